// =============================================================================
// Session Coordinator — the lifecycle thread
// =============================================================================
//
// Walks every session through five phases in a single loop:
//
//   A. Initialize — first entry runs the session-wide stream analysis and
//      caches the base/derivable intervals.
//   B. Load       — analyze → validate → execute provisioning for every
//      config-declared symbol (failing symbols are dropped with a warning;
//      all failing is fatal).
//   C. Activate   — open the SessionData gate, record the start.
//   D. Stream     — drain pending mid-session operations, wait on the pause
//      gate, replay the globally oldest queued bar (backtest) or let live
//      subscriptions feed the store, notify the data processor.
//   E. Teardown   — clear SessionData, queues and pending state, advance the
//      simulated clock to the next trading day (backtest) or stop (live).
//
// The coordinator owns the backtest bar queues (thread-local, no lock) and
// is the sole writer of the pause gate and the simulated clock.
//
// Mid-session symbol addition is non-blocking for the caller: operations
// queue on the pending channel and the coordinator drains them at the top of
// each streaming step — pause, deactivate, drop notifications, provision,
// catch up to the current simulated time without advancing the clock, then
// reactivate in reverse order on every exit path.
// =============================================================================

pub mod queues;

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate};
use chrono_tz::Tz;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::analyzer::{analyze_session_requirements, SessionRequirements};
use crate::calendar::TimeManager;
use crate::config::Config;
use crate::datasource::DataSource;
use crate::error::{CoreError, CoreResult};
use crate::indicators::{IndicatorConfig, IndicatorData};
use crate::processor::{process_bar_update, BarNotice};
use crate::provisioning::{
    analyze_requirements, determine_steps, OpKind, ProvisioningRequirements, ProvisioningStep,
};
use crate::quality::score_historical_window;
use crate::session_data::{SessionData, SymbolSessionData};
use crate::status::WorkerStatus;
use crate::sync::{PauseGate, Shutdown};
use crate::types::{AddedBy, Bar, BarSource, Interval, Mode};
use crate::validation::validate_symbol;

use queues::BarQueues;

/// Settle time after closing the pause gate, letting an in-flight streaming
/// step finish before the store is deactivated.
const PAUSE_SETTLE: Duration = Duration::from_millis(100);

// =============================================================================
// Pending operations & handle
// =============================================================================

/// Result of a mid-session add/remove operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Symbol newly provisioned (and caught up to the current time).
    Provisioned,
    /// Symbol was already fully present; nothing to do.
    AlreadyPresent,
    /// An adhoc symbol was upgraded to full membership.
    Upgraded,
    /// Symbol removed.
    Removed,
}

enum PendingKind {
    AddSymbol {
        symbol: String,
        added_by: AddedBy,
    },
    AddIndicator {
        symbol: String,
        added_by: AddedBy,
        indicator: IndicatorConfig,
    },
    RemoveSymbol {
        symbol: String,
    },
    /// Inspection breakpoint: pause the replay until released. Used by the
    /// control surface and the test suite to observe a frozen session.
    Hold {
        engaged: oneshot::Sender<()>,
        release: oneshot::Receiver<()>,
    },
}

struct PendingOp {
    kind: PendingKind,
    /// Do not execute before this simulated time (backtest scheduling).
    not_before: Option<DateTime<Tz>>,
    reply: Option<oneshot::Sender<CoreResult<AddOutcome>>>,
}

/// A scheduled hold: `engaged` fires when the coordinator parks, `release`
/// resumes it.
pub struct HoldHandle {
    pub engaged: oneshot::Receiver<()>,
    pub release: oneshot::Sender<()>,
}

/// Cloneable front door to the coordinator. Every operation enqueues and
/// returns immediately; the receiver resolves once the coordinator has
/// drained the request.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<PendingOp>,
    pause: PauseGate,
}

impl CoordinatorHandle {
    fn enqueue(
        &self,
        kind: PendingKind,
        not_before: Option<DateTime<Tz>>,
    ) -> oneshot::Receiver<CoreResult<AddOutcome>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let op = PendingOp {
            kind,
            not_before,
            reply: Some(reply_tx),
        };
        if self.tx.send(op).is_err() {
            // Coordinator gone; the dropped sender resolves the receiver
            // with an error on await.
            warn!("coordinator is not running; request dropped");
        }
        reply_rx
    }

    /// Queue a symbol for mid-session addition. Non-blocking.
    pub fn add_symbol(
        &self,
        symbol: &str,
        added_by: AddedBy,
    ) -> oneshot::Receiver<CoreResult<AddOutcome>> {
        self.enqueue(
            PendingKind::AddSymbol {
                symbol: symbol.to_string(),
                added_by,
            },
            None,
        )
    }

    /// Queue a symbol addition that executes once the simulated clock
    /// reaches `at`.
    pub fn add_symbol_at(
        &self,
        symbol: &str,
        added_by: AddedBy,
        at: DateTime<Tz>,
    ) -> oneshot::Receiver<CoreResult<AddOutcome>> {
        self.enqueue(
            PendingKind::AddSymbol {
                symbol: symbol.to_string(),
                added_by,
            },
            Some(at),
        )
    }

    /// Adhoc indicator registration; auto-provisions the symbol minimally
    /// when it is not loaded.
    pub fn add_indicator(
        &self,
        symbol: &str,
        added_by: AddedBy,
        indicator: IndicatorConfig,
    ) -> oneshot::Receiver<CoreResult<AddOutcome>> {
        self.enqueue(
            PendingKind::AddIndicator {
                symbol: symbol.to_string(),
                added_by,
                indicator,
            },
            None,
        )
    }

    pub fn remove_symbol(&self, symbol: &str) -> oneshot::Receiver<CoreResult<AddOutcome>> {
        self.enqueue(
            PendingKind::RemoveSymbol {
                symbol: symbol.to_string(),
            },
            None,
        )
    }

    /// Schedule an inspection hold at simulated time `at`.
    pub fn hold_at(&self, at: DateTime<Tz>) -> HoldHandle {
        let (engaged_tx, engaged_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        let op = PendingOp {
            kind: PendingKind::Hold {
                engaged: engaged_tx,
                release: release_rx,
            },
            not_before: Some(at),
            reply: None,
        };
        let _ = self.tx.send(op);
        HoldHandle {
            engaged: engaged_rx,
            release: release_tx,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.pause.is_open()
    }
}

// =============================================================================
// Coordinator
// =============================================================================

enum StreamOutcome {
    SessionComplete,
    Stopped,
    /// An invariant violation inside SessionData: tear down and surface the
    /// error as terminal.
    Fatal(CoreError),
}

pub struct SessionCoordinator {
    config: Config,
    mode: Mode,
    exchange: String,
    session: Arc<SessionData>,
    time_manager: Arc<TimeManager>,
    source: Arc<dyn DataSource>,
    processor_tx: mpsc::UnboundedSender<BarNotice>,
    notifications_paused: Arc<AtomicBool>,
    pause: PauseGate,
    pending_rx: mpsc::UnboundedReceiver<PendingOp>,
    pending_buf: VecDeque<PendingOp>,
    pending_symbols: HashSet<String>,
    queues: BarQueues,
    session_reqs: Option<SessionRequirements>,
    data_driven: bool,
    shutdown: Shutdown,
    status: Arc<WorkerStatus>,
    /// Set by the catch-up path and live subscription tasks when an
    /// invariant violation escapes `append_bar`; the streaming loop picks
    /// it up at its next step and begins teardown.
    fatal_cell: Arc<Mutex<Option<CoreError>>>,
}

impl SessionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        session: Arc<SessionData>,
        time_manager: Arc<TimeManager>,
        source: Arc<dyn DataSource>,
        processor_tx: mpsc::UnboundedSender<BarNotice>,
        notifications_paused: Arc<AtomicBool>,
        shutdown: Shutdown,
        status: Arc<WorkerStatus>,
    ) -> (Self, CoordinatorHandle) {
        let (tx, pending_rx) = mpsc::unbounded_channel();
        let pause = PauseGate::new(true);
        let handle = CoordinatorHandle {
            tx,
            pause: pause.clone(),
        };
        let mode = config.mode;
        let exchange = config.exchange_group.clone();
        let data_driven = config.is_data_driven();
        let coordinator = Self {
            config,
            mode,
            exchange,
            session,
            time_manager,
            source,
            processor_tx,
            notifications_paused,
            pause,
            pending_rx,
            pending_buf: VecDeque::new(),
            pending_symbols: HashSet::new(),
            queues: BarQueues::new(),
            session_reqs: None,
            data_driven,
            shutdown,
            status,
            fatal_cell: Arc::new(Mutex::new(None)),
        };
        (coordinator, handle)
    }

    // =========================================================================
    // Lifecycle loop
    // =========================================================================

    /// Run the session lifecycle to completion. `Err` is a terminal
    /// failure — stream validation, all symbols failing, or an invariant
    /// violation — and the system manager surfaces it via the system state
    /// flag.
    pub async fn run(mut self) -> CoreResult<()> {
        self.status.set_running(true);
        info!(mode = %self.mode, "session coordinator started");

        let result = self.run_sessions().await;
        if let Err(e) = &result {
            self.status.set("phase", json!("failed"));
            self.status.set("error", json!(e.to_string()));
            error!(error = %e, "session coordinator terminated with a fatal error");
        }

        self.status.set_running(false);
        info!("session coordinator stopped");
        result
    }

    async fn run_sessions(&mut self) -> CoreResult<()> {
        let mut date = self.initial_session_date();

        loop {
            if self.shutdown.is_triggered() {
                return Ok(());
            }

            // ── Phase A: initialize ─────────────────────────────────────
            self.status.set("phase", json!("initialize"));
            self.ensure_session_requirements().map_err(|e| {
                error!(error = %e, "stream validation failed; coordinator stopping");
                e
            })?;

            if self.mode == Mode::Backtest {
                let end = self
                    .config
                    .backtest_config
                    .as_ref()
                    .map(|bt| bt.end_date)
                    .unwrap_or(date);
                if date > end {
                    info!("backtest window exhausted");
                    return Ok(());
                }
            }

            let trading = self.time_manager.get_trading_session(date, &self.exchange);
            if !trading.is_trading_day {
                date = self.time_manager.next_trading_date(date, &self.exchange);
                continue;
            }

            info!(session_date = %date, "session initializing");
            self.session.set_session_date(date);
            self.status.set("session_date", json!(date.to_string()));
            if self.mode == Mode::Backtest {
                self.time_manager.set_backtest_time(trading.open);
            }

            // ── Phase B: load session data ──────────────────────────────
            self.status.set("phase", json!("load"));
            let symbols = self.config.session_data_config.symbols.clone();
            let mut survivors = 0usize;
            for symbol in &symbols {
                match self.provision_symbol(symbol, AddedBy::Config, date, None, None) {
                    Ok(_) => survivors += 1,
                    Err(e) => {
                        warn!(symbol = %symbol, error = %e, "symbol dropped from session");
                        self.status.bump("symbols_dropped");
                    }
                }
            }
            if survivors == 0 && !symbols.is_empty() {
                error!("all configured symbols failed validation; session cannot start");
                return Err(CoreError::Validation {
                    symbol: symbols.join(","),
                    reason: "all configured symbols failed validation".to_string(),
                });
            }

            // ── Phase C: activate ───────────────────────────────────────
            self.session.activate_session();
            self.status.set("phase", json!("stream"));
            info!(session_date = %date, symbols = survivors, "session active");

            // ── Phase D: stream ─────────────────────────────────────────
            let outcome = match self.mode {
                Mode::Backtest => self.stream_backtest(date).await,
                Mode::Live => self.stream_live(date).await,
            };

            // ── Phase E: teardown ───────────────────────────────────────
            self.status.set("phase", json!("teardown"));
            self.session.deactivate_session();
            self.session.clear();
            self.queues.clear();
            self.pending_symbols.clear();
            self.fail_pending("session tore down before the request was processed");
            self.status.bump("sessions_completed");
            info!(session_date = %date, "session torn down");

            match outcome {
                StreamOutcome::Fatal(e) => return Err(e),
                StreamOutcome::Stopped => return Ok(()),
                StreamOutcome::SessionComplete => match self.mode {
                    Mode::Backtest => {
                        date = self.time_manager.next_trading_date(date, &self.exchange);
                    }
                    // One live session per process start.
                    Mode::Live => return Ok(()),
                },
            }
        }
    }

    fn take_fatal(&self) -> Option<CoreError> {
        self.fatal_cell.lock().take()
    }

    fn initial_session_date(&self) -> NaiveDate {
        let start = match (self.mode, self.config.backtest_config.as_ref()) {
            (Mode::Backtest, Some(bt)) => bt.start_date,
            _ => self.time_manager.current_time().date_naive(),
        };
        self.time_manager
            .first_trading_date_on_or_after(start, &self.exchange)
    }

    /// First entry only: cache the session-wide base/derivable intervals.
    fn ensure_session_requirements(&mut self) -> CoreResult<()> {
        if self.session_reqs.is_some() {
            return Ok(());
        }
        let streams = self.config.stream_intervals()?;
        let mut indicator_intervals = Vec::new();
        for spec in self
            .config
            .session_data_config
            .indicators
            .session
            .iter()
            .chain(&self.config.session_data_config.indicators.historical)
        {
            indicator_intervals.push(Interval::parse(&spec.interval)?);
        }
        let reqs = analyze_session_requirements(&streams, &indicator_intervals)?;
        info!(
            base = %reqs.base_interval,
            derivable = ?reqs.derivable.iter().map(|i| i.to_string()).collect::<Vec<_>>(),
            "session stream requirements resolved"
        );
        self.session_reqs = Some(reqs);
        Ok(())
    }

    // =========================================================================
    // Phase D: streaming
    // =========================================================================

    async fn stream_backtest(&mut self, date: NaiveDate) -> StreamOutcome {
        let trading = self.time_manager.get_trading_session(date, &self.exchange);
        let speed = self
            .config
            .backtest_config
            .as_ref()
            .map(|bt| bt.speed_multiplier)
            .unwrap_or(0);
        let mut last_ts: Option<DateTime<Tz>> = None;

        loop {
            if self.shutdown.is_triggered() {
                return StreamOutcome::Stopped;
            }
            if let Some(e) = self.take_fatal() {
                return StreamOutcome::Fatal(e);
            }

            // 1. Mid-session additions first, so a new symbol's bars join
            //    the replay at the right position.
            self.drain_pending(date).await;

            // 2. The pause event (coordinator is the sole setter, but the
            //    wait keeps the step structure uniform).
            self.pause.wait_open().await;

            // 3. Advance one step.
            let Some((symbol, interval, bar)) = self.queues.pop_next() else {
                return StreamOutcome::SessionComplete;
            };

            let ts = bar.timestamp;
            if !trading.contains(ts) {
                // Outside regular hours (including the close minute itself).
                self.status.bump("bars_dropped_out_of_session");
                continue;
            }

            if speed > 0 {
                if let Some(prev) = last_ts {
                    let sim_delta = (ts - prev).num_milliseconds().max(0) as u64;
                    tokio::time::sleep(Duration::from_millis(sim_delta / speed as u64)).await;
                }
            }

            self.time_manager.set_backtest_time(ts);
            last_ts = Some(ts);

            match self.session.append_bar(&symbol, interval, bar) {
                Ok(()) => {
                    self.status.bump("bars_streamed");
                    self.notify_processor(&symbol, interval).await;
                }
                Err(e) if e.is_fatal() => {
                    error!(
                        symbol = %symbol,
                        error = %e,
                        "invariant violation while streaming; beginning teardown"
                    );
                    return StreamOutcome::Fatal(e);
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "queued bar rejected; dropped");
                    self.status.bump("bars_dropped_invalid");
                }
            }
        }
    }

    async fn stream_live(&mut self, date: NaiveDate) -> StreamOutcome {
        let trading = self.time_manager.get_trading_session(date, &self.exchange);

        // Per-symbol subscriptions feed SessionData from their own tasks.
        for symbol in self.session.get_active_symbols() {
            self.start_live_subscription(&symbol);
        }

        loop {
            if self.shutdown.is_triggered() {
                return StreamOutcome::Stopped;
            }
            if let Some(e) = self.take_fatal() {
                return StreamOutcome::Fatal(e);
            }
            self.drain_pending(date).await;
            self.pause.wait_open().await;

            if self.time_manager.current_time() >= trading.close {
                info!("live session reached the close");
                return StreamOutcome::SessionComplete;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    fn start_live_subscription(&self, symbol: &str) {
        let Some(reqs) = self.session_reqs.as_ref() else {
            return;
        };
        let base = reqs.base_interval;
        let rx = match self.source.subscribe(symbol, base) {
            Ok(rx) => rx,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "live subscription failed");
                return;
            }
        };
        let session = Arc::clone(&self.session);
        let processor_tx = self.processor_tx.clone();
        let shutdown = self.shutdown.clone();
        let fatal_cell = Arc::clone(&self.fatal_cell);
        let sym = symbol.to_string();
        tokio::spawn(async move {
            let mut rx = rx;
            let mut stop = shutdown.subscribe();
            loop {
                tokio::select! {
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                    bar = rx.recv() => {
                        let Some(bar) = bar else { break };
                        match session.append_bar(&sym, base, bar) {
                            Ok(()) => {
                                let _ = processor_tx.send(BarNotice {
                                    symbol: sym.clone(),
                                    interval: base,
                                    ack: None,
                                });
                            }
                            Err(e) if e.is_fatal() => {
                                error!(
                                    symbol = %sym,
                                    error = %e,
                                    "invariant violation on live stream; signalling teardown"
                                );
                                *fatal_cell.lock() = Some(e);
                                break;
                            }
                            Err(e) => {
                                warn!(symbol = %sym, error = %e, "live bar rejected");
                            }
                        }
                    }
                }
            }
            debug!(symbol = %sym, "live subscription task ended");
        });
    }

    async fn notify_processor(&self, symbol: &str, interval: Interval) {
        let (ack_tx, ack_rx) = if self.data_driven {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let notice = BarNotice {
            symbol: symbol.to_string(),
            interval,
            ack: ack_tx,
        };
        if self.processor_tx.send(notice).is_err() {
            error!("data processor channel closed");
            return;
        }
        if let Some(rx) = ack_rx {
            // Data-driven: hold the clock until the full strategy round
            // trip completes (or shutdown races us).
            tokio::select! {
                _ = rx => {}
                _ = self.shutdown.wait() => {}
            }
        }
    }

    // =========================================================================
    // Pending-operation drain (mid-session additions)
    // =========================================================================

    async fn drain_pending(&mut self, date: NaiveDate) {
        // Pull everything queued so far into the local buffer, deduping
        // repeated adds for the same symbol.
        while let Ok(op) = self.pending_rx.try_recv() {
            if let PendingKind::AddSymbol { symbol, .. }
            | PendingKind::AddIndicator { symbol, .. } = &op.kind
            {
                if self.pending_symbols.contains(symbol) {
                    if let Some(reply) = op.reply {
                        let _ = reply.send(Ok(AddOutcome::AlreadyPresent));
                    }
                    continue;
                }
                self.pending_symbols.insert(symbol.clone());
            }
            self.pending_buf.push_back(op);
        }

        loop {
            let eligible = match self.pending_buf.front() {
                Some(op) => op
                    .not_before
                    .map_or(true, |t| self.time_manager.current_time() >= t),
                None => false,
            };
            if !eligible {
                return;
            }
            let op = self
                .pending_buf
                .pop_front()
                .expect("front observed eligible");
            self.status.set("pending_depth", json!(self.pending_buf.len()));
            self.process_pending(op, date).await;
        }
    }

    async fn process_pending(&mut self, op: PendingOp, date: NaiveDate) {
        match op.kind {
            PendingKind::Hold { engaged, release } => {
                info!("replay hold engaged");
                let _ = engaged.send(());
                tokio::select! {
                    _ = release => {}
                    _ = self.shutdown.wait() => {}
                }
                info!("replay hold released");
            }
            PendingKind::RemoveSymbol { symbol } => {
                let result = self.handle_remove(&symbol).await;
                if let Some(reply) = op.reply {
                    let _ = reply.send(result);
                }
            }
            PendingKind::AddSymbol { symbol, added_by } => {
                let result = self.handle_add(&symbol, added_by, date, None).await;
                self.pending_symbols.remove(&symbol);
                if let Some(reply) = op.reply {
                    let _ = reply.send(result);
                }
            }
            PendingKind::AddIndicator {
                symbol,
                added_by,
                indicator,
            } => {
                let result = self.handle_add(&symbol, added_by, date, Some(indicator)).await;
                self.pending_symbols.remove(&symbol);
                if let Some(reply) = op.reply {
                    let _ = reply.send(result);
                }
            }
        }
    }

    async fn handle_remove(&mut self, symbol: &str) -> CoreResult<AddOutcome> {
        self.pause.close();
        tokio::time::sleep(PAUSE_SETTLE).await;
        self.session.deactivate_session();

        let existed = self.session.remove_symbol(symbol);
        self.queues.remove_symbol(symbol);

        self.session.activate_session();
        self.pause.open();

        if existed {
            info!(symbol = %symbol, "symbol removed mid-session");
            Ok(AddOutcome::Removed)
        } else {
            Err(CoreError::UnknownSymbol(symbol.to_string()))
        }
    }

    /// The full pause → deactivate → provision → catch up → reactivate
    /// sequence. Reactivation happens on every exit path, including
    /// provisioning failures and budget overruns.
    async fn handle_add(
        &mut self,
        symbol: &str,
        added_by: AddedBy,
        date: NaiveDate,
        indicator: Option<IndicatorConfig>,
    ) -> CoreResult<AddOutcome> {
        // 1. Pause streaming and let any in-flight step complete.
        self.pause.close();
        tokio::time::sleep(PAUSE_SETTLE).await;

        // 2. Hide intermediate state from strategies.
        self.session.deactivate_session();

        // 3. Notification-drop mode in the data processor.
        self.notifications_paused.store(true, Ordering::SeqCst);

        let deadline =
            Instant::now() + Duration::from_secs(self.config.runtime.provisioning_budget_secs);
        let was_new = !self.session.contains_symbol(symbol);

        // 4–5. Provision and catch up.
        let mut result = self.provision_symbol(symbol, added_by, date, indicator, Some(deadline));
        if let Ok(AddOutcome::Provisioned) = result {
            if let Err(e) = self.catch_up(symbol, deadline) {
                result = Err(e);
            } else if self.mode == Mode::Live && was_new {
                self.start_live_subscription(symbol);
            }
        }

        // Roll back partial state when a fresh provisioning failed.
        if result.is_err() && was_new {
            self.session.remove_symbol(symbol);
            self.queues.remove_symbol(symbol);
            warn!(symbol = %symbol, "mid-session provisioning rolled back");
        }

        // 6. Reactivate in reverse order — unconditionally.
        self.notifications_paused.store(false, Ordering::SeqCst);
        self.session.activate_session();
        self.pause.open();

        match &result {
            Ok(outcome) => {
                info!(symbol = %symbol, outcome = ?outcome, "mid-session request complete");
                self.status.bump("midsession_adds");
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "mid-session request failed");
                self.status.bump("midsession_failures");
            }
        }
        result
    }

    /// Pop the new symbol's queued bars older than the current simulated
    /// time and replay them through the same append/aggregate path the
    /// streaming step uses — without advancing the clock. From a
    /// subscriber's perspective the symbol has been present since the open.
    fn catch_up(&mut self, symbol: &str, deadline: Instant) -> CoreResult<()> {
        let Some(reqs) = self.session_reqs.as_ref() else {
            return Ok(());
        };
        let base = reqs.base_interval;
        let now = self.time_manager.current_time();
        let Some(date) = self.session.current_session_date() else {
            return Ok(());
        };
        let trading = self.time_manager.get_trading_session(date, &self.exchange);

        let bars = match self.mode {
            // Backtest: the queues already hold today's bars; take the ones
            // the replay has passed.
            Mode::Backtest => self.queues.drain_before(symbol, base, now),
            // Live: fetch the session so far from the source.
            Mode::Live => {
                if now <= trading.open {
                    Vec::new()
                } else {
                    self.source
                        .load_bars(symbol, base, trading.open, now)
                        .map_err(|e| {
                            CoreError::provisioning(symbol, "catch_up", e.to_string())
                        })?
                }
            }
        };
        let mut caught_up = 0usize;
        for bar in bars {
            if Instant::now() > deadline {
                return Err(CoreError::Timeout(
                    Duration::from_secs(self.config.runtime.provisioning_budget_secs),
                    format!("catch-up for {symbol} exceeded the provisioning budget"),
                ));
            }
            if !trading.contains(bar.timestamp) {
                continue;
            }
            match self.session.append_bar(symbol, base, bar) {
                Ok(()) => {
                    // Run the aggregation/indicator path synchronously; the
                    // processor is in notification-drop mode.
                    process_bar_update(
                        &self.session,
                        &self.time_manager,
                        &self.exchange,
                        symbol,
                        base,
                    );
                    caught_up += 1;
                }
                Err(e) if e.is_fatal() => {
                    // Fail the pending request and hand the invariant
                    // violation to the streaming loop so teardown begins.
                    error!(
                        symbol = %symbol,
                        error = %e,
                        "invariant violation during catch-up; signalling teardown"
                    );
                    *self.fatal_cell.lock() = Some(e.clone());
                    return Err(e);
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "catch-up bar rejected");
                }
            }
        }
        info!(symbol = %symbol, bars = caught_up, up_to = %now, "catch-up complete");
        Ok(())
    }

    // =========================================================================
    // Provisioning executor (phase 1–3 wiring + step dispatch)
    // =========================================================================

    /// Analyze → validate → plan → execute for one symbol.
    fn provision_symbol(
        &mut self,
        symbol: &str,
        added_by: AddedBy,
        date: NaiveDate,
        indicator: Option<IndicatorConfig>,
        deadline: Option<Instant>,
    ) -> CoreResult<AddOutcome> {
        let reqs = self
            .session_reqs
            .clone()
            .ok_or_else(|| CoreError::config("session requirements not yet analyzed"))?;

        let op = if indicator.is_some() {
            OpKind::Indicator
        } else {
            OpKind::Symbol
        };
        let req = analyze_requirements(
            op,
            symbol,
            added_by,
            &reqs,
            &self.config,
            &self.session,
            &self.time_manager,
            date,
            indicator,
        )?;

        let validation = validate_symbol(
            &req,
            self.source.as_ref(),
            &self.time_manager,
            &self.exchange,
            reqs.base_interval,
            date,
        );
        if !validation.passed() {
            for failure in validation.failures() {
                warn!(symbol = %symbol, check = %failure, "validation check failed");
            }
            return Err(CoreError::Validation {
                symbol: symbol.to_string(),
                reason: validation.failures().join("; "),
            });
        }

        let steps = determine_steps(&req);
        if steps.is_empty() {
            debug!(symbol = %symbol, "nothing to provision");
            return Ok(AddOutcome::AlreadyPresent);
        }
        let upgrading = steps.contains(&ProvisioningStep::UpgradeSymbol);

        for step in &steps {
            if let Some(deadline) = deadline {
                if Instant::now() > deadline {
                    return Err(CoreError::Timeout(
                        Duration::from_secs(self.config.runtime.provisioning_budget_secs),
                        format!("provisioning {symbol} exceeded the budget at {step:?}"),
                    ));
                }
            }
            self.execute_step(&req, step, date).map_err(|e| {
                error!(symbol = %symbol, step = ?step, error = %e, "provisioning step failed");
                e
            })?;
        }

        info!(
            symbol = %symbol,
            steps = steps.len(),
            source = %added_by,
            "provisioning complete"
        );
        Ok(if upgrading {
            AddOutcome::Upgraded
        } else {
            AddOutcome::Provisioned
        })
    }

    fn execute_step(
        &mut self,
        req: &ProvisioningRequirements,
        step: &ProvisioningStep,
        date: NaiveDate,
    ) -> CoreResult<()> {
        let symbol = req.symbol.as_str();
        match step {
            ProvisioningStep::CreateSymbol => {
                let sd = SymbolSessionData::new(symbol, req.base_interval, req.source);
                self.session.register_symbol_data(sd)
            }
            ProvisioningStep::UpgradeSymbol => self
                .session
                .with_symbol_mut(symbol, |sd| sd.upgrade_from_adhoc())
                .ok_or_else(|| CoreError::UnknownSymbol(symbol.to_string())),
            ProvisioningStep::AddInterval(interval) => self
                .session
                .with_symbol_mut(symbol, |sd| sd.add_interval(*interval))
                .ok_or_else(|| CoreError::UnknownSymbol(symbol.to_string()))?,
            ProvisioningStep::LoadHistorical => self.step_load_historical(req, date),
            ProvisioningStep::LoadSession => self.step_load_session(req, date),
            ProvisioningStep::RegisterIndicator(name) => self.step_register_indicator(req, name),
            ProvisioningStep::CalculateQuality => self.step_calculate_quality(req),
        }
    }

    fn step_load_historical(
        &mut self,
        req: &ProvisioningRequirements,
        date: NaiveDate,
    ) -> CoreResult<()> {
        let symbol = req.symbol.as_str();
        let session_open = self
            .time_manager
            .get_trading_session(date, &self.exchange)
            .open;

        for (interval, trading_days) in &req.historical_windows {
            let start_date =
                self.time_manager
                    .previous_trading_date(date, *trading_days, &self.exchange);

            // Skip windows that a previous (adhoc) load already covers.
            let covered = self
                .session
                .with_symbol(symbol, true, |sd| {
                    sd.historical
                        .bars
                        .get(interval)
                        .and_then(|h| h.date_range)
                        .map(|(first, _)| first <= start_date)
                        .unwrap_or(false)
                })
                .unwrap_or(false);
            if covered {
                continue;
            }

            let start = self
                .time_manager
                .get_trading_session(start_date, &self.exchange)
                .open;
            let bars = self
                .source
                .load_bars(symbol, *interval, start, session_open)
                .map_err(|e| {
                    CoreError::provisioning(symbol, "load_historical", e.to_string())
                })?;

            self.session
                .with_symbol_mut(symbol, |sd| {
                    sd.historical.bars.entry(*interval).or_default().absorb(bars);
                })
                .ok_or_else(|| CoreError::UnknownSymbol(symbol.to_string()))?;
        }

        // Historical indicator summaries for full loads.
        if req.op == OpKind::Symbol && req.is_full_load() {
            let specs = self.config.session_data_config.indicators.historical.clone();
            for spec in &specs {
                let cfg = IndicatorConfig::from_spec(spec)?;
                let warmup = cfg.warmup_bars() * self.config.runtime.warmup_multiplier as usize;
                let tail = self
                    .session
                    .with_symbol(symbol, true, |sd| {
                        sd.historical
                            .bars
                            .get(&cfg.interval)
                            .map(|h| h.tail(warmup.max(cfg.warmup_bars())))
                            .unwrap_or_default()
                    })
                    .unwrap_or_default();
                if tail.is_empty() {
                    continue;
                }
                let mut data = IndicatorData::new(cfg.clone());
                for bar in &tail {
                    data.update(bar);
                }
                if let Some(value) = data.current_value {
                    self.session.with_symbol_mut(symbol, |sd| {
                        sd.historical
                            .indicators
                            .insert(cfg.name.clone(), value.primary());
                    });
                }
            }
        }
        Ok(())
    }

    fn step_load_session(
        &mut self,
        req: &ProvisioningRequirements,
        date: NaiveDate,
    ) -> CoreResult<()> {
        let symbol = req.symbol.as_str();
        let trading = self.time_manager.get_trading_session(date, &self.exchange);
        let bars = self
            .source
            .load_bars(symbol, req.base_interval, trading.open, trading.close)
            .map_err(|e| CoreError::provisioning(symbol, "load_session", e.to_string()))?;

        // Queue-delivered bars are the session stream.
        let bars: Vec<Bar> = bars
            .into_iter()
            .map(|mut b| {
                b.source = BarSource::Stream;
                b
            })
            .collect();

        debug!(symbol = %symbol, count = bars.len(), "session queue filled");
        self.queues.fill(symbol, req.base_interval, bars);
        self.status.set("queue_depth", json!(self.queues.total_len()));
        Ok(())
    }

    fn step_register_indicator(
        &mut self,
        req: &ProvisioningRequirements,
        name: &str,
    ) -> CoreResult<()> {
        let symbol = req.symbol.as_str();
        let cfg = req
            .indicators
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .ok_or_else(|| {
                CoreError::provisioning(symbol, "register_indicator", format!("unknown indicator {name}"))
            })?;

        let warmup = cfg.warmup_bars() * self.config.runtime.warmup_multiplier as usize;
        let warmup_bars = self
            .session
            .with_symbol(symbol, true, |sd| {
                sd.historical
                    .bars
                    .get(&cfg.interval)
                    .map(|h| h.tail(warmup.max(cfg.warmup_bars())))
                    .unwrap_or_default()
            })
            .unwrap_or_default();

        let mut data = IndicatorData::new(cfg);
        for bar in &warmup_bars {
            data.update(bar);
        }
        debug!(
            symbol = %symbol,
            indicator = %name,
            warmup_fed = warmup_bars.len(),
            valid = data.valid,
            "indicator registered"
        );

        self.session
            .with_symbol_mut(symbol, |sd| sd.register_indicator(data))
            .ok_or_else(|| CoreError::UnknownSymbol(symbol.to_string()))?
    }

    fn step_calculate_quality(&mut self, req: &ProvisioningRequirements) -> CoreResult<()> {
        let symbol = req.symbol.as_str();
        let time_manager = Arc::clone(&self.time_manager);
        let exchange = self.exchange.clone();
        self.session
            .with_symbol_mut(symbol, |sd| {
                for (interval, hist) in sd.historical.bars.iter_mut() {
                    score_historical_window(hist, &time_manager, &exchange, *interval);
                }
            })
            .ok_or_else(|| CoreError::UnknownSymbol(symbol.to_string()))
    }

    /// Teardown path: fail requests aimed at the session that just ended,
    /// but keep operations scheduled for a future simulated time — they
    /// belong to an upcoming session.
    fn fail_pending(&mut self, reason: &str) {
        let now = self.time_manager.current_time();
        let mut kept = VecDeque::new();
        for op in self.pending_buf.drain(..) {
            let future = op.not_before.map_or(false, |t| t > now);
            if future {
                kept.push_back(op);
                continue;
            }
            if let Some(reply) = op.reply {
                let _ = reply.send(Err(CoreError::data(reason)));
            }
        }
        self.pending_buf = kept;
    }
}
