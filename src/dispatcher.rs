// =============================================================================
// Strategy Dispatcher — selective (symbol, interval) fan-out
// =============================================================================
//
// Loads the strategy modules named in configuration, runs each in its own
// task with its own bounded queue, and routes "new bars" notifications from
// the data processor to the strategies whose subscriptions match.
//
// Strategies pull bars through `SessionData::with_bars` (zero copy) — the
// notification carries only the (symbol, interval) tag.
//
// In data-driven mode the dispatcher waits for every notified strategy to
// signal completion before releasing the data processor; otherwise routing
// is fire-and-forget, and a strategy whose queue is full gets an overrun
// counted against it while the dispatcher moves on.
// =============================================================================

use std::sync::Arc;

use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::calendar::TimeManager;
use crate::config::StrategyConfig;
use crate::session_data::SessionData;
use crate::status::WorkerStatus;
use crate::sync::Shutdown;
use crate::types::Interval;

/// Per-strategy queue depth before overruns start.
const STRATEGY_QUEUE_CAPACITY: usize = 256;

// =============================================================================
// Messages
// =============================================================================

/// From the data processor: which series changed on this step.
pub struct BarsUpdate {
    pub updated: Vec<(String, Interval)>,
    /// Present in data-driven mode; fired once all notified strategies have
    /// completed.
    pub done: Option<oneshot::Sender<()>>,
}

struct StrategyNotice {
    symbol: String,
    interval: Interval,
    done: Option<oneshot::Sender<()>>,
}

// =============================================================================
// Strategy trait & context
// =============================================================================

/// What a strategy sees when notified.
#[derive(Clone)]
pub struct StrategyContext {
    pub session: Arc<SessionData>,
    pub time_manager: Arc<TimeManager>,
}

/// One strategy module. Runs on its own task; `on_bars` is invoked once per
/// matching (symbol, interval) notification.
pub trait Strategy: Send + 'static {
    fn name(&self) -> &str;

    /// Subscriptions as (symbol, interval) pairs. The symbol `"*"` matches
    /// every symbol, including ones added mid-session.
    fn subscriptions(&self) -> Vec<(String, Interval)>;

    fn on_bars(&mut self, symbol: &str, interval: Interval, ctx: &StrategyContext);
}

// =============================================================================
// Built-in strategies
// =============================================================================

fn interval_from_config(cfg: &serde_json::Value) -> Interval {
    cfg.get("interval")
        .and_then(|v| v.as_str())
        .and_then(|tag| Interval::parse(tag).ok())
        .unwrap_or(Interval::minutes(1))
}

/// Logs every bar it is notified about. Useful as a pipeline smoke test.
pub struct LoggingStrategy {
    interval: Interval,
    bars_seen: u64,
}

impl LoggingStrategy {
    pub fn new(cfg: &serde_json::Value) -> Self {
        Self {
            interval: interval_from_config(cfg),
            bars_seen: 0,
        }
    }
}

impl Strategy for LoggingStrategy {
    fn name(&self) -> &str {
        "logger"
    }

    fn subscriptions(&self) -> Vec<(String, Interval)> {
        vec![("*".to_string(), self.interval)]
    }

    fn on_bars(&mut self, symbol: &str, interval: Interval, ctx: &StrategyContext) {
        self.bars_seen += 1;
        let close = ctx
            .session
            .with_bars(symbol, interval, |bars| bars.last().map(|b| b.close))
            .flatten();
        debug!(
            symbol = %symbol,
            interval = %interval,
            close = ?close,
            total = self.bars_seen,
            "logger strategy bar"
        );
    }
}

/// Fast/slow moving-average cross over the subscribed interval.
pub struct MomentumStrategy {
    interval: Interval,
    fast: usize,
    slow: usize,
    last_signal: Option<bool>,
}

impl MomentumStrategy {
    pub fn new(cfg: &serde_json::Value) -> Self {
        Self {
            interval: interval_from_config(cfg),
            fast: cfg.get("fast").and_then(|v| v.as_u64()).unwrap_or(9) as usize,
            slow: cfg.get("slow").and_then(|v| v.as_u64()).unwrap_or(21) as usize,
            last_signal: None,
        }
    }

    fn mean_of_tail(bars: &[crate::types::Bar], n: usize) -> Option<f64> {
        if bars.len() < n || n == 0 {
            return None;
        }
        Some(bars[bars.len() - n..].iter().map(|b| b.close).sum::<f64>() / n as f64)
    }
}

impl Strategy for MomentumStrategy {
    fn name(&self) -> &str {
        "momentum"
    }

    fn subscriptions(&self) -> Vec<(String, Interval)> {
        vec![("*".to_string(), self.interval)]
    }

    fn on_bars(&mut self, symbol: &str, interval: Interval, ctx: &StrategyContext) {
        let crossed = ctx.session.with_bars(symbol, interval, |bars| {
            let fast = Self::mean_of_tail(bars, self.fast)?;
            let slow = Self::mean_of_tail(bars, self.slow)?;
            Some(fast > slow)
        });
        if let Some(Some(bullish)) = crossed {
            if self.last_signal != Some(bullish) {
                info!(
                    symbol = %symbol,
                    interval = %interval,
                    bullish,
                    "momentum signal flipped"
                );
                self.last_signal = Some(bullish);
            }
        }
    }
}

/// Resolve configured module paths to built-in strategies. Unknown modules
/// are skipped with a warning (a missing strategy is not fatal).
pub fn build_strategies(configs: &[StrategyConfig]) -> Vec<Box<dyn Strategy>> {
    let mut out: Vec<Box<dyn Strategy>> = Vec::new();
    for cfg in configs {
        if !cfg.enabled {
            continue;
        }
        let short = cfg.module.rsplit('.').next().unwrap_or(&cfg.module);
        match short {
            "logger" => out.push(Box::new(LoggingStrategy::new(&cfg.config))),
            "momentum" => out.push(Box::new(MomentumStrategy::new(&cfg.config))),
            other => {
                warn!(module = %cfg.module, "unknown strategy module '{other}', skipping");
            }
        }
    }
    out
}

// =============================================================================
// Dispatcher worker
// =============================================================================

struct StrategyHandle {
    name: String,
    subscriptions: Vec<(String, Interval)>,
    tx: mpsc::Sender<StrategyNotice>,
}

impl StrategyHandle {
    fn matches(&self, symbol: &str, interval: Interval) -> bool {
        self.subscriptions
            .iter()
            .any(|(sym, iv)| *iv == interval && (sym == "*" || sym == symbol))
    }
}

pub struct StrategyDispatcher {
    rx: mpsc::UnboundedReceiver<BarsUpdate>,
    handles: Vec<StrategyHandle>,
    data_driven: bool,
    shutdown: Shutdown,
    status: Arc<WorkerStatus>,
}

impl StrategyDispatcher {
    /// Build the dispatcher and spawn one task per strategy.
    pub fn new(
        rx: mpsc::UnboundedReceiver<BarsUpdate>,
        strategies: Vec<Box<dyn Strategy>>,
        ctx: StrategyContext,
        data_driven: bool,
        shutdown: Shutdown,
        status: Arc<WorkerStatus>,
    ) -> Self {
        let mut handles = Vec::new();
        for mut strategy in strategies {
            let (tx, mut strategy_rx) = mpsc::channel::<StrategyNotice>(STRATEGY_QUEUE_CAPACITY);
            let name = strategy.name().to_string();
            let subscriptions = strategy.subscriptions();
            let task_ctx = ctx.clone();
            let task_shutdown = shutdown.clone();
            let task_name = name.clone();
            tokio::spawn(async move {
                let mut stop = task_shutdown.subscribe();
                loop {
                    tokio::select! {
                        changed = stop.changed() => {
                            if changed.is_err() || *stop.borrow() {
                                break;
                            }
                        }
                        notice = strategy_rx.recv() => {
                            let Some(notice) = notice else { break };
                            strategy.on_bars(&notice.symbol, notice.interval, &task_ctx);
                            if let Some(done) = notice.done {
                                let _ = done.send(());
                            }
                        }
                    }
                }
                debug!(strategy = %task_name, "strategy task stopped");
            });
            handles.push(StrategyHandle {
                name,
                subscriptions,
                tx,
            });
        }

        status.set(
            "strategies",
            json!(handles.iter().map(|h| h.name.clone()).collect::<Vec<_>>()),
        );

        Self {
            rx,
            handles,
            data_driven,
            shutdown,
            status,
        }
    }

    pub async fn run(mut self) {
        self.status.set_running(true);
        info!(
            strategies = self.handles.len(),
            data_driven = self.data_driven,
            "strategy dispatcher started"
        );
        let mut stop = self.shutdown.subscribe();

        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                update = self.rx.recv() => {
                    let Some(update) = update else { break };
                    self.route(update).await;
                }
            }
        }

        self.status.set_running(false);
        info!("strategy dispatcher stopped");
    }

    async fn route(&self, update: BarsUpdate) {
        let mut completions: Vec<oneshot::Receiver<()>> = Vec::new();

        for (symbol, interval) in &update.updated {
            for handle in &self.handles {
                if !handle.matches(symbol, *interval) {
                    continue;
                }
                self.status.bump("routed");

                if self.data_driven {
                    let (done_tx, done_rx) = oneshot::channel();
                    let notice = StrategyNotice {
                        symbol: symbol.clone(),
                        interval: *interval,
                        done: Some(done_tx),
                    };
                    if handle.tx.send(notice).await.is_ok() {
                        completions.push(done_rx);
                    }
                } else {
                    let notice = StrategyNotice {
                        symbol: symbol.clone(),
                        interval: *interval,
                        done: None,
                    };
                    if let Err(mpsc::error::TrySendError::Full(_)) = handle.tx.try_send(notice) {
                        // The strategy cannot keep up; count it and move on.
                        self.status.bump(&format!("overruns_{}", handle.name));
                    }
                }
            }
        }

        // Data-driven completion barrier: all notified strategies must
        // finish before the processor (and thus the coordinator) continues.
        for done in completions {
            let _ = done.await;
        }
        if let Some(done) = update.done {
            let _ = done.send(());
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_data::SymbolSessionData;
    use crate::types::{AddedBy, Mode};
    use parking_lot::Mutex;

    struct RecordingStrategy {
        name: String,
        subs: Vec<(String, Interval)>,
        seen: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl Strategy for RecordingStrategy {
        fn name(&self) -> &str {
            &self.name
        }
        fn subscriptions(&self) -> Vec<(String, Interval)> {
            self.subs.clone()
        }
        fn on_bars(&mut self, symbol: &str, interval: Interval, _ctx: &StrategyContext) {
            self.seen.lock().push((symbol.to_string(), interval.to_string()));
        }
    }

    fn ctx() -> StrategyContext {
        let session = Arc::new(SessionData::new());
        session
            .register_symbol_data(SymbolSessionData::new(
                "RIVN",
                Interval::minutes(1),
                AddedBy::Config,
            ))
            .unwrap();
        session.activate_session();
        StrategyContext {
            session,
            time_manager: Arc::new(TimeManager::new(Mode::Backtest, "US_EQUITY")),
        }
    }

    #[tokio::test]
    async fn routes_only_matching_subscriptions() {
        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));
        let strategies: Vec<Box<dyn Strategy>> = vec![
            Box::new(RecordingStrategy {
                name: "a".into(),
                subs: vec![("RIVN".into(), Interval::minutes(1))],
                seen: seen_a.clone(),
            }),
            Box::new(RecordingStrategy {
                name: "b".into(),
                subs: vec![("AAPL".into(), Interval::minutes(1))],
                seen: seen_b.clone(),
            }),
        ];

        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = Shutdown::new();
        let status = WorkerStatus::new("dispatcher");
        let dispatcher =
            StrategyDispatcher::new(rx, strategies, ctx(), true, shutdown.clone(), status);
        let handle = tokio::spawn(dispatcher.run());

        let (done_tx, done_rx) = oneshot::channel();
        tx.send(BarsUpdate {
            updated: vec![("RIVN".into(), Interval::minutes(1))],
            done: Some(done_tx),
        })
        .unwrap();
        done_rx.await.unwrap();

        assert_eq!(seen_a.lock().len(), 1);
        assert!(seen_b.lock().is_empty());

        shutdown.trigger();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn wildcard_subscription_sees_every_symbol() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let strategies: Vec<Box<dyn Strategy>> = vec![Box::new(RecordingStrategy {
            name: "wild".into(),
            subs: vec![("*".into(), Interval::minutes(1))],
            seen: seen.clone(),
        })];

        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = Shutdown::new();
        let dispatcher = StrategyDispatcher::new(
            rx,
            strategies,
            ctx(),
            true,
            shutdown.clone(),
            WorkerStatus::new("dispatcher"),
        );
        let handle = tokio::spawn(dispatcher.run());

        for sym in ["RIVN", "AAPL"] {
            let (done_tx, done_rx) = oneshot::channel();
            tx.send(BarsUpdate {
                updated: vec![(sym.into(), Interval::minutes(1))],
                done: Some(done_tx),
            })
            .unwrap();
            done_rx.await.unwrap();
        }

        let got = seen.lock().clone();
        assert_eq!(got.len(), 2);
        assert!(got.iter().any(|(s, _)| s == "AAPL"));

        shutdown.trigger();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn completion_fires_after_strategy_work() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let strategies: Vec<Box<dyn Strategy>> = vec![Box::new(RecordingStrategy {
            name: "s".into(),
            subs: vec![("*".into(), Interval::minutes(1))],
            seen: seen.clone(),
        })];

        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = Shutdown::new();
        let dispatcher = StrategyDispatcher::new(
            rx,
            strategies,
            ctx(),
            true,
            shutdown.clone(),
            WorkerStatus::new("dispatcher"),
        );
        let handle = tokio::spawn(dispatcher.run());

        let (done_tx, done_rx) = oneshot::channel();
        tx.send(BarsUpdate {
            updated: vec![("RIVN".into(), Interval::minutes(1))],
            done: Some(done_tx),
        })
        .unwrap();
        done_rx.await.unwrap();
        // By the time done fires, the strategy has already recorded the bar.
        assert_eq!(seen.lock().len(), 1);

        shutdown.trigger();
        let _ = handle.await;
    }

    #[test]
    fn registry_skips_unknown_modules() {
        let configs = vec![
            StrategyConfig {
                module: "meridian.strategies.logger".into(),
                enabled: true,
                config: serde_json::json!({ "interval": "5m" }),
            },
            StrategyConfig {
                module: "meridian.strategies.alpha_unknown".into(),
                enabled: true,
                config: serde_json::Value::Null,
            },
            StrategyConfig {
                module: "momentum".into(),
                enabled: false,
                config: serde_json::Value::Null,
            },
        ];
        let built = build_strategies(&configs);
        assert_eq!(built.len(), 1);
        assert_eq!(built[0].name(), "logger");
        assert_eq!(built[0].subscriptions(), vec![("*".to_string(), Interval::minutes(5))]);
    }
}
