// =============================================================================
// System Manager — top-level runtime object
// =============================================================================
//
// Owns every long-lived object: the configuration, the time manager, the
// SessionData singleton, the data source, the worker statuses, and — while a
// run is active — the shutdown signal plus the coordinator handle. Nothing
// in the engine is a module-level global; everything is constructed here and
// passed down.
//
// `start()` wires the pipeline the way the teacher wires its subsystems:
// channels between workers, one spawned task per worker, cooperative
// shutdown. `export_state()` produces the full JSON document: system flags,
// per-thread operational state, and the SessionData tree.
// =============================================================================

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::calendar::TimeManager;
use crate::config::Config;
use crate::coordinator::{CoordinatorHandle, SessionCoordinator};
use crate::datasource::{DataSource, SyntheticSource};
use crate::dispatcher::{build_strategies, StrategyContext, StrategyDispatcher};
use crate::error::{CoreError, CoreResult};
use crate::processor::DataProcessor;
use crate::quality::{QualityConfig, QualityManager};
use crate::session_data::SessionData;
use crate::status::WorkerStatus;
use crate::sync::Shutdown;
use crate::types::AddedBy;

/// Lifecycle of the whole system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl std::fmt::Display for SystemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

pub struct SystemManager {
    config: Config,
    session: Arc<SessionData>,
    time_manager: Arc<TimeManager>,
    source: Arc<dyn DataSource>,

    state: Arc<RwLock<SystemState>>,
    /// The coordinator's terminal error when the state is `Failed`.
    terminal_error: Arc<RwLock<Option<CoreError>>>,
    session_id: RwLock<Option<Uuid>>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    shutdown: RwLock<Option<Shutdown>>,
    coordinator: RwLock<Option<CoordinatorHandle>>,
    handles: Mutex<Vec<JoinHandle<()>>>,

    status_coordinator: Arc<WorkerStatus>,
    status_processor: Arc<WorkerStatus>,
    status_quality: Arc<WorkerStatus>,
    status_dispatcher: Arc<WorkerStatus>,
}

impl SystemManager {
    /// Build with an explicit data source.
    pub fn new(config: Config, source: Arc<dyn DataSource>) -> Arc<Self> {
        let time_manager = Arc::new(TimeManager::new(config.mode, config.exchange_group.clone()));
        Arc::new(Self {
            config,
            session: Arc::new(SessionData::new()),
            time_manager,
            source,
            state: Arc::new(RwLock::new(SystemState::Idle)),
            terminal_error: Arc::new(RwLock::new(None)),
            session_id: RwLock::new(None),
            started_at: RwLock::new(None),
            shutdown: RwLock::new(None),
            coordinator: RwLock::new(None),
            handles: Mutex::new(Vec::new()),
            status_coordinator: WorkerStatus::new("coordinator"),
            status_processor: WorkerStatus::new("data_processor"),
            status_quality: WorkerStatus::new("quality_manager"),
            status_dispatcher: WorkerStatus::new("strategy_dispatcher"),
        })
    }

    /// Build with the synthetic source covering the configured symbols —
    /// the default for backtests and demos.
    pub fn with_synthetic_source(config: Config) -> Arc<Self> {
        let calendar = Arc::new(crate::calendar::UsEquityCalendar::new());
        let source = Arc::new(
            SyntheticSource::new(calendar).with_symbols(config.session_data_config.symbols.clone()),
        );
        Self::new(config, source)
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn state(&self) -> SystemState {
        *self.state.read()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session_data(&self) -> Arc<SessionData> {
        Arc::clone(&self.session)
    }

    pub fn time_manager(&self) -> Arc<TimeManager> {
        Arc::clone(&self.time_manager)
    }

    pub fn coordinator_handle(&self) -> Option<CoordinatorHandle> {
        self.coordinator.read().clone()
    }

    /// The error that moved the system to `Failed`, if any.
    pub fn terminal_error(&self) -> Option<CoreError> {
        self.terminal_error.read().clone()
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Spawn the full worker pipeline. Fails when already running. Must be
    /// called from within a tokio runtime.
    pub fn start(&self) -> CoreResult<()> {
        {
            let mut state = self.state.write();
            match *state {
                SystemState::Running | SystemState::Starting => {
                    return Err(CoreError::data("system is already running"));
                }
                _ => *state = SystemState::Starting,
            }
        }
        *self.terminal_error.write() = None;

        let shutdown = Shutdown::new();
        let exchange = self.config.exchange_group.clone();
        let data_driven = self.config.is_data_driven();

        // Channels: coordinator -> processor -> dispatcher.
        let (processor_tx, processor_rx) = mpsc::unbounded_channel();
        let (dispatcher_tx, dispatcher_rx) = mpsc::unbounded_channel();
        let notifications_paused = Arc::new(AtomicBool::new(false));

        // Strategy dispatcher (spawns one task per strategy).
        let strategies = build_strategies(&self.config.session_data_config.strategies);
        let dispatcher = StrategyDispatcher::new(
            dispatcher_rx,
            strategies,
            StrategyContext {
                session: Arc::clone(&self.session),
                time_manager: Arc::clone(&self.time_manager),
            },
            data_driven,
            shutdown.clone(),
            Arc::clone(&self.status_dispatcher),
        );

        // Data processor.
        let processor = DataProcessor::new(
            processor_rx,
            Arc::clone(&self.session),
            Arc::clone(&self.time_manager),
            exchange.clone(),
            dispatcher_tx,
            Arc::clone(&notifications_paused),
            data_driven,
            shutdown.clone(),
            Arc::clone(&self.status_processor),
        );

        // Quality manager.
        let quality = QualityManager::new(
            Arc::clone(&self.session),
            Arc::clone(&self.time_manager),
            exchange,
            Arc::clone(&self.source),
            self.config.mode,
            QualityConfig {
                sweep_ms: self.config.runtime.quality_sweep_ms,
                retry_limit: self.config.runtime.gap_retry_limit,
                fetch_timeout: Duration::from_secs(self.config.runtime.fetch_timeout_secs),
            },
            shutdown.clone(),
            Arc::clone(&self.status_quality),
        );

        // Coordinator.
        let (coordinator, handle) = SessionCoordinator::new(
            self.config.clone(),
            Arc::clone(&self.session),
            Arc::clone(&self.time_manager),
            Arc::clone(&self.source),
            processor_tx,
            notifications_paused,
            shutdown.clone(),
            Arc::clone(&self.status_coordinator),
        );

        let mut handles = self.handles.lock();
        handles.push(tokio::spawn(dispatcher.run()));
        handles.push(tokio::spawn(processor.run()));
        handles.push(tokio::spawn(quality.run()));

        // The coordinator's natural end flips the system to Stopped; a
        // terminal error (stream validation, all symbols failing, invariant
        // violation) flips it to Failed and is kept for the exit-code and
        // status surfaces.
        let state_cell = Arc::clone(&self.state);
        let error_cell = Arc::clone(&self.terminal_error);
        let coordinator_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let result = coordinator.run().await;
            coordinator_shutdown.trigger();
            let failed = result.is_err();
            if let Err(e) = result {
                *error_cell.write() = Some(e);
            }
            let mut state = state_cell.write();
            if matches!(
                *state,
                SystemState::Running | SystemState::Starting | SystemState::Stopping
            ) {
                *state = if failed {
                    SystemState::Failed
                } else {
                    SystemState::Stopped
                };
            }
        }));
        drop(handles);

        *self.coordinator.write() = Some(handle);
        *self.shutdown.write() = Some(shutdown);
        *self.session_id.write() = Some(Uuid::new_v4());
        *self.started_at.write() = Some(Utc::now());
        *self.state.write() = SystemState::Running;
        info!(mode = %self.config.mode, "system started");
        Ok(())
    }

    /// Trigger cooperative shutdown and wait (bounded) for the workers.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write();
            if !matches!(*state, SystemState::Running | SystemState::Starting) {
                return;
            }
            *state = SystemState::Stopping;
        }

        if let Some(shutdown) = self.shutdown.read().clone() {
            shutdown.trigger();
        }

        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!("worker did not stop within 5s; detaching");
            }
        }

        *self.coordinator.write() = None;
        {
            let mut state = self.state.write();
            // A terminal failure observed while stopping stays Failed.
            if *state != SystemState::Failed {
                *state = SystemState::Stopped;
            }
        }
        info!("system stopped");
    }

    /// Block until the run ends on its own (backtest exhaustion) or the
    /// timeout elapses. Returns the final state.
    pub async fn wait_until_stopped(&self, timeout: Duration) -> SystemState {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let state = self.state();
            if matches!(state, SystemState::Stopped | SystemState::Failed | SystemState::Idle) {
                return state;
            }
            if tokio::time::Instant::now() >= deadline {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    // ── Mid-session operations (pass-through to the coordinator) ────────

    pub fn add_symbol(
        &self,
        symbol: &str,
        added_by: AddedBy,
    ) -> CoreResult<tokio::sync::oneshot::Receiver<CoreResult<crate::coordinator::AddOutcome>>>
    {
        let handle = self
            .coordinator_handle()
            .ok_or_else(|| CoreError::data("system is not running"))?;
        Ok(handle.add_symbol(symbol, added_by))
    }

    pub fn remove_symbol(
        &self,
        symbol: &str,
    ) -> CoreResult<tokio::sync::oneshot::Receiver<CoreResult<crate::coordinator::AddOutcome>>>
    {
        let handle = self
            .coordinator_handle()
            .ok_or_else(|| CoreError::data("system is not running"))?;
        Ok(handle.remove_symbol(symbol))
    }

    /// Symbols that entered the session outside the configuration.
    pub fn dynamic_symbols(&self) -> Vec<Value> {
        let mut out = Vec::new();
        for symbol in self.session.get_active_symbols() {
            let entry = self.session.with_symbol(&symbol, false, |sd| {
                if sd.meta.added_by == AddedBy::Config {
                    None
                } else {
                    Some(json!({
                        "symbol": sd.symbol,
                        "added_by": sd.meta.added_by.to_string(),
                        "auto_provisioned": sd.meta.auto_provisioned,
                        "upgraded_from_adhoc": sd.meta.upgraded_from_adhoc,
                        "meets_session_config_requirements":
                            sd.meta.meets_session_config_requirements,
                        "added_at": sd.meta.added_at.to_rfc3339(),
                    }))
                }
            });
            if let Some(Some(v)) = entry {
                out.push(v);
            }
        }
        out
    }

    // ── Exports ─────────────────────────────────────────────────────────

    /// The `system_manager` section of the state export.
    pub fn status_json(&self) -> Value {
        let backtest_window = self.config.backtest_config.as_ref().map(|bt| {
            json!({
                "start_date": bt.start_date.to_string(),
                "end_date": bt.end_date.to_string(),
                "speed_multiplier": bt.speed_multiplier,
            })
        });
        json!({
            "state": self.state().to_string(),
            "mode": self.config.mode.to_string(),
            "timezone": self
                .time_manager
                .timezone(self.config.exchange_group.as_str())
                .name(),
            "exchange_group": self.config.exchange_group,
            "backtest_window": backtest_window,
            "session_id": self.session_id.read().map(|id| id.to_string()),
            "started_at": self.started_at.read().map(|t| t.to_rfc3339()),
            "terminal_error": self.terminal_error.read().as_ref().map(|e| e.to_string()),
        })
    }

    /// The complete state document: system flags, per-thread operational
    /// state, and the SessionData tree.
    pub fn export_state(&self, complete: bool) -> Value {
        let mut threads = serde_json::Map::new();
        for status in [
            &self.status_coordinator,
            &self.status_processor,
            &self.status_quality,
            &self.status_dispatcher,
        ] {
            threads.insert(status.name().to_string(), status.export());
        }
        json!({
            "system_manager": self.status_json(),
            "threads": threads,
            "session_data": self.session.export(complete),
        })
    }

    pub fn session_version(&self) -> u64 {
        self.session.version()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        serde_json::from_str(
            r#"{
                "mode": "backtest",
                "backtest_config": { "start_date": "2025-07-01", "end_date": "2025-07-01" },
                "session_data_config": {
                    "symbols": ["RIVN"],
                    "streams": ["1m", "5m"]
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn starts_idle_with_status_export() {
        let manager = SystemManager::with_synthetic_source(config());
        assert_eq!(manager.state(), SystemState::Idle);
        let status = manager.status_json();
        assert_eq!(status["state"], "idle");
        assert_eq!(status["mode"], "backtest");
        assert_eq!(status["timezone"], "America/New_York");
        assert_eq!(status["exchange_group"], "US_EQUITY");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn one_day_backtest_runs_to_completion() {
        let manager = SystemManager::with_synthetic_source(config());
        manager.start().unwrap();
        assert_eq!(manager.state(), SystemState::Running);
        // Double-start is rejected.
        assert!(manager.start().is_err());

        let final_state = manager.wait_until_stopped(Duration::from_secs(60)).await;
        assert_eq!(final_state, SystemState::Stopped);

        let export = manager.export_state(true);
        assert_eq!(export["system_manager"]["state"], "stopped");
        // Teardown cleared the session tree.
        assert!(export["session_data"]["symbols"]
            .as_object()
            .unwrap()
            .is_empty());
        // The coordinator streamed a full regular session.
        let streamed = export["threads"]["coordinator"]["bars_streamed"]
            .as_u64()
            .unwrap();
        assert_eq!(streamed, 390);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_interrupts_a_run() {
        let manager = SystemManager::with_synthetic_source(config());
        manager.start().unwrap();
        manager.stop().await;
        assert_eq!(manager.state(), SystemState::Stopped);
        // Stopping again is a no-op.
        manager.stop().await;
        assert_eq!(manager.state(), SystemState::Stopped);
    }
}
