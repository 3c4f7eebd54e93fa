// =============================================================================
// Meridian — Main Entry Point
// =============================================================================
//
// Loads the session configuration, builds the system manager, serves the
// control API, and starts the engine. In backtest mode the process exits
// when the replay window is exhausted; in live mode it runs until Ctrl+C.
// =============================================================================

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use meridian::api;
use meridian::system::{SystemManager, SystemState};
use meridian::{Config, CoreError};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Meridian session engine starting up");

    let config_path =
        std::env::var("MERIDIAN_CONFIG").unwrap_or_else(|_| "meridian.json".to_string());
    let mut config = Config::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, path = %config_path, "failed to load config, using defaults");
        default_config()
    });

    // Override symbols from env if available.
    if let Ok(syms) = std::env::var("MERIDIAN_SYMBOLS") {
        config.session_data_config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }

    info!(
        mode = %config.mode,
        symbols = ?config.session_data_config.symbols,
        streams = ?config.session_data_config.streams,
        exchange = %config.exchange_group,
        "session configuration resolved"
    );

    // ── 2. Build the system manager ──────────────────────────────────────
    let manager = SystemManager::with_synthetic_source(config.clone());

    // ── 3. Start the control API ─────────────────────────────────────────
    let bind_addr =
        std::env::var("MERIDIAN_BIND_ADDR").unwrap_or_else(|_| config.runtime.bind_addr.clone());
    let api_manager = Arc::clone(&manager);
    let bind_addr_clone = bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_manager);
        let listener = match tokio::net::TcpListener::bind(&bind_addr_clone).await {
            Ok(l) => l,
            Err(e) => {
                error!(addr = %bind_addr_clone, error = %e, "failed to bind control API");
                return;
            }
        };
        info!(addr = %bind_addr_clone, "control API listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "control API server failed");
        }
    });

    // ── 4. Start the engine ──────────────────────────────────────────────
    if let Err(e) = manager.start() {
        error!(error = %e, "engine failed to start");
        std::process::exit(2);
    }

    // ── 5. Run until the backtest completes or Ctrl+C ────────────────────
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received — stopping gracefully");
            manager.stop().await;
        }
        state = wait_for_exit(&manager) => {
            if state == SystemState::Failed {
                // Exit-code contract: 1 for validation failures, 2 for
                // runtime failures.
                let code = match manager.terminal_error() {
                    Some(CoreError::Validation { .. }) | Some(CoreError::Config(_)) => 1,
                    _ => 2,
                };
                error!(
                    error = ?manager.terminal_error().map(|e| e.to_string()),
                    code,
                    "engine run failed"
                );
                std::process::exit(code);
            }
            info!(state = %state, "engine run completed");
        }
    }

    info!("Meridian shut down complete");
    Ok(())
}

async fn wait_for_exit(manager: &Arc<SystemManager>) -> SystemState {
    loop {
        let state = manager.state();
        if matches!(state, SystemState::Stopped | SystemState::Failed) {
            return state;
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
}

fn default_config() -> Config {
    serde_json::from_value(serde_json::json!({
        "mode": "backtest",
        "backtest_config": {
            "start_date": "2025-07-01",
            "end_date": "2025-07-02",
            "speed_multiplier": 0
        },
        "session_data_config": {
            "symbols": ["RIVN", "AAPL"],
            "streams": ["1m", "5m"],
            "historical": {
                "enabled": true,
                "data": [ { "interval": "1m", "trailing_days": 3 } ]
            }
        },
        "exchange_group": "US_EQUITY"
    }))
    .expect("built-in default config is valid")
}
