// =============================================================================
// Session Configuration — the single input document
// =============================================================================
//
// One JSON file describes an entire run: the mode, the backtest window, the
// per-session data requirements (symbols, streamed intervals, historical
// windows, indicators, strategies) and the exchange group.
//
// Unrecognized keys are a startup failure (`deny_unknown_fields`), because a
// typo in a stream tag or indicator field silently changing behaviour is far
// worse than a refused start. Tunables that are not part of the session
// contract live under `runtime` with serde defaults so older files keep
// loading.
//
// Persistence uses the atomic tmp + rename pattern to prevent corruption on
// crash.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{CoreError, CoreResult};
use crate::types::{Interval, Mode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_exchange_group() -> String {
    "US_EQUITY".to_string()
}

fn default_true() -> bool {
    true
}

fn default_speed_multiplier() -> u32 {
    0
}

fn default_warmup_multiplier() -> u32 {
    2
}

fn default_quality_sweep_ms() -> u64 {
    1_000
}

fn default_fetch_timeout_secs() -> u64 {
    5
}

fn default_gap_retry_limit() -> u32 {
    3
}

fn default_provisioning_budget_secs() -> u64 {
    30
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

// =============================================================================
// Backtest window
// =============================================================================

/// The replay window and pacing for backtest mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BacktestConfig {
    /// First session date to replay (inclusive), `YYYY-MM-DD`.
    pub start_date: NaiveDate,
    /// Last session date to replay (inclusive), `YYYY-MM-DD`.
    pub end_date: NaiveDate,
    /// Real-time pacing divisor. `0` replays as fast as possible and runs
    /// the pipeline data-driven (the clock waits for strategies).
    #[serde(default = "default_speed_multiplier")]
    pub speed_multiplier: u32,
}

// =============================================================================
// Session data requirements
// =============================================================================

/// One historical window requirement: `interval` bars for the trailing
/// `trailing_days` trading days before the session date.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistoricalInterval {
    pub interval: String,
    pub trailing_days: u32,
}

/// Historical loading block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistoricalConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub data: Vec<HistoricalInterval>,
}

/// Declaration of one indicator to register.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndicatorSpec {
    /// Registration name, unique per symbol (e.g. `"sma_20_5m"`).
    pub name: String,
    /// Indicator kind tag (`sma`, `ema`, `rsi`, `macd`, `bollinger`, `atr`,
    /// `obv`, `vwap`).
    #[serde(rename = "type")]
    pub kind: String,
    pub period: usize,
    pub interval: String,
    /// Kind-specific parameters (MACD fast/slow/signal, Bollinger width...).
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Indicators block: session indicators update live on every bar of their
/// interval; historical indicators are computed once over the historical
/// window at provision time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndicatorsConfig {
    #[serde(default)]
    pub session: Vec<IndicatorSpec>,
    #[serde(default)]
    pub historical: Vec<IndicatorSpec>,
}

/// One strategy module to load into the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyConfig {
    /// Dotted module path resolved against the built-in strategy registry.
    pub module: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// The per-session data requirements.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionDataConfig {
    /// Symbols declared by configuration. Each is fully provisioned in
    /// Phase B with `added_by = config`.
    pub symbols: Vec<String>,
    /// Required streamed interval tags. The smallest that divides all others
    /// becomes the session base interval.
    pub streams: Vec<String>,
    #[serde(default)]
    pub historical: HistoricalConfig,
    #[serde(default)]
    pub indicators: IndicatorsConfig,
    #[serde(default)]
    pub strategies: Vec<StrategyConfig>,
}

// =============================================================================
// Runtime tuning (ambient knobs, all defaulted)
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeTuning {
    /// Warmup bar multiplier applied to every indicator's minimum warmup
    /// count when sizing historical loads.
    #[serde(default = "default_warmup_multiplier")]
    pub warmup_multiplier: u32,

    /// Quality-manager sweep cadence in milliseconds.
    #[serde(default = "default_quality_sweep_ms")]
    pub quality_sweep_ms: u64,

    /// Per-fetch timeout for live-mode gap backfills, seconds.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Maximum backfill attempts per gap before the gap is left as measured.
    #[serde(default = "default_gap_retry_limit")]
    pub gap_retry_limit: u32,

    /// Wall-clock budget for one mid-session provisioning run, seconds. On
    /// exceeded budget the new symbol is rejected and rolled back.
    #[serde(default = "default_provisioning_budget_secs")]
    pub provisioning_budget_secs: u64,

    /// Bind address of the control API.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for RuntimeTuning {
    fn default() -> Self {
        Self {
            warmup_multiplier: default_warmup_multiplier(),
            quality_sweep_ms: default_quality_sweep_ms(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            gap_retry_limit: default_gap_retry_limit(),
            provisioning_budget_secs: default_provisioning_budget_secs(),
            bind_addr: default_bind_addr(),
        }
    }
}

// =============================================================================
// Config
// =============================================================================

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub mode: Mode,

    /// Required when `mode == backtest`.
    #[serde(default)]
    pub backtest_config: Option<BacktestConfig>,

    pub session_data_config: SessionDataConfig,

    #[serde(default = "default_exchange_group")]
    pub exchange_group: String,

    #[serde(default)]
    pub runtime: RuntimeTuning,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("invalid config in {}", path.display()))?;

        info!(
            path = %path.display(),
            mode = %config.mode,
            symbols = ?config.session_data_config.symbols,
            streams = ?config.session_data_config.streams,
            "config loaded"
        );

        Ok(config)
    }

    /// Persist to `path` using an atomic write (write to `.tmp`, then
    /// rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<()> {
        if self.mode == Mode::Backtest {
            let bt = self
                .backtest_config
                .as_ref()
                .context("backtest mode requires backtest_config")?;
            if bt.end_date < bt.start_date {
                anyhow::bail!(
                    "backtest end_date {} precedes start_date {}",
                    bt.end_date,
                    bt.start_date
                );
            }
        }
        if self.session_data_config.streams.is_empty() {
            anyhow::bail!("session_data_config.streams must not be empty");
        }
        for tag in &self.session_data_config.streams {
            Interval::parse(tag)
                .map_err(|e| anyhow::anyhow!("invalid stream interval '{tag}': {e}"))?;
        }
        for hist in &self.session_data_config.historical.data {
            Interval::parse(&hist.interval)
                .map_err(|e| anyhow::anyhow!("invalid historical interval: {e}"))?;
        }
        for spec in self
            .session_data_config
            .indicators
            .session
            .iter()
            .chain(&self.session_data_config.indicators.historical)
        {
            Interval::parse(&spec.interval)
                .map_err(|e| anyhow::anyhow!("indicator '{}': {e}", spec.name))?;
            if spec.period == 0 {
                anyhow::bail!("indicator '{}' has period 0", spec.name);
            }
        }
        Ok(())
    }

    /// Parsed stream intervals.
    pub fn stream_intervals(&self) -> CoreResult<Vec<Interval>> {
        self.session_data_config
            .streams
            .iter()
            .map(|t| Interval::parse(t).map_err(CoreError::from))
            .collect()
    }

    /// Parsed historical `(interval, trailing_days)` pairs. Empty when
    /// historical loading is disabled.
    pub fn historical_intervals(&self) -> CoreResult<Vec<(Interval, u32)>> {
        if !self.session_data_config.historical.enabled {
            return Ok(Vec::new());
        }
        self.session_data_config
            .historical
            .data
            .iter()
            .map(|h| {
                Interval::parse(&h.interval)
                    .map(|iv| (iv, h.trailing_days))
                    .map_err(CoreError::from)
            })
            .collect()
    }

    /// Whether this run is data-driven: the simulated clock waits for the
    /// full strategy round-trip on every bar.
    pub fn is_data_driven(&self) -> bool {
        self.mode == Mode::Backtest
            && self
                .backtest_config
                .as_ref()
                .map(|bt| bt.speed_multiplier == 0)
                .unwrap_or(true)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> String {
        r#"{
            "mode": "backtest",
            "backtest_config": { "start_date": "2025-07-01", "end_date": "2025-07-02" },
            "session_data_config": {
                "symbols": ["RIVN"],
                "streams": ["1m", "5m"]
            }
        }"#
        .to_string()
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg: Config = serde_json::from_str(&minimal_json()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.mode, Mode::Backtest);
        assert_eq!(cfg.exchange_group, "US_EQUITY");
        assert!(!cfg.session_data_config.historical.enabled);
        assert!(cfg.session_data_config.strategies.is_empty());
        assert_eq!(cfg.runtime.gap_retry_limit, 3);
        assert_eq!(cfg.runtime.fetch_timeout_secs, 5);
        assert!(cfg.is_data_driven());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let json = minimal_json().replace("\"mode\"", "\"not_a_key\": 1, \"mode\"");
        assert!(serde_json::from_str::<Config>(&json).is_err());
    }

    #[test]
    fn backtest_mode_requires_window() {
        let json = r#"{
            "mode": "backtest",
            "session_data_config": { "symbols": ["A"], "streams": ["1m"] }
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn hourly_stream_tag_fails_validation() {
        let json = minimal_json().replace("\"5m\"", "\"1h\"");
        let cfg: Config = serde_json::from_str(&json).unwrap();
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("use minutes"), "got: {err}");
    }

    #[test]
    fn inverted_window_fails_validation() {
        let json = minimal_json().replace("2025-07-02", "2025-06-30");
        let cfg: Config = serde_json::from_str(&json).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn stream_intervals_parse() {
        let cfg: Config = serde_json::from_str(&minimal_json()).unwrap();
        let ivs = cfg.stream_intervals().unwrap();
        assert_eq!(ivs, vec![Interval::minutes(1), Interval::minutes(5)]);
    }

    #[test]
    fn full_document_parses() {
        let json = r#"{
            "mode": "live",
            "session_data_config": {
                "symbols": ["AAPL", "MSFT"],
                "streams": ["1m"],
                "historical": {
                    "enabled": true,
                    "data": [ { "interval": "1m", "trailing_days": 3 } ]
                },
                "indicators": {
                    "session": [
                        { "name": "sma_20_5m", "type": "sma", "period": 20, "interval": "5m" }
                    ],
                    "historical": []
                },
                "strategies": [
                    { "module": "meridian.strategies.momentum", "enabled": true, "config": {} }
                ]
            },
            "exchange_group": "US_EQUITY"
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.historical_intervals().unwrap(), vec![(Interval::minutes(1), 3)]);
        assert!(!cfg.is_data_driven());
    }

    #[test]
    fn atomic_save_roundtrip() {
        let cfg: Config = serde_json::from_str(&minimal_json()).unwrap();
        let dir = std::env::temp_dir().join("meridian-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        cfg.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.session_data_config.symbols, vec!["RIVN"]);
        std::fs::remove_file(&path).ok();
    }
}
