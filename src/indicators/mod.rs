// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Streaming implementations of the indicators the session engine can
// register. Each kind lives in its own file as a state record plus a pure,
// side-effect-free update function returning `Option<T>`, so callers are
// forced to handle the warmup and numerical-edge-case scenarios.
//
// This module ties the kinds together into a closed sum type: an
// `IndicatorData` carries an immutable `IndicatorConfig`, a per-kind mutable
// `IndicatorState`, and the latest `IndicatorValue`. Dispatch happens on the
// kind tag in `IndicatorData::update`.
// =============================================================================

pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod obv;
pub mod rsi;
pub mod sma;
pub mod vwap;

use chrono::DateTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::config::IndicatorSpec;
use crate::error::{CoreError, CoreResult};
use crate::types::{Bar, Interval};

// =============================================================================
// Kind & parameters
// =============================================================================

/// The closed set of indicator kinds the engine supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorKind {
    Sma,
    Ema,
    Rsi,
    Macd,
    Bollinger,
    Atr,
    Obv,
    Vwap,
}

impl IndicatorKind {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "sma" => Some(Self::Sma),
            "ema" => Some(Self::Ema),
            "rsi" => Some(Self::Rsi),
            "macd" => Some(Self::Macd),
            "bollinger" | "bbands" => Some(Self::Bollinger),
            "atr" => Some(Self::Atr),
            "obv" => Some(Self::Obv),
            "vwap" => Some(Self::Vwap),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sma => "sma",
            Self::Ema => "ema",
            Self::Rsi => "rsi",
            Self::Macd => "macd",
            Self::Bollinger => "bollinger",
            Self::Atr => "atr",
            Self::Obv => "obv",
            Self::Vwap => "vwap",
        }
    }
}

impl std::fmt::Display for IndicatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific tunables with conventional defaults. Only the fields
/// relevant to the configured kind are consulted.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorParams {
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub band_width: f64,
}

impl Default for IndicatorParams {
    fn default() -> Self {
        Self {
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            band_width: 2.0,
        }
    }
}

impl IndicatorParams {
    fn from_json(value: &serde_json::Value) -> Self {
        let mut params = Self::default();
        if let Some(v) = value.get("fast").and_then(|v| v.as_u64()) {
            params.macd_fast = v as usize;
        }
        if let Some(v) = value.get("slow").and_then(|v| v.as_u64()) {
            params.macd_slow = v as usize;
        }
        if let Some(v) = value.get("signal").and_then(|v| v.as_u64()) {
            params.macd_signal = v as usize;
        }
        if let Some(v) = value.get("width").and_then(|v| v.as_f64()) {
            params.band_width = v;
        }
        params
    }
}

// =============================================================================
// Config
// =============================================================================

/// Immutable description of one registered indicator.
#[derive(Debug, Clone)]
pub struct IndicatorConfig {
    pub name: String,
    pub kind: IndicatorKind,
    pub period: usize,
    pub interval: Interval,
    pub params: IndicatorParams,
}

impl IndicatorConfig {
    /// Build from a config-file spec, rejecting unknown kinds and bad
    /// interval tags.
    pub fn from_spec(spec: &IndicatorSpec) -> CoreResult<Self> {
        let kind = IndicatorKind::parse(&spec.kind).ok_or_else(|| {
            CoreError::config(format!(
                "indicator '{}' has unknown type '{}'",
                spec.name, spec.kind
            ))
        })?;
        let interval = Interval::parse(&spec.interval)?;
        Ok(Self {
            name: spec.name.clone(),
            kind,
            period: spec.period,
            interval,
            params: IndicatorParams::from_json(&spec.params),
        })
    }

    /// Minimum number of bars that must be fed before the indicator reports
    /// a value. This is exactly the bar count at which the update function
    /// first returns `Some`.
    pub fn warmup_bars(&self) -> usize {
        match self.kind {
            IndicatorKind::Sma | IndicatorKind::Ema | IndicatorKind::Bollinger => self.period,
            IndicatorKind::Rsi => self.period + 1,
            IndicatorKind::Atr => self.period,
            IndicatorKind::Macd => self.params.macd_slow + self.params.macd_signal - 1,
            IndicatorKind::Obv | IndicatorKind::Vwap => 1,
        }
    }
}

// =============================================================================
// Value & state
// =============================================================================

/// What an indicator reports: a single number or a small named tuple.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IndicatorValue {
    Scalar(f64),
    Macd {
        macd: f64,
        signal: f64,
        histogram: f64,
    },
    Bands {
        middle: f64,
        upper: f64,
        lower: f64,
    },
}

impl IndicatorValue {
    /// Scalar view for callers that only care about one number (historical
    /// indicator summaries): MACD reports the line, bands the middle.
    pub fn primary(&self) -> f64 {
        match self {
            Self::Scalar(v) => *v,
            Self::Macd { macd, .. } => *macd,
            Self::Bands { middle, .. } => *middle,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Scalar(v) => serde_json::json!(v),
            Self::Macd {
                macd,
                signal,
                histogram,
            } => serde_json::json!({ "macd": macd, "signal": signal, "histogram": histogram }),
            Self::Bands {
                middle,
                upper,
                lower,
            } => serde_json::json!({ "middle": middle, "upper": upper, "lower": lower }),
        }
    }
}

/// Per-kind mutable computation state.
#[derive(Debug, Clone)]
pub enum IndicatorState {
    Sma(sma::SmaState),
    Ema(ema::EmaState),
    Rsi(rsi::RsiState),
    Macd(macd::MacdState),
    Bollinger(bollinger::BollingerState),
    Atr(atr::AtrState),
    Obv(obv::ObvState),
    Vwap(vwap::VwapState),
}

impl IndicatorState {
    fn for_kind(kind: IndicatorKind) -> Self {
        match kind {
            IndicatorKind::Sma => Self::Sma(sma::SmaState::new()),
            IndicatorKind::Ema => Self::Ema(ema::EmaState::new()),
            IndicatorKind::Rsi => Self::Rsi(rsi::RsiState::new()),
            IndicatorKind::Macd => Self::Macd(macd::MacdState::new()),
            IndicatorKind::Bollinger => Self::Bollinger(bollinger::BollingerState::new()),
            IndicatorKind::Atr => Self::Atr(atr::AtrState::new()),
            IndicatorKind::Obv => Self::Obv(obv::ObvState::new()),
            IndicatorKind::Vwap => Self::Vwap(vwap::VwapState::new()),
        }
    }
}

// =============================================================================
// IndicatorData
// =============================================================================

/// One live indicator instance attached to a `(symbol, interval)` series.
#[derive(Debug, Clone)]
pub struct IndicatorData {
    pub config: IndicatorConfig,
    pub state: IndicatorState,
    pub current_value: Option<IndicatorValue>,
    /// False until the warmup bar count has been fed.
    pub valid: bool,
    pub last_updated: Option<DateTime<Tz>>,
    pub bars_seen: usize,
}

impl IndicatorData {
    pub fn new(config: IndicatorConfig) -> Self {
        let state = IndicatorState::for_kind(config.kind);
        Self {
            config,
            state,
            current_value: None,
            valid: false,
            last_updated: None,
            bars_seen: 0,
        }
    }

    /// Feed one bar of the indicator's interval through the kind-specific
    /// update function.
    pub fn update(&mut self, bar: &Bar) {
        self.bars_seen += 1;

        let produced = match &mut self.state {
            IndicatorState::Sma(state) => {
                sma::update(state, bar.close, self.config.period).map(IndicatorValue::Scalar)
            }
            IndicatorState::Ema(state) => {
                ema::update(state, bar.close, self.config.period).map(IndicatorValue::Scalar)
            }
            IndicatorState::Rsi(state) => {
                rsi::update(state, bar.close, self.config.period).map(IndicatorValue::Scalar)
            }
            IndicatorState::Macd(state) => macd::update(
                state,
                bar.close,
                self.config.params.macd_fast,
                self.config.params.macd_slow,
                self.config.params.macd_signal,
            )
            .map(|out| IndicatorValue::Macd {
                macd: out.macd,
                signal: out.signal,
                histogram: out.histogram,
            }),
            IndicatorState::Bollinger(state) => bollinger::update(
                state,
                bar.close,
                self.config.period,
                self.config.params.band_width,
            )
            .map(|bands| IndicatorValue::Bands {
                middle: bands.middle,
                upper: bands.upper,
                lower: bands.lower,
            }),
            IndicatorState::Atr(state) => {
                atr::update(state, bar.high, bar.low, bar.close, self.config.period)
                    .map(IndicatorValue::Scalar)
            }
            IndicatorState::Obv(state) => {
                obv::update(state, bar.close, bar.volume).map(IndicatorValue::Scalar)
            }
            IndicatorState::Vwap(state) => {
                vwap::update(state, bar.timestamp, bar.typical_price(), bar.volume)
                    .map(IndicatorValue::Scalar)
            }
        };

        if let Some(value) = produced {
            self.current_value = Some(value);
            self.valid = true;
            self.last_updated = Some(bar.timestamp);
        }
    }
}
