// =============================================================================
// Shared types used across the Meridian session engine
// =============================================================================
//
// The two foundational value types of the whole pipeline live here:
//
//   * `Bar` — an immutable OHLCV record stamped in the exchange timezone.
//   * `Interval` — a canonical bar-interval tag (`1m`, `5m`, `30s`, `1d`, ...).
//
// Hourly tags are deliberately rejected at parse time; callers must express
// hours in minutes (`60m`). This keeps the divisibility arithmetic between
// base and derived intervals in a single unit family.
// =============================================================================

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Bar
// =============================================================================

/// Where a bar came from. Recorded on every bar so the quality manager and
/// the state export can tell streamed data from locally produced data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BarSource {
    /// Delivered by the streaming feed (or the backtest replay queues).
    Stream,
    /// Loaded from the historical fetch layer during provisioning.
    Historical,
    /// Re-fetched by the quality manager to fill a gap.
    Backfill,
    /// Aggregated locally from base-interval bars.
    Derived,
}

impl fmt::Display for BarSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream => write!(f, "stream"),
            Self::Historical => write!(f, "historical"),
            Self::Backfill => write!(f, "backfill"),
            Self::Derived => write!(f, "derived"),
        }
    }
}

/// A single OHLCV bar for one `(symbol, interval)` window.
///
/// Timestamps are timezone-aware and carry the exchange timezone; conversion
/// to UTC happens only at interchange boundaries (JSON export). A bar stamped
/// `t` for interval `i` covers the half-open window `[t, t + i)`.
///
/// Bars are immutable after creation — nothing in the engine mutates a bar
/// once it has been appended to a series.
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub symbol: String,
    pub timestamp: DateTime<Tz>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub source: BarSource,
}

impl Bar {
    /// Typical price, used by volume-weighted indicators.
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

// =============================================================================
// Interval
// =============================================================================

/// The unit family of an interval tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IntervalUnit {
    Second,
    Minute,
    Day,
    Week,
}

impl IntervalUnit {
    /// Canonical length of one unit in seconds.
    pub fn seconds(self) -> i64 {
        match self {
            Self::Second => 1,
            Self::Minute => 60,
            Self::Day => 86_400,
            Self::Week => 604_800,
        }
    }

    fn suffix(self) -> char {
        match self {
            Self::Second => 's',
            Self::Minute => 'm',
            Self::Day => 'd',
            Self::Week => 'w',
        }
    }
}

/// Error produced when an interval tag cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntervalParseError {
    #[error("empty interval tag")]
    Empty,
    #[error("interval tag '{0}' has no numeric prefix")]
    MissingCount(String),
    #[error("interval count must be positive in '{0}'")]
    ZeroCount(String),
    #[error("hourly interval tags are not supported; use minutes instead (e.g. '60m' for '{0}')")]
    HourlyRejected(String),
    #[error("unknown interval unit in '{0}' (expected one of s, m, d, w)")]
    UnknownUnit(String),
}

/// A canonical bar interval: a positive count plus a unit, e.g. `1m`, `30s`,
/// `5m`, `1d`, `1w`.
///
/// A derived interval `d` is producible from a base interval `b` iff
/// `d.seconds() >= b.seconds() && d.seconds() % b.seconds() == 0`
/// (see [`Interval::is_derivable_from`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval {
    count: u32,
    unit: IntervalUnit,
}

impl Interval {
    pub fn new(count: u32, unit: IntervalUnit) -> Self {
        debug_assert!(count > 0, "interval count must be positive");
        Self { count, unit }
    }

    pub fn seconds_n(count: u32) -> Self {
        Self::new(count, IntervalUnit::Second)
    }

    pub fn minutes(count: u32) -> Self {
        Self::new(count, IntervalUnit::Minute)
    }

    pub fn days(count: u32) -> Self {
        Self::new(count, IntervalUnit::Day)
    }

    pub fn weeks(count: u32) -> Self {
        Self::new(count, IntervalUnit::Week)
    }

    pub fn unit(&self) -> IntervalUnit {
        self.unit
    }

    /// Canonical length in seconds.
    pub fn seconds(&self) -> i64 {
        self.count as i64 * self.unit.seconds()
    }

    /// Length as a chrono `Duration`.
    pub fn duration(&self) -> Duration {
        Duration::seconds(self.seconds())
    }

    /// True for second/minute intervals, false for day/week.
    pub fn is_intraday(&self) -> bool {
        matches!(self.unit, IntervalUnit::Second | IntervalUnit::Minute)
    }

    /// Whether bars of `self` can be aggregated from bars of `base`.
    pub fn is_derivable_from(&self, base: Interval) -> bool {
        let (d, b) = (self.seconds(), base.seconds());
        d >= b && d % b == 0
    }

    /// Parse a canonical tag such as `1m`, `30s`, `5m`, `1d`.
    ///
    /// Hourly tags (`1h`, `2h`, ...) are rejected with a dedicated error so
    /// the caller can surface the "use minutes" guidance.
    pub fn parse(tag: &str) -> Result<Self, IntervalParseError> {
        let tag = tag.trim();
        if tag.is_empty() {
            return Err(IntervalParseError::Empty);
        }

        let digits: String = tag.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return Err(IntervalParseError::MissingCount(tag.to_string()));
        }
        let count: u32 = digits
            .parse()
            .map_err(|_| IntervalParseError::MissingCount(tag.to_string()))?;
        if count == 0 {
            return Err(IntervalParseError::ZeroCount(tag.to_string()));
        }

        let unit = match &tag[digits.len()..] {
            "s" => IntervalUnit::Second,
            "m" => IntervalUnit::Minute,
            "d" => IntervalUnit::Day,
            "w" => IntervalUnit::Week,
            "h" | "H" => return Err(IntervalParseError::HourlyRejected(tag.to_string())),
            _ => return Err(IntervalParseError::UnknownUnit(tag.to_string())),
        };

        Ok(Self { count, unit })
    }
}

// Ordering by canonical seconds, ties broken by unit so that equal-length
// tags from different families (e.g. 86400s vs 1d) order deterministically.
impl PartialOrd for Interval {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Interval {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.seconds()
            .cmp(&other.seconds())
            .then(self.unit.cmp(&other.unit))
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.count, self.unit.suffix())
    }
}

impl FromStr for Interval {
    type Err = IntervalParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Interval {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Self::parse(&tag).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Provenance & mode enums
// =============================================================================

/// How a symbol entered the session. Determines metadata defaults and whether
/// full or minimal provisioning is performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddedBy {
    Config,
    Strategy,
    Scanner,
    Adhoc,
}

impl fmt::Display for AddedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config => write!(f, "config"),
            Self::Strategy => write!(f, "strategy"),
            Self::Scanner => write!(f, "scanner"),
            Self::Adhoc => write!(f, "adhoc"),
        }
    }
}

/// Whether the engine replays history against a simulated clock or streams
/// from a live feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Backtest,
    Live,
}

impl Default for Mode {
    fn default() -> Self {
        Self::Backtest
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backtest => write!(f, "backtest"),
            Self::Live => write!(f, "live"),
        }
    }
}
