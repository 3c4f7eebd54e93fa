// =============================================================================
// Per-symbol session state
// =============================================================================
//
// Everything the engine knows about one symbol lives in a single
// `SymbolSessionData` tree: the per-interval bar series, session metrics,
// live indicators, the historical store, and the provenance metadata.
// Deleting the symbol deletes all of it — there are no side tables.
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;

use crate::error::{CoreError, CoreResult};
use crate::indicators::IndicatorData;
use crate::types::{AddedBy, Bar, Interval};

// =============================================================================
// Gap
// =============================================================================

/// A contiguous run of missing expected bars inside a regular session.
#[derive(Debug, Clone, PartialEq)]
pub struct Gap {
    /// First missing timestamp.
    pub start_time: DateTime<Tz>,
    /// Last missing timestamp (inclusive).
    pub end_time: DateTime<Tz>,
    pub bar_count: usize,
    /// Backfill attempts made so far (live mode only).
    pub retry_count: u32,
}

// =============================================================================
// Session metrics
// =============================================================================

/// Rolling per-symbol metrics over the base-interval stream.
#[derive(Debug, Clone)]
pub struct SessionMetrics {
    pub volume: f64,
    pub high: f64,
    pub low: f64,
    pub last_update: Option<DateTime<Tz>>,
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self {
            volume: 0.0,
            high: f64::NEG_INFINITY,
            low: f64::INFINITY,
            last_update: None,
        }
    }
}

impl SessionMetrics {
    pub fn absorb(&mut self, bar: &Bar) {
        self.volume += bar.volume;
        self.high = self.high.max(bar.high);
        self.low = self.low.min(bar.low);
        self.last_update = Some(bar.timestamp);
    }
}

// =============================================================================
// Bar series
// =============================================================================

/// One interval's bar series plus its quality bookkeeping.
#[derive(Debug, Clone)]
pub struct BarIntervalData {
    /// False for the streamed base interval, true for locally aggregated
    /// intervals.
    pub derived: bool,
    /// The base interval this series is aggregated from (`None` for the
    /// base itself).
    pub base: Option<Interval>,
    /// Chronologically ordered, strictly increasing timestamps.
    pub data: Vec<Bar>,
    /// 0..=100, unset until the quality manager has scored the series.
    pub quality: Option<f64>,
    pub gaps: Vec<Gap>,
    /// Set on append, cleared by the quality sweep.
    pub updated: bool,
}

impl BarIntervalData {
    pub fn streamed() -> Self {
        Self {
            derived: false,
            base: None,
            data: Vec::new(),
            quality: None,
            gaps: Vec::new(),
            updated: false,
        }
    }

    pub fn derived_from(base: Interval) -> Self {
        Self {
            derived: true,
            base: Some(base),
            data: Vec::new(),
            quality: None,
            gaps: Vec::new(),
            updated: false,
        }
    }

    /// Append preserving strict timestamp monotonicity. Duplicate and
    /// out-of-order timestamps are rejected as invariant violations; the
    /// caller logs and drops the bar.
    pub fn append(&mut self, bar: Bar) -> CoreResult<()> {
        if let Some(last) = self.data.last() {
            if bar.timestamp == last.timestamp {
                return Err(CoreError::invariant(format!(
                    "duplicate timestamp {} for {}",
                    bar.timestamp, bar.symbol
                )));
            }
            if bar.timestamp < last.timestamp {
                return Err(CoreError::invariant(format!(
                    "out-of-order bar {} < {} for {}",
                    bar.timestamp, last.timestamp, bar.symbol
                )));
            }
        }
        self.data.push(bar);
        self.updated = true;
        Ok(())
    }

    /// Insert a backfilled bar at its sorted position. Returns false when a
    /// bar with the same timestamp already exists (the fill is skipped).
    pub fn backfill(&mut self, bar: Bar) -> bool {
        match self
            .data
            .binary_search_by(|b| b.timestamp.cmp(&bar.timestamp))
        {
            Ok(_) => false,
            Err(idx) => {
                self.data.insert(idx, bar);
                self.updated = true;
                true
            }
        }
    }
}

// =============================================================================
// Historical store
// =============================================================================

/// Historical bars for one interval, bucketed by exchange-timezone calendar
/// date, chronologically ordered within each date.
#[derive(Debug, Clone, Default)]
pub struct HistoricalIntervalData {
    pub data_by_date: BTreeMap<NaiveDate, Vec<Bar>>,
    pub quality: Option<f64>,
    pub gaps: Vec<Gap>,
    pub date_range: Option<(NaiveDate, NaiveDate)>,
}

impl HistoricalIntervalData {
    pub fn total_bars(&self) -> usize {
        self.data_by_date.values().map(Vec::len).sum()
    }

    /// Merge a sorted batch, bucketing by date and extending the range.
    pub fn absorb(&mut self, bars: Vec<Bar>) {
        for bar in bars {
            let date = bar.timestamp.date_naive();
            self.data_by_date.entry(date).or_default().push(bar);
        }
        for bars in self.data_by_date.values_mut() {
            bars.sort_by_key(|b| b.timestamp);
            bars.dedup_by_key(|b| b.timestamp);
        }
        let first = self.data_by_date.keys().next().copied();
        let last = self.data_by_date.keys().next_back().copied();
        self.date_range = first.zip(last);
    }

    /// The trailing `count` bars across all dates, oldest first.
    pub fn tail(&self, count: usize) -> Vec<Bar> {
        let mut all: Vec<&Bar> = self.data_by_date.values().flatten().collect();
        let start = all.len().saturating_sub(count);
        all.drain(..start);
        all.into_iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct HistoricalData {
    pub bars: HashMap<Interval, HistoricalIntervalData>,
    /// Historical indicator summaries: name -> final value over the window.
    pub indicators: HashMap<String, f64>,
}

// =============================================================================
// Quotes & ticks
// =============================================================================

/// Top-of-book quote (live mode only).
#[derive(Debug, Clone)]
pub struct Quote {
    pub timestamp: DateTime<Tz>,
    pub bid: f64,
    pub ask: f64,
}

/// Individual trade print (live mode only).
#[derive(Debug, Clone)]
pub struct Tick {
    pub timestamp: DateTime<Tz>,
    pub price: f64,
    pub size: f64,
}

// =============================================================================
// Metadata
// =============================================================================

/// Provenance metadata. Lives inside the symbol object so deleting the
/// symbol deletes it too.
#[derive(Debug, Clone)]
pub struct SymbolMeta {
    pub meets_session_config_requirements: bool,
    pub added_by: AddedBy,
    pub auto_provisioned: bool,
    pub added_at: DateTime<Utc>,
    pub upgraded_from_adhoc: bool,
}

impl SymbolMeta {
    pub fn for_added_by(added_by: AddedBy) -> Self {
        let adhoc = matches!(added_by, AddedBy::Scanner | AddedBy::Adhoc);
        Self {
            meets_session_config_requirements: !adhoc,
            added_by,
            auto_provisioned: adhoc,
            added_at: Utc::now(),
            upgraded_from_adhoc: false,
        }
    }
}

// =============================================================================
// SymbolSessionData
// =============================================================================

/// The complete per-symbol state tree.
#[derive(Debug, Clone)]
pub struct SymbolSessionData {
    pub symbol: String,
    pub base_interval: Interval,
    pub bars: HashMap<Interval, BarIntervalData>,
    pub quotes: Vec<Quote>,
    pub ticks: Vec<Tick>,
    pub metrics: SessionMetrics,
    pub indicators: HashMap<String, IndicatorData>,
    pub historical: HistoricalData,
    pub meta: SymbolMeta,
}

impl SymbolSessionData {
    /// Create a symbol with its base-interval series installed — the one
    /// and only `derived = false` entry.
    pub fn new(symbol: impl Into<String>, base_interval: Interval, added_by: AddedBy) -> Self {
        let mut bars = HashMap::new();
        bars.insert(base_interval, BarIntervalData::streamed());
        Self {
            symbol: symbol.into(),
            base_interval,
            bars,
            quotes: Vec::new(),
            ticks: Vec::new(),
            metrics: SessionMetrics::default(),
            indicators: HashMap::new(),
            historical: HistoricalData::default(),
            meta: SymbolMeta::for_added_by(added_by),
        }
    }

    /// Install a derived-interval series. Rejects intervals that are not
    /// derivable from the base. Adding an existing interval is a no-op.
    pub fn add_interval(&mut self, interval: Interval) -> CoreResult<()> {
        if self.bars.contains_key(&interval) {
            return Ok(());
        }
        if !interval.is_derivable_from(self.base_interval) {
            return Err(CoreError::invariant(format!(
                "interval {} is not derivable from base {} for {}",
                interval, self.base_interval, self.symbol
            )));
        }
        self.bars
            .insert(interval, BarIntervalData::derived_from(self.base_interval));
        Ok(())
    }

    /// Register an indicator. The indicator's interval series must already
    /// exist.
    pub fn register_indicator(&mut self, data: IndicatorData) -> CoreResult<()> {
        if !self.bars.contains_key(&data.config.interval) {
            return Err(CoreError::invariant(format!(
                "indicator {} targets missing interval {} on {}",
                data.config.name, data.config.interval, self.symbol
            )));
        }
        self.indicators.insert(data.config.name.clone(), data);
        Ok(())
    }

    /// Flip the adhoc metadata to full-membership after an upgrade.
    pub fn upgrade_from_adhoc(&mut self) {
        self.meta.meets_session_config_requirements = true;
        self.meta.upgraded_from_adhoc = true;
    }

    pub fn derived_intervals(&self) -> Vec<Interval> {
        let mut out: Vec<Interval> = self
            .bars
            .iter()
            .filter(|(_, d)| d.derived)
            .map(|(iv, _)| *iv)
            .collect();
        out.sort();
        out
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BarSource;
    use chrono::TimeZone;
    use chrono_tz::America::New_York;

    fn bar(minute: i64, close: f64) -> Bar {
        let ts = New_York.with_ymd_and_hms(2025, 7, 2, 9, 30, 0).unwrap()
            + chrono::Duration::minutes(minute);
        Bar {
            symbol: "RIVN".into(),
            timestamp: ts,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
            source: BarSource::Stream,
        }
    }

    #[test]
    fn new_symbol_has_exactly_one_streamed_entry() {
        let sd = SymbolSessionData::new("RIVN", Interval::minutes(1), AddedBy::Config);
        let streamed: Vec<_> = sd.bars.iter().filter(|(_, d)| !d.derived).collect();
        assert_eq!(streamed.len(), 1);
        assert_eq!(*streamed[0].0, Interval::minutes(1));
        assert!(sd.meta.meets_session_config_requirements);
        assert!(!sd.meta.auto_provisioned);
    }

    #[test]
    fn scanner_symbols_are_adhoc_until_upgraded() {
        let mut sd = SymbolSessionData::new("MSFT", Interval::minutes(1), AddedBy::Scanner);
        assert!(!sd.meta.meets_session_config_requirements);
        assert!(sd.meta.auto_provisioned);
        assert!(!sd.meta.upgraded_from_adhoc);

        sd.upgrade_from_adhoc();
        assert!(sd.meta.meets_session_config_requirements);
        assert!(sd.meta.upgraded_from_adhoc);
    }

    #[test]
    fn add_interval_enforces_divisibility() {
        let mut sd = SymbolSessionData::new("RIVN", Interval::minutes(2), AddedBy::Config);
        assert!(sd.add_interval(Interval::minutes(10)).is_ok());
        assert!(sd.bars[&Interval::minutes(10)].derived);
        assert_eq!(sd.bars[&Interval::minutes(10)].base, Some(Interval::minutes(2)));
        // 5m is not a multiple of 2m.
        assert!(sd.add_interval(Interval::minutes(5)).is_err());
        // Re-adding an existing interval is a no-op.
        assert!(sd.add_interval(Interval::minutes(10)).is_ok());
    }

    #[test]
    fn append_rejects_duplicates_and_regressions() {
        let mut series = BarIntervalData::streamed();
        series.append(bar(0, 100.0)).unwrap();
        series.append(bar(1, 101.0)).unwrap();

        let dup = series.append(bar(1, 102.0)).unwrap_err();
        assert!(dup.is_fatal());
        let back = series.append(bar(0, 99.0)).unwrap_err();
        assert!(matches!(back, CoreError::Invariant(_)));
        assert_eq!(series.data.len(), 2);
    }

    #[test]
    fn backfill_inserts_in_order_and_skips_duplicates() {
        let mut series = BarIntervalData::streamed();
        series.append(bar(0, 100.0)).unwrap();
        series.append(bar(3, 103.0)).unwrap();

        assert!(series.backfill(bar(1, 101.0)));
        assert!(series.backfill(bar(2, 102.0)));
        assert!(!series.backfill(bar(2, 555.0)));

        let ts: Vec<_> = series.data.iter().map(|b| b.timestamp).collect();
        let mut sorted = ts.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(ts, sorted);
        assert_eq!(series.data.len(), 4);
    }

    #[test]
    fn indicator_registration_requires_interval() {
        use crate::indicators::{IndicatorConfig, IndicatorData, IndicatorKind, IndicatorParams};
        let mut sd = SymbolSessionData::new("RIVN", Interval::minutes(1), AddedBy::Config);
        let cfg = IndicatorConfig {
            name: "sma_20_5m".into(),
            kind: IndicatorKind::Sma,
            period: 20,
            interval: Interval::minutes(5),
            params: IndicatorParams::default(),
        };
        assert!(sd.register_indicator(IndicatorData::new(cfg.clone())).is_err());
        sd.add_interval(Interval::minutes(5)).unwrap();
        assert!(sd.register_indicator(IndicatorData::new(cfg)).is_ok());
    }

    #[test]
    fn metrics_absorb_tracks_extremes() {
        let mut m = SessionMetrics::default();
        m.absorb(&bar(0, 100.0));
        m.absorb(&bar(1, 110.0));
        m.absorb(&bar(2, 90.0));
        assert_eq!(m.volume, 300.0);
        assert_eq!(m.high, 111.0);
        assert_eq!(m.low, 89.0);
        assert_eq!(m.last_update, Some(bar(2, 0.0).timestamp));
    }

    #[test]
    fn historical_absorb_buckets_by_date() {
        let mut hist = HistoricalIntervalData::default();
        let day1: Vec<Bar> = (0..3).map(|i| bar(i, 100.0)).collect();
        let mut day2: Vec<Bar> = (0..2)
            .map(|i| {
                let mut b = bar(i, 100.0);
                b.timestamp = b.timestamp + chrono::Duration::days(1);
                b
            })
            .collect();
        let mut all = day1;
        all.append(&mut day2);
        hist.absorb(all);

        assert_eq!(hist.data_by_date.len(), 2);
        assert_eq!(hist.total_bars(), 5);
        let (first, last) = hist.date_range.unwrap();
        assert_eq!(first, NaiveDate::from_ymd_opt(2025, 7, 2).unwrap());
        assert_eq!(last, NaiveDate::from_ymd_opt(2025, 7, 3).unwrap());
        assert_eq!(hist.tail(4).len(), 4);
        // Tail preserves chronological order across the date boundary.
        let tail = hist.tail(3);
        assert!(tail.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }
}
