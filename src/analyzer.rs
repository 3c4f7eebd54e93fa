// =============================================================================
// Requirement Analyzer — pure session & indicator requirement logic
// =============================================================================
//
// Two entry points used by the coordinator before any resources are
// committed:
//
//   * `analyze_session_requirements` picks the session-wide base interval
//     from the configured streams (plus indicator intervals) and reports
//     which of the rest are derivable from it.
//
//   * `analyze_indicator_requirements` sizes the historical warmup window
//     for one indicator. All calendar arithmetic delegates to the
//     `TimeManager` — bars-per-day comes from the actual session length of
//     real trading days, never from a hardcoded constant.
// =============================================================================

use chrono::NaiveDate;

use crate::calendar::TimeManager;
use crate::error::{CoreError, CoreResult};
use crate::indicators::IndicatorConfig;
use crate::types::Interval;

// =============================================================================
// Session requirements
// =============================================================================

/// Result of the session-wide stream analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRequirements {
    /// The smallest-seconds interval that divides every other required
    /// interval. All streaming happens at this interval.
    pub base_interval: Interval,
    /// Every other required interval, derivable from the base by
    /// aggregation. Sorted ascending.
    pub derivable: Vec<Interval>,
}

/// Derive the base interval for a session from the configured stream tags
/// plus any intervals required by indicators.
///
/// Deterministic and idempotent: the same inputs always produce the same
/// result, and the result feeds back into itself unchanged.
pub fn analyze_session_requirements(
    streams: &[Interval],
    indicator_intervals: &[Interval],
) -> CoreResult<SessionRequirements> {
    let mut required: Vec<Interval> = streams
        .iter()
        .chain(indicator_intervals.iter())
        .copied()
        .collect();
    required.sort();
    required.dedup();

    if required.is_empty() {
        return Err(CoreError::config(
            "no stream intervals configured; at least one is required",
        ));
    }

    let base = required[0];
    for candidate in &required[1..] {
        if !candidate.is_derivable_from(base) {
            return Err(CoreError::config(format!(
                "no common base interval: {candidate} is not derivable from {base} \
                 ({} % {} != 0)",
                candidate.seconds(),
                base.seconds()
            )));
        }
    }

    Ok(SessionRequirements {
        base_interval: base,
        derivable: required[1..].to_vec(),
    })
}

// =============================================================================
// Indicator requirements
// =============================================================================

/// How much data one indicator needs before it can go valid.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorRequirements {
    /// Intervals this indicator forces into the session (just its own).
    pub required_intervals: Vec<Interval>,
    /// Warmup bar count after the configured multiplier.
    pub warmup_bars: usize,
    /// Trading days of history needed to produce that many bars.
    pub trading_days: u32,
    /// Actual calendar-day span of the walk-back, holidays and weekends
    /// included.
    pub historical_days: u32,
    /// First calendar date of the window.
    pub from_date: NaiveDate,
}

/// Size the historical window for `cfg`, walking the trading calendar
/// backwards from `from_date` (exclusive).
///
/// For an intraday interval the bars-per-day divisor is taken from the
/// actual session length of the previous trading day — early-close days in
/// the window mean the estimate errs slightly long, which is the safe
/// direction for warmup.
pub fn analyze_indicator_requirements(
    cfg: &IndicatorConfig,
    time_manager: &TimeManager,
    warmup_multiplier: u32,
    from_date: NaiveDate,
    exchange: &str,
) -> CoreResult<IndicatorRequirements> {
    let warmup_bars = cfg.warmup_bars() * warmup_multiplier.max(1) as usize;

    let trading_days = if cfg.interval.is_intraday() {
        let probe_date = time_manager.previous_trading_date(from_date, 1, exchange);
        let session = time_manager.get_trading_session(probe_date, exchange);
        let bars_per_day = session.bar_capacity(cfg.interval);
        if bars_per_day <= 0 {
            return Err(CoreError::config(format!(
                "interval {} does not fit inside a {} trading session",
                cfg.interval, exchange
            )));
        }
        ((warmup_bars as i64 + bars_per_day - 1) / bars_per_day).max(1) as u32
    } else {
        // Daily and weekly bars: one bar per trading day / week, walk back
        // directly.
        match cfg.interval.unit() {
            crate::types::IntervalUnit::Week => warmup_bars as u32 * 5,
            _ => warmup_bars as u32,
        }
    };

    let start = time_manager.previous_trading_date(from_date, trading_days, exchange);
    let historical_days = (from_date - start).num_days().max(0) as u32;

    Ok(IndicatorRequirements {
        required_intervals: vec![cfg.interval],
        warmup_bars,
        trading_days,
        historical_days,
        from_date: start,
    })
}
