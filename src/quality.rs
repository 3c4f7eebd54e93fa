// =============================================================================
// Quality Manager — gap detection and per-interval quality scores
// =============================================================================
//
// Periodic sweep over every series that changed since the last pass:
//
//   1. Build the set of expected timestamps for the current trading session
//      (open-aligned stride, close-exclusive — a bar stamped exactly at the
//      close belongs to no session).
//   2. Diff against the actual timestamps; group consecutive misses into
//      `Gap`s.
//   3. Quality = 100 * actual / expected, rounded to one decimal. Left unset
//      while nothing is expected yet.
//
// Non-trading time never counts: the stretch between one session's close
// and the next session's open is not a gap, and early-close days expect
// proportionally fewer bars.
//
// In live mode each gap triggers a targeted re-fetch with a per-fetch
// timeout; after `retry_limit` failed attempts the gap is left as measured.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono_tz::Tz;
use serde_json::json;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::calendar::{TimeManager, TradingSession};
use crate::datasource::DataSource;
use crate::session_data::{Gap, HistoricalIntervalData, SessionData};
use crate::status::WorkerStatus;
use crate::sync::Shutdown;
use crate::types::{Interval, IntervalUnit, Mode};

// =============================================================================
// Pure scoring helpers
// =============================================================================

/// Expected bar timestamps for `interval` inside `session`, capped at `now`.
///
/// The upper bound is inclusive of `now` while the session is open (a bar
/// stamped `t` exists from simulated time `t` onwards) and stops at
/// `close - interval` afterwards, keeping the close itself excluded. Daily
/// and weekly series are not scored in-session.
pub fn expected_timestamps(
    session: &TradingSession,
    interval: Interval,
    now: DateTime<Tz>,
) -> Vec<DateTime<Tz>> {
    if !session.is_trading_day || now < session.open {
        return Vec::new();
    }
    if matches!(interval.unit(), IntervalUnit::Day | IntervalUnit::Week) {
        return Vec::new();
    }

    let step = interval.duration();
    let cap = if now < session.close {
        now
    } else {
        session.close - step
    };

    let mut out = Vec::new();
    let mut t = session.open;
    while t <= cap {
        out.push(t);
        t += step;
    }
    out
}

/// Group sorted missing timestamps into runs of consecutive `interval`
/// strides.
pub fn group_gaps(missing: &[DateTime<Tz>], interval: Interval) -> Vec<Gap> {
    let step = interval.duration();
    let mut gaps: Vec<Gap> = Vec::new();
    for &ts in missing {
        match gaps.last_mut() {
            Some(gap) if ts - gap.end_time == step => {
                gap.end_time = ts;
                gap.bar_count += 1;
            }
            _ => gaps.push(Gap {
                start_time: ts,
                end_time: ts,
                bar_count: 1,
                retry_count: 0,
            }),
        }
    }
    gaps
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Score one series: `(quality, gaps)` against the expected set, or `None`
/// when nothing is expected yet.
pub fn score_series(
    expected: &[DateTime<Tz>],
    actual: &HashSet<DateTime<Tz>>,
    interval: Interval,
) -> Option<(f64, Vec<Gap>)> {
    if expected.is_empty() {
        return None;
    }
    let present = expected.iter().filter(|t| actual.contains(t)).count();
    let missing: Vec<DateTime<Tz>> = expected
        .iter()
        .filter(|t| !actual.contains(t))
        .copied()
        .collect();
    let quality = round1(100.0 * present as f64 / expected.len() as f64);
    Some((quality, group_gaps(&missing, interval)))
}

/// Score a historical window in place: expected bars are the full session
/// capacity of every trading day in the range.
pub fn score_historical_window(
    hist: &mut HistoricalIntervalData,
    time_manager: &TimeManager,
    exchange: &str,
    interval: Interval,
) {
    let Some((first, last)) = hist.date_range else {
        return;
    };

    let mut expected: Vec<DateTime<Tz>> = Vec::new();
    let mut actual: HashSet<DateTime<Tz>> = HashSet::new();
    let mut date = first;
    while date <= last {
        let session = time_manager.get_trading_session(date, exchange);
        if session.is_trading_day {
            match interval.unit() {
                IntervalUnit::Day | IntervalUnit::Week => expected.push(session.open),
                _ => {
                    let close_cap = session.close + chrono::Duration::seconds(1);
                    expected.extend(expected_timestamps(&session, interval, close_cap));
                }
            }
        }
        if let Some(bars) = hist.data_by_date.get(&date) {
            actual.extend(bars.iter().map(|b| b.timestamp));
        }
        date = match date.succ_opt() {
            Some(d) => d,
            None => break,
        };
    }

    if let Some((quality, gaps)) = score_series(&expected, &actual, interval) {
        hist.quality = Some(quality);
        hist.gaps = gaps;
    }
}

// =============================================================================
// Worker
// =============================================================================

pub struct QualityConfig {
    pub sweep_ms: u64,
    pub retry_limit: u32,
    pub fetch_timeout: Duration,
}

pub struct QualityManager {
    session: Arc<SessionData>,
    time_manager: Arc<TimeManager>,
    exchange: String,
    source: Arc<dyn DataSource>,
    mode: Mode,
    cfg: QualityConfig,
    shutdown: Shutdown,
    status: Arc<WorkerStatus>,
    /// Backfill attempts per gap, keyed by (symbol, interval, gap start).
    retries: HashMap<(String, Interval, i64), u32>,
    last_swept_date: Option<chrono::NaiveDate>,
}

impl QualityManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<SessionData>,
        time_manager: Arc<TimeManager>,
        exchange: String,
        source: Arc<dyn DataSource>,
        mode: Mode,
        cfg: QualityConfig,
        shutdown: Shutdown,
        status: Arc<WorkerStatus>,
    ) -> Self {
        Self {
            session,
            time_manager,
            exchange,
            source,
            mode,
            cfg,
            shutdown,
            status,
            retries: HashMap::new(),
            last_swept_date: None,
        }
    }

    pub async fn run(mut self) {
        self.status.set_running(true);
        info!(sweep_ms = self.cfg.sweep_ms, mode = %self.mode, "quality manager started");
        let mut stop = self.shutdown.subscribe();

        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                // Wake on data arrival or on the sweep timer, whichever
                // comes first.
                _ = self.session.data_arrival.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(self.cfg.sweep_ms)) => {}
            }
            self.sweep().await;
        }

        self.status.set_running(false);
        info!("quality manager stopped");
    }

    async fn sweep(&mut self) {
        // Never score the half-built state during mid-session insertion.
        if !self.session.is_active() {
            return;
        }
        let Some(date) = self.session.current_session_date() else {
            return;
        };
        if self.last_swept_date != Some(date) {
            // New session: gap retry budgets reset with the session state.
            self.retries.clear();
            self.last_swept_date = Some(date);
        }
        let trading = self.time_manager.get_trading_session(date, self.exchange.as_str());
        if !trading.is_trading_day {
            return;
        }

        let updated = self.session.take_updated_series();
        if updated.is_empty() {
            return;
        }
        self.status.bump("sweeps");
        let now = self.time_manager.current_time();

        for (symbol, interval) in updated {
            let expected = expected_timestamps(&trading, interval, now);
            let actual: HashSet<DateTime<Tz>> = self
                .session
                .with_symbol(&symbol, true, |sd| {
                    sd.bars
                        .get(&interval)
                        .map(|series| series.data.iter().map(|b| b.timestamp).collect())
                        .unwrap_or_default()
                })
                .unwrap_or_default();

            let Some((quality, mut gaps)) = score_series(&expected, &actual, interval) else {
                continue;
            };

            for gap in &mut gaps {
                let key = (symbol.clone(), interval, gap.start_time.timestamp());
                gap.retry_count = self.retries.get(&key).copied().unwrap_or(0);
            }

            if !gaps.is_empty() {
                self.status.set("last_gap_symbol", json!(symbol.as_str()));
                debug!(
                    symbol = %symbol,
                    interval = %interval,
                    quality,
                    gaps = gaps.len(),
                    "quality scored with gaps"
                );
            }

            if self.mode == Mode::Live {
                self.attempt_backfills(&symbol, interval, &mut gaps).await;
            }

            self.session.set_quality(&symbol, interval, quality);
            self.session.set_gaps(&symbol, interval, gaps);
        }
    }

    /// Live mode only: try to re-fetch each gap's window, bounded by the
    /// retry cap and the per-fetch timeout.
    async fn attempt_backfills(&mut self, symbol: &str, interval: Interval, gaps: &mut [Gap]) {
        for gap in gaps.iter_mut() {
            let key = (symbol.to_string(), interval, gap.start_time.timestamp());
            let attempts = self.retries.entry(key).or_insert(0);
            if *attempts >= self.cfg.retry_limit {
                continue;
            }
            *attempts += 1;
            gap.retry_count = *attempts;

            let source = Arc::clone(&self.source);
            let sym = symbol.to_string();
            let start = gap.start_time;
            let end = gap.end_time + interval.duration();
            let fetch = tokio::task::spawn_blocking(move || {
                source.load_bars(&sym, interval, start, end)
            });

            match timeout(self.cfg.fetch_timeout, fetch).await {
                Ok(Ok(Ok(bars))) if !bars.is_empty() => {
                    match self.session.backfill_bars(symbol, interval, bars) {
                        Ok(inserted) if inserted > 0 => {
                            self.status.bump("backfills");
                            info!(
                                symbol = %symbol,
                                interval = %interval,
                                inserted,
                                "gap backfilled"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(symbol = %symbol, error = %e, "backfill insert failed"),
                    }
                }
                Ok(Ok(Ok(_))) => {
                    debug!(symbol = %symbol, "backfill fetch returned nothing");
                }
                Ok(Ok(Err(e))) => {
                    warn!(symbol = %symbol, error = %e, "backfill fetch failed");
                }
                Ok(Err(e)) => {
                    warn!(symbol = %symbol, error = %e, "backfill task panicked");
                }
                Err(_) => {
                    warn!(
                        symbol = %symbol,
                        timeout_s = self.cfg.fetch_timeout.as_secs(),
                        "backfill fetch timed out; gap left for retry"
                    );
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn tm() -> TimeManager {
        TimeManager::new(Mode::Backtest, "US_EQUITY")
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn m1() -> Interval {
        Interval::minutes(1)
    }

    #[test]
    fn full_day_expects_390_minutes() {
        let s = tm().get_trading_session(d(2025, 7, 2), "US_EQUITY");
        let exp = expected_timestamps(&s, m1(), s.close + chrono::Duration::hours(1));
        assert_eq!(exp.len(), 390);
        assert_eq!(*exp.first().unwrap(), s.open);
        // Close itself is excluded.
        assert_eq!(*exp.last().unwrap(), s.close - chrono::Duration::minutes(1));
    }

    #[test]
    fn early_close_day_expects_210_minutes() {
        let s = tm().get_trading_session(d(2024, 11, 29), "US_EQUITY");
        let exp = expected_timestamps(&s, m1(), s.close + chrono::Duration::hours(3));
        assert_eq!(exp.len(), 210);
        // Nothing after 13:00 is ever expected — the 13:00-16:00 stretch is
        // not a gap.
        assert!(exp.iter().all(|t| *t < s.close));
    }

    #[test]
    fn mid_session_cap_is_inclusive_of_now() {
        let s = tm().get_trading_session(d(2025, 7, 2), "US_EQUITY");
        let now = s.open + chrono::Duration::minutes(156); // 12:06
        let exp = expected_timestamps(&s, m1(), now);
        assert_eq!(exp.len(), 157);
    }

    #[test]
    fn before_open_nothing_is_expected() {
        let s = tm().get_trading_session(d(2025, 7, 2), "US_EQUITY");
        let exp = expected_timestamps(&s, m1(), s.open - chrono::Duration::minutes(5));
        assert!(exp.is_empty());
    }

    #[test]
    fn single_missing_bar_is_a_gap_of_one() {
        let s = tm().get_trading_session(d(2025, 7, 2), "US_EQUITY");
        let expected = expected_timestamps(&s, m1(), s.close);
        let mut actual: HashSet<_> = expected.iter().copied().collect();
        let missing_ts = s.open + chrono::Duration::minutes(42);
        actual.remove(&missing_ts);

        let (quality, gaps) = score_series(&expected, &actual, m1()).unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].bar_count, 1);
        assert_eq!(gaps[0].start_time, missing_ts);
        assert_eq!(gaps[0].end_time, missing_ts);
        assert_eq!(quality, round1(100.0 * 389.0 / 390.0));
    }

    #[test]
    fn consecutive_misses_group_into_one_gap() {
        let s = tm().get_trading_session(d(2025, 7, 2), "US_EQUITY");
        let expected = expected_timestamps(&s, m1(), s.close);
        let mut actual: HashSet<_> = expected.iter().copied().collect();
        // 09:45, 09:46, 09:47 missing.
        for k in 15..18 {
            actual.remove(&(s.open + chrono::Duration::minutes(k)));
        }

        let (quality, gaps) = score_series(&expected, &actual, m1()).unwrap();
        assert_eq!(quality, 99.2);
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].bar_count, 3);
        assert_eq!(gaps[0].start_time, s.open + chrono::Duration::minutes(15));
        assert_eq!(gaps[0].end_time, s.open + chrono::Duration::minutes(17));
    }

    #[test]
    fn separated_misses_stay_separate_gaps() {
        let s = tm().get_trading_session(d(2025, 7, 2), "US_EQUITY");
        let expected = expected_timestamps(&s, m1(), s.close);
        let mut actual: HashSet<_> = expected.iter().copied().collect();
        actual.remove(&(s.open + chrono::Duration::minutes(10)));
        actual.remove(&(s.open + chrono::Duration::minutes(20)));

        let (_, gaps) = score_series(&expected, &actual, m1()).unwrap();
        assert_eq!(gaps.len(), 2);
        assert!(gaps.iter().all(|g| g.bar_count == 1));
    }

    #[test]
    fn perfect_series_scores_100_with_no_gaps() {
        let s = tm().get_trading_session(d(2025, 7, 2), "US_EQUITY");
        let expected = expected_timestamps(&s, m1(), s.close);
        let actual: HashSet<_> = expected.iter().copied().collect();
        let (quality, gaps) = score_series(&expected, &actual, m1()).unwrap();
        assert_eq!(quality, 100.0);
        assert!(gaps.is_empty());
    }

    #[test]
    fn empty_expectation_leaves_quality_unset() {
        assert!(score_series(&[], &HashSet::new(), m1()).is_none());
    }

    #[test]
    fn historical_window_scoring_spans_trading_days_only() {
        use crate::types::{Bar, BarSource};
        let t = tm();
        let mut hist = HistoricalIntervalData::default();

        // Two perfect trading days around the 2025-07-04 holiday weekend.
        for date in [d(2025, 7, 2), d(2025, 7, 3)] {
            let session = t.get_trading_session(date, "US_EQUITY");
            let mut bars = Vec::new();
            let mut ts = session.open;
            while ts < session.close {
                bars.push(Bar {
                    symbol: "RIVN".into(),
                    timestamp: ts,
                    open: 1.0,
                    high: 1.0,
                    low: 1.0,
                    close: 1.0,
                    volume: 1.0,
                    source: BarSource::Historical,
                });
                ts += chrono::Duration::minutes(1);
            }
            hist.absorb(bars);
        }

        score_historical_window(&mut hist, &t, "US_EQUITY", m1());
        // 07-03 is a 13:00 early close; the holiday contributes nothing.
        assert_eq!(hist.quality, Some(100.0));
        assert!(hist.gaps.is_empty());
    }
}
