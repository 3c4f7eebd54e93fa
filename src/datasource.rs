// =============================================================================
// Data Source — the raw market-data fetch collaborator
// =============================================================================
//
// The engine never talks to an exchange directly; it consumes the `DataSource`
// trait. Historical ranges come back as sorted `Vec<Bar>`; live streaming is
// channel-based — one `UnboundedReceiver<Bar>` per `(symbol, interval)`
// subscription, fed from whatever transport the implementation uses.
//
// `SyntheticSource` is the built-in implementation used by backtests, demos
// and the test suite: fully deterministic bars generated over the trading
// calendar, with per-timestamp omission support so tests can inject gaps.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate};
use chrono_tz::Tz;
use tokio::sync::mpsc;
use tracing::debug;

use crate::calendar::TradingCalendar;
use crate::error::{CoreError, CoreResult};
use crate::types::{Bar, BarSource, Interval, IntervalUnit};

// =============================================================================
// Trait
// =============================================================================

pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this source can serve the symbol at all (validation check 1).
    fn supports_symbol(&self, symbol: &str) -> bool;

    /// Intervals the source can stream directly. Anything derivable from one
    /// of these is also considered supported by the validator.
    fn supported_intervals(&self, symbol: &str) -> Vec<Interval>;

    /// Whether historical bars exist for the window (validation check 3).
    fn has_historical(
        &self,
        symbol: &str,
        interval: Interval,
        start: NaiveDate,
        end: NaiveDate,
    ) -> bool;

    /// Load bars in `[start, end)`, chronologically sorted.
    fn load_bars(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Tz>,
        end: DateTime<Tz>,
    ) -> CoreResult<Vec<Bar>>;

    /// Open a live subscription. Bars arrive on the returned channel in
    /// chronological order; dropping the receiver ends the subscription.
    fn subscribe(&self, symbol: &str, interval: Interval) -> CoreResult<mpsc::UnboundedReceiver<Bar>>;
}

// =============================================================================
// SyntheticSource
// =============================================================================

/// Deterministic bar generator over a trading calendar.
///
/// Prices follow a smooth per-symbol curve seeded from the symbol name, so
/// repeated runs produce identical bars. Timestamps listed in the omission
/// set are skipped, which is how tests create gaps.
pub struct SyntheticSource {
    calendar: Arc<dyn TradingCalendar>,
    symbols: HashSet<String>,
    streamable: Vec<Interval>,
    omitted: HashSet<(String, i64)>,
    history_start: NaiveDate,
}

impl SyntheticSource {
    pub fn new(calendar: Arc<dyn TradingCalendar>) -> Self {
        Self {
            calendar,
            symbols: HashSet::new(),
            streamable: vec![Interval::minutes(1), Interval::days(1)],
            omitted: HashSet::new(),
            history_start: NaiveDate::from_ymd_opt(2020, 1, 2).expect("static date"),
        }
    }

    pub fn with_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.symbols.extend(symbols.into_iter().map(Into::into));
        self
    }

    pub fn with_streamable(mut self, intervals: Vec<Interval>) -> Self {
        self.streamable = intervals;
        self
    }

    /// Skip the given timestamps for `symbol` — the generated stream will
    /// have a gap there.
    pub fn with_omitted<I>(mut self, symbol: &str, timestamps: I) -> Self
    where
        I: IntoIterator<Item = DateTime<Tz>>,
    {
        for ts in timestamps {
            self.omitted.insert((symbol.to_string(), ts.timestamp()));
        }
        self
    }

    /// Stable per-symbol seed in [0, 1).
    fn seed(symbol: &str) -> f64 {
        let mut h: u64 = 1469598103934665603;
        for b in symbol.bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(1099511628211);
        }
        (h % 10_000) as f64 / 10_000.0
    }

    fn price_at(symbol: &str, epoch: i64) -> f64 {
        let seed = Self::seed(symbol);
        let base = 20.0 + seed * 380.0;
        let minutes = (epoch / 60) as f64;
        // Slow drift plus a faster wobble; amplitudes are small enough that
        // prices stay positive.
        base * (1.0 + 0.02 * (minutes / 390.0).sin() + 0.004 * (minutes / 7.0).sin())
    }

    fn bar_at(symbol: &str, interval: Interval, ts: DateTime<Tz>, source: BarSource) -> Bar {
        let epoch = ts.timestamp();
        let open = Self::price_at(symbol, epoch);
        let close = Self::price_at(symbol, epoch + interval.seconds());
        let spread = (open - close).abs().max(open * 0.0004);
        let volume = 8_000.0 + ((epoch / 60) % 4_000) as f64;
        Bar {
            symbol: symbol.to_string(),
            timestamp: ts,
            open,
            high: open.max(close) + spread * 0.5,
            low: open.min(close) - spread * 0.5,
            close,
            volume,
            source,
        }
    }

    fn session_timestamps(
        &self,
        date: NaiveDate,
        interval: Interval,
    ) -> Vec<DateTime<Tz>> {
        let session = self.calendar.trading_session(date);
        if !session.is_trading_day {
            return Vec::new();
        }
        match interval.unit() {
            // Daily and weekly bars are stamped at the session open.
            IntervalUnit::Day | IntervalUnit::Week => vec![session.open],
            _ => {
                let mut out = Vec::new();
                let step = interval.duration();
                let mut t = session.open;
                while t < session.close {
                    out.push(t);
                    t += step;
                }
                out
            }
        }
    }
}

impl DataSource for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn supports_symbol(&self, symbol: &str) -> bool {
        self.symbols.contains(symbol)
    }

    fn supported_intervals(&self, _symbol: &str) -> Vec<Interval> {
        self.streamable.clone()
    }

    fn has_historical(
        &self,
        symbol: &str,
        _interval: Interval,
        start: NaiveDate,
        _end: NaiveDate,
    ) -> bool {
        self.symbols.contains(symbol) && start >= self.history_start
    }

    fn load_bars(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Tz>,
        end: DateTime<Tz>,
    ) -> CoreResult<Vec<Bar>> {
        if !self.supports_symbol(symbol) {
            return Err(CoreError::data(format!(
                "synthetic source has no data for symbol {symbol}"
            )));
        }

        let mut bars = Vec::new();
        let mut date = start.date_naive();
        let last_date = end.date_naive();
        while date <= last_date {
            for ts in self.session_timestamps(date, interval) {
                if ts < start || ts >= end {
                    continue;
                }
                if self.omitted.contains(&(symbol.to_string(), ts.timestamp())) {
                    continue;
                }
                bars.push(Self::bar_at(symbol, interval, ts, BarSource::Historical));
            }
            date = match date.succ_opt() {
                Some(d) => d,
                None => break,
            };
        }

        debug!(
            symbol = %symbol,
            interval = %interval,
            count = bars.len(),
            "synthetic load_bars"
        );
        Ok(bars)
    }

    fn subscribe(&self, symbol: &str, interval: Interval) -> CoreResult<mpsc::UnboundedReceiver<Bar>> {
        if !self.supports_symbol(symbol) {
            return Err(CoreError::data(format!(
                "synthetic source cannot stream unknown symbol {symbol}"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let calendar = Arc::clone(&self.calendar);
        let sym = symbol.to_string();
        let omitted = self.omitted.clone();
        tokio::spawn(async move {
            let step = std::time::Duration::from_secs(interval.seconds().max(1) as u64);
            let mut ticker = tokio::time::interval(step);
            loop {
                ticker.tick().await;
                let tz = calendar.timezone();
                let now = chrono::Utc::now().with_timezone(&tz);
                let session = calendar.trading_session(now.date_naive());
                if !session.contains(now) {
                    continue;
                }
                // Align the stamp to the interval grid off the session open.
                let offset = (now - session.open).num_seconds() / interval.seconds()
                    * interval.seconds();
                let ts = session.open + chrono::Duration::seconds(offset);
                if omitted.contains(&(sym.clone(), ts.timestamp())) {
                    continue;
                }
                let bar = SyntheticSource::bar_at(&sym, interval, ts, BarSource::Stream);
                if tx.send(bar).is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}
