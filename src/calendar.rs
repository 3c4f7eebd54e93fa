// =============================================================================
// Time Manager — trading calendar + session clock
// =============================================================================
//
// Every piece of calendar arithmetic in the engine goes through here: session
// open/close lookups, holiday and early-close awareness, trading-day walks.
// Nothing else in the codebase hardcodes trading-day length, weekends, or
// holidays.
//
// The clock half serves both modes: in backtest the coordinator advances a
// simulated time as bars are replayed; in live mode the system clock is
// projected into the exchange timezone. Dates are always handled in the
// exchange timezone; UTC appears only at interchange boundaries.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use parking_lot::RwLock;
use tracing::warn;

use crate::types::{Interval, Mode};

// =============================================================================
// Trading session
// =============================================================================

/// The resolved trading session for one calendar date.
#[derive(Debug, Clone)]
pub struct TradingSession {
    pub date: NaiveDate,
    pub is_trading_day: bool,
    /// Regular-session open, exchange-local.
    pub open: DateTime<Tz>,
    /// Regular-session close, exchange-local. Bars stamped exactly at the
    /// close belong to the next window and are excluded everywhere.
    pub close: DateTime<Tz>,
    pub early_close: bool,
    pub timezone: Tz,
}

impl TradingSession {
    /// Number of whole `interval` windows inside the regular session.
    pub fn bar_capacity(&self, interval: Interval) -> i64 {
        if !self.is_trading_day {
            return 0;
        }
        let span = (self.close - self.open).num_seconds();
        span / interval.seconds()
    }

    /// Whether `t` falls inside regular trading hours (close-exclusive).
    pub fn contains(&self, t: DateTime<Tz>) -> bool {
        self.is_trading_day && t >= self.open && t < self.close
    }
}

// =============================================================================
// TradingCalendar trait
// =============================================================================

/// Calendar collaborator for one exchange: session shape, holidays, early
/// closes. Implementations must be cheap to query — lookups happen on the
/// hot streaming path.
pub trait TradingCalendar: Send + Sync {
    fn timezone(&self) -> Tz;
    fn trading_session(&self, date: NaiveDate) -> TradingSession;
    fn is_holiday(&self, date: NaiveDate) -> bool;
}

// =============================================================================
// UsEquityCalendar
// =============================================================================

/// Regular US equity hours: 09:30–16:00 America/New_York, weekends off,
/// full-day holidays and 13:00 early closes from the tables below.
pub struct UsEquityCalendar {
    holidays: HashSet<NaiveDate>,
    early_closes: HashMap<NaiveDate, NaiveTime>,
}

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).expect("static calendar date")
}

impl Default for UsEquityCalendar {
    fn default() -> Self {
        let holidays = HashSet::from([
            // 2024
            d(2024, 1, 1),
            d(2024, 1, 15),
            d(2024, 2, 19),
            d(2024, 3, 29),
            d(2024, 5, 27),
            d(2024, 6, 19),
            d(2024, 7, 4),
            d(2024, 9, 2),
            d(2024, 11, 28),
            d(2024, 12, 25),
            // 2025
            d(2025, 1, 1),
            d(2025, 1, 20),
            d(2025, 2, 17),
            d(2025, 4, 18),
            d(2025, 5, 26),
            d(2025, 6, 19),
            d(2025, 7, 4),
            d(2025, 9, 1),
            d(2025, 11, 27),
            d(2025, 12, 25),
        ]);

        let half = NaiveTime::from_hms_opt(13, 0, 0).expect("static time");
        let early_closes = HashMap::from([
            (d(2024, 7, 3), half),
            (d(2024, 11, 29), half),
            (d(2024, 12, 24), half),
            (d(2025, 7, 3), half),
            (d(2025, 11, 28), half),
            (d(2025, 12, 24), half),
        ]);

        Self {
            holidays,
            early_closes,
        }
    }
}

impl UsEquityCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend the holiday table (for exchanges sharing the US session shape
    /// with extra closures, or for tests).
    pub fn with_holiday(mut self, date: NaiveDate) -> Self {
        self.holidays.insert(date);
        self
    }

    pub fn with_early_close(mut self, date: NaiveDate, close: NaiveTime) -> Self {
        self.early_closes.insert(date, close);
        self
    }

    fn at_local(tz: Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Tz> {
        // Exchange session boundaries never fall inside a DST gap (US
        // transitions happen at 02:00 local), so a missing local time here
        // is a programming error, not a data condition.
        tz.from_local_datetime(&date.and_time(time))
            .earliest()
            .expect("exchange-local session boundary must exist")
    }
}

impl TradingCalendar for UsEquityCalendar {
    fn timezone(&self) -> Tz {
        chrono_tz::America::New_York
    }

    fn trading_session(&self, date: NaiveDate) -> TradingSession {
        let tz = self.timezone();
        let weekend = matches!(date.weekday(), Weekday::Sat | Weekday::Sun);
        let holiday = self.holidays.contains(&date);
        let is_trading_day = !weekend && !holiday;

        let open_t = NaiveTime::from_hms_opt(9, 30, 0).expect("static time");
        let close_t = self
            .early_closes
            .get(&date)
            .copied()
            .unwrap_or_else(|| NaiveTime::from_hms_opt(16, 0, 0).expect("static time"));

        TradingSession {
            date,
            is_trading_day,
            open: Self::at_local(tz, date, open_t),
            close: Self::at_local(tz, date, close_t),
            early_close: self.early_closes.contains_key(&date),
            timezone: tz,
        }
    }

    fn is_holiday(&self, date: NaiveDate) -> bool {
        self.holidays.contains(&date)
    }
}

// =============================================================================
// TimeManager
// =============================================================================

/// The time collaborator handed to every component: calendar lookups by
/// exchange group plus the current (simulated or real) time.
pub struct TimeManager {
    mode: Mode,
    default_exchange: String,
    calendars: HashMap<String, Arc<dyn TradingCalendar>>,
    sim_time: RwLock<Option<DateTime<Tz>>>,
}

impl TimeManager {
    pub fn new(mode: Mode, default_exchange: impl Into<String>) -> Self {
        let default_exchange = default_exchange.into();
        let mut calendars: HashMap<String, Arc<dyn TradingCalendar>> = HashMap::new();
        calendars.insert(default_exchange.clone(), Arc::new(UsEquityCalendar::new()));
        Self {
            mode,
            default_exchange,
            calendars,
            sim_time: RwLock::new(None),
        }
    }

    /// Replace or add the calendar for an exchange group.
    pub fn register_calendar(&mut self, exchange: impl Into<String>, cal: Arc<dyn TradingCalendar>) {
        self.calendars.insert(exchange.into(), cal);
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn default_exchange(&self) -> &str {
        &self.default_exchange
    }

    fn calendar(&self, exchange: &str) -> &Arc<dyn TradingCalendar> {
        if let Some(cal) = self.calendars.get(exchange) {
            return cal;
        }
        warn!(exchange = %exchange, "unknown exchange group, using default calendar");
        self.calendars
            .get(&self.default_exchange)
            .expect("default calendar is always registered")
    }

    pub fn timezone(&self, exchange: &str) -> Tz {
        self.calendar(exchange).timezone()
    }

    /// The engine's current time in the exchange timezone: the simulated
    /// clock in backtest (once the coordinator has set it), the system clock
    /// otherwise.
    pub fn current_time(&self) -> DateTime<Tz> {
        if let Some(t) = *self.sim_time.read() {
            return t;
        }
        let tz = self.timezone(self.default_exchange.as_str());
        Utc::now().with_timezone(&tz)
    }

    /// Advance the simulated clock. The coordinator is the only caller.
    pub fn set_backtest_time(&self, t: DateTime<Tz>) {
        *self.sim_time.write() = Some(t);
    }

    pub fn get_trading_session(&self, date: NaiveDate, exchange: &str) -> TradingSession {
        self.calendar(exchange).trading_session(date)
    }

    pub fn is_holiday(&self, date: NaiveDate, exchange: &str) -> bool {
        self.calendar(exchange).is_holiday(date)
    }

    /// Walk back `n` trading days from `from` (exclusive of `from`).
    /// `previous_trading_date(d, 1)` is the trading day immediately before
    /// `d`.
    pub fn previous_trading_date(&self, from: NaiveDate, n: u32, exchange: &str) -> NaiveDate {
        let cal = self.calendar(exchange);
        let mut date = from;
        let mut remaining = n.max(1);
        // Bounded walk: holidays and weekends never exceed ~4 non-trading
        // days in a row, so 10 days per step is a safe ceiling.
        let mut guard = n as i64 * 10 + 30;
        while remaining > 0 && guard > 0 {
            date = date.pred_opt().expect("date arithmetic in range");
            if cal.trading_session(date).is_trading_day {
                remaining -= 1;
            }
            guard -= 1;
        }
        date
    }

    /// The first trading day strictly after `from`.
    pub fn next_trading_date(&self, from: NaiveDate, exchange: &str) -> NaiveDate {
        let cal = self.calendar(exchange);
        let mut date = from;
        let mut guard = 40;
        loop {
            date = date.succ_opt().expect("date arithmetic in range");
            if cal.trading_session(date).is_trading_day || guard == 0 {
                return date;
            }
            guard -= 1;
        }
    }

    /// The first trading day on or after `from`.
    pub fn first_trading_date_on_or_after(&self, from: NaiveDate, exchange: &str) -> NaiveDate {
        if self.get_trading_session(from, exchange).is_trading_day {
            from
        } else {
            self.next_trading_date(from, exchange)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn tm() -> TimeManager {
        TimeManager::new(Mode::Backtest, "US_EQUITY")
    }

    #[test]
    fn regular_session_is_390_minutes() {
        let s = tm().get_trading_session(d(2025, 7, 2), "US_EQUITY");
        assert!(s.is_trading_day);
        assert!(!s.early_close);
        assert_eq!(s.bar_capacity(Interval::minutes(1)), 390);
        assert_eq!(s.bar_capacity(Interval::minutes(5)), 78);
    }

    #[test]
    fn early_close_session_is_210_minutes() {
        let s = tm().get_trading_session(d(2024, 11, 29), "US_EQUITY");
        assert!(s.is_trading_day);
        assert!(s.early_close);
        assert_eq!(s.bar_capacity(Interval::minutes(1)), 210);
    }

    #[test]
    fn weekend_and_holiday_are_not_trading_days() {
        let t = tm();
        assert!(!t.get_trading_session(d(2025, 7, 5), "US_EQUITY").is_trading_day); // Saturday
        assert!(!t.get_trading_session(d(2025, 7, 4), "US_EQUITY").is_trading_day); // July 4th
        assert!(t.is_holiday(d(2024, 11, 28), "US_EQUITY")); // Thanksgiving
    }

    #[test]
    fn session_contains_is_close_exclusive() {
        let t = tm();
        let s = t.get_trading_session(d(2025, 7, 2), "US_EQUITY");
        assert!(s.contains(s.open));
        assert!(s.contains(s.close - chrono::Duration::minutes(1)));
        assert!(!s.contains(s.close));
        assert!(!s.contains(s.open - chrono::Duration::seconds(1)));
    }

    #[test]
    fn previous_trading_date_skips_weekend_and_holiday() {
        let t = tm();
        // Monday 2025-07-07 minus 1 trading day is Thursday 07-03 (07-04 is
        // a holiday, 07-05/06 the weekend).
        assert_eq!(
            t.previous_trading_date(d(2025, 7, 7), 1, "US_EQUITY"),
            d(2025, 7, 3)
        );
        // Three trading days before 07-07: 07-03, 07-02, 07-01.
        assert_eq!(
            t.previous_trading_date(d(2025, 7, 7), 3, "US_EQUITY"),
            d(2025, 7, 1)
        );
    }

    #[test]
    fn next_trading_date_skips_non_trading_days() {
        let t = tm();
        assert_eq!(t.next_trading_date(d(2025, 7, 3), "US_EQUITY"), d(2025, 7, 7));
        assert_eq!(t.next_trading_date(d(2025, 7, 1), "US_EQUITY"), d(2025, 7, 2));
    }

    #[test]
    fn sim_clock_round_trip() {
        let t = tm();
        let s = t.get_trading_session(d(2025, 7, 2), "US_EQUITY");
        t.set_backtest_time(s.open);
        assert_eq!(t.current_time(), s.open);
        let later = s.open + chrono::Duration::minutes(42);
        t.set_backtest_time(later);
        assert_eq!(t.current_time(), later);
    }

    #[test]
    fn session_times_are_exchange_local() {
        let s = tm().get_trading_session(d(2025, 7, 2), "US_EQUITY");
        // July is EDT (UTC-4): 09:30 local is 13:30 UTC.
        assert_eq!(s.open.with_timezone(&Utc).format("%H:%M").to_string(), "13:30");
        // November is EST (UTC-5): 09:30 local is 14:30 UTC.
        let s2 = tm().get_trading_session(d(2024, 11, 29), "US_EQUITY");
        assert_eq!(s2.open.with_timezone(&Utc).format("%H:%M").to_string(), "14:30");
    }
}
