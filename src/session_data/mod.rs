// =============================================================================
// SessionData — the single source of truth
// =============================================================================
//
// Process-wide store of all per-symbol session state. Every worker reads and
// mutates through the guarded methods here; there are no shadow tracking
// maps anywhere else in the engine — whatever a worker needs to know (which
// intervals are derived, which series changed) it derives from this tree.
//
// Thread safety:
//   - One `parking_lot::RwLock` guards the whole store. No guarded method
//     calls another guarded method, so the lock is never re-entered.
//   - Borrowed access to bar series is closure-scoped (`with_bars`) so a
//     reference can never outlive the guard. Callers that need to keep data
//     use the copying accessors.
//   - An atomic version counter signals the export/WebSocket layer; a
//     `Notify` wakes the quality manager on data arrival.
//
// The `session_active` gate hides intermediate state during mid-session
// symbol insertion: while deactivated, read accessors return empty/None but
// writes still land (`internal = true` readers bypass the gate for the
// catch-up path).
// =============================================================================

mod export;
mod symbol;

pub use symbol::{
    BarIntervalData, Gap, HistoricalData, HistoricalIntervalData, Quote, SessionMetrics,
    SymbolMeta, SymbolSessionData, Tick,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, NaiveDate};
use chrono_tz::Tz;
use parking_lot::RwLock;
use tokio::sync::Notify;

use crate::error::{CoreError, CoreResult};
use crate::types::{Bar, Interval};

/// Ring cap for quote/tick tapes per symbol.
const MAX_TAPE_EVENTS: usize = 10_000;

pub(crate) struct SessionStore {
    pub(crate) symbols: HashMap<String, SymbolSessionData>,
    pub(crate) session_active: bool,
    pub(crate) current_session_date: Option<NaiveDate>,
    /// Delta-export cursors: rows already emitted per (symbol, interval).
    pub(crate) export_cursors: HashMap<(String, Interval), usize>,
}

pub struct SessionData {
    pub(crate) inner: RwLock<SessionStore>,
    version: AtomicU64,
    /// Signalled on every bar append; the quality manager sleeps on this.
    pub data_arrival: Notify,
}

impl Default for SessionData {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionData {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(SessionStore {
                symbols: HashMap::new(),
                session_active: false,
                current_session_date: None,
                export_cursors: HashMap::new(),
            }),
            version: AtomicU64::new(1),
            data_arrival: Notify::new(),
        }
    }

    // ── Version tracking ────────────────────────────────────────────────

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    // ── Session gate ────────────────────────────────────────────────────

    pub fn activate_session(&self) {
        self.inner.write().session_active = true;
        self.bump();
    }

    pub fn deactivate_session(&self) {
        self.inner.write().session_active = false;
        self.bump();
    }

    pub fn is_active(&self) -> bool {
        self.inner.read().session_active
    }

    pub fn set_session_date(&self, date: NaiveDate) {
        self.inner.write().current_session_date = Some(date);
        self.bump();
    }

    pub fn current_session_date(&self) -> Option<NaiveDate> {
        self.inner.read().current_session_date
    }

    // ── Symbol registration & removal ───────────────────────────────────

    /// Install a pre-populated symbol tree. Fails if the symbol is already
    /// present — upgrades mutate in place instead of re-registering.
    pub fn register_symbol_data(&self, sd: SymbolSessionData) -> CoreResult<()> {
        let mut store = self.inner.write();
        if store.symbols.contains_key(&sd.symbol) {
            return Err(CoreError::data(format!(
                "symbol {} is already registered",
                sd.symbol
            )));
        }
        store.symbols.insert(sd.symbol.clone(), sd);
        drop(store);
        self.bump();
        Ok(())
    }

    /// Remove a symbol and everything hanging off it: bars, indicators,
    /// quality, metadata, export cursors. Returns whether it existed.
    pub fn remove_symbol(&self, symbol: &str) -> bool {
        let mut store = self.inner.write();
        let existed = store.symbols.remove(symbol).is_some();
        store.export_cursors.retain(|(sym, _), _| sym != symbol);
        drop(store);
        if existed {
            self.bump();
        }
        existed
    }

    /// Drop all symbols. Called only on session teardown.
    pub fn clear(&self) {
        let mut store = self.inner.write();
        store.symbols.clear();
        store.export_cursors.clear();
        drop(store);
        self.bump();
    }

    // ── Guarded read access ─────────────────────────────────────────────

    /// Run `f` against a symbol's tree under the lock. Returns `None` when
    /// the symbol is missing — or when the session is deactivated and
    /// `internal` is false (the gate that hides mid-insertion state).
    pub fn with_symbol<R>(
        &self,
        symbol: &str,
        internal: bool,
        f: impl FnOnce(&SymbolSessionData) -> R,
    ) -> Option<R> {
        let store = self.inner.read();
        if !store.session_active && !internal {
            return None;
        }
        store.symbols.get(symbol).map(f)
    }

    /// Mutable variant for internal writers (provisioning, the processor's
    /// indicator updates, catch-up).
    pub fn with_symbol_mut<R>(
        &self,
        symbol: &str,
        f: impl FnOnce(&mut SymbolSessionData) -> R,
    ) -> Option<R> {
        let mut store = self.inner.write();
        let out = store.symbols.get_mut(symbol).map(f);
        drop(store);
        if out.is_some() {
            self.bump();
        }
        out
    }

    /// Zero-copy bar access: `f` borrows the ordered series under the lock.
    /// The hot path for strategies.
    pub fn with_bars<R>(
        &self,
        symbol: &str,
        interval: Interval,
        f: impl FnOnce(&[Bar]) -> R,
    ) -> Option<R> {
        let store = self.inner.read();
        if !store.session_active {
            return None;
        }
        store
            .symbols
            .get(symbol)
            .and_then(|sd| sd.bars.get(&interval))
            .map(|series| f(&series.data))
    }

    /// Copying accessor, optionally filtered to bars at or after `since`.
    pub fn get_bars(&self, symbol: &str, interval: Interval, since: Option<DateTime<Tz>>) -> Vec<Bar> {
        let store = self.inner.read();
        if !store.session_active {
            return Vec::new();
        }
        let Some(series) = store
            .symbols
            .get(symbol)
            .and_then(|sd| sd.bars.get(&interval))
        else {
            return Vec::new();
        };
        match since {
            Some(t) => series
                .data
                .iter()
                .filter(|b| b.timestamp >= t)
                .cloned()
                .collect(),
            None => series.data.clone(),
        }
    }

    pub fn get_active_symbols(&self) -> Vec<String> {
        let store = self.inner.read();
        if !store.session_active {
            return Vec::new();
        }
        let mut out: Vec<String> = store.symbols.keys().cloned().collect();
        out.sort();
        out
    }

    /// Map of symbol -> derived intervals, consumed by the data processor
    /// to discover aggregation work. Derived-ness is read off the tree, not
    /// tracked separately.
    pub fn get_symbols_with_derived(&self) -> HashMap<String, Vec<Interval>> {
        let store = self.inner.read();
        if !store.session_active {
            return HashMap::new();
        }
        store
            .symbols
            .iter()
            .map(|(sym, sd)| (sym.clone(), sd.derived_intervals()))
            .collect()
    }

    pub fn contains_symbol(&self, symbol: &str) -> bool {
        self.inner.read().symbols.contains_key(symbol)
    }

    pub fn symbol_count(&self) -> usize {
        self.inner.read().symbols.len()
    }

    // ── Mutators ────────────────────────────────────────────────────────

    /// Append a bar to `(symbol, interval)`: enforces strict timestamp
    /// monotonicity, marks the series updated, and recomputes session
    /// metrics when the interval is the symbol's base. Works regardless of
    /// the active gate (writes continue during mid-session catch-up).
    pub fn append_bar(&self, symbol: &str, interval: Interval, bar: Bar) -> CoreResult<()> {
        let mut store = self.inner.write();
        let sd = store
            .symbols
            .get_mut(symbol)
            .ok_or_else(|| CoreError::UnknownSymbol(symbol.to_string()))?;
        let is_base = interval == sd.base_interval;
        let series = sd.bars.get_mut(&interval).ok_or_else(|| {
            CoreError::data(format!("no {interval} series registered for {symbol}"))
        })?;
        let metrics_bar = bar.clone();
        series.append(bar)?;
        if is_base {
            sd.metrics.absorb(&metrics_bar);
        }
        drop(store);
        self.bump();
        self.data_arrival.notify_waiters();
        Ok(())
    }

    /// Insert backfilled bars at their sorted positions (live-mode gap
    /// fills). Duplicate timestamps are skipped. Returns how many landed.
    pub fn backfill_bars(&self, symbol: &str, interval: Interval, bars: Vec<Bar>) -> CoreResult<usize> {
        let mut store = self.inner.write();
        let sd = store
            .symbols
            .get_mut(symbol)
            .ok_or_else(|| CoreError::UnknownSymbol(symbol.to_string()))?;
        let series = sd.bars.get_mut(&interval).ok_or_else(|| {
            CoreError::data(format!("no {interval} series registered for {symbol}"))
        })?;
        let mut inserted = 0;
        for bar in bars {
            if series.backfill(bar) {
                inserted += 1;
            }
        }
        drop(store);
        if inserted > 0 {
            self.bump();
            self.data_arrival.notify_waiters();
        }
        Ok(inserted)
    }

    pub fn set_quality(&self, symbol: &str, interval: Interval, quality: f64) {
        let mut store = self.inner.write();
        if let Some(series) = store
            .symbols
            .get_mut(symbol)
            .and_then(|sd| sd.bars.get_mut(&interval))
        {
            series.quality = Some(quality);
        }
        drop(store);
        self.bump();
    }

    pub fn set_gaps(&self, symbol: &str, interval: Interval, gaps: Vec<Gap>) {
        let mut store = self.inner.write();
        if let Some(series) = store
            .symbols
            .get_mut(symbol)
            .and_then(|sd| sd.bars.get_mut(&interval))
        {
            series.gaps = gaps;
        }
        drop(store);
        self.bump();
    }

    /// Record a top-of-book quote (live mode). The tape is ring-capped.
    pub fn append_quote(&self, symbol: &str, quote: Quote) -> CoreResult<()> {
        let mut store = self.inner.write();
        let sd = store
            .symbols
            .get_mut(symbol)
            .ok_or_else(|| CoreError::UnknownSymbol(symbol.to_string()))?;
        sd.quotes.push(quote);
        if sd.quotes.len() > MAX_TAPE_EVENTS {
            sd.quotes.remove(0);
        }
        Ok(())
    }

    /// Record a trade print (live mode). The tape is ring-capped.
    pub fn append_tick(&self, symbol: &str, tick: Tick) -> CoreResult<()> {
        let mut store = self.inner.write();
        let sd = store
            .symbols
            .get_mut(symbol)
            .ok_or_else(|| CoreError::UnknownSymbol(symbol.to_string()))?;
        sd.ticks.push(tick);
        if sd.ticks.len() > MAX_TAPE_EVENTS {
            sd.ticks.remove(0);
        }
        Ok(())
    }

    /// Series that changed since the last quality sweep, with the sweep
    /// consuming the flags.
    pub fn take_updated_series(&self) -> Vec<(String, Interval)> {
        let mut store = self.inner.write();
        let mut out = Vec::new();
        for (sym, sd) in store.symbols.iter_mut() {
            for (iv, series) in sd.bars.iter_mut() {
                if series.updated {
                    series.updated = false;
                    out.push((sym.clone(), *iv));
                }
            }
        }
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
    use crate::types::{AddedBy, BarSource};
    use chrono::TimeZone;
    use chrono_tz::America::New_York;

    fn m1() -> Interval {
        Interval::minutes(1)
    }

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

    fn active_session_with_symbol() -> SessionData {
        let session = SessionData::new();
        session
            .register_symbol_data(SymbolSessionData::new("RIVN", m1(), AddedBy::Config))
            .unwrap();
        session.activate_session();
        session
    }

    #[test]
    fn reads_return_empty_when_deactivated() {
        let session = active_session_with_symbol();
        session.append_bar("RIVN", m1(), bar(0, 100.0)).unwrap();

        assert_eq!(session.get_active_symbols(), vec!["RIVN".to_string()]);
        assert!(session.with_symbol("RIVN", false, |_| ()).is_some());

        session.deactivate_session();
        assert!(session.get_active_symbols().is_empty());
        assert!(session.with_symbol("RIVN", false, |_| ()).is_none());
        assert!(session.get_bars("RIVN", m1(), None).is_empty());
        assert!(session.get_symbols_with_derived().is_empty());
        // Internal readers bypass the gate.
        assert!(session.with_symbol("RIVN", true, |_| ()).is_some());
        // Writes still land while deactivated.
        session.append_bar("RIVN", m1(), bar(1, 101.0)).unwrap();
        session.activate_session();
        assert_eq!(session.get_bars("RIVN", m1(), None).len(), 2);
    }

    #[test]
    fn append_updates_metrics_only_for_base() {
        let session = active_session_with_symbol();
        session
            .with_symbol_mut("RIVN", |sd| sd.add_interval(Interval::minutes(5)))
            .unwrap()
            .unwrap();

        session.append_bar("RIVN", m1(), bar(0, 100.0)).unwrap();
        session
            .append_bar("RIVN", Interval::minutes(5), bar(0, 100.0))
            .unwrap();

        session
            .with_symbol("RIVN", false, |sd| {
                assert_eq!(sd.metrics.volume, 100.0);
                assert_eq!(sd.metrics.last_update, Some(bar(0, 0.0).timestamp));
            })
            .unwrap();
    }

    #[test]
    fn duplicate_append_is_an_invariant_violation() {
        let session = active_session_with_symbol();
        session.append_bar("RIVN", m1(), bar(0, 100.0)).unwrap();
        let err = session.append_bar("RIVN", m1(), bar(0, 101.0)).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(session.get_bars("RIVN", m1(), None).len(), 1);
    }

    #[test]
    fn missing_symbol_reads_are_none_not_errors() {
        let session = SessionData::new();
        session.activate_session();
        assert!(session.with_symbol("GHOST", false, |_| ()).is_none());
        assert!(session.get_bars("GHOST", m1(), None).is_empty());
        assert!(session.with_bars("GHOST", m1(), |_| ()).is_none());
    }

    #[test]
    fn since_filter_on_get_bars() {
        let session = active_session_with_symbol();
        for i in 0..5 {
            session.append_bar("RIVN", m1(), bar(i, 100.0 + i as f64)).unwrap();
        }
        let since = bar(3, 0.0).timestamp;
        let bars = session.get_bars("RIVN", m1(), Some(since));
        assert_eq!(bars.len(), 2);
        assert!(bars.iter().all(|b| b.timestamp >= since));
    }

    #[test]
    fn with_bars_is_borrowed_access() {
        let session = active_session_with_symbol();
        session.append_bar("RIVN", m1(), bar(0, 100.0)).unwrap();
        let last_close = session
            .with_bars("RIVN", m1(), |bars| bars.last().map(|b| b.close))
            .flatten();
        assert_eq!(last_close, Some(100.0));
    }

    #[test]
    fn remove_symbol_drops_everything() {
        let session = active_session_with_symbol();
        session.append_bar("RIVN", m1(), bar(0, 100.0)).unwrap();
        session.set_quality("RIVN", m1(), 99.0);

        assert!(session.remove_symbol("RIVN"));
        assert!(!session.contains_symbol("RIVN"));
        assert!(!session.remove_symbol("RIVN"));
        assert_eq!(session.symbol_count(), 0);
    }

    #[test]
    fn clear_empties_the_store() {
        let session = active_session_with_symbol();
        session
            .register_symbol_data(SymbolSessionData::new("AAPL", m1(), AddedBy::Strategy))
            .unwrap();
        assert_eq!(session.symbol_count(), 2);
        session.clear();
        assert_eq!(session.symbol_count(), 0);
    }

    #[test]
    fn double_registration_is_rejected() {
        let session = active_session_with_symbol();
        let err = session
            .register_symbol_data(SymbolSessionData::new("RIVN", m1(), AddedBy::Config))
            .unwrap_err();
        assert!(matches!(err, CoreError::Data(_)));
    }

    #[test]
    fn take_updated_series_consumes_flags() {
        let session = active_session_with_symbol();
        session.append_bar("RIVN", m1(), bar(0, 100.0)).unwrap();
        assert_eq!(session.take_updated_series(), vec![("RIVN".to_string(), m1())]);
        assert!(session.take_updated_series().is_empty());
    }

    #[test]
    fn quote_and_tick_tapes_append_per_symbol() {
        let session = active_session_with_symbol();
        session
            .append_quote(
                "RIVN",
                Quote {
                    timestamp: bar(0, 0.0).timestamp,
                    bid: 99.5,
                    ask: 100.5,
                },
            )
            .unwrap();
        session
            .append_tick(
                "RIVN",
                Tick {
                    timestamp: bar(0, 0.0).timestamp,
                    price: 100.0,
                    size: 10.0,
                },
            )
            .unwrap();
        session
            .with_symbol("RIVN", false, |sd| {
                assert_eq!(sd.quotes.len(), 1);
                assert_eq!(sd.ticks.len(), 1);
            })
            .unwrap();
        assert!(session
            .append_quote(
                "GHOST",
                Quote {
                    timestamp: bar(0, 0.0).timestamp,
                    bid: 1.0,
                    ask: 2.0,
                }
            )
            .is_err());
    }

    #[test]
    fn quality_and_gaps_land_on_the_series() {
        let session = active_session_with_symbol();
        session.set_quality("RIVN", m1(), 99.2);
        let gap = Gap {
            start_time: bar(15, 0.0).timestamp,
            end_time: bar(17, 0.0).timestamp,
            bar_count: 3,
            retry_count: 0,
        };
        session.set_gaps("RIVN", m1(), vec![gap.clone()]);
        session
            .with_symbol("RIVN", false, |sd| {
                let series = &sd.bars[&m1()];
                assert_eq!(series.quality, Some(99.2));
                assert_eq!(series.gaps, vec![gap]);
            })
            .unwrap();
    }
}
