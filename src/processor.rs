// =============================================================================
// Data Processor — derived bars + indicator updates
// =============================================================================
//
// Worker that sits between the coordinator and the strategy dispatcher.
// Blocks on the coordinator's notification channel; on every base-bar
// notification it:
//
//   1. Aggregates any derived-interval windows the new bar completes
//      (open = first, high = max, low = min, close = last, volume = sum,
//      timestamp = window start, aligned to the session open).
//   2. Feeds indicators keyed on intervals that just changed.
//   3. Forwards a "bars updated" notification to the dispatcher tagged with
//      the concrete (symbol, interval) pairs.
//
// In data-driven backtests the processor waits for the dispatcher's
// completion signal before acking the coordinator, so the simulated clock
// cannot outrun the strategies. While notifications are paused (mid-session
// insertion) updates are processed but not forwarded.
//
// The aggregation core is a plain function so the coordinator's catch-up
// path can run the identical logic synchronously.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::calendar::TimeManager;
use crate::dispatcher::BarsUpdate;
use crate::session_data::SessionData;
use crate::status::WorkerStatus;
use crate::sync::Shutdown;
use crate::types::{Bar, BarSource, Interval, IntervalUnit};

// =============================================================================
// Notification message
// =============================================================================

/// "A new base bar landed for (symbol, interval)."
pub struct BarNotice {
    pub symbol: String,
    pub interval: Interval,
    /// Present in data-driven mode: the coordinator blocks until this fires.
    pub ack: Option<oneshot::Sender<()>>,
}

// =============================================================================
// Aggregation core (shared with the catch-up path)
// =============================================================================

/// Apply one new base bar: aggregate completed derived windows and update
/// indicators. Returns the (symbol, interval) pairs whose series changed,
/// base first. Uses internal (gate-bypassing) reads so it also works during
/// mid-session catch-up while the session is deactivated.
pub fn process_bar_update(
    session: &SessionData,
    time_manager: &TimeManager,
    exchange: &str,
    symbol: &str,
    base: Interval,
) -> Vec<(String, Interval)> {
    let mut updated = vec![(symbol.to_string(), base)];

    let Some((last_ts, derived)) = session.with_symbol(symbol, true, |sd| {
        let last_ts = sd
            .bars
            .get(&base)
            .and_then(|series| series.data.last())
            .map(|b| b.timestamp);
        (last_ts, sd.derived_intervals())
    }) else {
        return updated;
    };
    let Some(ts) = last_ts else {
        return updated;
    };

    let trading = time_manager.get_trading_session(ts.date_naive(), exchange);
    if !trading.is_trading_day {
        return updated;
    }
    let base_secs = base.seconds();
    let offset_end = (ts - trading.open).num_seconds() + base_secs;

    for d in derived {
        let complete = match d.unit() {
            IntervalUnit::Day => ts + base.duration() >= trading.close,
            // Weekly bars are only assembled from historical data; a single
            // session can never complete one.
            IntervalUnit::Week => false,
            _ => offset_end % d.seconds() == 0,
        };
        if !complete {
            continue;
        }

        let window_start = match d.unit() {
            IntervalUnit::Day => trading.open,
            _ => trading.open + chrono::Duration::seconds(offset_end - d.seconds()),
        };

        let Some(derived_bar) = session.with_symbol(symbol, true, |sd| {
            let series = sd.bars.get(&base)?;
            let window: Vec<&Bar> = series
                .data
                .iter()
                .rev()
                .take_while(|b| b.timestamp >= window_start)
                .collect();
            if window.is_empty() {
                return None;
            }
            // `window` is reversed; first() is the newest bar.
            let newest = window.first()?;
            let oldest = window.last()?;
            Some(Bar {
                symbol: symbol.to_string(),
                timestamp: window_start,
                open: oldest.open,
                high: window.iter().map(|b| b.high).fold(f64::MIN, f64::max),
                low: window.iter().map(|b| b.low).fold(f64::MAX, f64::min),
                close: newest.close,
                volume: window.iter().map(|b| b.volume).sum(),
                source: BarSource::Derived,
            })
        })
        .flatten() else {
            continue;
        };

        match session.append_bar(symbol, d, derived_bar) {
            Ok(()) => updated.push((symbol.to_string(), d)),
            Err(e) => {
                // A dropped derived bar is recoverable; the quality sweep
                // will surface the hole.
                warn!(symbol = %symbol, interval = %d, error = %e, "derived bar rejected");
            }
        }
    }

    // Indicator updates for every interval that changed.
    for (sym, iv) in updated.clone() {
        session.with_symbol_mut(&sym, |sd| {
            let Some(bar) = sd.bars.get(&iv).and_then(|s| s.data.last()).cloned() else {
                return;
            };
            for indicator in sd.indicators.values_mut() {
                if indicator.config.interval == iv {
                    indicator.update(&bar);
                }
            }
        });
    }

    updated
}

// =============================================================================
// Worker
// =============================================================================

pub struct DataProcessor {
    rx: mpsc::UnboundedReceiver<BarNotice>,
    session: Arc<SessionData>,
    time_manager: Arc<TimeManager>,
    exchange: String,
    dispatcher_tx: mpsc::UnboundedSender<BarsUpdate>,
    /// Notification-drop mode, toggled by the coordinator around
    /// mid-session insertion.
    notifications_paused: Arc<AtomicBool>,
    data_driven: bool,
    shutdown: Shutdown,
    status: Arc<WorkerStatus>,
}

impl DataProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rx: mpsc::UnboundedReceiver<BarNotice>,
        session: Arc<SessionData>,
        time_manager: Arc<TimeManager>,
        exchange: String,
        dispatcher_tx: mpsc::UnboundedSender<BarsUpdate>,
        notifications_paused: Arc<AtomicBool>,
        data_driven: bool,
        shutdown: Shutdown,
        status: Arc<WorkerStatus>,
    ) -> Self {
        Self {
            rx,
            session,
            time_manager,
            exchange,
            dispatcher_tx,
            notifications_paused,
            data_driven,
            shutdown,
            status,
        }
    }

    pub async fn run(mut self) {
        self.status.set_running(true);
        info!(data_driven = self.data_driven, "data processor started");
        let mut stop = self.shutdown.subscribe();

        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                notice = self.rx.recv() => {
                    let Some(notice) = notice else { break };
                    self.handle(notice).await;
                }
            }
        }

        self.status.set_running(false);
        info!("data processor stopped");
    }

    async fn handle(&self, notice: BarNotice) {
        let updated = process_bar_update(
            &self.session,
            &self.time_manager,
            &self.exchange,
            &notice.symbol,
            notice.interval,
        );
        self.status.bump("bars_processed");
        if updated.len() > 1 {
            self.status.set("last_derived", json!(updated.len() - 1));
        }

        if self.notifications_paused.load(Ordering::SeqCst) {
            self.status.bump("notifications_dropped");
            debug!(symbol = %notice.symbol, "notification dropped (paused)");
        } else {
            let (done_tx, done_rx) = if self.data_driven {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            } else {
                (None, None)
            };

            let update = BarsUpdate {
                updated,
                done: done_tx,
            };
            if self.dispatcher_tx.send(update).is_err() {
                error!("dispatcher channel closed; dropping notification");
            } else if let Some(rx) = done_rx {
                // Data-driven: hold the coordinator until strategies have
                // seen this bar.
                let _ = rx.await;
            }
        }

        if let Some(ack) = notice.ack {
            let _ = ack.send(());
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_data::SymbolSessionData;
    use crate::types::{AddedBy, Mode};
    use chrono::TimeZone;
    use chrono_tz::America::New_York;

    fn m(n: u32) -> Interval {
        Interval::minutes(n)
    }

    fn bar(minute: i64, close: f64, volume: f64) -> Bar {
        let ts = New_York.with_ymd_and_hms(2025, 7, 2, 9, 30, 0).unwrap()
            + chrono::Duration::minutes(minute);
        Bar {
            symbol: "RIVN".into(),
            timestamp: ts,
            open: close - 0.5,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume,
            source: BarSource::Stream,
        }
    }

    fn fixture() -> (SessionData, TimeManager) {
        let session = SessionData::new();
        let mut sd = SymbolSessionData::new("RIVN", m(1), AddedBy::Config);
        sd.add_interval(m(5)).unwrap();
        session.register_symbol_data(sd).unwrap();
        session.activate_session();
        let tm = TimeManager::new(Mode::Backtest, "US_EQUITY");
        (session, tm)
    }

    #[test]
    fn five_one_minute_bars_complete_a_five_minute_window() {
        let (session, tm) = fixture();

        for i in 0..5 {
            session
                .append_bar("RIVN", m(1), bar(i, 100.0 + i as f64, 10.0))
                .unwrap();
            let updated = process_bar_update(&session, &tm, "US_EQUITY", "RIVN", m(1));
            if i < 4 {
                assert_eq!(updated.len(), 1, "window completed early at bar {i}");
            } else {
                assert_eq!(updated.len(), 2);
                assert_eq!(updated[1].1, m(5));
            }
        }

        let derived = session.get_bars("RIVN", m(5), None);
        assert_eq!(derived.len(), 1);
        let d = &derived[0];
        // Window start = session open; OHLCV rolled up over the 5 bars.
        assert_eq!(d.timestamp, bar(0, 0.0, 0.0).timestamp);
        assert_eq!(d.open, 99.5); // first bar's open
        assert_eq!(d.close, 104.0); // last bar's close
        assert_eq!(d.high, 105.0); // max high
        assert_eq!(d.low, 99.0); // min low
        assert_eq!(d.volume, 50.0);
        assert_eq!(d.source, BarSource::Derived);
    }

    #[test]
    fn second_window_aligns_to_session_open() {
        let (session, tm) = fixture();
        for i in 0..10 {
            session
                .append_bar("RIVN", m(1), bar(i, 100.0, 10.0))
                .unwrap();
            process_bar_update(&session, &tm, "US_EQUITY", "RIVN", m(1));
        }
        let derived = session.get_bars("RIVN", m(5), None);
        assert_eq!(derived.len(), 2);
        assert_eq!(
            (derived[1].timestamp - derived[0].timestamp).num_minutes(),
            5
        );
    }

    #[test]
    fn gap_in_base_bars_still_aggregates_available_ones() {
        let (session, tm) = fixture();
        // Minute 2 is missing from the first window.
        for i in [0, 1, 3, 4] {
            session
                .append_bar("RIVN", m(1), bar(i, 100.0, 10.0))
                .unwrap();
            process_bar_update(&session, &tm, "US_EQUITY", "RIVN", m(1));
        }
        let derived = session.get_bars("RIVN", m(5), None);
        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].volume, 40.0);
    }

    #[test]
    fn indicators_update_on_their_interval_only() {
        use crate::indicators::{IndicatorConfig, IndicatorData, IndicatorKind, IndicatorParams};
        let (session, tm) = fixture();
        session
            .with_symbol_mut("RIVN", |sd| {
                sd.register_indicator(IndicatorData::new(IndicatorConfig {
                    name: "sma_2_5m".into(),
                    kind: IndicatorKind::Sma,
                    period: 2,
                    interval: m(5),
                    params: IndicatorParams::default(),
                }))
                .unwrap();
                sd.register_indicator(IndicatorData::new(IndicatorConfig {
                    name: "sma_3_1m".into(),
                    kind: IndicatorKind::Sma,
                    period: 3,
                    interval: m(1),
                    params: IndicatorParams::default(),
                }))
                .unwrap();
            })
            .unwrap();

        for i in 0..10 {
            session
                .append_bar("RIVN", m(1), bar(i, 100.0 + i as f64, 10.0))
                .unwrap();
            process_bar_update(&session, &tm, "US_EQUITY", "RIVN", m(1));
        }

        session
            .with_symbol("RIVN", false, |sd| {
                let m1_ind = &sd.indicators["sma_3_1m"];
                assert!(m1_ind.valid);
                assert_eq!(m1_ind.bars_seen, 10);

                let m5_ind = &sd.indicators["sma_2_5m"];
                // Two 5m windows completed.
                assert_eq!(m5_ind.bars_seen, 2);
                assert!(m5_ind.valid);
            })
            .unwrap();
    }

    #[test]
    fn works_while_session_deactivated() {
        let (session, tm) = fixture();
        session.deactivate_session();
        for i in 0..5 {
            session
                .append_bar("RIVN", m(1), bar(i, 100.0, 10.0))
                .unwrap();
            process_bar_update(&session, &tm, "US_EQUITY", "RIVN", m(1));
        }
        session.activate_session();
        assert_eq!(session.get_bars("RIVN", m(5), None).len(), 1);
    }
}
