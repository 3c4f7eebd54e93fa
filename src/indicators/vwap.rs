// =============================================================================
// Volume-Weighted Average Price (VWAP)
// =============================================================================
//
// Running sum(typical_price * volume) / sum(volume), reset at session
// boundaries — the state remembers which session date it is accumulating and
// starts over when a bar from a new date arrives.
// =============================================================================

use chrono::{DateTime, NaiveDate};
use chrono_tz::Tz;

#[derive(Debug, Clone, Default)]
pub struct VwapState {
    pv_sum: f64,
    vol_sum: f64,
    session_date: Option<NaiveDate>,
}

impl VwapState {
    pub fn new() -> Self {
        Self::default()
    }
}

pub fn update(
    state: &mut VwapState,
    timestamp: DateTime<Tz>,
    typical_price: f64,
    volume: f64,
) -> Option<f64> {
    if !typical_price.is_finite() || !volume.is_finite() || volume < 0.0 {
        return None;
    }

    let date = timestamp.date_naive();
    if state.session_date != Some(date) {
        state.pv_sum = 0.0;
        state.vol_sum = 0.0;
        state.session_date = Some(date);
    }

    state.pv_sum += typical_price * volume;
    state.vol_sum += volume;

    if state.vol_sum > 0.0 {
        Some(state.pv_sum / state.vol_sum)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::America::New_York;

    fn ts(day: u32, h: u32, min: u32) -> DateTime<Tz> {
        New_York.with_ymd_and_hms(2025, 7, day, h, min, 0).unwrap()
    }

    #[test]
    fn weighted_average_over_one_session() {
        let mut state = VwapState::new();
        assert_eq!(update(&mut state, ts(2, 9, 30), 100.0, 10.0), Some(100.0));
        // (100*10 + 110*30) / 40 = 107.5
        assert_eq!(update(&mut state, ts(2, 9, 31), 110.0, 30.0), Some(107.5));
    }

    #[test]
    fn resets_at_session_boundary() {
        let mut state = VwapState::new();
        update(&mut state, ts(1, 15, 59), 500.0, 1_000.0);
        // A new session date wipes the accumulators.
        assert_eq!(update(&mut state, ts(2, 9, 30), 100.0, 10.0), Some(100.0));
    }

    #[test]
    fn zero_volume_bar_keeps_previous_ratio() {
        let mut state = VwapState::new();
        update(&mut state, ts(2, 9, 30), 100.0, 10.0);
        assert_eq!(update(&mut state, ts(2, 9, 31), 999.0, 0.0), Some(100.0));
    }
}
