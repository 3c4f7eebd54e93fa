// =============================================================================
// Relative Strength Index (RSI)
// =============================================================================
//
// Wilder's RSI over close-to-close changes:
//
//   RS  = avg_gain / avg_loss
//   RSI = 100 - 100 / (1 + RS)
//
// The first `period` changes seed the averages with a plain mean; afterwards
// the averages follow Wilder smoothing:
//
//   avg = (avg * (period - 1) + current) / period
//
// A value therefore first appears after `period + 1` closes (one close is
// consumed just to establish the first change).
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct RsiState {
    prev_close: Option<f64>,
    avg_gain: f64,
    avg_loss: f64,
    changes_seen: usize,
}

impl RsiState {
    pub fn new() -> Self {
        Self::default()
    }
}

fn rsi_from(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        // All gains (or totally flat): saturate at 100.
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

/// Feed one close. Returns the RSI once `period` changes have been observed.
pub fn update(state: &mut RsiState, close: f64, period: usize) -> Option<f64> {
    if period == 0 || !close.is_finite() {
        return None;
    }

    let prev = match state.prev_close {
        Some(p) => p,
        None => {
            state.prev_close = Some(close);
            return None;
        }
    };
    state.prev_close = Some(close);

    let change = close - prev;
    let gain = change.max(0.0);
    let loss = (-change).max(0.0);
    state.changes_seen += 1;

    if state.changes_seen <= period {
        state.avg_gain += gain;
        state.avg_loss += loss;
        if state.changes_seen == period {
            state.avg_gain /= period as f64;
            state.avg_loss /= period as f64;
            return Some(rsi_from(state.avg_gain, state.avg_loss));
        }
        None
    } else {
        let p = period as f64;
        state.avg_gain = (state.avg_gain * (p - 1.0) + gain) / p;
        state.avg_loss = (state.avg_loss * (p - 1.0) + loss) / p;
        Some(rsi_from(state.avg_gain, state.avg_loss))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_period_plus_one_closes() {
        let mut state = RsiState::new();
        assert_eq!(update(&mut state, 10.0, 3), None); // establishes prev
        assert_eq!(update(&mut state, 11.0, 3), None);
        assert_eq!(update(&mut state, 12.0, 3), None);
        assert!(update(&mut state, 13.0, 3).is_some());
    }

    #[test]
    fn all_gains_saturate_at_100() {
        let mut state = RsiState::new();
        let mut last = None;
        for c in 1..=10 {
            last = update(&mut state, c as f64, 5);
        }
        assert_eq!(last, Some(100.0));
    }

    #[test]
    fn all_losses_pin_at_zero() {
        let mut state = RsiState::new();
        let mut last = None;
        for c in (1..=10).rev() {
            last = update(&mut state, c as f64, 5);
        }
        let v = last.unwrap();
        assert!(v.abs() < 1e-9, "expected ~0, got {v}");
    }

    #[test]
    fn alternating_series_lands_in_the_middle() {
        // Equal-magnitude gains and losses: RS = 1, RSI = 50.
        let mut state = RsiState::new();
        let mut last = None;
        for i in 0..20 {
            let c = if i % 2 == 0 { 100.0 } else { 101.0 };
            last = update(&mut state, c, 4);
        }
        let v = last.unwrap();
        assert!((v - 50.0).abs() < 5.0, "expected near 50, got {v}");
    }
}
