// =============================================================================
// Average True Range (ATR)
// =============================================================================
//
// True range of a bar given the previous close:
//
//   TR = max(high - low, |high - prev_close|, |low - prev_close|)
//
// The first bar has no previous close, so its TR is simply high - low. The
// first `period` TRs seed the ATR with a plain mean; afterwards Wilder
// smoothing applies:
//
//   ATR = (ATR * (period - 1) + TR) / period
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct AtrState {
    prev_close: Option<f64>,
    atr: Option<f64>,
    tr_sum: f64,
    tr_count: usize,
}

impl AtrState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Feed one bar's high/low/close. Returns the ATR once `period` true ranges
/// have been accumulated.
pub fn update(state: &mut AtrState, high: f64, low: f64, close: f64, period: usize) -> Option<f64> {
    if period == 0 || !high.is_finite() || !low.is_finite() || !close.is_finite() {
        return None;
    }

    let tr = match state.prev_close {
        Some(pc) => (high - low).max((high - pc).abs()).max((low - pc).abs()),
        None => high - low,
    };
    state.prev_close = Some(close);

    match state.atr {
        Some(prev) => {
            let p = period as f64;
            let atr = (prev * (p - 1.0) + tr) / p;
            state.atr = Some(atr);
            Some(atr)
        }
        None => {
            state.tr_sum += tr;
            state.tr_count += 1;
            if state.tr_count == period {
                let atr = state.tr_sum / period as f64;
                state.atr = Some(atr);
                Some(atr)
            } else {
                None
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_with_mean_of_true_ranges() {
        let mut state = AtrState::new();
        // Three bars with range 2.0 each, no inter-bar jumps.
        assert_eq!(update(&mut state, 11.0, 9.0, 10.0, 3), None);
        assert_eq!(update(&mut state, 11.0, 9.0, 10.0, 3), None);
        assert_eq!(update(&mut state, 11.0, 9.0, 10.0, 3), Some(2.0));
    }

    #[test]
    fn gap_up_widens_the_true_range() {
        let mut state = AtrState::new();
        update(&mut state, 11.0, 9.0, 10.0, 2);
        // Gap to 20: TR = max(1, |21-10|, |19-10|) = 11.
        let atr = update(&mut state, 21.0, 19.0, 20.0, 2).unwrap();
        assert!((atr - (2.0 + 11.0) / 2.0).abs() < 1e-12);
    }

    #[test]
    fn wilder_smoothing_after_seed() {
        let mut state = AtrState::new();
        update(&mut state, 11.0, 9.0, 10.0, 2);
        update(&mut state, 11.0, 9.0, 10.0, 2); // seed ATR = 2.0
        let atr = update(&mut state, 12.0, 8.0, 10.0, 2).unwrap(); // TR = 4
        assert!((atr - (2.0 + 4.0) / 2.0).abs() < 1e-12);
    }
}
