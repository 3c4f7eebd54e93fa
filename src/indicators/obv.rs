// =============================================================================
// On-Balance Volume (OBV)
// =============================================================================
//
// Running signed volume sum: add the bar's volume when the close rises,
// subtract it when the close falls, unchanged when flat. Starts at zero on
// the first bar.
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct ObvState {
    prev_close: Option<f64>,
    obv: f64,
}

impl ObvState {
    pub fn new() -> Self {
        Self::default()
    }
}

pub fn update(state: &mut ObvState, close: f64, volume: f64) -> Option<f64> {
    if !close.is_finite() || !volume.is_finite() {
        return None;
    }

    match state.prev_close {
        None => {
            state.prev_close = Some(close);
            Some(state.obv)
        }
        Some(prev) => {
            if close > prev {
                state.obv += volume;
            } else if close < prev {
                state.obv -= volume;
            }
            state.prev_close = Some(close);
            Some(state.obv)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero_then_accumulates() {
        let mut state = ObvState::new();
        assert_eq!(update(&mut state, 10.0, 100.0), Some(0.0));
        assert_eq!(update(&mut state, 11.0, 200.0), Some(200.0)); // up
        assert_eq!(update(&mut state, 10.5, 50.0), Some(150.0)); // down
        assert_eq!(update(&mut state, 10.5, 999.0), Some(150.0)); // flat
    }
}
