// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle band: SMA(period). Upper/lower: middle +/- width * stddev, with the
// population standard deviation over the same window.
// =============================================================================

use std::collections::VecDeque;

#[derive(Debug, Clone, Default)]
pub struct BollingerState {
    window: VecDeque<f64>,
}

impl BollingerState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// The three band values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bands {
    pub middle: f64,
    pub upper: f64,
    pub lower: f64,
}

/// Feed one close. Returns the bands once the window is full.
pub fn update(state: &mut BollingerState, close: f64, period: usize, width: f64) -> Option<Bands> {
    if period == 0 || !close.is_finite() {
        return None;
    }

    state.window.push_back(close);
    if state.window.len() > period {
        state.window.pop_front();
    }
    if state.window.len() < period {
        return None;
    }

    let n = period as f64;
    let mean = state.window.iter().sum::<f64>() / n;
    let variance = state.window.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();

    Some(Bands {
        middle: mean,
        upper: mean + width * std_dev,
        lower: mean - width * std_dev,
    })
}
