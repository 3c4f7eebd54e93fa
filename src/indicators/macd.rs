// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
// Three EMAs chained together:
//
//   macd_line = EMA(fast) - EMA(slow)
//   signal    = EMA(macd_line, signal_period)
//   histogram = macd_line - signal
//
// A full triple first appears after `slow + signal - 1` closes: the line
// starts at close `slow`, and the signal needs `signal_period` line values.
// =============================================================================

use super::ema::{self, EmaState};

#[derive(Debug, Clone, Default)]
pub struct MacdState {
    fast: EmaState,
    slow: EmaState,
    signal: EmaState,
}

impl MacdState {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdOutput {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Feed one close through all three EMAs.
pub fn update(
    state: &mut MacdState,
    close: f64,
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> Option<MacdOutput> {
    let fast = ema::update(&mut state.fast, close, fast_period);
    let slow = ema::update(&mut state.slow, close, slow_period);

    let (fast, slow) = match (fast, slow) {
        (Some(f), Some(s)) => (f, s),
        _ => return None,
    };

    let line = fast - slow;
    let signal = ema::update(&mut state.signal, line, signal_period)?;

    Some(MacdOutput {
        macd: line,
        signal,
        histogram: line - signal,
    })
}
