// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
// MACD line   = EMA(fast) - EMA(slow)
// Signal line = EMA(MACD line, signal_period)
// Histogram   = MACD line - Signal line
//
// Default periods: fast=12, slow=26, signal=9.
// =============================================================================

use super::ema::calculate_ema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MacdValue {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute the most recent MACD reading from a `closes` series.
///
/// Returns `None` when there is not enough data to seed both the slow EMA and
/// the signal-line EMA of the MACD series.
pub fn calculate_macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Option<MacdValue> {
    if fast == 0 || slow == 0 || signal == 0 || fast >= slow {
        return None;
    }

    let ema_fast = calculate_ema(closes, fast);
    let ema_slow = calculate_ema(closes, slow);
    if ema_fast.is_empty() || ema_slow.is_empty() {
        return None;
    }

    // ema_fast is longer (starts earlier) than ema_slow by (slow - fast)
    // entries; align them on the tail so each macd_line[i] compares EMAs at
    // the same closing bar.
    let offset = ema_fast.len().checked_sub(ema_slow.len())?;
    let macd_line: Vec<f64> = ema_slow
        .iter()
        .enumerate()
        .map(|(i, slow_v)| ema_fast[i + offset] - slow_v)
        .collect();

    if macd_line.len() < signal {
        return None;
    }

    let signal_line = calculate_ema(&macd_line, signal);
    let signal_v = *signal_line.last()?;
    let macd_v = *macd_line.last()?;

    let histogram = macd_v - signal_v;
    if !macd_v.is_finite() || !signal_v.is_finite() || !histogram.is_finite() {
        return None;
    }

    Some(MacdValue { macd: macd_v, signal: signal_v, histogram })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_insufficient_data_returns_none() {
        let closes: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 12, 26, 9).is_none());
    }

    #[test]
    fn macd_rejects_fast_not_less_than_slow() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 26, 12, 9).is_none());
    }

    #[test]
    fn macd_bullish_for_rising_series() {
        let closes: Vec<f64> = (1..=200).map(|x| x as f64).collect();
        let value = calculate_macd(&closes, 12, 26, 9).unwrap();
        // A steadily rising series produces a positive MACD line (fast EMA
        // above slow EMA).
        assert!(value.macd > 0.0);
        assert!(value.macd.is_finite() && value.signal.is_finite() && value.histogram.is_finite());
    }

    #[test]
    fn macd_bearish_for_falling_series() {
        let closes: Vec<f64> = (1..=200).rev().map(|x| x as f64).collect();
        let value = calculate_macd(&closes, 12, 26, 9).unwrap();
        assert!(value.macd < 0.0);
    }

    #[test]
    fn macd_flat_series_is_near_zero() {
        let closes = vec![100.0; 200];
        let value = calculate_macd(&closes, 12, 26, 9).unwrap();
        assert!(value.macd.abs() < 1e-9);
        assert!(value.histogram.abs() < 1e-9);
    }
}
