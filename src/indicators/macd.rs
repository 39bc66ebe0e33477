// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
// MACD line = EMA(fast) - EMA(slow), conventionally fast=12, slow=26.
// Signal line = EMA(9) of the MACD line.
// =============================================================================

use super::ema::calculate_ema;

/// Compute the most recent `(macd, signal)` pair for `closes`.
///
/// Returns `None` when there is not enough data for the slow EMA plus the
/// signal-line EMA, or when any intermediate value is non-finite.
pub fn current_macd(closes: &[f64], fast: usize, slow: usize, signal_period: usize) -> Option<(f64, f64)> {
    if fast == 0 || slow == 0 || signal_period == 0 || fast >= slow {
        return None;
    }
    if closes.len() < slow + signal_period {
        return None;
    }

    let ema_fast = calculate_ema(closes, fast);
    let ema_slow = calculate_ema(closes, slow);
    if ema_fast.is_empty() || ema_slow.is_empty() {
        return None;
    }

    // Align the two series on their tails: ema_fast has `closes.len() - fast + 1`
    // entries, ema_slow has `closes.len() - slow + 1`; the slow series is
    // shorter, so the last `ema_slow.len()` entries of each align index-for-index
    // with the most recent candles.
    let offset = ema_fast.len() - ema_slow.len();
    let macd_line: Vec<f64> = ema_slow
        .iter()
        .enumerate()
        .map(|(i, slow_val)| ema_fast[i + offset] - slow_val)
        .collect();

    if macd_line.len() < signal_period {
        return None;
    }

    let signal_line = calculate_ema(&macd_line, signal_period);
    let macd = *macd_line.last()?;
    let signal = *signal_line.last()?;

    if !macd.is_finite() || !signal.is_finite() {
        return None;
    }

    Some((macd, signal))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_data_returns_none() {
        let closes: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        assert!(current_macd(&closes, 12, 26, 9).is_none());
    }

    #[test]
    fn ascending_series_has_positive_macd() {
        let closes: Vec<f64> = (1..=120).map(|x| x as f64).collect();
        let (macd, _signal) = current_macd(&closes, 12, 26, 9).expect("enough data");
        assert!(macd > 0.0);
    }

    #[test]
    fn flat_series_has_zero_macd() {
        let closes = vec![100.0; 120];
        let (macd, signal) = current_macd(&closes, 12, 26, 9).expect("enough data");
        assert!(macd.abs() < 1e-9);
        assert!(signal.abs() < 1e-9);
    }
}
