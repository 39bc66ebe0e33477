// =============================================================================
// Pattern analysis — candle-shape signals, support/resistance, trend lines
// =============================================================================
//
// The expected outputs are signals, support/resistance clusters, trend-line
// segments, and key levels; the numeric cutoffs for each named candle shape
// are left to the implementer. The thresholds below are a reasonable,
// deterministic reading of common technical-analysis convention.
// =============================================================================

use crate::indicators::{ema, rsi};
use crate::types::{Candle, KeyLevels, PatternAnalysis, PatternSentiment, PatternSignal, TrendLineSegment};

const KEY_LEVEL_WINDOW: usize = 20;
const PIVOT_LOOKBACK: usize = 2;
const CLUSTER_TOLERANCE_PCT: f64 = 0.5;

/// Run pattern analysis over `candles` for one `(symbol, timeframe)` pair.
/// Returns `None` when there isn't enough history to say anything useful.
pub fn analyze(candles: &[Candle], timeframe: &str) -> Option<PatternAnalysis> {
    if candles.len() < KEY_LEVEL_WINDOW {
        return None;
    }

    let key_levels = compute_key_levels(candles);
    let pivots = find_pivots(candles);
    let (support_levels, resistance_levels) = cluster_levels(candles, &pivots);
    let trend_lines = build_trend_lines(candles, &pivots);

    let mut signals = Vec::new();
    signals.extend(candle_shape_signals(candles));
    signals.extend(trend_alignment_signal(candles));
    signals.extend(rsi_signal(candles));

    Some(PatternAnalysis {
        timeframe: timeframe.to_string(),
        signals,
        support_levels,
        resistance_levels,
        trend_lines,
        key_levels,
    })
}

fn compute_key_levels(candles: &[Candle]) -> KeyLevels {
    let window = &candles[candles.len() - KEY_LEVEL_WINDOW..];
    let high_20 = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let low_20 = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
    let current_price = candles.last().map(|c| c.close).unwrap_or(0.0);

    let range_position_pct = if high_20 > low_20 {
        (current_price - low_20) / (high_20 - low_20) * 100.0
    } else {
        50.0
    };

    KeyLevels { current_price, high_20, low_20, range_position_pct }
}

#[derive(Clone, Copy)]
struct Pivot {
    index: usize,
    price: f64,
    is_high: bool,
}

/// A simple fractal pivot: a high (or low) that is the extreme among its
/// `PIVOT_LOOKBACK` neighbours on each side.
fn find_pivots(candles: &[Candle]) -> Vec<Pivot> {
    let mut pivots = Vec::new();
    if candles.len() <= PIVOT_LOOKBACK * 2 {
        return pivots;
    }

    for i in PIVOT_LOOKBACK..candles.len() - PIVOT_LOOKBACK {
        let window = &candles[i - PIVOT_LOOKBACK..=i + PIVOT_LOOKBACK];
        let high = candles[i].high;
        let low = candles[i].low;

        if window.iter().all(|c| c.high <= high) {
            pivots.push(Pivot { index: i, price: high, is_high: true });
        }
        if window.iter().all(|c| c.low >= low) {
            pivots.push(Pivot { index: i, price: low, is_high: false });
        }
    }

    pivots
}

/// Cluster pivot prices within `CLUSTER_TOLERANCE_PCT` of each other into a
/// single support/resistance level, keeping the cluster average.
fn cluster_levels(candles: &[Candle], pivots: &[Pivot]) -> (Vec<f64>, Vec<f64>) {
    let current_price = candles.last().map(|c| c.close).unwrap_or(0.0);

    let mut highs: Vec<f64> = pivots.iter().filter(|p| p.is_high).map(|p| p.price).collect();
    let mut lows: Vec<f64> = pivots.iter().filter(|p| !p.is_high).map(|p| p.price).collect();
    highs.sort_by(|a, b| a.partial_cmp(b).unwrap());
    lows.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let resistance_levels = cluster(&highs)
        .into_iter()
        .filter(|level| *level >= current_price)
        .collect();
    let support_levels = cluster(&lows)
        .into_iter()
        .filter(|level| *level <= current_price)
        .collect();

    (support_levels, resistance_levels)
}

fn cluster(sorted: &[f64]) -> Vec<f64> {
    let mut clusters: Vec<Vec<f64>> = Vec::new();
    for &price in sorted {
        match clusters.last_mut() {
            Some(group) if price - group[group.len() - 1] <= group[group.len() - 1] * CLUSTER_TOLERANCE_PCT / 100.0 => {
                group.push(price);
            }
            _ => clusters.push(vec![price]),
        }
    }
    clusters.iter().map(|g| g.iter().sum::<f64>() / g.len() as f64).collect()
}

/// At most two trend lines: the most recent swing-high-to-swing-high run
/// (resistance trend line) and the most recent swing-low-to-swing-low run
/// (support trend line).
fn build_trend_lines(_candles: &[Candle], pivots: &[Pivot]) -> Vec<TrendLineSegment> {
    let mut lines = Vec::new();

    let highs: Vec<&Pivot> = pivots.iter().filter(|p| p.is_high).collect();
    if highs.len() >= 2 {
        let a = highs[highs.len() - 2];
        let b = highs[highs.len() - 1];
        lines.push(TrendLineSegment { start_index: a.index, start_price: a.price, end_index: b.index, end_price: b.price });
    }

    let lows: Vec<&Pivot> = pivots.iter().filter(|p| !p.is_high).collect();
    if lows.len() >= 2 {
        let a = lows[lows.len() - 2];
        let b = lows[lows.len() - 1];
        lines.push(TrendLineSegment { start_index: a.index, start_price: a.price, end_index: b.index, end_price: b.price });
    }

    lines
}

fn candle_shape_signals(candles: &[Candle]) -> Vec<PatternSignal> {
    let mut signals = Vec::new();
    let n = candles.len();
    if n < 2 {
        return signals;
    }

    let last = &candles[n - 1];
    let prev = &candles[n - 2];

    let body = (last.close - last.open).abs();
    let range = last.high - last.low;

    // Doji: body is a tiny fraction of the full range.
    if range > 0.0 && body / range < 0.1 {
        signals.push(PatternSignal {
            name: "doji".to_string(),
            sentiment: PatternSentiment::Neutral,
            confidence: 60.0,
            description: "small real body relative to the candle's range, signalling indecision".to_string(),
            position_index: n - 1,
        });
    }

    // Bullish engulfing: prior candle red, current candle green and its body
    // fully engulfs the prior body.
    let prev_bearish = prev.close < prev.open;
    let last_bullish = last.close > last.open;
    if prev_bearish && last_bullish && last.open <= prev.close && last.close >= prev.open {
        signals.push(PatternSignal {
            name: "bullish_engulfing".to_string(),
            sentiment: PatternSentiment::Bullish,
            confidence: 70.0,
            description: "current candle's body fully engulfs the prior bearish candle".to_string(),
            position_index: n - 1,
        });
    }

    // Bearish engulfing: mirror image.
    let prev_bullish = prev.close > prev.open;
    let last_bearish = last.close < last.open;
    if prev_bullish && last_bearish && last.open >= prev.close && last.close <= prev.open {
        signals.push(PatternSignal {
            name: "bearish_engulfing".to_string(),
            sentiment: PatternSentiment::Bearish,
            confidence: 70.0,
            description: "current candle's body fully engulfs the prior bullish candle".to_string(),
            position_index: n - 1,
        });
    }

    // Hammer: small body near the top of the range with a long lower wick.
    let lower_wick = last.open.min(last.close) - last.low;
    let upper_wick = last.high - last.open.max(last.close);
    if range > 0.0 && body / range < 0.3 && lower_wick > body * 2.0 && upper_wick < body {
        signals.push(PatternSignal {
            name: "hammer".to_string(),
            sentiment: PatternSentiment::Bullish,
            confidence: 55.0,
            description: "long lower wick with a small body near the top of the range".to_string(),
            position_index: n - 1,
        });
    }

    signals
}

fn trend_alignment_signal(candles: &[Candle]) -> Option<PatternSignal> {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let (is_bullish, strength) = ema::ema_trend_aligned(&closes)?;
    Some(PatternSignal {
        name: "ema_stack_alignment".to_string(),
        sentiment: if is_bullish { PatternSentiment::Bullish } else { PatternSentiment::Bearish },
        confidence: (strength * 1000.0).min(95.0).max(50.0),
        description: format!(
            "EMA 9/21/55 stack is {} aligned",
            if is_bullish { "bullishly" } else { "bearishly" }
        ),
        position_index: candles.len() - 1,
    })
}

fn rsi_signal(candles: &[Candle]) -> Option<PatternSignal> {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let (value, label) = rsi::current_rsi(&closes, 14)?;
    if label == "NEUTRAL" {
        return None;
    }
    Some(PatternSignal {
        name: format!("rsi_{}", label.to_lowercase()),
        sentiment: if label == "OVERSOLD" { PatternSentiment::Bullish } else { PatternSentiment::Bearish },
        confidence: 65.0,
        description: format!("RSI-14 at {value:.1} is {label}"),
        position_index: candles.len() - 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle { open_time_ms: 0, open, high, low, close, volume: 1.0, close_time_ms: 0 }
    }

    fn ranging_series(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + (i % 5) as f64;
                candle(base, base + 1.0, base - 1.0, base)
            })
            .collect()
    }

    #[test]
    fn too_few_candles_returns_none() {
        assert!(analyze(&ranging_series(5), "1h").is_none());
    }

    #[test]
    fn key_levels_bound_the_current_price() {
        let candles = ranging_series(30);
        let analysis = analyze(&candles, "1h").unwrap();
        assert!(analysis.key_levels.current_price <= analysis.key_levels.high_20);
        assert!(analysis.key_levels.current_price >= analysis.key_levels.low_20);
        assert!(analysis.key_levels.range_position_pct >= 0.0);
        assert!(analysis.key_levels.range_position_pct <= 100.0);
    }

    #[test]
    fn bullish_engulfing_detected() {
        let mut candles = ranging_series(25);
        candles.push(candle(100.0, 101.0, 99.0, 98.0)); // bearish
        candles.push(candle(97.5, 102.0, 97.0, 101.5)); // engulfs it
        let analysis = analyze(&candles, "1h").unwrap();
        assert!(analysis.signals.iter().any(|s| s.name == "bullish_engulfing"));
    }

    #[test]
    fn rsi_signal_lowercases_the_label_and_skips_neutral() {
        let ascending: Vec<Candle> = (1..=30).map(|i| candle(i as f64, i as f64, i as f64, i as f64)).collect();
        let signal = rsi_signal(&ascending).expect("all-gains series is overbought, not neutral");
        assert_eq!(signal.name, "rsi_overbought");
        assert_eq!(signal.sentiment, PatternSentiment::Bearish);

        let flat: Vec<Candle> = (0..30).map(|_| candle(100.0, 100.0, 100.0, 100.0)).collect();
        assert!(rsi_signal(&flat).is_none());
    }

    #[test]
    fn doji_detected_on_tiny_body() {
        let mut candles = ranging_series(25);
        candles.push(candle(100.0, 102.0, 98.0, 100.05));
        let analysis = analyze(&candles, "1h").unwrap();
        assert!(analysis.signals.iter().any(|s| s.name == "doji"));
    }
}
