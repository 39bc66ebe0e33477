// =============================================================================
// Market / Pattern Collaborator — fresh market data + chart pattern analysis
// =============================================================================
//
// The trader loop never talks to a price feed directly; it asks this
// collaborator for `get_fresh(symbol)` and `analyze_patterns(candles, ...)`.
// On-demand REST polling is used rather than a continuously streamed order
// book, since the engine only needs a fresh snapshot once per cycle.
// =============================================================================

pub mod patterns;

use std::collections::HashMap;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::futures_intel::open_interest::OpenInterestTracker;
use crate::indicators::{ema, macd, rsi};
use crate::types::{Candle, MarketData, PatternAnalysis};

const KLINES_LIMIT: u32 = 200;
const EMA_FAST_PERIOD: usize = 9;
const EMA_SLOW_PERIOD: usize = 21;
const RSI_PERIOD: usize = 14;

/// Fetches fresh OHLCV candles, derives indicators, and runs pattern
/// analysis. One instance is shared (read-only) across every trader.
pub struct MarketDataCollaborator {
    client: reqwest::Client,
    base_url: String,
    oi_tracker: OpenInterestTracker,
}

impl MarketDataCollaborator {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client for MarketDataCollaborator");

        Self {
            oi_tracker: OpenInterestTracker::with_client(client.clone()),
            client,
            base_url: "https://fapi.binance.com".to_string(),
        }
    }

    /// GET /fapi/v1/klines for one symbol/interval; public endpoint, no
    /// signature required. Array layout mirrors spot klines: [openTime, open,
    /// high, low, close, volume, closeTime, ...].
    #[instrument(skip(self), name = "market_data::get_klines")]
    async fn get_klines(&self, symbol: &str, interval: &str) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, KLINES_LIMIT
        );

        let resp = self.client.get(&url).send().await.context("GET /fapi/v1/klines failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("GET /fapi/v1/klines returned {}: {}", status, body);
        }

        let raw = body.as_array().context("klines response is not an array")?;
        let mut candles = Vec::with_capacity(raw.len());

        for entry in raw {
            let Some(arr) = entry.as_array() else {
                warn!("skipping non-array kline entry");
                continue;
            };
            if arr.len() < 7 {
                warn!(len = arr.len(), "skipping malformed kline entry");
                continue;
            }

            let parse_f64 = |v: &serde_json::Value| -> f64 { v.as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0) };

            candles.push(Candle {
                open_time_ms: arr[0].as_i64().unwrap_or(0),
                open: parse_f64(&arr[1]),
                high: parse_f64(&arr[2]),
                low: parse_f64(&arr[3]),
                close: parse_f64(&arr[4]),
                volume: parse_f64(&arr[5]),
                close_time_ms: arr[6].as_i64().unwrap_or(0),
            });
        }

        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// Fetch fresh `MarketData` for `symbol` across every configured
    /// timeframe. The first timeframe in `timeframes` is treated as primary
    /// for price, change %, and indicator derivation.
    #[instrument(skip(self, timeframes), name = "market_data::get_fresh")]
    pub async fn get_fresh(&self, symbol: &str, timeframes: &[String]) -> Result<MarketData> {
        let mut candles_by_timeframe = HashMap::new();
        for timeframe in timeframes {
            match self.get_klines(symbol, timeframe).await {
                Ok(candles) => {
                    candles_by_timeframe.insert(timeframe.clone(), candles);
                }
                Err(err) => warn!(symbol, timeframe, error = %err, "failed to fetch candles for timeframe"),
            }
        }

        let primary = timeframes.first().and_then(|tf| candles_by_timeframe.get(tf));
        let closes: Vec<f64> = primary.map(|c| c.iter().map(|k| k.close).collect()).unwrap_or_default();

        let last_price = closes.last().copied().unwrap_or(0.0);
        let change_1h_pct = price_change_pct(&closes, minutes_to_bars(60, timeframes.first()));
        let change_4h_pct = price_change_pct(&closes, minutes_to_bars(240, timeframes.first()));

        let ema_fast = ema::calculate_ema(&closes, EMA_FAST_PERIOD).last().copied();
        let ema_slow = ema::calculate_ema(&closes, EMA_SLOW_PERIOD).last().copied();
        let (macd_val, macd_signal) = macd::current_macd(&closes, 12, 26, 9)
            .map(|(m, s)| (Some(m), Some(s)))
            .unwrap_or((None, None));
        let rsi_14 = rsi::current_rsi(&closes, RSI_PERIOD).map(|(value, _label)| value);

        let open_interest_notional = match self.oi_tracker.fetch(symbol).await {
            Ok(state) => state.current_oi * last_price,
            Err(err) => {
                warn!(symbol, error = %err, "failed to fetch open interest, defaulting to 0");
                0.0
            }
        };

        Ok(MarketData {
            symbol: symbol.to_string(),
            last_price,
            change_1h_pct,
            change_4h_pct,
            ema_fast,
            ema_slow,
            macd: macd_val,
            macd_signal,
            rsi_14,
            open_interest_notional,
            candles: candles_by_timeframe,
        })
    }

    /// Run chart-pattern analysis over a slice of closed candles for one
    /// `(symbol, timeframe)` pair. Pure and synchronous — "collaborator"
    /// here describes the data flow, not an I/O boundary.
    pub fn analyze_patterns(&self, candles: &[Candle], _symbol: &str, timeframe: &str) -> Option<PatternAnalysis> {
        patterns::analyze(candles, timeframe)
    }
}

impl Default for MarketDataCollaborator {
    fn default() -> Self {
        Self::new()
    }
}

/// Percent change between the close `bars_back` candles ago and the most
/// recent close. Returns 0.0 when there isn't enough history.
fn price_change_pct(closes: &[f64], bars_back: usize) -> f64 {
    if bars_back == 0 || closes.len() <= bars_back {
        return 0.0;
    }
    let now = closes[closes.len() - 1];
    let then = closes[closes.len() - 1 - bars_back];
    if then == 0.0 {
        return 0.0;
    }
    (now - then) / then * 100.0
}

/// Rough bar count for a given number of minutes, based on the primary
/// timeframe's nominal bar length. Unknown timeframe strings default to one
/// bar per minute.
fn minutes_to_bars(minutes: i64, timeframe: Option<&String>) -> usize {
    let bar_minutes = match timeframe.map(|s| s.as_str()) {
        Some("1m") => 1,
        Some("5m") => 5,
        Some("15m") => 15,
        Some("30m") => 30,
        Some("1h") => 60,
        Some("4h") => 240,
        Some("1d") => 1440,
        _ => 1,
    };
    (minutes / bar_minutes).max(1) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_change_pct_needs_enough_history() {
        assert_eq!(price_change_pct(&[1.0, 2.0], 5), 0.0);
    }

    #[test]
    fn price_change_pct_computes_ratio() {
        let closes = vec![100.0, 110.0];
        assert!((price_change_pct(&closes, 1) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn minutes_to_bars_uses_timeframe_length() {
        assert_eq!(minutes_to_bars(240, Some(&"4h".to_string())), 1);
        assert_eq!(minutes_to_bars(60, Some(&"15m".to_string())), 4);
    }
}
