// =============================================================================
// Context Builder (C4) — per-cycle TradingContext assembly
// =============================================================================
//
// Fetches account/position state via the exchange adapter (C2), folds in
// fresh market data and pattern analyses from the market/pattern
// collaborator, and produces the immutable `TradingContext` the prompt
// builder and risk guards consume. Pattern analyses fan out one ephemeral
// task per (symbol, timeframe), joined under a 5 s deadline — a timeout
// here is non-fatal, it just means that analysis is missing from the
// prompt.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::RwLock;
use tracing::{instrument, warn};

use crate::config::TraderConfig;
use crate::decision_log::DecisionLog;
use crate::exchange::ExchangeAdapter;
use crate::market_data::MarketDataCollaborator;
use crate::types::{
    AccountSummary, CandidateSource, CandidateSymbol, FeeRates, LeverageCaps, Liquidity, MarketData, MarketSummary,
    PatternAnalysis, Position, Side, Trend, Volatility,
};

const PATTERN_ANALYSIS_DEADLINE: Duration = Duration::from_secs(5);

/// Builds the cycle-local `TradingContext`. Holds the only trader-local
/// state that must survive across cycles: each position's peak-PnL
/// high-water mark and first-seen timestamp, and a stale-but-usable cache
/// of the last successfully fetched `MarketData` per symbol.
pub struct ContextBuilder {
    exchange: Arc<dyn ExchangeAdapter>,
    market_data: Arc<MarketDataCollaborator>,
    decision_log: Arc<DecisionLog>,
    peak_tracker: RwLock<HashMap<(String, Side), (f64, DateTime<Utc>)>>,
    market_data_cache: RwLock<HashMap<String, MarketData>>,
}

impl ContextBuilder {
    pub fn new(exchange: Arc<dyn ExchangeAdapter>, market_data: Arc<MarketDataCollaborator>, decision_log: Arc<DecisionLog>) -> Self {
        Self {
            exchange,
            market_data,
            decision_log,
            peak_tracker: RwLock::new(HashMap::new()),
            market_data_cache: RwLock::new(HashMap::new()),
        }
    }

    #[instrument(skip(self, config), fields(trader_id = %config.id), name = "context::build")]
    pub async fn build(
        &self,
        config: &TraderConfig,
        cycle_index: u64,
        runtime_minutes: i64,
    ) -> anyhow::Result<crate::types::TradingContext> {
        let balance = self.exchange.get_balance().await?;
        let mut positions = self.exchange.get_positions().await?;
        let open_orders = self.exchange.get_open_orders(None).await?;

        for position in &mut positions {
            position.unrealized_pnl_pct = if position.margin_used > 0.0 {
                position.unrealized_pnl / position.margin_used * 100.0
            } else {
                0.0
            };
        }
        self.apply_peak_tracking(&mut positions);

        let margin_used: f64 = positions.iter().map(|p| p.margin_used).sum();
        let total_equity = balance.wallet_balance;
        let account = AccountSummary {
            total_equity,
            available_balance: balance.available_balance,
            unrealized_pnl: balance.unrealized_profit,
            total_pnl: balance.unrealized_profit,
            total_pnl_pct: if total_equity > 0.0 { balance.unrealized_profit / total_equity * 100.0 } else { 0.0 },
            margin_used,
            margin_used_pct: if total_equity > 0.0 { margin_used / total_equity * 100.0 } else { 0.0 },
            position_count: positions.len(),
        };

        let held_symbols: Vec<String> = positions.iter().map(|p| p.symbol.clone()).collect();
        let candidate_symbols = self.determine_candidates(config, &held_symbols);
        let working_symbols = working_symbol_set(&held_symbols, &candidate_symbols, positions.len());

        let market_data = self.fetch_market_data(&working_symbols, &config.timeframes, config.oi_floor_usd, &held_symbols).await;
        let pattern_analyses = self.analyze_patterns(&market_data, &config.timeframes).await;

        let market_summary = build_market_summary(&market_data);
        let recent_trades = self.decision_log.recent_trades(10);

        Ok(crate::types::TradingContext {
            current_time: Utc::now(),
            runtime_minutes,
            cycle_index,
            account,
            positions,
            open_orders,
            candidate_symbols,
            market_data,
            pattern_analyses,
            market_summary,
            timeframes: config.timeframes.clone(),
            leverage_caps: LeverageCaps { major_cap: config.major_leverage_cap, altcoin_cap: config.altcoin_leverage_cap },
            fee_rates: FeeRates { maker: config.maker_fee_rate, taker: config.taker_fee_rate },
            recent_trades,
        })
    }

    fn apply_peak_tracking(&self, positions: &mut [Position]) {
        let mut tracker = self.peak_tracker.write();
        let now = Utc::now();
        let live_keys: std::collections::HashSet<(String, Side)> = positions.iter().map(|p| p.key()).collect();

        for position in positions.iter_mut() {
            let key = position.key();
            let entry = tracker.entry(key).or_insert((position.unrealized_pnl_pct, now));
            entry.0 = entry.0.max(position.unrealized_pnl_pct);
            position.peak_pnl_pct = entry.0;
            position.update_time = entry.1;
        }

        tracker.retain(|key, _| live_keys.contains(key));
    }

    fn determine_candidates(&self, config: &TraderConfig, held_symbols: &[String]) -> Vec<CandidateSymbol> {
        let mut by_symbol: HashMap<String, Vec<CandidateSource>> = HashMap::new();

        by_symbol.entry("BTCUSDT".to_string()).or_default().push(CandidateSource::Default);
        for symbol in &config.default_symbols {
            by_symbol.entry(symbol.clone()).or_default().push(CandidateSource::Default);
        }
        for symbol in &config.custom_symbols {
            by_symbol.entry(symbol.clone()).or_default().push(CandidateSource::Custom);
        }
        for symbol in held_symbols {
            by_symbol.entry(symbol.clone()).or_default().push(CandidateSource::UserSelected);
        }

        let mut candidates: Vec<CandidateSymbol> =
            by_symbol.into_iter().map(|(symbol, sources)| CandidateSymbol { symbol, sources }).collect();
        candidates.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        candidates
    }

    async fn fetch_market_data(
        &self,
        symbols: &[String],
        timeframes: &[String],
        oi_floor_usd: f64,
        held_symbols: &[String],
    ) -> HashMap<String, MarketData> {
        let mut result = HashMap::new();

        for symbol in symbols {
            match self.market_data.get_fresh(symbol, timeframes).await {
                Ok(data) => {
                    self.market_data_cache.write().insert(symbol.clone(), data.clone());
                    result.insert(symbol.clone(), data);
                }
                Err(err) => {
                    warn!(symbol, error = %err, "market data fetch failed, falling back to cache");
                    if let Some(cached) = self.market_data_cache.read().get(symbol) {
                        result.insert(symbol.clone(), cached.clone());
                    }
                }
            }
        }

        let is_protected = |s: &str| s == "BTCUSDT" || held_symbols.iter().any(|h| h == s);
        result.retain(|symbol, data| is_protected(symbol) || data.open_interest_notional >= oi_floor_usd);
        result
    }

    async fn analyze_patterns(
        &self,
        market_data: &HashMap<String, MarketData>,
        timeframes: &[String],
    ) -> HashMap<String, HashMap<String, PatternAnalysis>> {
        let mut tasks = Vec::new();

        for (symbol, data) in market_data {
            for timeframe in timeframes {
                let Some(candles) = data.candles.get(timeframe).cloned() else {
                    continue;
                };
                let collaborator = self.market_data.clone();
                let symbol = symbol.clone();
                let timeframe = timeframe.clone();
                tasks.push(tokio::spawn(async move {
                    let analysis = collaborator.analyze_patterns(&candles, &symbol, &timeframe);
                    (symbol, timeframe, analysis)
                }));
            }
        }

        let mut analyses: HashMap<String, HashMap<String, PatternAnalysis>> = HashMap::new();
        match tokio::time::timeout(PATTERN_ANALYSIS_DEADLINE, join_all(tasks)).await {
            Ok(results) => {
                for joined in results {
                    if let Ok((symbol, timeframe, Some(analysis))) = joined {
                        analyses.entry(symbol).or_default().insert(timeframe, analysis);
                    }
                }
            }
            Err(_) => warn!("pattern analysis fan-out exceeded the 5s deadline; partial results discarded"),
        }

        analyses
    }
}

/// BTCUSDT always, every held symbol, and up to a cap of further
/// candidates (the cap shrinks as concurrent positions grow).
fn working_symbol_set(held_symbols: &[String], candidates: &[CandidateSymbol], position_count: usize) -> Vec<String> {
    let cap = match position_count {
        0 => 30,
        1 => 25,
        2 => 20,
        _ => 15,
    };

    let mut symbols = vec!["BTCUSDT".to_string()];
    for symbol in held_symbols {
        if !symbols.contains(symbol) {
            symbols.push(symbol.clone());
        }
    }

    for candidate in candidates {
        if symbols.len() >= cap {
            break;
        }
        if !symbols.contains(&candidate.symbol) {
            symbols.push(candidate.symbol.clone());
        }
    }

    symbols
}

/// Deterministic trend/volatility/liquidity scoring from one symbol's
/// `MarketData`. Primary symbol is BTC when available, else the
/// lexicographically smallest key.
fn build_market_summary(market_data: &HashMap<String, MarketData>) -> MarketSummary {
    let primary = market_data
        .get("BTCUSDT")
        .or_else(|| market_data.keys().min().and_then(|k| market_data.get(k)));

    let Some(data) = primary else {
        return MarketSummary {
            trend: Trend::Unknown,
            volatility: Volatility::Unknown,
            liquidity: Liquidity::Unknown,
            suggested_action: "no market data available".to_string(),
            notes: vec![],
        };
    };

    let trend = match data.change_4h_pct {
        c if c > 5.0 => Trend::StrongBull,
        c if c > 1.0 => Trend::Bull,
        c if c < -5.0 => Trend::StrongBear,
        c if c < -1.0 => Trend::Bear,
        _ => Trend::Range,
    };

    let volatility = match data.change_1h_pct.abs() {
        v if v > 4.0 => Volatility::Extreme,
        v if v > 2.0 => Volatility::High,
        v if v > 0.5 => Volatility::Normal,
        _ => Volatility::Low,
    };

    let liquidity = match data.open_interest_notional {
        oi if oi > 500_000_000.0 => Liquidity::High,
        oi if oi > 50_000_000.0 => Liquidity::Normal,
        oi if oi > 0.0 => Liquidity::Low,
        _ => Liquidity::Unknown,
    };

    let suggested_action = match trend {
        Trend::StrongBull | Trend::Bull => "favor longs",
        Trend::StrongBear | Trend::Bear => "favor shorts",
        Trend::Range => "observe",
        Trend::Unknown => "no market data available",
    }
    .to_string();

    let mut notes = Vec::new();
    if let Some(rsi) = data.rsi_14 {
        if rsi >= 70.0 {
            notes.push(format!("{} RSI-14 at {rsi:.1} is overbought", data.symbol));
        } else if rsi <= 30.0 {
            notes.push(format!("{} RSI-14 at {rsi:.1} is oversold", data.symbol));
        }
    }

    MarketSummary { trend, volatility, liquidity, suggested_action, notes }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data(symbol: &str, change_4h: f64, change_1h: f64, oi: f64) -> MarketData {
        MarketData {
            symbol: symbol.to_string(),
            last_price: 100.0,
            change_1h_pct: change_1h,
            change_4h_pct: change_4h,
            ema_fast: None,
            ema_slow: None,
            macd: None,
            macd_signal: None,
            rsi_14: None,
            open_interest_notional: oi,
            candles: HashMap::new(),
        }
    }

    #[test]
    fn working_symbol_set_always_includes_btc() {
        let set = working_symbol_set(&[], &[], 0);
        assert!(set.contains(&"BTCUSDT".to_string()));
    }

    #[test]
    fn working_symbol_set_cap_shrinks_with_positions() {
        let candidates: Vec<CandidateSymbol> =
            (0..50).map(|i| CandidateSymbol { symbol: format!("SYM{i}USDT"), sources: vec![] }).collect();
        let set0 = working_symbol_set(&[], &candidates, 0);
        let set3 = working_symbol_set(&[], &candidates, 3);
        assert_eq!(set0.len(), 30);
        assert_eq!(set3.len(), 15);
    }

    #[test]
    fn market_summary_prefers_btc_when_present() {
        let mut data = HashMap::new();
        data.insert("AAAUSDT".to_string(), sample_data("AAAUSDT", 10.0, 0.1, 1.0));
        data.insert("BTCUSDT".to_string(), sample_data("BTCUSDT", 6.0, 0.1, 1.0));
        let summary = build_market_summary(&data);
        assert_eq!(summary.trend, Trend::StrongBull);
    }

    #[test]
    fn market_summary_falls_back_to_lexicographically_smallest() {
        let mut data = HashMap::new();
        data.insert("ZZZUSDT".to_string(), sample_data("ZZZUSDT", -6.0, 0.1, 1.0));
        data.insert("AAAUSDT".to_string(), sample_data("AAAUSDT", 6.0, 0.1, 1.0));
        let summary = build_market_summary(&data);
        assert_eq!(summary.trend, Trend::StrongBull);
    }

    #[test]
    fn market_summary_empty_data_is_unknown() {
        let summary = build_market_summary(&HashMap::new());
        assert_eq!(summary.trend, Trend::Unknown);
    }
}
