// =============================================================================
// Decision Log Collaborator — append/read-recent/performance-analysis
// =============================================================================
//
// Two independent ring buffers, both safe for concurrent appends: the full
// per-cycle `DecisionRecord` audit trail, and a lighter `RecentTradeOutcome`
// history the trader loop feeds on every detected close. Capped the same
// way: push, then evict from the front while over the limit.
// =============================================================================

use parking_lot::RwLock;

use crate::types::{DecisionRecord, PerformanceStats, RecentTradeOutcome};

const MAX_RECORDS: usize = 500;
const MAX_TRADES: usize = 200;

pub struct DecisionLog {
    records: RwLock<Vec<DecisionRecord>>,
    trades: RwLock<Vec<RecentTradeOutcome>>,
}

impl DecisionLog {
    pub fn new() -> Self {
        Self { records: RwLock::new(Vec::new()), trades: RwLock::new(Vec::new()) }
    }

    /// Append a per-cycle decision record, even one recording a parse or
    /// execution failure — the audit trail must not have gaps.
    pub fn append(&self, record: DecisionRecord) {
        let mut records = self.records.write();
        records.push(record);
        while records.len() > MAX_RECORDS {
            records.remove(0);
        }
    }

    /// Most recent `n` decision records, newest last.
    pub fn recent_decisions(&self, n: usize) -> Vec<DecisionRecord> {
        let records = self.records.read();
        let start = records.len().saturating_sub(n);
        records[start..].to_vec()
    }

    /// Record a closed trade's outcome for the performance feed and the
    /// recent-trade log shown to the LLM.
    pub fn record_trade(&self, outcome: RecentTradeOutcome) {
        let mut trades = self.trades.write();
        trades.push(outcome);
        while trades.len() > MAX_TRADES {
            trades.remove(0);
        }
    }

    /// Most recent `n` trade outcomes, newest last.
    pub fn recent_trades(&self, n: usize) -> Vec<RecentTradeOutcome> {
        let trades = self.trades.read();
        let start = trades.len().saturating_sub(n);
        trades[start..].to_vec()
    }

    /// Aggregate statistics over the full retained trade history. Returns
    /// the zero-valued default when there is no trade history yet.
    pub fn performance_stats(&self) -> PerformanceStats {
        let trades = self.trades.read();
        if trades.is_empty() {
            return PerformanceStats::default();
        }

        let trade_count = trades.len();
        let wins = trades.iter().filter(|t| t.pnl > 0.0).count();
        let win_rate = wins as f64 / trade_count as f64;

        let average_pnl = trades.iter().map(|t| t.pnl).sum::<f64>() / trade_count as f64;
        let average_pnl_pct = trades.iter().map(|t| t.pnl_pct).sum::<f64>() / trade_count as f64;

        let sharpe_like = sharpe_like_ratio(&trades.iter().map(|t| t.pnl_pct).collect::<Vec<_>>());

        PerformanceStats { trade_count, win_rate, average_pnl, average_pnl_pct, sharpe_like }
    }
}

impl Default for DecisionLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Mean / population-stddev ratio over a return series — a crude stand-in
/// for a proper annualised Sharpe ratio, hence "Sharpe-like". Returns 0.0
/// when there is fewer than two samples or the series has zero variance.
fn sharpe_like_ratio(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    let std_dev = variance.sqrt();
    if std_dev == 0.0 {
        return 0.0;
    }
    mean / std_dev
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use chrono::Utc;

    fn trade(pnl: f64, pnl_pct: f64) -> RecentTradeOutcome {
        RecentTradeOutcome {
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            opened_at: Utc::now(),
            closed_at: Utc::now(),
            open_price: 100.0,
            close_price: 110.0,
            pnl,
            pnl_pct,
            leverage: 5.0,
            was_stop_loss: false,
            duration_secs: 3600,
        }
    }

    #[test]
    fn performance_stats_empty_is_default() {
        let log = DecisionLog::new();
        let stats = log.performance_stats();
        assert_eq!(stats.trade_count, 0);
        assert_eq!(stats.win_rate, 0.0);
    }

    #[test]
    fn performance_stats_computes_win_rate_and_average() {
        let log = DecisionLog::new();
        log.record_trade(trade(10.0, 5.0));
        log.record_trade(trade(-5.0, -2.5));
        let stats = log.performance_stats();
        assert_eq!(stats.trade_count, 2);
        assert_eq!(stats.win_rate, 0.5);
        assert!((stats.average_pnl - 2.5).abs() < 1e-9);
    }

    #[test]
    fn trade_history_evicts_oldest_past_cap() {
        let log = DecisionLog::new();
        for i in 0..(MAX_TRADES + 10) {
            log.record_trade(trade(i as f64, 0.0));
        }
        assert_eq!(log.recent_trades(usize::MAX).len(), MAX_TRADES);
    }

    #[test]
    fn recent_decisions_returns_newest_last() {
        let log = DecisionLog::new();
        for i in 0..3 {
            log.append(DecisionRecord {
                id: uuid::Uuid::new_v4().to_string(),
                trader_id: "t1".to_string(),
                exchange: "binance".to_string(),
                cycle_index: i,
                timestamp: Utc::now(),
                account: Default::default(),
                positions: vec![],
                candidate_symbols: vec![],
                system_prompt: String::new(),
                user_prompt: String::new(),
                reasoning: String::new(),
                decisions: vec![],
                actions: vec![],
                success: true,
                error: None,
                log_lines: vec![],
            });
        }
        let recent = log.recent_decisions(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent.last().unwrap().cycle_index, 2);
    }
}
