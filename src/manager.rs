// =============================================================================
// Trader Manager (C8) — lifecycle for N traders
// =============================================================================
//
// Holds a registry of running traders keyed by id and owns the two-task
// workgroup (main cycle loop + drawdown monitor) spawned for each one.
// `stop(id)` flips the trader's shutdown watch channel and joins both
// handles before returning, so the caller can rely on the workgroup having
// fully drained. Traders never share mutable state; the manager only
// serializes access to its own registry.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{AiProviderConfig, TraderConfig};
use crate::context::ContextBuilder;
use crate::decision_log::DecisionLog;
use crate::error::ConfigError;
use crate::execution::ExecutionOrchestrator;
use crate::llm::LlmClient;
use crate::market_data::MarketDataCollaborator;
use crate::trader::Trader;
use crate::types::TradingMode;

struct TraderHandle {
    trader: Arc<Trader>,
    shutdown_tx: watch::Sender<bool>,
    cycle_task: JoinHandle<()>,
    drawdown_task: JoinHandle<()>,
}

/// Owns every running trader in the process. One instance per deployment.
pub struct TraderManager {
    decision_log: Arc<DecisionLog>,
    traders: RwLock<HashMap<String, TraderHandle>>,
}

impl TraderManager {
    pub fn new() -> Self {
        Self { decision_log: Arc::new(DecisionLog::new()), traders: RwLock::new(HashMap::new()) }
    }

    pub fn decision_log(&self) -> Arc<DecisionLog> {
        self.decision_log.clone()
    }

    /// Construct a trader from `config`, spawn its cycle loop and drawdown
    /// monitor, and register it. Replaces (stopping first) any existing
    /// trader with the same id.
    pub async fn start(&self, config: TraderConfig) -> Result<(), ConfigError> {
        let id = config.id.clone();

        if self.traders.read().contains_key(&id) {
            self.stop(&id).await;
        }

        let exchange: Arc<dyn crate::exchange::ExchangeAdapter> = Arc::from(crate::exchange::build_adapter(&config.exchange)?);
        let llm = LlmClient::new(&config.ai);
        let market_data = Arc::new(MarketDataCollaborator::new());
        let context_builder = ContextBuilder::new(exchange.clone(), market_data, self.decision_log.clone());
        let execution = ExecutionOrchestrator::new(exchange.clone());

        let trader = Arc::new(Trader::new(config, exchange, llm, context_builder, execution, self.decision_log.clone()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let cycle_trader = trader.clone();
        let cycle_rx = shutdown_rx.clone();
        let cycle_task = tokio::spawn(async move { cycle_trader.run_cycle_loop(cycle_rx).await });

        let drawdown_trader = trader.clone();
        let drawdown_rx = shutdown_rx;
        let drawdown_task = tokio::spawn(async move { drawdown_trader.run_drawdown_monitor(drawdown_rx).await });

        info!(trader_id = %id, "trader started");
        self.traders.write().insert(id, TraderHandle { trader, shutdown_tx, cycle_task, drawdown_task });
        Ok(())
    }

    /// Signal the trader's shutdown channel and wait for both of its tasks
    /// to finish. A second call for an id that is no longer registered is a
    /// no-op.
    pub async fn stop(&self, id: &str) {
        let handle = self.traders.write().remove(id);
        let Some(handle) = handle else {
            return;
        };

        let _ = handle.shutdown_tx.send(true);
        if let Err(err) = handle.cycle_task.await {
            warn!(trader_id = id, error = %err, "trader cycle task panicked");
        }
        if let Err(err) = handle.drawdown_task.await {
            warn!(trader_id = id, error = %err, "trader drawdown task panicked");
        }
        info!(trader_id = id, "trader stopped");
    }

    /// Stop every registered trader, waiting for each workgroup to drain.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.traders.read().keys().cloned().collect();
        for id in ids {
            self.stop(&id).await;
        }
    }

    pub fn set_mode(&self, id: &str, mode: TradingMode) -> bool {
        match self.traders.read().get(id) {
            Some(handle) => {
                handle.trader.set_mode(mode);
                true
            }
            None => false,
        }
    }

    /// Update AI provider credentials in place without restarting the
    /// trader's loop.
    pub fn reload_ai_config(&self, id: &str, provider: String, api_key: String, base_url: String, model_name: String) -> bool {
        match self.traders.read().get(id) {
            Some(handle) => {
                handle.trader.reload_ai_config(AiProviderConfig { provider, api_key, base_url, model_name });
                true
            }
            None => false,
        }
    }

    pub fn running_ids(&self) -> Vec<String> {
        self.traders.read().keys().cloned().collect()
    }
}

impl Default for TraderManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExchangeBackend, ExchangeCredentials};

    fn sample_config(id: &str) -> TraderConfig {
        TraderConfig {
            id: id.to_string(),
            ai: AiProviderConfig { provider: "openai".into(), api_key: "k".into(), base_url: "https://api.openai.com/v1".into(), model_name: "gpt-4o".into() },
            exchange: ExchangeCredentials {
                backend: ExchangeBackend::CentralizedApiKey,
                api_key: "ek".into(),
                api_secret: "es".into(),
                wallet_private_key: String::new(),
                agent_wallet_address: String::new(),
            },
            account_mode: Default::default(),
            scan_interval_secs: 300,
            initial_balance_usd: 1000.0,
            major_leverage_cap: 10.0,
            altcoin_leverage_cap: 5.0,
            maker_fee_rate: 0.0002,
            taker_fee_rate: 0.0005,
            cross_margin: true,
            default_symbols: vec!["BTCUSDT".into()],
            custom_symbols: vec![],
            system_prompt_template: "default".into(),
            personal_strategy_override: None,
            override_base: false,
            order_execution_strategy: Default::default(),
            limit_price_offset_pct: 0.02,
            limit_timeout_secs: 20,
            timeframes: vec!["1h".into()],
            max_concurrent_positions: 3,
            margin_used_abort_pct: 70.0,
            drawdown_pnl_pct: -8.0,
            drawdown_confidence_floor: 85.0,
            min_confidence: 80.0,
            min_rr_ratio: 3.0,
            margin_ceiling_pct: 90.0,
            stop_loss_anomaly_tolerance_pct: 0.5,
            drawdown_retrace_pct: 40.0,
            drawdown_min_pnl_pct: 5.0,
            oi_floor_usd: 15_000_000.0,
            min_notional_others_usd: 12.0,
            min_notional_major_floor_usd: 12.0,
            min_notional_major_ceiling_usd: 60.0,
        }
    }

    #[tokio::test]
    async fn start_then_stop_registers_and_deregisters() {
        let manager = TraderManager::new();
        manager.start(sample_config("t1")).await.unwrap();
        assert_eq!(manager.running_ids(), vec!["t1".to_string()]);

        manager.stop("t1").await;
        assert!(manager.running_ids().is_empty());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let manager = TraderManager::new();
        manager.start(sample_config("t1")).await.unwrap();
        manager.stop("t1").await;
        manager.stop("t1").await;
        assert!(manager.running_ids().is_empty());
    }

    #[tokio::test]
    async fn reload_ai_config_returns_false_for_unknown_trader() {
        let manager = TraderManager::new();
        assert!(!manager.reload_ai_config("missing", "openai".into(), "k".into(), "u".into(), "m".into()));
    }
}
