// =============================================================================
// TraderConfig — per-trader identity, credentials, and tunable ratios
// =============================================================================
//
// One config per trader, not a single global. Persistence uses an atomic
// tmp + rename pattern: write to `.tmp`, then rename, so a crash mid-write
// never corrupts the file on disk. Every tunable ratio carries a
// `#[serde(default = "...")]` so that adding a new field never breaks
// loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::AccountMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_major_leverage_cap() -> f64 {
    10.0
}

fn default_altcoin_leverage_cap() -> f64 {
    5.0
}

fn default_maker_fee() -> f64 {
    0.0002
}

fn default_taker_fee() -> f64 {
    0.0005
}

fn default_true() -> bool {
    true
}

fn default_timeframes() -> Vec<String> {
    vec!["15m".to_string(), "1h".to_string(), "4h".to_string()]
}

fn default_default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_system_prompt_template() -> String {
    "default".to_string()
}

fn default_limit_price_offset_pct() -> f64 {
    0.02
}

fn default_limit_timeout_secs() -> u64 {
    20
}

fn default_scan_interval_secs() -> u64 {
    60
}

fn default_max_concurrent_positions() -> u32 {
    3
}

fn default_margin_used_abort_pct() -> f64 {
    70.0
}

fn default_drawdown_pnl_pct() -> f64 {
    -8.0
}

fn default_drawdown_confidence_floor() -> f64 {
    85.0
}

fn default_min_confidence() -> f64 {
    80.0
}

fn default_min_rr_ratio() -> f64 {
    3.0
}

fn default_margin_ceiling_pct() -> f64 {
    90.0
}

fn default_stop_loss_anomaly_tolerance_pct() -> f64 {
    0.5
}

fn default_drawdown_retrace_pct() -> f64 {
    40.0
}

fn default_drawdown_min_pnl_pct() -> f64 {
    5.0
}

fn default_oi_floor_usd() -> f64 {
    15_000_000.0
}

fn default_min_notional_others() -> f64 {
    12.0
}

fn default_min_notional_major_floor() -> f64 {
    12.0
}

fn default_min_notional_major_ceiling() -> f64 {
    60.0
}

// =============================================================================
// OrderExecutionStrategy
// =============================================================================

/// How a decision's entry/exit order is actually placed on the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderExecutionStrategy {
    MarketOnly,
    ConservativeHybrid,
    LimitOnly,
}

impl Default for OrderExecutionStrategy {
    fn default() -> Self {
        Self::MarketOnly
    }
}

/// Which family of exchange driver a trader talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeBackend {
    CentralizedApiKey,
    SignedWallet,
    Web3AgentWallet,
}

/// Which LLM provider a trader talks to. The provider only changes the base
/// URL and auth header shape; the wire format is the OpenAI-compatible
/// chat-completions contract throughout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiProviderConfig {
    pub provider: String,
    pub api_key: String,
    pub base_url: String,
    pub model_name: String,
}

/// Exchange credential material, opaque to everything but the concrete
/// adapter it is handed to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeCredentials {
    pub backend: ExchangeBackend,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub wallet_private_key: String,
    #[serde(default)]
    pub agent_wallet_address: String,
}

// =============================================================================
// TraderConfig
// =============================================================================

/// Per-trader identity, credentials, cycle timing, and the tunable ratios
/// risk guards and the normalizer use. Every magic ratio the original
/// behavior hardcodes is exposed here with a named default, mirroring the
/// teacher's `StrategyParams` pattern of giving every constant a config
/// field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderConfig {
    pub id: String,
    pub ai: AiProviderConfig,
    pub exchange: ExchangeCredentials,

    #[serde(default)]
    pub account_mode: AccountMode,

    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    pub initial_balance_usd: f64,

    #[serde(default = "default_major_leverage_cap")]
    pub major_leverage_cap: f64,

    #[serde(default = "default_altcoin_leverage_cap")]
    pub altcoin_leverage_cap: f64,

    #[serde(default = "default_maker_fee")]
    pub maker_fee_rate: f64,

    #[serde(default = "default_taker_fee")]
    pub taker_fee_rate: f64,

    /// `true` for cross margin, `false` for isolated.
    #[serde(default = "default_true")]
    pub cross_margin: bool,

    #[serde(default = "default_default_symbols")]
    pub default_symbols: Vec<String>,

    #[serde(default)]
    pub custom_symbols: Vec<String>,

    #[serde(default = "default_system_prompt_template")]
    pub system_prompt_template: String,

    /// Operator-supplied prompt text layered on top of (or replacing) the
    /// named template.
    #[serde(default)]
    pub personal_strategy_override: Option<String>,

    #[serde(default)]
    pub override_base: bool,

    #[serde(default)]
    pub order_execution_strategy: OrderExecutionStrategy,

    #[serde(default = "default_limit_price_offset_pct")]
    pub limit_price_offset_pct: f64,

    #[serde(default = "default_limit_timeout_secs")]
    pub limit_timeout_secs: u64,

    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<String>,

    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: u32,

    // --- risk guard ratios -----------------------------------------------
    #[serde(default = "default_margin_used_abort_pct")]
    pub margin_used_abort_pct: f64,

    #[serde(default = "default_drawdown_pnl_pct")]
    pub drawdown_pnl_pct: f64,

    #[serde(default = "default_drawdown_confidence_floor")]
    pub drawdown_confidence_floor: f64,

    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    #[serde(default = "default_min_rr_ratio")]
    pub min_rr_ratio: f64,

    #[serde(default = "default_margin_ceiling_pct")]
    pub margin_ceiling_pct: f64,

    #[serde(default = "default_stop_loss_anomaly_tolerance_pct")]
    pub stop_loss_anomaly_tolerance_pct: f64,

    // --- drawdown monitor ratios -------------------------------------------
    #[serde(default = "default_drawdown_retrace_pct")]
    pub drawdown_retrace_pct: f64,

    #[serde(default = "default_drawdown_min_pnl_pct")]
    pub drawdown_min_pnl_pct: f64,

    // --- context builder ratios --------------------------------------------
    #[serde(default = "default_oi_floor_usd")]
    pub oi_floor_usd: f64,

    // --- minimum notional ladder --------------------------------------------
    #[serde(default = "default_min_notional_others")]
    pub min_notional_others_usd: f64,

    #[serde(default = "default_min_notional_major_floor")]
    pub min_notional_major_floor_usd: f64,

    #[serde(default = "default_min_notional_major_ceiling")]
    pub min_notional_major_ceiling_usd: f64,
}

impl TraderConfig {
    /// Load a trader config from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read trader config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse trader config from {}", path.display()))?;

        info!(path = %path.display(), trader_id = %config.id, "trader config loaded");

        Ok(config)
    }

    /// Persist the config to `path` using an atomic write (write to `.tmp`,
    /// then rename), preventing corruption if the process crashes mid-write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise trader config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), trader_id = %self.id, "trader config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "id": "t1",
            "ai": {"provider": "openai", "api_key": "k", "base_url": "https://api.openai.com/v1", "model_name": "gpt-4o"},
            "exchange": {"backend": "centralized_api_key", "api_key": "ek", "api_secret": "es"},
            "initial_balance_usd": 1000.0
        }"#
    }

    #[test]
    fn deserialize_minimal_config_fills_defaults() {
        let cfg: TraderConfig = serde_json::from_str(sample_json()).unwrap();
        assert_eq!(cfg.id, "t1");
        assert_eq!(cfg.scan_interval_secs, 60);
        assert_eq!(cfg.major_leverage_cap, 10.0);
        assert_eq!(cfg.altcoin_leverage_cap, 5.0);
        assert!(cfg.cross_margin);
        assert_eq!(cfg.default_symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(cfg.system_prompt_template, "default");
        assert_eq!(cfg.order_execution_strategy, OrderExecutionStrategy::MarketOnly);
        assert_eq!(cfg.max_concurrent_positions, 3);
        assert_eq!(cfg.margin_used_abort_pct, 70.0);
        assert_eq!(cfg.min_confidence, 80.0);
        assert_eq!(cfg.min_rr_ratio, 3.0);
        assert_eq!(cfg.drawdown_retrace_pct, 40.0);
        assert_eq!(cfg.min_notional_others_usd, 12.0);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg: TraderConfig = serde_json::from_str(sample_json()).unwrap();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: TraderConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.id, cfg2.id);
        assert_eq!(cfg.major_leverage_cap, cfg2.major_leverage_cap);
    }

    #[test]
    fn save_then_load_roundtrips_atomically() {
        let cfg: TraderConfig = serde_json::from_str(sample_json()).unwrap();
        let dir = std::env::temp_dir().join(format!("aurora-trader-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("trader.json");

        cfg.save(&path).unwrap();
        let loaded = TraderConfig::load(&path).unwrap();
        assert_eq!(loaded.id, cfg.id);
        assert_eq!(loaded.initial_balance_usd, cfg.initial_balance_usd);

        std::fs::remove_file(&path).ok();
        std::fs::remove_dir(&dir).ok();
    }
}
