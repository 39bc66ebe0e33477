// =============================================================================
// Exchange Adapter — uniform capability set over three exchange families
// =============================================================================
//
// A trader is configured with exactly one concrete backend (centralized
// API-key, signed-wallet DEX, or web3 agent-wallet DEX) and never swaps it
// while running. All three implement `ExchangeAdapter`; the rest of the
// engine never matches on the concrete type.
// =============================================================================

mod binance_futures;
mod cache;
mod rate_limit;
mod signed_wallet;
mod web3_agent;

pub use binance_futures::BinanceFuturesAdapter;
pub use signed_wallet::SignedWalletAdapter;
pub use web3_agent::Web3AgentAdapter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ExchangeCredentials;
use crate::error::ExchangeError;
use crate::types::{OpenOrder, Position, Side};

/// Balance snapshot returned by `get_balance`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct BalanceSnapshot {
    pub wallet_balance: f64,
    pub unrealized_profit: f64,
    pub available_balance: f64,
}

/// Result of a state-changing call (open/close/stop/take).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub symbol: String,
    pub price: Option<f64>,
    pub quantity: f64,
}

/// Per-symbol rounding rules the adapter applies before dispatching an
/// order. Each concrete driver owns its own table, fetched once and cached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolRounding {
    pub tick_size: f64,
    pub step_size: f64,
}

impl SymbolRounding {
    pub fn round_price(&self, price: f64) -> f64 {
        round_to_step(price, self.tick_size)
    }

    pub fn round_quantity(&self, qty: f64) -> f64 {
        round_to_step(qty, self.step_size)
    }
}

/// Round `value` down to the nearest multiple of `step` (never rounds up,
/// so a rounded order never exceeds the caller's intended size/price).
pub fn round_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    (value / step).floor() * step
}

/// The capability set every exchange backend must expose, exactly as
/// declared in the external-interfaces section: balance, positions, open
/// orders, market price, position open/close, protective-order management,
/// margin mode and leverage.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn get_balance(&self) -> Result<BalanceSnapshot, ExchangeError>;
    async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError>;
    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<OpenOrder>, ExchangeError>;
    async fn get_market_price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    async fn open_long(&self, symbol: &str, qty: f64, leverage: f64) -> Result<OrderResult, ExchangeError>;
    async fn open_short(&self, symbol: &str, qty: f64, leverage: f64) -> Result<OrderResult, ExchangeError>;
    /// `qty == 0.0` closes the entire position.
    async fn close_long(&self, symbol: &str, qty: f64) -> Result<OrderResult, ExchangeError>;
    async fn close_short(&self, symbol: &str, qty: f64) -> Result<OrderResult, ExchangeError>;

    /// Resting limit entry, used by the conservative-hybrid and limit-only
    /// order-execution strategies instead of `open_long`/`open_short`.
    async fn open_long_limit(&self, symbol: &str, qty: f64, leverage: f64, price: f64) -> Result<OrderResult, ExchangeError>;
    async fn open_short_limit(&self, symbol: &str, qty: f64, leverage: f64, price: f64) -> Result<OrderResult, ExchangeError>;
    async fn is_order_filled(&self, symbol: &str, order_id: &str) -> Result<bool, ExchangeError>;
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError>;

    async fn set_stop_loss(&self, symbol: &str, side: Side, qty: f64, price: f64) -> Result<OrderResult, ExchangeError>;
    async fn set_take_profit(&self, symbol: &str, side: Side, qty: f64, price: f64) -> Result<OrderResult, ExchangeError>;

    async fn cancel_stop_loss_orders(&self, symbol: &str) -> Result<(), ExchangeError>;
    async fn cancel_take_profit_orders(&self, symbol: &str) -> Result<(), ExchangeError>;
    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ExchangeError>;

    async fn set_margin_mode(&self, symbol: &str, is_cross_margin: bool) -> Result<(), ExchangeError>;
    async fn set_leverage(&self, symbol: &str, leverage: f64) -> Result<(), ExchangeError>;

    fn rounding_for(&self, symbol: &str) -> SymbolRounding;
}

/// Retry a bulk-cancel style call with linear backoff (1 s, 2 s, 3 s, ...),
/// bounded to `max_attempts`. All other adapter calls either succeed or
/// surface the exchange error directly; this wrapper is only for the
/// bulk-cancel family.
pub async fn retry_with_linear_backoff<F, Fut, T>(max_attempts: u32, mut f: F) -> Result<T, ExchangeError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ExchangeError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max_attempts => {
                tracing::warn!(attempt, max_attempts, error = %e, "retrying after transient exchange error");
                tokio::time::sleep(std::time::Duration::from_secs(attempt as u64)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Construct the configured adapter variant from trader credentials.
pub fn build_adapter(creds: &ExchangeCredentials) -> Result<Box<dyn ExchangeAdapter>, crate::error::ConfigError> {
    use crate::config::ExchangeBackend;

    match creds.backend {
        ExchangeBackend::CentralizedApiKey => {
            if creds.api_key.is_empty() || creds.api_secret.is_empty() {
                return Err(crate::error::ConfigError::MissingField(
                    "exchange.api_key/api_secret".to_string(),
                ));
            }
            Ok(Box::new(BinanceFuturesAdapter::new(&creds.api_key, &creds.api_secret)))
        }
        ExchangeBackend::SignedWallet => {
            if creds.wallet_private_key.is_empty() {
                return Err(crate::error::ConfigError::MissingField(
                    "exchange.wallet_private_key".to_string(),
                ));
            }
            SignedWalletAdapter::new(&creds.wallet_private_key)
                .map(|a| Box::new(a) as Box<dyn ExchangeAdapter>)
                .map_err(|e| crate::error::ConfigError::Invalid(e.to_string()))
        }
        ExchangeBackend::Web3AgentWallet => {
            if creds.wallet_private_key.is_empty() || creds.agent_wallet_address.is_empty() {
                return Err(crate::error::ConfigError::MissingField(
                    "exchange.wallet_private_key/agent_wallet_address".to_string(),
                ));
            }
            Web3AgentAdapter::new(&creds.wallet_private_key, &creds.agent_wallet_address)
                .map(|a| Box::new(a) as Box<dyn ExchangeAdapter>)
                .map_err(|e| crate::error::ConfigError::Invalid(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_to_step_never_rounds_up() {
        assert_eq!(round_to_step(1.2345, 0.01), 1.23);
        assert_eq!(round_to_step(1.239, 0.01), 1.23);
        assert_eq!(round_to_step(100.0, 1.0), 100.0);
    }

    #[test]
    fn round_to_step_zero_step_is_identity() {
        assert_eq!(round_to_step(1.2345, 0.0), 1.2345);
    }
}
