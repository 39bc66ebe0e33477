// =============================================================================
// Signed-wallet DEX adapter — every request signed directly by the trading
// wallet's private key (EIP-712-style personal-message signing)
// =============================================================================
//
// No API key/secret; the wallet's own signature over a canonical request
// payload authenticates every call. The private key never leaves this
// process and is never logged.
// =============================================================================

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use ethers::signers::{LocalWallet, Signer};
use parking_lot::RwLock;
use serde_json::json;
use tracing::instrument;

use crate::error::ExchangeError;
use crate::types::{OpenOrder, Position, Side};

use super::cache::TtlCache;
use super::{BalanceSnapshot, ExchangeAdapter, OrderResult, SymbolRounding};

const DEFAULT_ROUNDING: SymbolRounding = SymbolRounding {
    tick_size: 0.01,
    step_size: 0.001,
};

/// A signed-wallet DEX driver. `base_url` defaults to the reference venue
/// this adapter targets; it is overridable for testnets.
pub struct SignedWalletAdapter {
    wallet: LocalWallet,
    base_url: String,
    client: reqwest::Client,
    balance_cache: TtlCache<BalanceSnapshot>,
    positions_cache: TtlCache<Vec<Position>>,
    rounding: RwLock<HashMap<String, SymbolRounding>>,
}

impl SignedWalletAdapter {
    pub fn new(private_key_hex: &str) -> Result<Self> {
        let wallet: LocalWallet = private_key_hex
            .trim_start_matches("0x")
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid wallet private key: {e}"))?;

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;

        Ok(Self {
            wallet,
            base_url: "https://api.reference-dex.example/v1".to_string(),
            client,
            balance_cache: TtlCache::new(),
            positions_cache: TtlCache::new(),
            rounding: RwLock::new(HashMap::new()),
        })
    }

    /// Sign a canonical request payload with the trading wallet and return
    /// the hex-encoded signature alongside the signer address.
    async fn sign_payload(&self, payload: &serde_json::Value) -> Result<(String, String), ExchangeError> {
        let canonical = serde_json::to_string(payload).map_err(|e| ExchangeError::Semantic(e.to_string()))?;
        let signature = self
            .wallet
            .sign_message(canonical.as_bytes())
            .await
            .map_err(|e| ExchangeError::Transport(anyhow::anyhow!(e)))?;
        Ok((format!("0x{}", signature), format!("{:?}", self.wallet.address())))
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        mut payload: serde_json::Value,
    ) -> Result<serde_json::Value, ExchangeError> {
        payload["timestamp"] = json!(Utc::now().timestamp_millis());
        let (signature, address) = self.sign_payload(&payload).await?;
        payload["signature"] = json!(signature);
        payload["address"] = json!(address);

        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .request(method, &url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transient(format!("failed to parse response body: {e}")))?;

        if status.is_success() {
            return Ok(body);
        }
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(ExchangeError::Transient(format!("{status}: {body}")));
        }
        Err(ExchangeError::Semantic(format!("{status}: {body}")))
    }

    fn parse_position(v: &serde_json::Value) -> Option<Position> {
        let symbol = v["symbol"].as_str()?.to_string();
        let quantity = v["size"].as_f64()?.abs();
        if quantity == 0.0 {
            return None;
        }
        let side = if v["size"].as_f64()? > 0.0 { Side::Long } else { Side::Short };
        let entry_price = v["entryPrice"].as_f64().unwrap_or(0.0);
        let mark_price = v["markPrice"].as_f64().unwrap_or(0.0);
        let leverage = v["leverage"].as_f64().unwrap_or(1.0);
        let unrealized_pnl = v["unrealizedPnl"].as_f64().unwrap_or(0.0);
        let liquidation_price = v["liquidationPrice"].as_f64().unwrap_or(0.0);
        let margin_used = entry_price * quantity / leverage.max(1.0);
        let unrealized_pnl_pct = if margin_used > 0.0 { unrealized_pnl / margin_used * 100.0 } else { 0.0 };

        Some(Position {
            symbol,
            side,
            entry_price,
            mark_price,
            quantity,
            leverage,
            unrealized_pnl,
            unrealized_pnl_pct,
            peak_pnl_pct: unrealized_pnl_pct.max(0.0),
            liquidation_price,
            margin_used,
            update_time: Utc::now(),
            stop_loss: None,
            take_profit: None,
        })
    }
}

#[async_trait]
impl ExchangeAdapter for SignedWalletAdapter {
    #[instrument(skip(self), name = "signed_wallet::get_balance")]
    async fn get_balance(&self) -> Result<BalanceSnapshot, ExchangeError> {
        if let Some(cached) = self.balance_cache.get() {
            return Ok(cached);
        }
        let body = self.signed_request(reqwest::Method::POST, "/account", json!({})).await?;
        let snapshot = BalanceSnapshot {
            wallet_balance: body["walletBalance"].as_f64().unwrap_or(0.0),
            unrealized_profit: body["unrealizedPnl"].as_f64().unwrap_or(0.0),
            available_balance: body["availableBalance"].as_f64().unwrap_or(0.0),
        };
        self.balance_cache.set(snapshot);
        Ok(snapshot)
    }

    #[instrument(skip(self), name = "signed_wallet::get_positions")]
    async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        if let Some(cached) = self.positions_cache.get() {
            return Ok(cached);
        }
        let body = self.signed_request(reqwest::Method::POST, "/positions", json!({})).await?;
        let raw = body["positions"].as_array().cloned().unwrap_or_default();
        let positions: Vec<Position> = raw.iter().filter_map(Self::parse_position).collect();
        self.positions_cache.set(positions.clone());
        Ok(positions)
    }

    #[instrument(skip(self), name = "signed_wallet::get_open_orders")]
    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<OpenOrder>, ExchangeError> {
        let body = self
            .signed_request(reqwest::Method::POST, "/orders", json!({"symbol": symbol}))
            .await?;
        let raw = body["orders"].as_array().cloned().unwrap_or_default();
        Ok(raw
            .iter()
            .filter_map(|v| {
                Some(OpenOrder {
                    symbol: v["symbol"].as_str()?.to_string(),
                    order_id: v["orderId"].as_str()?.to_string(),
                    order_type: match v["type"].as_str()? {
                        "limit" => crate::types::OrderType::Limit,
                        "stop_market" => crate::types::OrderType::StopMarket,
                        "take_profit_market" => crate::types::OrderType::TakeProfitMarket,
                        _ => crate::types::OrderType::Market,
                    },
                    side: if v["side"].as_str()? == "buy" { Side::Long } else { Side::Short },
                    quantity: v["quantity"].as_f64().unwrap_or(0.0),
                    price: v["price"].as_f64(),
                    stop_price: v["stopPrice"].as_f64(),
                })
            })
            .collect())
    }

    #[instrument(skip(self), name = "signed_wallet::get_market_price")]
    async fn get_market_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let body = self
            .signed_request(reqwest::Method::POST, "/ticker", json!({"symbol": symbol}))
            .await?;
        body["price"].as_f64().ok_or_else(|| ExchangeError::Semantic(format!("no price for {symbol}")))
    }

    async fn open_long(&self, symbol: &str, qty: f64, leverage: f64) -> Result<OrderResult, ExchangeError> {
        let rounded = self.rounding_for(symbol).round_quantity(qty);
        let body = self
            .signed_request(
                reqwest::Method::POST,
                "/order",
                json!({"symbol": symbol, "side": "buy", "positionSide": "long", "quantity": rounded, "leverage": leverage}),
            )
            .await;
        self.balance_cache.invalidate();
        self.positions_cache.invalidate();
        let body = body?;
        Ok(OrderResult {
            order_id: body["orderId"].as_str().unwrap_or_default().to_string(),
            symbol: symbol.to_string(),
            price: None,
            quantity: rounded,
        })
    }

    async fn open_short(&self, symbol: &str, qty: f64, leverage: f64) -> Result<OrderResult, ExchangeError> {
        let rounded = self.rounding_for(symbol).round_quantity(qty);
        let body = self
            .signed_request(
                reqwest::Method::POST,
                "/order",
                json!({"symbol": symbol, "side": "sell", "positionSide": "short", "quantity": rounded, "leverage": leverage}),
            )
            .await;
        self.balance_cache.invalidate();
        self.positions_cache.invalidate();
        let body = body?;
        Ok(OrderResult {
            order_id: body["orderId"].as_str().unwrap_or_default().to_string(),
            symbol: symbol.to_string(),
            price: None,
            quantity: rounded,
        })
    }

    async fn open_long_limit(&self, symbol: &str, qty: f64, leverage: f64, price: f64) -> Result<OrderResult, ExchangeError> {
        let rounding = self.rounding_for(symbol);
        let rounded = rounding.round_quantity(qty);
        let rounded_price = rounding.round_price(price);
        let body = self
            .signed_request(
                reqwest::Method::POST,
                "/order",
                json!({"symbol": symbol, "side": "buy", "positionSide": "long", "type": "limit", "quantity": rounded, "price": rounded_price, "leverage": leverage}),
            )
            .await;
        self.balance_cache.invalidate();
        self.positions_cache.invalidate();
        let body = body?;
        Ok(OrderResult {
            order_id: body["orderId"].as_str().unwrap_or_default().to_string(),
            symbol: symbol.to_string(),
            price: Some(rounded_price),
            quantity: rounded,
        })
    }

    async fn open_short_limit(&self, symbol: &str, qty: f64, leverage: f64, price: f64) -> Result<OrderResult, ExchangeError> {
        let rounding = self.rounding_for(symbol);
        let rounded = rounding.round_quantity(qty);
        let rounded_price = rounding.round_price(price);
        let body = self
            .signed_request(
                reqwest::Method::POST,
                "/order",
                json!({"symbol": symbol, "side": "sell", "positionSide": "short", "type": "limit", "quantity": rounded, "price": rounded_price, "leverage": leverage}),
            )
            .await;
        self.balance_cache.invalidate();
        self.positions_cache.invalidate();
        let body = body?;
        Ok(OrderResult {
            order_id: body["orderId"].as_str().unwrap_or_default().to_string(),
            symbol: symbol.to_string(),
            price: Some(rounded_price),
            quantity: rounded,
        })
    }

    async fn is_order_filled(&self, symbol: &str, order_id: &str) -> Result<bool, ExchangeError> {
        let body = self
            .signed_request(reqwest::Method::POST, "/orderStatus", json!({"symbol": symbol, "orderId": order_id}))
            .await?;
        Ok(body["status"].as_str() == Some("filled"))
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        match self
            .signed_request(reqwest::Method::POST, "/cancelOrder", json!({"symbol": symbol, "orderId": order_id}))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_gone() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn close_long(&self, symbol: &str, qty: f64) -> Result<OrderResult, ExchangeError> {
        let close_qty = if qty == 0.0 {
            self.get_positions()
                .await?
                .into_iter()
                .find(|p| p.symbol == symbol && p.side == Side::Long)
                .map(|p| p.quantity)
                .unwrap_or(0.0)
        } else {
            qty
        };
        let rounded = self.rounding_for(symbol).round_quantity(close_qty);
        let body = self
            .signed_request(
                reqwest::Method::POST,
                "/order",
                json!({"symbol": symbol, "side": "sell", "positionSide": "long", "quantity": rounded, "reduceOnly": true}),
            )
            .await;
        self.balance_cache.invalidate();
        self.positions_cache.invalidate();
        let body = body?;
        Ok(OrderResult {
            order_id: body["orderId"].as_str().unwrap_or_default().to_string(),
            symbol: symbol.to_string(),
            price: None,
            quantity: rounded,
        })
    }

    async fn close_short(&self, symbol: &str, qty: f64) -> Result<OrderResult, ExchangeError> {
        let close_qty = if qty == 0.0 {
            self.get_positions()
                .await?
                .into_iter()
                .find(|p| p.symbol == symbol && p.side == Side::Short)
                .map(|p| p.quantity)
                .unwrap_or(0.0)
        } else {
            qty
        };
        let rounded = self.rounding_for(symbol).round_quantity(close_qty);
        let body = self
            .signed_request(
                reqwest::Method::POST,
                "/order",
                json!({"symbol": symbol, "side": "buy", "positionSide": "short", "quantity": rounded, "reduceOnly": true}),
            )
            .await;
        self.balance_cache.invalidate();
        self.positions_cache.invalidate();
        let body = body?;
        Ok(OrderResult {
            order_id: body["orderId"].as_str().unwrap_or_default().to_string(),
            symbol: symbol.to_string(),
            price: None,
            quantity: rounded,
        })
    }

    async fn set_stop_loss(&self, symbol: &str, side: Side, qty: f64, price: f64) -> Result<OrderResult, ExchangeError> {
        let rounded_qty = self.rounding_for(symbol).round_quantity(qty);
        let rounded_price = self.rounding_for(symbol).round_price(price);
        let position_side = if side == Side::Long { "long" } else { "short" };
        let body = self
            .signed_request(
                reqwest::Method::POST,
                "/order",
                json!({"symbol": symbol, "type": "stop_market", "positionSide": position_side, "quantity": rounded_qty, "stopPrice": rounded_price, "reduceOnly": true}),
            )
            .await;
        self.balance_cache.invalidate();
        self.positions_cache.invalidate();
        let body = body?;
        Ok(OrderResult {
            order_id: body["orderId"].as_str().unwrap_or_default().to_string(),
            symbol: symbol.to_string(),
            price: Some(rounded_price),
            quantity: rounded_qty,
        })
    }

    async fn set_take_profit(&self, symbol: &str, side: Side, qty: f64, price: f64) -> Result<OrderResult, ExchangeError> {
        let rounded_qty = self.rounding_for(symbol).round_quantity(qty);
        let rounded_price = self.rounding_for(symbol).round_price(price);
        let position_side = if side == Side::Long { "long" } else { "short" };
        let body = self
            .signed_request(
                reqwest::Method::POST,
                "/order",
                json!({"symbol": symbol, "type": "take_profit_market", "positionSide": position_side, "quantity": rounded_qty, "stopPrice": rounded_price, "reduceOnly": true}),
            )
            .await;
        self.balance_cache.invalidate();
        self.positions_cache.invalidate();
        let body = body?;
        Ok(OrderResult {
            order_id: body["orderId"].as_str().unwrap_or_default().to_string(),
            symbol: symbol.to_string(),
            price: Some(rounded_price),
            quantity: rounded_qty,
        })
    }

    async fn cancel_stop_loss_orders(&self, symbol: &str) -> Result<(), ExchangeError> {
        let result = super::retry_with_linear_backoff(3, || async {
            self.signed_request(reqwest::Method::POST, "/cancelByType", json!({"symbol": symbol, "type": "stop_market"}))
                .await
                .map(|_| ())
        })
        .await;
        self.balance_cache.invalidate();
        self.positions_cache.invalidate();
        result
    }

    async fn cancel_take_profit_orders(&self, symbol: &str) -> Result<(), ExchangeError> {
        let result = super::retry_with_linear_backoff(3, || async {
            self.signed_request(reqwest::Method::POST, "/cancelByType", json!({"symbol": symbol, "type": "take_profit_market"}))
                .await
                .map(|_| ())
        })
        .await;
        self.balance_cache.invalidate();
        self.positions_cache.invalidate();
        result
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ExchangeError> {
        let result = super::retry_with_linear_backoff(3, || async {
            self.signed_request(reqwest::Method::POST, "/cancelAll", json!({"symbol": symbol}))
                .await
                .map(|_| ())
        })
        .await;
        self.balance_cache.invalidate();
        self.positions_cache.invalidate();
        result
    }

    async fn set_margin_mode(&self, symbol: &str, is_cross_margin: bool) -> Result<(), ExchangeError> {
        self.signed_request(
            reqwest::Method::POST,
            "/marginMode",
            json!({"symbol": symbol, "isCross": is_cross_margin}),
        )
        .await
        .map(|_| ())
    }

    async fn set_leverage(&self, symbol: &str, leverage: f64) -> Result<(), ExchangeError> {
        self.signed_request(reqwest::Method::POST, "/leverage", json!({"symbol": symbol, "leverage": leverage}))
            .await
            .map(|_| ())
    }

    fn rounding_for(&self, symbol: &str) -> SymbolRounding {
        self.rounding.read().get(symbol).copied().unwrap_or(DEFAULT_ROUNDING)
    }
}

impl std::fmt::Debug for SignedWalletAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedWalletAdapter")
            .field("address", &format!("{:?}", self.wallet.address()))
            .field("base_url", &self.base_url)
            .finish()
    }
}
