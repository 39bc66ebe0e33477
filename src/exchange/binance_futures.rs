// =============================================================================
// Centralized exchange adapter — USDT-M futures, API-key/secret, HMAC-SHA256
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed
// requests include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to
// tolerate minor clock drift against the exchange's servers.
// =============================================================================

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::error::ExchangeError;
use crate::types::{OpenOrder, OrderType, Position, Side};

use super::cache::TtlCache;
use super::rate_limit::RateLimitTracker;
use super::{BalanceSnapshot, ExchangeAdapter, OrderResult, SymbolRounding};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: u64 = 5000;
const BULK_CANCEL_MAX_ATTEMPTS: u32 = 3;

/// Default per-symbol rounding used until the real exchange-info lookup has
/// been populated for a symbol. Conservative enough not to reject orders on
/// major pairs; refined per-symbol entries are cached as they're learned.
const DEFAULT_ROUNDING: SymbolRounding = SymbolRounding {
    tick_size: 0.01,
    step_size: 0.001,
};

/// Centralized USDT-M futures exchange driver with HMAC-SHA256 request
/// signing. One instance per trader; never shared across traders.
pub struct BinanceFuturesAdapter {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    rate_limit: RateLimitTracker,
    balance_cache: TtlCache<BalanceSnapshot>,
    positions_cache: TtlCache<Vec<Position>>,
    rounding: RwLock<HashMap<String, SymbolRounding>>,
}

impl BinanceFuturesAdapter {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!("BinanceFuturesAdapter initialised (base_url=https://fapi.binance.com)");

        Self {
            api_key,
            secret,
            base_url: "https://fapi.binance.com".to_string(),
            client,
            rate_limit: RateLimitTracker::new(),
            balance_cache: TtlCache::new(),
            positions_cache: TtlCache::new(),
            rounding: RwLock::new(HashMap::new()),
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    async fn signed_get(&self, path: &str, params: &str) -> Result<serde_json::Value, ExchangeError> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        self.send(self.client.get(&url)).await
    }

    async fn signed_post(&self, path: &str, params: &str) -> Result<serde_json::Value, ExchangeError> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        self.send(self.client.post(&url)).await
    }

    async fn signed_delete(&self, path: &str, params: &str) -> Result<serde_json::Value, ExchangeError> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        self.send(self.client.delete(&url)).await
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<serde_json::Value, ExchangeError> {
        let resp = req.send().await.map_err(|e| ExchangeError::Transient(e.to_string()))?;
        self.rate_limit.update_from_headers(resp.headers());
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
        let position_amt: f64 = v["positionAmt"].as_str()?.parse().ok()?;
        if position_amt == 0.0 {
            return None;
        }
        let side = if position_amt > 0.0 { Side::Long } else { Side::Short };
        let entry_price: f64 = v["entryPrice"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
        let mark_price: f64 = v["markPrice"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
        let leverage: f64 = v["leverage"].as_str().unwrap_or("1").parse().unwrap_or(1.0);
        let unrealized_pnl: f64 = v["unRealizedProfit"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
        let liquidation_price: f64 = v["liquidationPrice"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
        let quantity = position_amt.abs();
        let margin_used = entry_price * quantity / leverage.max(1.0);
        let unrealized_pnl_pct = if margin_used > 0.0 {
            unrealized_pnl / margin_used * 100.0
        } else {
            0.0
        };

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

    fn parse_open_order(v: &serde_json::Value) -> Option<OpenOrder> {
        let symbol = v["symbol"].as_str()?.to_string();
        let order_id = v["orderId"].as_i64().map(|n| n.to_string())?;
        let order_type = match v["type"].as_str()? {
            "LIMIT" => OrderType::Limit,
            "MARKET" => OrderType::Market,
            "STOP_MARKET" => OrderType::StopMarket,
            "TAKE_PROFIT_MARKET" => OrderType::TakeProfitMarket,
            _ => return None,
        };
        let side = match v["side"].as_str()? {
            "BUY" => Side::Long,
            "SELL" => Side::Short,
            _ => return None,
        };
        let quantity: f64 = v["origQty"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
        let price: Option<f64> = v["price"].as_str().and_then(|s| s.parse().ok()).filter(|p| *p > 0.0);
        let stop_price: Option<f64> = v["stopPrice"].as_str().and_then(|s| s.parse().ok()).filter(|p| *p > 0.0);

        Some(OpenOrder {
            symbol,
            order_id,
            order_type,
            side,
            quantity,
            price,
            stop_price,
        })
    }

    async fn cancel_orders_matching(
        &self,
        symbol: &str,
        keep: impl Fn(&OpenOrder) -> bool,
    ) -> Result<(), ExchangeError> {
        let orders = self.get_open_orders(Some(symbol)).await?;
        for order in orders.iter().filter(|o| keep(o)) {
            let params = format!("symbol={}&orderId={}", symbol, order.order_id);
            self.signed_delete("/fapi/v1/order", &params).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceFuturesAdapter {
    #[instrument(skip(self), name = "binance_futures::get_balance")]
    async fn get_balance(&self) -> Result<BalanceSnapshot, ExchangeError> {
        if let Some(cached) = self.balance_cache.get() {
            return Ok(cached);
        }

        let body = self.signed_get("/fapi/v2/account", "").await?;
        let snapshot = BalanceSnapshot {
            wallet_balance: body["totalWalletBalance"].as_str().unwrap_or("0").parse().unwrap_or(0.0),
            unrealized_profit: body["totalUnrealizedProfit"].as_str().unwrap_or("0").parse().unwrap_or(0.0),
            available_balance: body["availableBalance"].as_str().unwrap_or("0").parse().unwrap_or(0.0),
        };
        self.balance_cache.set(snapshot);
        Ok(snapshot)
    }

    #[instrument(skip(self), name = "binance_futures::get_positions")]
    async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        if let Some(cached) = self.positions_cache.get() {
            return Ok(cached);
        }

        let body = self.signed_get("/fapi/v2/positionRisk", "").await?;
        let raw = body.as_array().ok_or_else(|| ExchangeError::Semantic("positionRisk response not an array".to_string()))?;
        let positions: Vec<Position> = raw.iter().filter_map(Self::parse_position).collect();
        self.positions_cache.set(positions.clone());
        Ok(positions)
    }

    #[instrument(skip(self), name = "binance_futures::get_open_orders")]
    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<OpenOrder>, ExchangeError> {
        let params = match symbol {
            Some(s) => format!("symbol={s}"),
            None => String::new(),
        };
        let body = self.signed_get("/fapi/v1/openOrders", &params).await?;
        let raw = body.as_array().ok_or_else(|| ExchangeError::Semantic("openOrders response not an array".to_string()))?;
        Ok(raw.iter().filter_map(Self::parse_open_order).collect())
    }

    #[instrument(skip(self), name = "binance_futures::get_market_price")]
    async fn get_market_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let url = format!("{}/fapi/v1/ticker/price?symbol={}", self.base_url, symbol);
        let body = self.send(self.client.get(&url)).await?;
        body["price"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ExchangeError::Semantic(format!("no price for {symbol}")))
    }

    #[instrument(skip(self), name = "binance_futures::open_long")]
    async fn open_long(&self, symbol: &str, qty: f64, leverage: f64) -> Result<OrderResult, ExchangeError> {
        self.set_leverage(symbol, leverage).await.ok();
        let rounded = self.rounding_for(symbol).round_quantity(qty);
        let params = format!("symbol={symbol}&side=BUY&type=MARKET&quantity={rounded}&positionSide=LONG");
        let body = self.signed_post("/fapi/v1/order", &params).await;
        self.balance_cache.invalidate();
        self.positions_cache.invalidate();
        let body = body?;
        Ok(OrderResult {
            order_id: body["orderId"].as_i64().map(|n| n.to_string()).unwrap_or_default(),
            symbol: symbol.to_string(),
            price: None,
            quantity: rounded,
        })
    }

    #[instrument(skip(self), name = "binance_futures::open_short")]
    async fn open_short(&self, symbol: &str, qty: f64, leverage: f64) -> Result<OrderResult, ExchangeError> {
        self.set_leverage(symbol, leverage).await.ok();
        let rounded = self.rounding_for(symbol).round_quantity(qty);
        let params = format!("symbol={symbol}&side=SELL&type=MARKET&quantity={rounded}&positionSide=SHORT");
        let body = self.signed_post("/fapi/v1/order", &params).await;
        self.balance_cache.invalidate();
        self.positions_cache.invalidate();
        let body = body?;
        Ok(OrderResult {
            order_id: body["orderId"].as_i64().map(|n| n.to_string()).unwrap_or_default(),
            symbol: symbol.to_string(),
            price: None,
            quantity: rounded,
        })
    }

    #[instrument(skip(self), name = "binance_futures::open_long_limit")]
    async fn open_long_limit(&self, symbol: &str, qty: f64, leverage: f64, price: f64) -> Result<OrderResult, ExchangeError> {
        self.set_leverage(symbol, leverage).await.ok();
        let rounding = self.rounding_for(symbol);
        let rounded_qty = rounding.round_quantity(qty);
        let rounded_price = rounding.round_price(price);
        let params = format!(
            "symbol={symbol}&side=BUY&type=LIMIT&timeInForce=GTC&quantity={rounded_qty}&price={rounded_price}&positionSide=LONG"
        );
        let body = self.signed_post("/fapi/v1/order", &params).await;
        self.balance_cache.invalidate();
        self.positions_cache.invalidate();
        let body = body?;
        Ok(OrderResult {
            order_id: body["orderId"].as_i64().map(|n| n.to_string()).unwrap_or_default(),
            symbol: symbol.to_string(),
            price: Some(rounded_price),
            quantity: rounded_qty,
        })
    }

    #[instrument(skip(self), name = "binance_futures::open_short_limit")]
    async fn open_short_limit(&self, symbol: &str, qty: f64, leverage: f64, price: f64) -> Result<OrderResult, ExchangeError> {
        self.set_leverage(symbol, leverage).await.ok();
        let rounding = self.rounding_for(symbol);
        let rounded_qty = rounding.round_quantity(qty);
        let rounded_price = rounding.round_price(price);
        let params = format!(
            "symbol={symbol}&side=SELL&type=LIMIT&timeInForce=GTC&quantity={rounded_qty}&price={rounded_price}&positionSide=SHORT"
        );
        let body = self.signed_post("/fapi/v1/order", &params).await;
        self.balance_cache.invalidate();
        self.positions_cache.invalidate();
        let body = body?;
        Ok(OrderResult {
            order_id: body["orderId"].as_i64().map(|n| n.to_string()).unwrap_or_default(),
            symbol: symbol.to_string(),
            price: Some(rounded_price),
            quantity: rounded_qty,
        })
    }

    #[instrument(skip(self), name = "binance_futures::is_order_filled")]
    async fn is_order_filled(&self, symbol: &str, order_id: &str) -> Result<bool, ExchangeError> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let body = self.signed_get("/fapi/v1/order", &params).await?;
        Ok(body["status"].as_str() == Some("FILLED"))
    }

    #[instrument(skip(self), name = "binance_futures::cancel_order")]
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        match self.signed_delete("/fapi/v1/order", &params).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_gone() => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), name = "binance_futures::close_long")]
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
        let params = format!("symbol={symbol}&side=SELL&type=MARKET&quantity={rounded}&positionSide=LONG");
        let body = self.signed_post("/fapi/v1/order", &params).await;
        self.balance_cache.invalidate();
        self.positions_cache.invalidate();
        let body = body?;
        Ok(OrderResult {
            order_id: body["orderId"].as_i64().map(|n| n.to_string()).unwrap_or_default(),
            symbol: symbol.to_string(),
            price: None,
            quantity: rounded,
        })
    }

    #[instrument(skip(self), name = "binance_futures::close_short")]
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
        let params = format!("symbol={symbol}&side=BUY&type=MARKET&quantity={rounded}&positionSide=SHORT");
        let body = self.signed_post("/fapi/v1/order", &params).await;
        self.balance_cache.invalidate();
        self.positions_cache.invalidate();
        let body = body?;
        Ok(OrderResult {
            order_id: body["orderId"].as_i64().map(|n| n.to_string()).unwrap_or_default(),
            symbol: symbol.to_string(),
            price: None,
            quantity: rounded,
        })
    }

    #[instrument(skip(self), name = "binance_futures::set_stop_loss")]
    async fn set_stop_loss(&self, symbol: &str, side: Side, qty: f64, price: f64) -> Result<OrderResult, ExchangeError> {
        let rounded_qty = self.rounding_for(symbol).round_quantity(qty);
        let rounded_price = self.rounding_for(symbol).round_price(price);
        let (order_side, position_side) = match side {
            Side::Long => ("SELL", "LONG"),
            Side::Short => ("BUY", "SHORT"),
        };
        let params = format!(
            "symbol={symbol}&side={order_side}&type=STOP_MARKET&quantity={rounded_qty}&stopPrice={rounded_price}&positionSide={position_side}"
        );
        let body = self.signed_post("/fapi/v1/order", &params).await;
        self.balance_cache.invalidate();
        self.positions_cache.invalidate();
        let body = body?;
        Ok(OrderResult {
            order_id: body["orderId"].as_i64().map(|n| n.to_string()).unwrap_or_default(),
            symbol: symbol.to_string(),
            price: Some(rounded_price),
            quantity: rounded_qty,
        })
    }

    #[instrument(skip(self), name = "binance_futures::set_take_profit")]
    async fn set_take_profit(&self, symbol: &str, side: Side, qty: f64, price: f64) -> Result<OrderResult, ExchangeError> {
        let rounded_qty = self.rounding_for(symbol).round_quantity(qty);
        let rounded_price = self.rounding_for(symbol).round_price(price);
        let (order_side, position_side) = match side {
            Side::Long => ("SELL", "LONG"),
            Side::Short => ("BUY", "SHORT"),
        };
        let params = format!(
            "symbol={symbol}&side={order_side}&type=TAKE_PROFIT_MARKET&quantity={rounded_qty}&stopPrice={rounded_price}&positionSide={position_side}"
        );
        let body = self.signed_post("/fapi/v1/order", &params).await;
        self.balance_cache.invalidate();
        self.positions_cache.invalidate();
        let body = body?;
        Ok(OrderResult {
            order_id: body["orderId"].as_i64().map(|n| n.to_string()).unwrap_or_default(),
            symbol: symbol.to_string(),
            price: Some(rounded_price),
            quantity: rounded_qty,
        })
    }

    #[instrument(skip(self), name = "binance_futures::cancel_stop_loss_orders")]
    async fn cancel_stop_loss_orders(&self, symbol: &str) -> Result<(), ExchangeError> {
        let result = super::retry_with_linear_backoff(BULK_CANCEL_MAX_ATTEMPTS, || {
            self.cancel_orders_matching(symbol, |o| o.order_type == OrderType::StopMarket)
        })
        .await;
        self.balance_cache.invalidate();
        self.positions_cache.invalidate();
        result
    }

    #[instrument(skip(self), name = "binance_futures::cancel_take_profit_orders")]
    async fn cancel_take_profit_orders(&self, symbol: &str) -> Result<(), ExchangeError> {
        let result = super::retry_with_linear_backoff(BULK_CANCEL_MAX_ATTEMPTS, || {
            self.cancel_orders_matching(symbol, |o| o.order_type == OrderType::TakeProfitMarket)
        })
        .await;
        self.balance_cache.invalidate();
        self.positions_cache.invalidate();
        result
    }

    #[instrument(skip(self), name = "binance_futures::cancel_all_orders")]
    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ExchangeError> {
        let result = super::retry_with_linear_backoff(BULK_CANCEL_MAX_ATTEMPTS, || async {
            let params = format!("symbol={symbol}");
            self.signed_delete("/fapi/v1/allOpenOrders", &params).await.map(|_| ())
        })
        .await;
        self.balance_cache.invalidate();
        self.positions_cache.invalidate();
        result
    }

    #[instrument(skip(self), name = "binance_futures::set_margin_mode")]
    async fn set_margin_mode(&self, symbol: &str, is_cross_margin: bool) -> Result<(), ExchangeError> {
        let mode = if is_cross_margin { "CROSSED" } else { "ISOLATED" };
        let params = format!("symbol={symbol}&marginType={mode}");
        match self.signed_post("/fapi/v1/marginType", &params).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_gone() => Ok(()),
            Err(e) => {
                warn!(symbol, error = %e, "set_margin_mode failed (non-fatal, likely already set)");
                Ok(())
            }
        }
    }

    #[instrument(skip(self), name = "binance_futures::set_leverage")]
    async fn set_leverage(&self, symbol: &str, leverage: f64) -> Result<(), ExchangeError> {
        let params = format!("symbol={symbol}&leverage={}", leverage.round() as i64);
        self.signed_post("/fapi/v1/leverage", &params).await.map(|_| ())
    }

    fn rounding_for(&self, symbol: &str) -> SymbolRounding {
        self.rounding.read().get(symbol).copied().unwrap_or(DEFAULT_ROUNDING)
    }
}

impl std::fmt::Debug for BinanceFuturesAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFuturesAdapter")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_position_skips_zero_amount() {
        let v = serde_json::json!({
            "symbol": "BTCUSDT",
            "positionAmt": "0",
            "entryPrice": "0",
            "markPrice": "0",
            "leverage": "10",
            "unRealizedProfit": "0",
            "liquidationPrice": "0",
        });
        assert!(BinanceFuturesAdapter::parse_position(&v).is_none());
    }

    #[test]
    fn parse_position_long_side_from_positive_amount() {
        let v = serde_json::json!({
            "symbol": "BTCUSDT",
            "positionAmt": "0.5",
            "entryPrice": "40000",
            "markPrice": "41000",
            "leverage": "10",
            "unRealizedProfit": "500",
            "liquidationPrice": "36000",
        });
        let pos = BinanceFuturesAdapter::parse_position(&v).unwrap();
        assert_eq!(pos.side, Side::Long);
        assert_eq!(pos.quantity, 0.5);
        assert_eq!(pos.leverage, 10.0);
    }

    #[test]
    fn parse_position_short_side_from_negative_amount() {
        let v = serde_json::json!({
            "symbol": "ETHUSDT",
            "positionAmt": "-2.0",
            "entryPrice": "2000",
            "markPrice": "1950",
            "leverage": "5",
            "unRealizedProfit": "100",
            "liquidationPrice": "2400",
        });
        let pos = BinanceFuturesAdapter::parse_position(&v).unwrap();
        assert_eq!(pos.side, Side::Short);
        assert_eq!(pos.quantity, 2.0);
    }
}
