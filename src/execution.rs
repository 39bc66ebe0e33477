// =============================================================================
// Execution Orchestrator (C6) — order decisions by priority, execute each
// against the exchange adapter
// =============================================================================
//
// Demo/live branching collapses here into the single always-live path a
// pluggable `ExchangeAdapter` already abstracts. Per-position protective
// order state lives in a `(symbol, side) -> protective order prices` table
// rather than as back-pointers on `Position`.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::{OrderExecutionStrategy, TraderConfig};
use crate::exchange::{ExchangeAdapter, OrderResult};
use crate::error::ExchangeError;
use crate::risk;
use crate::types::{ActionKind, CloseReason, Decision, DecisionAction, Position, Side, TradingContext};

/// `(symbol, side) -> {stop_price, take_price}` in place of back-pointers on
/// `Position`. Cleared whenever the position disappears from an exchange
/// snapshot.
#[derive(Debug, Clone, Copy, Default)]
struct ProtectiveOrders {
    stop_price: Option<f64>,
    take_price: Option<f64>,
}

pub struct ExecutionOrchestrator {
    exchange: std::sync::Arc<dyn ExchangeAdapter>,
    protective_orders: RwLock<HashMap<(String, Side), ProtectiveOrders>>,
}

impl ExecutionOrchestrator {
    pub fn new(exchange: std::sync::Arc<dyn ExchangeAdapter>) -> Self {
        Self { exchange, protective_orders: RwLock::new(HashMap::new()) }
    }

    /// Stably reorder `decisions` by priority (close/partial -> update ->
    /// open -> hold/wait) and execute each in turn, returning one
    /// `DecisionAction` per input decision.
    ///
    /// `position_cache` is this cycle's already-fetched position snapshot —
    /// the context builder fetches it once per cycle; re-fetching here would
    /// just be a second read of the same exchange state within its 30s TTL
    /// window, so the cycle's `TradingContext::positions` doubles as that
    /// cache. `last_cycle_positions` is the snapshot from the previous cycle, used
    /// to distinguish "no matching position" from "exchange already closed
    /// it since last cycle".
    pub async fn execute_cycle(
        &self,
        config: &TraderConfig,
        ctx: &TradingContext,
        mut decisions: Vec<Decision>,
        last_cycle_positions: &[Position],
    ) -> Vec<DecisionAction> {
        self.prune_stale_protective_orders(&ctx.positions);

        decisions.sort_by_key(|d| d.kind.priority());

        let mut actions = Vec::with_capacity(decisions.len());
        for decision in decisions {
            let action = self.execute_one(config, ctx, decision, last_cycle_positions).await;
            actions.push(action);
        }
        actions
    }

    fn prune_stale_protective_orders(&self, live_positions: &[Position]) {
        let live_keys: std::collections::HashSet<(String, Side)> = live_positions.iter().map(|p| p.key()).collect();
        self.protective_orders.write().retain(|key, _| live_keys.contains(key));
    }

    async fn execute_one(
        &self,
        config: &TraderConfig,
        ctx: &TradingContext,
        decision: Decision,
        last_cycle_positions: &[Position],
    ) -> DecisionAction {
        match decision.kind {
            ActionKind::OpenLong | ActionKind::OpenShort => self.execute_open(config, ctx, decision).await,
            ActionKind::CloseLong | ActionKind::CloseShort => self.execute_close(ctx, decision, 0.0).await,
            ActionKind::PartialClose => self.execute_partial_close(config, ctx, decision).await,
            ActionKind::UpdateStopLoss | ActionKind::UpdateTakeProfit => {
                self.execute_update_protective(config, ctx, decision, last_cycle_positions).await
            }
            ActionKind::Hold | ActionKind::Wait => self.execute_hold_or_wait(config, ctx, decision, last_cycle_positions).await,
        }
    }

    // -------------------------------------------------------------------
    // open_long / open_short
    // -------------------------------------------------------------------

    async fn execute_open(&self, config: &TraderConfig, ctx: &TradingContext, mut decision: Decision) -> DecisionAction {
        let side = decision.kind.side().expect("open_* always has a side");

        if ctx.positions.iter().any(|p| p.symbol == decision.symbol && p.side == side) {
            return failed_action(decision.kind, &decision.symbol, "a same-side position already exists".to_string());
        }

        if let Err(e) = risk::apply_open_pipeline(config, ctx, &mut decision) {
            return failed_action(decision.kind, &decision.symbol, e.to_string());
        }

        let mark_price = match self.exchange.get_market_price(&decision.symbol).await {
            Ok(p) => p,
            Err(e) => return failed_action(decision.kind, &decision.symbol, format!("failed to fetch mark price: {e}")),
        };

        let position_size_usd = decision.position_size_usd.expect("normalized by apply_open_pipeline");
        let leverage = decision.leverage.expect("normalized by apply_open_pipeline");
        let rounding = self.exchange.rounding_for(&decision.symbol);
        let qty = rounding.round_quantity(position_size_usd / mark_price);

        if qty <= 0.0 {
            return failed_action(decision.kind, &decision.symbol, "rounded quantity is zero".to_string());
        }

        if let Err(e) = self.exchange.set_margin_mode(&decision.symbol, config.cross_margin).await {
            warn!(symbol = %decision.symbol, error = %e, "set_margin_mode failed, proceeding with existing mode");
        }
        if let Err(e) = self.exchange.set_leverage(&decision.symbol, leverage).await {
            warn!(symbol = %decision.symbol, error = %e, "set_leverage failed, proceeding with existing leverage");
        }

        let order = match self.place_entry(config, &decision.symbol, side, qty, leverage, mark_price).await {
            Ok(o) => o,
            Err(e) => return failed_action(decision.kind, &decision.symbol, e.to_string()),
        };

        info!(symbol = %decision.symbol, side = %side, qty, leverage, order_id = %order.order_id, "position opened");

        // Protective orders failing does not roll back the open.
        let mut protective = ProtectiveOrders::default();
        if let Some(stop) = decision.stop_loss {
            let (stop, note) = risk::sanitize_stop_loss(config, side, mark_price, stop);
            if let Some(note) = note {
                decision.adjustment_notes.push(note);
            }
            match self.exchange.set_stop_loss(&decision.symbol, side, qty, stop).await {
                Ok(_) => protective.stop_price = Some(stop),
                Err(e) => warn!(symbol = %decision.symbol, error = %e, "set_stop_loss failed after open"),
            }
        }
        if let Some(take) = decision.take_profit {
            match self.exchange.set_take_profit(&decision.symbol, side, qty, take).await {
                Ok(_) => protective.take_price = Some(take),
                Err(e) => warn!(symbol = %decision.symbol, error = %e, "set_take_profit failed after open"),
            }
        }
        self.protective_orders.write().insert((decision.symbol.clone(), side), protective);

        DecisionAction {
            kind: decision.kind,
            symbol: decision.symbol,
            quantity: Some(qty),
            leverage: Some(leverage),
            price: Some(order.price.unwrap_or(mark_price)),
            order_id: Some(order.order_id),
            success: true,
            error: None,
            realized_pnl: None,
            close_reason: None,
        }
    }

    /// Places the entry order per `config.order_execution_strategy`. The
    /// conservative-hybrid path rests a limit order at `limit_price_offset_pct`
    /// off mark price, waits up to `limit_timeout_secs` for a fill, then
    /// cancels and resubmits as a market order if it never filled.
    async fn place_entry(
        &self,
        config: &TraderConfig,
        symbol: &str,
        side: Side,
        qty: f64,
        leverage: f64,
        mark_price: f64,
    ) -> Result<OrderResult, ExchangeError> {
        match config.order_execution_strategy {
            OrderExecutionStrategy::MarketOnly => self.open_market(symbol, side, qty, leverage).await,
            OrderExecutionStrategy::LimitOnly => {
                let price = limit_entry_price(side, mark_price, config.limit_price_offset_pct);
                self.open_limit(symbol, side, qty, leverage, price).await
            }
            OrderExecutionStrategy::ConservativeHybrid => {
                let price = limit_entry_price(side, mark_price, config.limit_price_offset_pct);
                let order = self.open_limit(symbol, side, qty, leverage, price).await?;

                if self.await_fill(symbol, &order.order_id, config.limit_timeout_secs).await {
                    return Ok(order);
                }

                info!(
                    symbol, order_id = %order.order_id, timeout_secs = config.limit_timeout_secs,
                    "limit entry unfilled within timeout, cancelling and resubmitting as market order"
                );
                if let Err(e) = self.exchange.cancel_order(symbol, &order.order_id).await {
                    warn!(symbol, error = %e, "cancel_order failed during conservative-hybrid fallback, resubmitting as market anyway");
                }
                self.open_market(symbol, side, qty, leverage).await
            }
        }
    }

    async fn open_market(&self, symbol: &str, side: Side, qty: f64, leverage: f64) -> Result<OrderResult, ExchangeError> {
        match side {
            Side::Long => self.exchange.open_long(symbol, qty, leverage).await,
            Side::Short => self.exchange.open_short(symbol, qty, leverage).await,
        }
    }

    async fn open_limit(&self, symbol: &str, side: Side, qty: f64, leverage: f64, price: f64) -> Result<OrderResult, ExchangeError> {
        match side {
            Side::Long => self.exchange.open_long_limit(symbol, qty, leverage, price).await,
            Side::Short => self.exchange.open_short_limit(symbol, qty, leverage, price).await,
        }
    }

    /// Polls `is_order_filled` once per second until it reports filled or
    /// `timeout_secs` elapses. Returns `false` on timeout or a check error
    /// persisting through the whole window.
    async fn await_fill(&self, symbol: &str, order_id: &str, timeout_secs: u64) -> bool {
        let budget = std::time::Duration::from_secs(timeout_secs.max(1));
        tokio::time::timeout(budget, async {
            loop {
                if matches!(self.exchange.is_order_filled(symbol, order_id).await, Ok(true)) {
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        })
        .await
        .is_ok()
    }

    // -------------------------------------------------------------------
    // close_long / close_short / partial_close
    // -------------------------------------------------------------------

    async fn execute_close(&self, ctx: &TradingContext, decision: Decision, qty_override: f64) -> DecisionAction {
        let side = decision.kind.side().expect("close_* always has a side");
        let position = ctx.positions.iter().find(|p| p.symbol == decision.symbol && p.side == side);

        let Some(position) = position else {
            return failed_action(decision.kind, &decision.symbol, "no matching open position to close".to_string());
        };

        let realized_pnl = position.unrealized_pnl;
        let close_result = match side {
            Side::Long => self.exchange.close_long(&decision.symbol, qty_override).await,
            Side::Short => self.exchange.close_short(&decision.symbol, qty_override).await,
        };

        match close_result {
            Ok(order) => {
                self.protective_orders.write().remove(&(decision.symbol.clone(), side));
                let close_reason = infer_manual_close_reason(&decision.reasoning, realized_pnl);
                info!(symbol = %decision.symbol, side = %side, realized_pnl, ?close_reason, "position closed");
                DecisionAction {
                    kind: decision.kind,
                    symbol: decision.symbol,
                    quantity: Some(position.quantity),
                    leverage: Some(position.leverage),
                    price: Some(order.price.unwrap_or(position.mark_price)),
                    order_id: Some(order.order_id),
                    success: true,
                    error: None,
                    realized_pnl: Some(realized_pnl),
                    close_reason: Some(close_reason),
                }
            }
            Err(e) if e.is_already_gone() => {
                self.protective_orders.write().remove(&(decision.symbol.clone(), side));
                DecisionAction {
                    kind: decision.kind,
                    symbol: decision.symbol,
                    quantity: None,
                    leverage: None,
                    price: None,
                    order_id: None,
                    success: true,
                    error: Some("position already closed on the exchange".to_string()),
                    realized_pnl: Some(realized_pnl),
                    close_reason: Some(CloseReason::Unknown),
                }
            }
            Err(e) => failed_action(decision.kind, &decision.symbol, e.to_string()),
        }
    }

    async fn execute_partial_close(&self, config: &TraderConfig, ctx: &TradingContext, decision: Decision) -> DecisionAction {
        let Some(position) = ctx.positions.iter().find(|p| p.symbol == decision.symbol) else {
            return failed_action(decision.kind, &decision.symbol, "no matching open position to partially close".to_string());
        };
        let side = position.side;

        let close_pct = decision.close_percentage.unwrap_or(100.0);
        let close_qty = position.quantity * close_pct / 100.0;
        let remaining_qty = position.quantity - close_qty;
        let remaining_notional = remaining_qty * position.mark_price;

        if remaining_notional <= 10.0 {
            info!(symbol = %decision.symbol, remaining_notional, "partial_close remainder below 10 USDT, rewriting to full close");
            let full_close_kind = if side == Side::Long { ActionKind::CloseLong } else { ActionKind::CloseShort };
            let rewritten = Decision { kind: full_close_kind, ..decision };
            return self.execute_close(ctx, rewritten, 0.0).await;
        }

        let rounding = self.exchange.rounding_for(&decision.symbol);
        let qty = rounding.round_quantity(close_qty);
        let realized_pnl = position.unrealized_pnl * (close_pct / 100.0);

        let close_result = match side {
            Side::Long => self.exchange.close_long(&decision.symbol, qty).await,
            Side::Short => self.exchange.close_short(&decision.symbol, qty).await,
        };

        let order = match close_result {
            Ok(o) => o,
            Err(e) if e.is_already_gone() => {
                self.protective_orders.write().remove(&(decision.symbol.clone(), side));
                return DecisionAction {
                    kind: decision.kind,
                    symbol: decision.symbol,
                    quantity: None,
                    leverage: None,
                    price: None,
                    order_id: None,
                    success: true,
                    error: Some("position already closed on the exchange".to_string()),
                    realized_pnl: None,
                    close_reason: Some(CloseReason::Unknown),
                };
            }
            Err(e) => return failed_action(decision.kind, &decision.symbol, e.to_string()),
        };

        // Exchanges typically auto-cancel the previous TP/SL after a
        // quantity change; re-arming for the remainder is mandatory, not
        // optional, whenever the model supplied new prices.
        let mut protective = ProtectiveOrders::default();
        if let Some(new_stop) = decision.new_stop_loss {
            let (stop, _) = risk::sanitize_stop_loss(config, side, position.mark_price, new_stop);
            match self.exchange.set_stop_loss(&decision.symbol, side, remaining_qty, stop).await {
                Ok(_) => protective.stop_price = Some(stop),
                Err(e) => warn!(symbol = %decision.symbol, error = %e, "failed to re-arm stop_loss after partial close"),
            }
        }
        if let Some(new_take) = decision.new_take_profit {
            match self.exchange.set_take_profit(&decision.symbol, side, remaining_qty, new_take).await {
                Ok(_) => protective.take_price = Some(new_take),
                Err(e) => warn!(symbol = %decision.symbol, error = %e, "failed to re-arm take_profit after partial close"),
            }
        }
        if protective.stop_price.is_some() || protective.take_price.is_some() {
            self.protective_orders.write().insert((decision.symbol.clone(), side), protective);
        }

        DecisionAction {
            kind: ActionKind::PartialClose,
            symbol: decision.symbol,
            quantity: Some(qty),
            leverage: Some(position.leverage),
            price: Some(order.price.unwrap_or(position.mark_price)),
            order_id: Some(order.order_id),
            success: true,
            error: None,
            realized_pnl: Some(realized_pnl),
            close_reason: None,
        }
    }

    // -------------------------------------------------------------------
    // update_stop_loss / update_take_profit
    // -------------------------------------------------------------------

    async fn execute_update_protective(
        &self,
        config: &TraderConfig,
        ctx: &TradingContext,
        decision: Decision,
        last_cycle_positions: &[Position],
    ) -> DecisionAction {
        let existing_any_side = |positions: &[Position]| positions.iter().find(|p| p.symbol == decision.symbol);

        let Some(position) = existing_any_side(&ctx.positions) else {
            if existing_any_side(last_cycle_positions).is_some() {
                return DecisionAction {
                    kind: decision.kind,
                    symbol: decision.symbol,
                    quantity: None,
                    leverage: None,
                    price: None,
                    order_id: None,
                    success: true,
                    error: Some("position already closed by the exchange since last cycle".to_string()),
                    realized_pnl: None,
                    close_reason: None,
                };
            }
            return failed_action(decision.kind, &decision.symbol, "no matching open position".to_string());
        };

        let side = position.side;
        let qty = position.quantity;

        match decision.kind {
            ActionKind::UpdateStopLoss => {
                let requested = decision.new_stop_loss.expect("parser validated new_stop_loss > 0");
                let (price, _note) = risk::sanitize_stop_loss(config, side, position.mark_price, requested);

                if let Err(e) = self.exchange.cancel_stop_loss_orders(&decision.symbol).await {
                    warn!(symbol = %decision.symbol, error = %e, "cancel_stop_loss_orders failed before re-arm");
                }
                match self.exchange.set_stop_loss(&decision.symbol, side, qty, price).await {
                    Ok(order) => {
                        self.protective_orders.write().entry((decision.symbol.clone(), side)).or_default().stop_price = Some(price);
                        DecisionAction {
                            kind: decision.kind,
                            symbol: decision.symbol,
                            quantity: Some(qty),
                            leverage: Some(position.leverage),
                            price: Some(price),
                            order_id: Some(order.order_id),
                            success: true,
                            error: None,
                            realized_pnl: None,
                            close_reason: None,
                        }
                    }
                    Err(e) => failed_action(decision.kind, &decision.symbol, e.to_string()),
                }
            }
            ActionKind::UpdateTakeProfit => {
                let price = decision.new_take_profit.expect("parser validated new_take_profit > 0");

                if let Err(e) = self.exchange.cancel_take_profit_orders(&decision.symbol).await {
                    warn!(symbol = %decision.symbol, error = %e, "cancel_take_profit_orders failed before re-arm");
                }
                match self.exchange.set_take_profit(&decision.symbol, side, qty, price).await {
                    Ok(order) => {
                        self.protective_orders.write().entry((decision.symbol.clone(), side)).or_default().take_price = Some(price);
                        DecisionAction {
                            kind: decision.kind,
                            symbol: decision.symbol,
                            quantity: Some(qty),
                            leverage: Some(position.leverage),
                            price: Some(price),
                            order_id: Some(order.order_id),
                            success: true,
                            error: None,
                            realized_pnl: None,
                            close_reason: None,
                        }
                    }
                    Err(e) => failed_action(decision.kind, &decision.symbol, e.to_string()),
                }
            }
            _ => unreachable!("execute_update_protective only called for update_* actions"),
        }
    }

    // -------------------------------------------------------------------
    // hold / wait
    // -------------------------------------------------------------------

    async fn execute_hold_or_wait(
        &self,
        config: &TraderConfig,
        ctx: &TradingContext,
        decision: Decision,
        last_cycle_positions: &[Position],
    ) -> DecisionAction {
        if decision.new_stop_loss.is_none() && decision.new_take_profit.is_none() {
            return DecisionAction {
                kind: decision.kind,
                symbol: decision.symbol,
                quantity: None,
                leverage: None,
                price: None,
                order_id: None,
                success: true,
                error: None,
                realized_pnl: None,
                close_reason: None,
            };
        }

        // hold/wait carrying protective prices piggy-backs the update_*
        // handlers rather than duplicating their logic.
        if let Some(new_stop) = decision.new_stop_loss {
            let synthetic = Decision { kind: ActionKind::UpdateStopLoss, new_stop_loss: Some(new_stop), ..decision.clone() };
            let action = self.execute_update_protective(config, ctx, synthetic, last_cycle_positions).await;
            if decision.new_take_profit.is_none() {
                return action;
            }
        }
        if let Some(new_take) = decision.new_take_profit {
            let synthetic = Decision { kind: ActionKind::UpdateTakeProfit, new_take_profit: Some(new_take), ..decision };
            return self.execute_update_protective(config, ctx, synthetic, last_cycle_positions).await;
        }
        unreachable!("at least one protective price was present")
    }
}

fn failed_action(kind: ActionKind, symbol: &str, error: String) -> DecisionAction {
    warn!(symbol, kind = ?kind, error = %error, "action execution failed");
    DecisionAction {
        kind,
        symbol: symbol.to_string(),
        quantity: None,
        leverage: None,
        price: None,
        order_id: None,
        success: false,
        error: Some(error),
        realized_pnl: None,
        close_reason: None,
    }
}

/// Entry price for a resting limit order: slightly better than mark price
/// so the order queues as a maker fill instead of crossing the book.
fn limit_entry_price(side: Side, mark_price: f64, offset_pct: f64) -> f64 {
    match side {
        Side::Long => mark_price * (1.0 - offset_pct / 100.0),
        Side::Short => mark_price * (1.0 + offset_pct / 100.0),
    }
}

/// Derive a close reason for a model-initiated close from its reasoning
/// text plus the realized PnL sign.
fn infer_manual_close_reason(reasoning: &str, realized_pnl: f64) -> CloseReason {
    let lower = reasoning.to_lowercase();
    if lower.contains("stop") || lower.contains("stop-loss") || lower.contains("stop loss") {
        CloseReason::StopLoss
    } else if lower.contains("take profit") || lower.contains("take-profit") || lower.contains("target") {
        CloseReason::TakeProfit
    } else if realized_pnl.abs() < f64::EPSILON {
        CloseReason::Unknown
    } else {
        CloseReason::Manual
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_reason_prefers_explicit_reasoning_text() {
        assert_eq!(infer_manual_close_reason("hit my stop level", 10.0), CloseReason::StopLoss);
        assert_eq!(infer_manual_close_reason("reached take profit target", -5.0), CloseReason::TakeProfit);
        assert_eq!(infer_manual_close_reason("market shifted, exiting manually", 5.0), CloseReason::Manual);
    }

    #[test]
    fn limit_entry_price_favors_the_maker_side() {
        let long_price = limit_entry_price(Side::Long, 100.0, 0.02);
        let short_price = limit_entry_price(Side::Short, 100.0, 0.02);
        assert!(long_price < 100.0);
        assert!(short_price > 100.0);
        assert!((long_price - 99.98).abs() < 1e-9);
        assert!((short_price - 100.02).abs() < 1e-9);
    }

    #[test]
    fn priority_orders_close_before_update_before_open_before_hold() {
        use crate::types::ActionKind::*;
        let mut kinds = vec![OpenLong, CloseLong, UpdateStopLoss, Hold];
        kinds.sort_by_key(|k| k.priority());
        assert_eq!(kinds, vec![CloseLong, UpdateStopLoss, OpenLong, Hold]);
    }
}
