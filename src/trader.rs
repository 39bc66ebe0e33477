// =============================================================================
// Trader Loop (C7) — per-trader cycle scheduler
// =============================================================================
//
// One `Trader` owns two long-lived tasks: `run_cycle_loop` (the per-tick
// decision cycle) and `run_drawdown_monitor` (a once-a-minute emergency-flat
// sweep). Both observe the same `watch::Receiver<bool>` cooperative-
// cancellation signal, one handle per trader, owned by the manager.
//
// Local cross-cycle state (last-cycle positions, the daily-PnL accumulator,
// the risk-tripwire cooldown) lives behind `parking_lot::RwLock`s so the
// drawdown monitor can read it concurrently with the main loop mutating it.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{info, instrument, warn};

use crate::config::TraderConfig;
use crate::context::ContextBuilder;
use crate::decision_log::DecisionLog;
use crate::exchange::ExchangeAdapter;
use crate::execution::ExecutionOrchestrator;
use crate::llm::LlmClient;
use crate::parser::{self, ParseContext};
use crate::prompt;
use crate::types::{
    ActionKind, CloseReason, Decision, DecisionAction, DecisionRecord, Position, RecentTradeOutcome, Side, TradingMode,
};

const DRAWDOWN_MONITOR_INTERVAL_SECS: u64 = 60;
const TRIPWIRE_COOLDOWN_SECS: i64 = 3600;
const DAILY_RESET_PERIOD_SECS: i64 = 24 * 3600;

/// Per-trader runtime. Constructed once by the manager and held behind an
/// `Arc` so both of its tasks can share it.
pub struct Trader {
    pub id: String,
    config: RwLock<TraderConfig>,
    mode: RwLock<TradingMode>,
    exchange: Arc<dyn ExchangeAdapter>,
    llm: RwLock<LlmClient>,
    context_builder: ContextBuilder,
    execution: ExecutionOrchestrator,
    decision_log: Arc<DecisionLog>,

    last_positions: RwLock<Vec<Position>>,
    cycle_index: RwLock<u64>,
    started_at: DateTime<Utc>,

    daily_pnl_accum: RwLock<f64>,
    daily_reset_at: RwLock<DateTime<Utc>>,
    stop_until: RwLock<Option<DateTime<Utc>>>,
}

impl Trader {
    pub fn new(
        config: TraderConfig,
        exchange: Arc<dyn ExchangeAdapter>,
        llm: LlmClient,
        context_builder: ContextBuilder,
        execution: ExecutionOrchestrator,
        decision_log: Arc<DecisionLog>,
    ) -> Self {
        let id = config.id.clone();
        Self {
            id,
            config: RwLock::new(config),
            mode: RwLock::new(TradingMode::Paused),
            exchange,
            llm: RwLock::new(llm),
            context_builder,
            execution,
            decision_log,
            last_positions: RwLock::new(Vec::new()),
            cycle_index: RwLock::new(0),
            started_at: Utc::now(),
            daily_pnl_accum: RwLock::new(0.0),
            daily_reset_at: RwLock::new(Utc::now()),
            stop_until: RwLock::new(None),
        }
    }

    pub fn set_mode(&self, mode: TradingMode) {
        *self.mode.write() = mode;
    }

    pub fn mode(&self) -> TradingMode {
        *self.mode.read()
    }

    /// Swap AI provider credentials in place without restarting the loop.
    pub fn reload_ai_config(&self, ai: crate::config::AiProviderConfig) {
        self.llm.write().reload(&ai);
        self.config.write().ai = ai;
    }

    /// The main cycle loop: spawned once per trader and run until shutdown.
    pub async fn run_cycle_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let scan_interval = self.config.read().scan_interval_secs;
        let mut ticker = interval(Duration::from_secs(scan_interval.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(trader_id = %self.id, scan_interval, "trader cycle loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    self.run_cycle().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(trader_id = %self.id, "trader cycle loop stopped");
    }

    /// The drawdown monitor: spawned alongside the main loop, evaluated
    /// every minute against the last-cycle position snapshot.
    pub async fn run_drawdown_monitor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(DRAWDOWN_MONITOR_INTERVAL_SECS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(trader_id = %self.id, "drawdown monitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    self.check_drawdown().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(trader_id = %self.id, "drawdown monitor stopped");
    }

    #[instrument(skip(self), fields(trader_id = %self.id))]
    async fn run_cycle(&self) {
        if self.mode() == TradingMode::Killed {
            return;
        }

        let now = Utc::now();
        if let Some(stop_until) = *self.stop_until.read() {
            if now < stop_until {
                info!(trader_id = %self.id, until = %stop_until, "cycle skipped, risk tripwire cooldown active");
                return;
            }
        }
        self.maybe_reset_daily(now);

        let config = self.config.read().clone();
        let cycle_index = {
            let mut idx = self.cycle_index.write();
            *idx += 1;
            *idx
        };
        let runtime_minutes = (now - self.started_at).num_minutes();

        let ctx = match self.context_builder.build(&config, cycle_index, runtime_minutes).await {
            Ok(ctx) => ctx,
            Err(err) => {
                warn!(trader_id = %self.id, error = %err, "failed to build trading context, skipping cycle");
                return;
            }
        };

        self.detect_double_sided_anomalies(&ctx.positions);

        let last_positions = self.last_positions.read().clone();
        let (passive_decisions, passive_actions) = self.detect_passive_closes(&last_positions, &ctx.positions);
        for action in &passive_actions {
            if let (Some(pnl), Some(reason)) = (action.realized_pnl, action.close_reason) {
                self.record_closed_trade(&last_positions, action, pnl, reason);
            }
        }

        let system_prompt = prompt::build_system_prompt(&config, &ctx);
        let performance = self.decision_log.performance_stats();
        let user_prompt = prompt::build_user_prompt(&ctx, Some(&performance));

        let llm_result = self.llm.read().complete(&system_prompt, &user_prompt).await;

        let (reasoning, decisions, llm_latency_ms, cycle_success, cycle_error) = match llm_result {
            Ok(reply) => {
                let parse_ctx = ParseContext {
                    equity: ctx.account.total_equity,
                    leverage_caps: ctx.leverage_caps,
                    taker_fee_rate: ctx.fee_rates.taker,
                    min_notional: crate::types::MinNotionalLadder {
                        others: config.min_notional_others_usd,
                        major_floor: config.min_notional_major_floor_usd,
                        major_ceiling: config.min_notional_major_ceiling_usd,
                    },
                    min_confidence: config.min_confidence,
                    min_rr_ratio: config.min_rr_ratio,
                };
                let outcome = parser::parse_reply(&reply.content, &parse_ctx);
                (outcome.reasoning, outcome.decisions, reply.latency_ms, true, None)
            }
            Err(err) => {
                warn!(trader_id = %self.id, error = %err, "LLM call failed, recording wait-only cycle");
                (String::new(), vec![Decision::bare(ActionKind::Wait, "ALL", "LLM call failed")], 0, false, Some(err.to_string()))
            }
        };

        let mut all_decisions = passive_decisions;
        all_decisions.extend(decisions.iter().cloned());

        let executed_actions = if self.mode() == TradingMode::Live {
            self.execution.execute_cycle(&config, &ctx, decisions, &last_positions).await
        } else {
            decisions.iter().map(|d| simulated_action(d)).collect()
        };

        for action in &executed_actions {
            if let (Some(pnl), Some(reason)) = (action.realized_pnl, action.close_reason) {
                self.record_closed_trade(&last_positions, action, pnl, reason);
            }
        }

        let mut all_actions = passive_actions;
        all_actions.extend(executed_actions);

        self.evaluate_risk_tripwire(now);

        *self.last_positions.write() = ctx.positions.clone();

        let record = DecisionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            trader_id: self.id.clone(),
            exchange: exchange_backend_name(config.exchange.backend).to_string(),
            cycle_index,
            timestamp: now,
            account: ctx.account,
            positions: ctx.positions,
            candidate_symbols: ctx.candidate_symbols,
            system_prompt,
            user_prompt,
            reasoning,
            decisions: all_decisions,
            actions: all_actions,
            success: cycle_success,
            error: cycle_error,
            log_lines: Vec::new(),
        };
        self.decision_log.append(record);
        let _ = llm_latency_ms;
    }

    fn maybe_reset_daily(&self, now: DateTime<Utc>) {
        let should_reset = (now - *self.daily_reset_at.read()).num_seconds() > DAILY_RESET_PERIOD_SECS;
        if should_reset {
            *self.daily_pnl_accum.write() = 0.0;
            *self.daily_reset_at.write() = now;
            info!(trader_id = %self.id, "daily PnL accumulator reset");
        }
    }

    /// If the daily realized-PnL drawdown has breached `drawdown_pnl_pct` of
    /// the trader's initial balance, open a cooldown window during which
    /// `run_cycle` skips entirely — a single daily-loss circuit breaker.
    fn evaluate_risk_tripwire(&self, now: DateTime<Utc>) {
        let config = self.config.read();
        if config.initial_balance_usd <= 0.0 {
            return;
        }
        let daily_pnl_pct = *self.daily_pnl_accum.read() / config.initial_balance_usd * 100.0;
        if daily_pnl_pct <= config.drawdown_pnl_pct {
            let until = now + chrono::Duration::seconds(TRIPWIRE_COOLDOWN_SECS);
            warn!(trader_id = %self.id, daily_pnl_pct, until = %until, "daily drawdown tripwire fired, pausing new cycles");
            *self.stop_until.write() = Some(until);
        }
    }

    fn record_closed_trade(&self, last_positions: &[Position], action: &DecisionAction, realized_pnl: f64, close_reason: CloseReason) {
        *self.daily_pnl_accum.write() += realized_pnl;

        let Some(old) = last_positions.iter().find(|p| p.symbol == action.symbol) else {
            return;
        };
        let pnl_pct = if old.margin_used > 0.0 { realized_pnl / old.margin_used * 100.0 } else { 0.0 };
        self.decision_log.record_trade(RecentTradeOutcome {
            symbol: old.symbol.clone(),
            side: old.side,
            opened_at: old.update_time,
            closed_at: Utc::now(),
            open_price: old.entry_price,
            close_price: old.mark_price,
            pnl: realized_pnl,
            pnl_pct,
            leverage: old.leverage,
            was_stop_loss: close_reason == CloseReason::StopLoss,
            duration_secs: (Utc::now() - old.update_time).num_seconds(),
        });
    }

    /// Flag (never auto-resolve) a symbol held long and short simultaneously.
    /// The exchange should never let this happen given the capability set in
    /// §4.2, but the spec treats it as an observable anomaly rather than an
    /// invariant the trader enforces itself.
    fn detect_double_sided_anomalies(&self, positions: &[Position]) {
        let mut by_symbol: std::collections::HashMap<&str, (bool, bool)> = std::collections::HashMap::new();
        for position in positions {
            let entry = by_symbol.entry(position.symbol.as_str()).or_default();
            match position.side {
                Side::Long => entry.0 = true,
                Side::Short => entry.1 = true,
            }
        }
        for (symbol, (has_long, has_short)) in by_symbol {
            if has_long && has_short {
                warn!(trader_id = %self.id, symbol, "double-sided position anomaly: both long and short open simultaneously");
            }
        }
    }

    /// Diff last-cycle positions against this cycle's by `(symbol, side)`
    /// key; every key present last cycle and absent now gets exactly one
    /// synthetic close decision/action.
    fn detect_passive_closes(&self, last: &[Position], current: &[Position]) -> (Vec<Decision>, Vec<DecisionAction>) {
        let current_keys: std::collections::HashSet<(String, Side)> = current.iter().map(|p| p.key()).collect();

        let mut decisions = Vec::new();
        let mut actions = Vec::new();

        for old in last {
            if current_keys.contains(&old.key()) {
                continue;
            }
            let (reason, price) = infer_passive_close_reason(old);
            let kind = if old.side == Side::Long { ActionKind::CloseLong } else { ActionKind::CloseShort };

            let decision = Decision::bare(kind, old.symbol.clone(), format!("passive close detected, inferred reason: {reason:?}"));
            let action = DecisionAction {
                kind,
                symbol: old.symbol.clone(),
                quantity: Some(old.quantity),
                leverage: Some(old.leverage),
                price: Some(price),
                order_id: None,
                success: true,
                error: None,
                realized_pnl: Some(old.unrealized_pnl),
                close_reason: Some(reason),
            };

            info!(trader_id = %self.id, symbol = %old.symbol, side = %old.side, ?reason, "passive close detected");
            decisions.push(decision);
            actions.push(action);
        }

        (decisions, actions)
    }

    /// Flatten any live position whose PnL% has retraced ≥40% from its
    /// peak-PnL high-water mark after having exceeded 5%.
    async fn check_drawdown(&self) {
        let config = self.config.read().clone();
        let positions = self.last_positions.read().clone();

        for position in &positions {
            if position.unrealized_pnl_pct <= config.drawdown_min_pnl_pct {
                continue;
            }
            let retrace_pct = (position.peak_pnl_pct - position.unrealized_pnl_pct) / position.peak_pnl_pct * 100.0;
            if retrace_pct < config.drawdown_retrace_pct {
                continue;
            }

            warn!(
                trader_id = %self.id,
                symbol = %position.symbol,
                side = %position.side,
                peak_pnl_pct = position.peak_pnl_pct,
                current_pnl_pct = position.unrealized_pnl_pct,
                retrace_pct,
                "drawdown monitor: retrace threshold breached, flattening position"
            );

            if let Err(err) = self.exchange.cancel_all_orders(&position.symbol).await {
                warn!(trader_id = %self.id, symbol = %position.symbol, error = %err, "failed to cancel orders before emergency flatten");
            }

            let close_result = match position.side {
                Side::Long => self.exchange.close_long(&position.symbol, 0.0).await,
                Side::Short => self.exchange.close_short(&position.symbol, 0.0).await,
            };
            match close_result {
                Ok(_) => {
                    self.record_closed_trade(
                        &positions,
                        &DecisionAction {
                            kind: if position.side == Side::Long { ActionKind::CloseLong } else { ActionKind::CloseShort },
                            symbol: position.symbol.clone(),
                            quantity: Some(position.quantity),
                            leverage: Some(position.leverage),
                            price: Some(position.mark_price),
                            order_id: None,
                            success: true,
                            error: None,
                            realized_pnl: Some(position.unrealized_pnl),
                            close_reason: Some(CloseReason::Manual),
                        },
                        position.unrealized_pnl,
                        CloseReason::Manual,
                    );
                }
                Err(err) if err.is_already_gone() => {}
                Err(err) => warn!(trader_id = %self.id, symbol = %position.symbol, error = %err, "drawdown monitor flatten failed"),
            }
        }
    }
}

fn exchange_backend_name(backend: crate::config::ExchangeBackend) -> &'static str {
    use crate::config::ExchangeBackend::*;
    match backend {
        CentralizedApiKey => "centralized_api_key",
        SignedWallet => "signed_wallet",
        Web3AgentWallet => "web3_agent_wallet",
    }
}

fn infer_passive_close_reason(old: &Position) -> (CloseReason, f64) {
    let mark = old.mark_price;

    if old.liquidation_price > 0.0 && within_pct(mark, old.liquidation_price, 2.0) {
        return (CloseReason::Liquidation, old.liquidation_price);
    }
    if let Some(stop) = old.stop_loss {
        if within_pct(mark, stop, 1.0) {
            return (CloseReason::StopLoss, stop);
        }
    }
    if let Some(take) = old.take_profit {
        if within_pct(mark, take, 1.0) {
            return (CloseReason::TakeProfit, take);
        }
    }
    (CloseReason::Unknown, mark)
}

fn within_pct(value: f64, reference: f64, pct: f64) -> bool {
    if reference <= 0.0 {
        return false;
    }
    ((value - reference).abs() / reference) * 100.0 <= pct
}

/// Demo-mode stand-in for an action that never reached the exchange.
fn simulated_action(decision: &Decision) -> DecisionAction {
    DecisionAction {
        kind: decision.kind,
        symbol: decision.symbol.clone(),
        quantity: decision.position_size_usd,
        leverage: decision.leverage,
        price: None,
        order_id: None,
        success: true,
        error: None,
        realized_pnl: None,
        close_reason: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn position(side: Side, mark: f64, stop: Option<f64>, take: Option<f64>, liq: f64) -> Position {
        Position {
            symbol: "BTCUSDT".to_string(),
            side,
            entry_price: 40_000.0,
            mark_price: mark,
            quantity: 0.01,
            leverage: 5.0,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            peak_pnl_pct: 0.0,
            liquidation_price: liq,
            margin_used: 80.0,
            update_time: Utc::now(),
            stop_loss: stop,
            take_profit: take,
        }
    }

    #[test]
    fn infer_reason_stop_loss_within_one_pct() {
        let pos = position(Side::Long, 38_750.0, Some(38_800.0), Some(45_000.0), 35_000.0);
        let (reason, price) = infer_passive_close_reason(&pos);
        assert_eq!(reason, CloseReason::StopLoss);
        assert_eq!(price, 38_800.0);
    }

    #[test]
    fn infer_reason_take_profit_within_one_pct() {
        let pos = position(Side::Long, 44_600.0, Some(38_000.0), Some(45_000.0), 35_000.0);
        let (reason, price) = infer_passive_close_reason(&pos);
        assert_eq!(reason, CloseReason::TakeProfit);
        assert_eq!(price, 45_000.0);
    }

    #[test]
    fn infer_reason_liquidation_within_two_pct() {
        let pos = position(Side::Long, 35_500.0, Some(30_000.0), Some(45_000.0), 35_000.0);
        let (reason, price) = infer_passive_close_reason(&pos);
        assert_eq!(reason, CloseReason::Liquidation);
        assert_eq!(price, 35_000.0);
    }

    #[test]
    fn infer_reason_unknown_when_nothing_matches() {
        let pos = position(Side::Long, 41_000.0, Some(38_000.0), Some(45_000.0), 35_000.0);
        let (reason, price) = infer_passive_close_reason(&pos);
        assert_eq!(reason, CloseReason::Unknown);
        assert_eq!(price, 41_000.0);
    }
}
