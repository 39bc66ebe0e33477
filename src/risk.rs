// =============================================================================
// Risk Guards & Normalizer (C5) — applied per action, after parsing and
// before execution
// =============================================================================
//
// Guards run in a fixed order; the first failing guard aborts the action
// with a human-readable note (`RiskError::Blocked` / `RiskError::Rejected`).
// Everything that survives is then size/leverage-normalized and, for
// protective-price updates, sanity-checked against the current mark price.
//
// The daily lazy-rollover idiom (`Trader::maybe_reset_daily`) and the "gate
// returns a reason string" shape generalize a fixed set of circuit breakers
// into this per-action guard chain.
// =============================================================================

use tracing::{debug, warn};

use crate::config::TraderConfig;
use crate::error::RiskError;
use crate::types::{is_major_symbol, ActionKind, Decision, Side, TradingContext, Volatility};

/// Open-position guards — `open_long` / `open_short` only. Run before any
/// size/leverage normalization; a tripped guard aborts the action outright,
/// no partial effect.
pub fn check_open_guards(config: &TraderConfig, ctx: &TradingContext, decision: &Decision) -> Result<(), RiskError> {
    debug_assert!(decision.kind.is_open());

    if ctx.account.margin_used_pct >= config.margin_used_abort_pct {
        return Err(RiskError::Blocked("no free margin headroom".to_string()));
    }
    if ctx.account.position_count as u32 >= config.max_concurrent_positions {
        return Err(RiskError::Blocked("max concurrent positions reached".to_string()));
    }

    let confidence = decision.confidence.unwrap_or(0.0);
    if ctx.account.total_pnl_pct <= config.drawdown_pnl_pct && confidence < config.drawdown_confidence_floor {
        return Err(RiskError::Blocked("drawdown regime; require higher confidence".to_string()));
    }

    if ctx.market_summary.volatility == Volatility::Extreme {
        return Err(RiskError::Blocked("extreme volatility; observation only".to_string()));
    }

    // A dynamic position cap guard (size scaling down as concurrent
    // positions grow) is deliberately not implemented here.

    Ok(())
}

/// Default leverage when the model omits it or supplies zero: the
/// symbol-tiered cap, falling back to 3x for any symbol the caps don't
/// recognise.
fn default_leverage(config: &TraderConfig, symbol: &str) -> f64 {
    if is_major_symbol(symbol) {
        config.major_leverage_cap
    } else if config.altcoin_leverage_cap > 0.0 {
        config.altcoin_leverage_cap
    } else {
        3.0
    }
}

/// Size/leverage normalization. Mutates `decision` in place, pushing
/// a human-readable note onto `adjustment_notes` for every clamp/raise.
/// Returns `Err` only when even the minimum notional cannot fit in the
/// effective available balance.
pub fn normalize_size_and_leverage(
    config: &TraderConfig,
    ctx: &TradingContext,
    decision: &mut Decision,
) -> Result<(), RiskError> {
    debug_assert!(decision.kind.is_open());

    if decision.leverage.unwrap_or(0.0) <= 0.0 {
        let fallback = default_leverage(config, &decision.symbol);
        decision.adjustment_notes.push(format!("leverage defaulted to {fallback}"));
        decision.leverage = Some(fallback);
    }
    let leverage = decision.leverage.expect("leverage assigned above");

    let equity = ctx.account.total_equity;
    let confidence = decision.confidence.unwrap_or(0.0);

    let buffer_pct = if equity < 200.0 {
        0.10
    } else if equity < 500.0 {
        0.07
    } else if equity < 1_000.0 {
        0.05
    } else {
        0.03
    };

    let mut effective_balance = ctx.account.available_balance * (1.0 - buffer_pct);
    if confidence >= 90.0 {
        effective_balance *= 0.70;
    } else if confidence >= 85.0 {
        effective_balance *= 0.80;
    }
    effective_balance = effective_balance.min(equity * 0.12);

    let max_position_usd = (effective_balance / (1.0 / leverage + ctx.fee_rates.taker)).max(0.0);
    let max_position_usd = (max_position_usd * 100.0).floor() / 100.0;

    let mut position_size_usd = decision.position_size_usd.unwrap_or(0.0);

    if position_size_usd > max_position_usd {
        decision
            .adjustment_notes
            .push(format!("position_size_usd clamped from {position_size_usd:.2} to max {max_position_usd:.2}"));
        position_size_usd = max_position_usd;
    }

    let ladder = crate::types::MinNotionalLadder {
        others: config.min_notional_others_usd,
        major_floor: config.min_notional_major_floor_usd,
        major_ceiling: config.min_notional_major_ceiling_usd,
    };
    let min_notional = crate::parser::min_notional_usd(&decision.symbol, equity, &ladder);
    if position_size_usd < min_notional {
        if min_notional > max_position_usd {
            return Err(RiskError::Rejected(format!(
                "minimum notional {min_notional:.2} does not fit in effective balance {max_position_usd:.2}"
            )));
        }
        decision
            .adjustment_notes
            .push(format!("position_size_usd raised from {position_size_usd:.2} to minimum notional {min_notional:.2}"));
        position_size_usd = min_notional;
    }

    // Bump up modest AI sizing when confidence is high and there's clearly
    // more capital available than the model asked for.
    if confidence >= 85.0 && max_position_usd > 1.5 * position_size_usd {
        let bumped = (position_size_usd * 1.2).min(max_position_usd);
        if bumped > position_size_usd {
            decision
                .adjustment_notes
                .push(format!("position_size_usd raised from {position_size_usd:.2} to {bumped:.2} (confident sizing)"));
            position_size_usd = bumped;
        }
    }

    decision.position_size_usd = Some(position_size_usd);

    let required = position_size_usd / leverage + position_size_usd * ctx.fee_rates.taker;
    if required > ctx.account.available_balance {
        return Err(RiskError::Rejected(format!(
            "required margin {required:.2} exceeds available balance {:.2}",
            ctx.account.available_balance
        )));
    }

    Ok(())
}

/// Stop-loss sanity check, shared by the initial `open_*` stop and every
/// `update_stop_loss` / `partial_close` re-arm against the current mark
/// price. Returns the (possibly replaced) stop price and an optional note.
pub fn sanitize_stop_loss(config: &TraderConfig, side: Side, current_price: f64, new_stop: f64) -> (f64, Option<String>) {
    if current_price <= 0.0 {
        return (new_stop, None);
    }

    let tolerance = config.stop_loss_anomaly_tolerance_pct / 100.0;
    let deviation = match side {
        // Long: anomalous when the stop sits above the current price.
        Side::Long => (new_stop - current_price) / current_price,
        // Short: anomalous when the stop sits below the current price.
        Side::Short => (current_price - new_stop) / current_price,
    };

    if deviation <= 0.0 {
        return (new_stop, None);
    }

    if deviation > tolerance {
        let replacement = match side {
            Side::Long => current_price * (1.0 - 0.002),
            Side::Short => current_price * (1.0 + 0.002),
        };
        warn!(side = %side, new_stop, current_price, "stop-loss anomaly, replacing with a price-relative default");
        return (
            replacement,
            Some(format!("stop_loss {new_stop:.4} replaced with {replacement:.4} (anomalous relative to mark)")),
        );
    }

    (new_stop, Some(format!("stop_loss {new_stop:.4} is within {tolerance:.3} of mark; kept but flagged")))
}

/// Run every guard relevant to an `open_long`/`open_short` decision, in
/// order. On success the decision has been normalized in place and is
/// ready for execution.
pub fn apply_open_pipeline(config: &TraderConfig, ctx: &TradingContext, decision: &mut Decision) -> Result<(), RiskError> {
    check_open_guards(config, ctx, decision)?;
    normalize_size_and_leverage(config, ctx, decision)?;
    debug!(symbol = %decision.symbol, position_size_usd = decision.position_size_usd, leverage = decision.leverage, "open decision normalized");
    Ok(())
}

/// Actions whose `kind` is not `open_long`/`open_short` skip the open
/// pipeline entirely; the execution orchestrator calls `sanitize_stop_loss`
/// directly for `update_stop_loss` / `partial_close`.
pub fn applies_to(kind: ActionKind) -> bool {
    kind.is_open()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AiProviderConfig, ExchangeBackend, ExchangeCredentials, OrderExecutionStrategy};
    use crate::types::{AccountSummary, FeeRates, LeverageCaps, Liquidity, MarketSummary, Trend};

    fn config() -> TraderConfig {
        TraderConfig {
            id: "t1".into(),
            ai: AiProviderConfig { provider: "openai".into(), api_key: "k".into(), base_url: "u".into(), model_name: "m".into() },
            exchange: ExchangeCredentials {
                backend: ExchangeBackend::CentralizedApiKey,
                api_key: "k".into(),
                api_secret: "s".into(),
                wallet_private_key: String::new(),
                agent_wallet_address: String::new(),
            },
            account_mode: Default::default(),
            scan_interval_secs: 60,
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
            order_execution_strategy: OrderExecutionStrategy::MarketOnly,
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

    fn ctx(margin_used_pct: f64, position_count: usize, total_pnl_pct: f64, volatility: Volatility) -> TradingContext {
        TradingContext {
            current_time: chrono::Utc::now(),
            runtime_minutes: 0,
            cycle_index: 0,
            account: AccountSummary {
                total_equity: 1000.0,
                available_balance: 800.0,
                unrealized_pnl: 0.0,
                total_pnl: 0.0,
                total_pnl_pct,
                margin_used: margin_used_pct * 10.0,
                margin_used_pct,
                position_count,
            },
            positions: vec![],
            open_orders: vec![],
            candidate_symbols: vec![],
            market_data: Default::default(),
            pattern_analyses: Default::default(),
            market_summary: MarketSummary { trend: Trend::Range, volatility, liquidity: Liquidity::Normal, suggested_action: String::new(), notes: vec![] },
            timeframes: vec!["1h".into()],
            leverage_caps: LeverageCaps { major_cap: 10.0, altcoin_cap: 5.0 },
            fee_rates: FeeRates { maker: 0.0002, taker: 0.0005 },
            recent_trades: vec![],
        }
    }

    fn open_decision(confidence: f64) -> Decision {
        Decision {
            kind: ActionKind::OpenLong,
            symbol: "BTCUSDT".into(),
            reasoning: "test".into(),
            leverage: Some(5.0),
            position_size_usd: Some(100.0),
            stop_loss: Some(38000.0),
            take_profit: Some(45000.0),
            confidence: Some(confidence),
            risk_usd: None,
            new_stop_loss: None,
            new_take_profit: None,
            close_percentage: None,
            adjustment_notes: vec![],
        }
    }

    #[test]
    fn margin_used_boundary_69_9_allowed_70_0_blocked() {
        let cfg = config();
        let d = open_decision(90.0);
        assert!(check_open_guards(&cfg, &ctx(69.9, 0, 0.0, Volatility::Normal), &d).is_ok());
        assert!(check_open_guards(&cfg, &ctx(70.0, 0, 0.0, Volatility::Normal), &d).is_err());
    }

    #[test]
    fn max_positions_blocks_at_cap() {
        let cfg = config();
        let d = open_decision(90.0);
        assert!(check_open_guards(&cfg, &ctx(10.0, 2, 0.0, Volatility::Normal), &d).is_ok());
        assert!(check_open_guards(&cfg, &ctx(10.0, 3, 0.0, Volatility::Normal), &d).is_err());
    }

    #[test]
    fn drawdown_regime_requires_higher_confidence() {
        let cfg = config();
        assert!(check_open_guards(&cfg, &ctx(10.0, 0, -9.0, Volatility::Normal), &open_decision(80.0)).is_err());
        assert!(check_open_guards(&cfg, &ctx(10.0, 0, -9.0, Volatility::Normal), &open_decision(90.0)).is_ok());
    }

    #[test]
    fn extreme_volatility_blocks_opens() {
        let cfg = config();
        let d = open_decision(90.0);
        assert!(check_open_guards(&cfg, &ctx(10.0, 0, 0.0, Volatility::Extreme), &d).is_err());
    }

    #[test]
    fn normalize_clamps_oversized_request() {
        let cfg = config();
        let c = ctx(10.0, 0, 0.0, Volatility::Normal);
        let mut d = open_decision(70.0);
        d.position_size_usd = Some(1_000_000.0);
        normalize_size_and_leverage(&cfg, &c, &mut d).unwrap();
        assert!(d.position_size_usd.unwrap() < 1_000_000.0);
        assert!(d.adjustment_notes.iter().any(|n| n.contains("clamped")));
    }

    #[test]
    fn sanitize_stop_loss_replaces_anomalous_long_stop() {
        let cfg = config();
        let (price, note) = sanitize_stop_loss(&cfg, Side::Long, 100.0, 105.0);
        assert!((price - 99.8).abs() < 1e-9);
        assert!(note.unwrap().contains("replaced"));
    }

    #[test]
    fn sanitize_stop_loss_keeps_small_deviation_with_warning() {
        let cfg = config();
        let (price, note) = sanitize_stop_loss(&cfg, Side::Long, 100.0, 100.3);
        assert_eq!(price, 100.3);
        assert!(note.unwrap().contains("flagged"));
    }

    #[test]
    fn sanitize_stop_loss_short_mirrors_long() {
        let cfg = config();
        let (price, note) = sanitize_stop_loss(&cfg, Side::Short, 100.0, 95.0);
        assert!((price - 100.2).abs() < 1e-9);
        assert!(note.is_some());
    }
}
