// =============================================================================
// Prompt Builder — assembles the system and user prompts sent to the LLM
// =============================================================================
//
// The system prompt is "template text + dynamic hard-constraint section +
// output-format section". Templates are named and looked up in a small
// built-in registry; an unknown name falls back to `default`, which itself
// falls back to a minimal built-in stub if the registry is ever empty.
// =============================================================================

use crate::config::TraderConfig;
use crate::types::{CandidateSymbol, PatternAnalysis, TradingContext};

const MINIMAL_STUB: &str = "You are a disciplined futures trading assistant. Respond only with the \
required <reasoning> and <decision> sections.";

/// Fixed template bodies, keyed by name. Real deployments would load these
/// from an external store; this registry exists so `system_prompt_template`
/// always resolves to *something* even with an empty config directory.
fn template_registry(name: &str) -> Option<&'static str> {
    match name {
        "default" => Some(
            "You are an autonomous futures trading agent. You manage one account and \
             must protect capital above all else. Think step by step before deciding.",
        ),
        "adaptive" => Some(
            "You are an autonomous futures trading agent operating in a regime-aware \
             mode: weight your recent trade history and the current market summary \
             more heavily than usual when sizing new positions.",
        ),
        _ => None,
    }
}

fn resolve_template(name: &str) -> &'static str {
    template_registry(name)
        .or_else(|| template_registry("default"))
        .unwrap_or(MINIMAL_STUB)
}

/// Build the system prompt: template + dynamic hard constraints + output
/// format contract, or the operator's override text if `override_base` is
/// set.
pub fn build_system_prompt(config: &TraderConfig, ctx: &TradingContext) -> String {
    let template = resolve_template(&config.system_prompt_template);

    if let Some(override_text) = &config.personal_strategy_override {
        if config.override_base {
            return format!("{override_text}\n\n{}", output_format_section());
        }
    }

    let mut prompt = String::new();
    prompt.push_str(template);
    prompt.push_str("\n\n");
    prompt.push_str(&dynamic_constraints_section(config, ctx));

    if let Some(override_text) = &config.personal_strategy_override {
        prompt.push_str("\n\n--- Operator strategy notes ---\n");
        prompt.push_str(override_text);
    }

    prompt.push_str("\n\n");
    prompt.push_str(&output_format_section());
    prompt
}

fn dynamic_constraints_section(config: &TraderConfig, ctx: &TradingContext) -> String {
    let equity = ctx.account.total_equity;
    let (altcoin_low, altcoin_high) = (equity * 2.5, equity * 5.0);
    let (major_low, major_high) = (equity * 5.0, equity * 10.0);

    format!(
        "Hard constraints for this cycle:\n\
         1. Every opened position must have an estimated reward/risk ratio of at least 3.0.\n\
         2. Hold at most {max_pos} concurrent positions.\n\
         3. Per-asset position value band (USDT): altcoins {alt_low:.0}-{alt_high:.0}, \
            BTC/ETH {maj_low:.0}-{maj_high:.0}, derived from current account equity.\n\
         4. Leverage caps: BTC/ETH up to {major_cap:.0}x, all other symbols up to {alt_cap:.0}x.\n\
         5. Total margin used must never exceed {margin_ceiling:.0}% of equity.\n\
         6. Only open a position when your confidence is 80 or higher.\n\
         7. Minimum notional per position is {min_notional_note}.",
        max_pos = config.max_concurrent_positions,
        alt_low = altcoin_low,
        alt_high = altcoin_high,
        maj_low = major_low,
        maj_high = major_high,
        major_cap = config.major_leverage_cap,
        alt_cap = config.altcoin_leverage_cap,
        margin_ceiling = config.margin_ceiling_pct,
        min_notional_note = "12 USDT for most symbols, scaling up to 60 USDT for BTC/ETH as equity grows toward 100 USDT",
    )
}

fn output_format_section() -> String {
    "Respond with exactly two sections: a <reasoning>...</reasoning> block containing your \
     free-text analysis, followed by a <decision>[...]</decision> block containing a JSON array \
     of action objects. Valid action tags and their required fields:\n\
     - open_long / open_short: symbol, leverage, position_size_usd, stop_loss, take_profit, confidence, reasoning\n\
     - close_long / close_short: symbol, reasoning\n\
     - update_stop_loss: symbol, new_stop_loss, reasoning\n\
     - update_take_profit: symbol, new_take_profit, reasoning\n\
     - partial_close: symbol, close_percentage, reasoning (optionally new_stop_loss / new_take_profit)\n\
     - hold: symbol, reasoning\n\
     - wait: symbol (\"ALL\" is acceptable), reasoning"
        .to_string()
}

/// Build the user prompt: wall-clock, cycle, account, market summary,
/// positions, candidates, recent trades and a Sharpe-like score.
pub fn build_user_prompt(ctx: &TradingContext, performance: Option<&crate::types::PerformanceStats>) -> String {
    let mut out = String::new();

    out.push_str(&format!(
        "Time: {}\nCycle: {}\nRuntime: {} minutes\n\n",
        ctx.current_time.to_rfc3339(),
        ctx.cycle_index,
        ctx.runtime_minutes
    ));

    out.push_str("Account summary:\n");
    out.push_str(&format!(
        "  total_equity={:.2} available_balance={:.2} unrealized_pnl={:.2} total_pnl_pct={:.2}% \
         margin_used_pct={:.2}% position_count={}\n",
        ctx.account.total_equity,
        ctx.account.available_balance,
        ctx.account.unrealized_pnl,
        ctx.account.total_pnl_pct,
        ctx.account.margin_used_pct,
        ctx.account.position_count,
    ));
    if ctx.account.available_balance > ctx.account.total_equity * 0.5 {
        out.push_str("  note: over half of equity is sitting idle as available balance.\n");
    }
    out.push('\n');

    out.push_str(&format!(
        "Market summary: trend={:?} volatility={:?} liquidity={:?} suggested_action={}\n",
        ctx.market_summary.trend, ctx.market_summary.volatility, ctx.market_summary.liquidity, ctx.market_summary.suggested_action
    ));
    for note in &ctx.market_summary.notes {
        out.push_str(&format!("  note: {note}\n"));
    }
    out.push('\n');

    out.push_str("Open positions:\n");
    if ctx.positions.is_empty() {
        out.push_str("  (none)\n");
    }
    for position in &ctx.positions {
        out.push_str(&format!(
            "  {} {:?} qty={:.6} entry={:.4} mark={:.4} pnl_pct={:.2}% peak_pnl_pct={:.2}% leverage={:.1}x\n",
            position.symbol,
            position.side,
            position.quantity,
            position.entry_price,
            position.mark_price,
            position.unrealized_pnl_pct,
            position.peak_pnl_pct,
            position.leverage,
        ));
        append_pattern_blocks(&mut out, ctx, &position.symbol, "    ");
    }
    out.push('\n');

    out.push_str("Candidate symbols:\n");
    for candidate in &ctx.candidate_symbols {
        out.push_str(&format!("  {}{}\n", candidate.symbol, format_sources(candidate)));
        append_pattern_blocks(&mut out, ctx, &candidate.symbol, "    ");
    }
    out.push('\n');

    out.push_str("Recent trades:\n");
    if ctx.recent_trades.is_empty() {
        out.push_str("  (none)\n");
    }
    for trade in ctx.recent_trades.iter().rev().take(10) {
        out.push_str(&format!(
            "  {} {:?} pnl={:.2} ({:.2}%) duration={}s stop_loss={}\n",
            trade.symbol, trade.side, trade.pnl, trade.pnl_pct, trade.duration_secs, trade.was_stop_loss
        ));
    }

    if let Some(stats) = performance {
        out.push_str(&format!(
            "\nPerformance: trades={} win_rate={:.1}% avg_pnl={:.2} sharpe_like={:.2}\n",
            stats.trade_count, stats.win_rate * 100.0, stats.average_pnl, stats.sharpe_like
        ));
    }

    out
}

fn format_sources(candidate: &CandidateSymbol) -> String {
    if candidate.sources.is_empty() {
        return String::new();
    }
    format!(" [{}]", candidate.sources.iter().map(|s| format!("{s:?}")).collect::<Vec<_>>().join(","))
}

fn append_pattern_blocks(out: &mut String, ctx: &TradingContext, symbol: &str, indent: &str) {
    let Some(by_timeframe) = ctx.pattern_analyses.get(symbol) else {
        return;
    };
    for timeframe in &ctx.timeframes {
        if let Some(analysis) = by_timeframe.get(timeframe) {
            out.push_str(&format!("{indent}[{timeframe}] {}\n", describe_pattern_analysis(analysis)));
        }
    }
}

fn describe_pattern_analysis(analysis: &PatternAnalysis) -> String {
    let signals = analysis
        .signals
        .iter()
        .map(|s| format!("{}({:?},{:.0}%)", s.name, s.sentiment, s.confidence))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "price={:.4} range_pos={:.1}% signals=[{signals}]",
        analysis.key_levels.current_price, analysis.key_levels.range_position_pct
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AiProviderConfig, ExchangeBackend, ExchangeCredentials, OrderExecutionStrategy};
    use crate::types::{AccountSummary, FeeRates, LeverageCaps, Liquidity, MarketSummary, Trend, Volatility};
    use std::collections::HashMap;

    fn sample_config() -> TraderConfig {
        TraderConfig {
            id: "t1".to_string(),
            ai: AiProviderConfig {
                provider: "openai".to_string(),
                api_key: "k".to_string(),
                base_url: "https://api.openai.com/v1".to_string(),
                model_name: "gpt-4o".to_string(),
            },
            exchange: ExchangeCredentials {
                backend: ExchangeBackend::CentralizedApiKey,
                api_key: "ek".to_string(),
                api_secret: "es".to_string(),
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
            default_symbols: vec!["BTCUSDT".to_string()],
            custom_symbols: vec![],
            system_prompt_template: "default".to_string(),
            personal_strategy_override: None,
            override_base: false,
            order_execution_strategy: OrderExecutionStrategy::MarketOnly,
            limit_price_offset_pct: 0.02,
            limit_timeout_secs: 20,
            timeframes: vec!["1h".to_string()],
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

    fn sample_ctx() -> TradingContext {
        TradingContext {
            current_time: chrono::Utc::now(),
            runtime_minutes: 10,
            cycle_index: 1,
            account: AccountSummary {
                total_equity: 1000.0,
                available_balance: 800.0,
                unrealized_pnl: 0.0,
                total_pnl: 0.0,
                total_pnl_pct: 0.0,
                margin_used: 200.0,
                margin_used_pct: 20.0,
                position_count: 0,
            },
            positions: vec![],
            open_orders: vec![],
            candidate_symbols: vec![],
            market_data: HashMap::new(),
            pattern_analyses: HashMap::new(),
            market_summary: MarketSummary {
                trend: Trend::Range,
                volatility: Volatility::Normal,
                liquidity: Liquidity::Normal,
                suggested_action: "observe".to_string(),
                notes: vec![],
            },
            timeframes: vec!["1h".to_string()],
            leverage_caps: LeverageCaps { major_cap: 10.0, altcoin_cap: 5.0 },
            fee_rates: FeeRates { maker: 0.0002, taker: 0.0005 },
            recent_trades: vec![],
        }
    }

    #[test]
    fn system_prompt_includes_output_format_and_constraints() {
        let prompt = build_system_prompt(&sample_config(), &sample_ctx());
        assert!(prompt.contains("open_long"));
        assert!(prompt.contains("reward/risk ratio of at least 3.0"));
        assert!(prompt.contains("80 or higher"));
    }

    #[test]
    fn override_base_replaces_template_entirely() {
        let mut config = sample_config();
        config.personal_strategy_override = Some("only trade BTCUSDT".to_string());
        config.override_base = true;
        let prompt = build_system_prompt(&config, &sample_ctx());
        assert!(prompt.starts_with("only trade BTCUSDT"));
        assert!(!prompt.contains("Hard constraints for this cycle"));
    }

    #[test]
    fn unknown_template_falls_back_to_default() {
        let mut config = sample_config();
        config.system_prompt_template = "does-not-exist".to_string();
        let prompt = build_system_prompt(&config, &sample_ctx());
        assert!(prompt.contains("autonomous futures trading agent"));
    }

    #[test]
    fn user_prompt_notes_idle_balance_above_half_equity() {
        let prompt = build_user_prompt(&sample_ctx(), None);
        assert!(prompt.contains("idle as available balance"));
    }
}
