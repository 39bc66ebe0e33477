// =============================================================================
// Decision Parser — turns a noisy LLM text reply into validated actions
// =============================================================================
//
// The reply is expected to carry a `<reasoning>` block and a `<decision>`
// block wrapping a fenced JSON array, but real replies are messy: missing
// tags, full-width punctuation from a CJK-tuned model, stray thousands
// separators. This module never fails the cycle — when no JSON can be
// recovered at all it synthesizes a single `wait` action so the trader loop
// always has something to execute.
// =============================================================================

use serde_json::Value;

use crate::error::ParseError;
use crate::types::{ActionKind, Decision, LeverageCaps, MinNotionalLadder};

/// Assumed entry-to-stop distance, as a fraction of the stop price, used to
/// estimate reward/risk when the reply carries no actual entry price.
const ASSUMED_ENTRY_OFFSET_PCT: f64 = 0.01;

/// Inputs needed to validate numeric fields against account state.
pub struct ParseContext {
    pub equity: f64,
    pub leverage_caps: LeverageCaps,
    pub taker_fee_rate: f64,
    pub min_notional: MinNotionalLadder,
    pub min_confidence: f64,
    pub min_rr_ratio: f64,
}

/// Everything the parser produced for one LLM reply.
pub struct ParseOutcome {
    pub reasoning: String,
    pub decisions: Vec<Decision>,
    pub rejections: Vec<ParseError>,
    pub used_fallback: bool,
}

/// Minimum notional for `symbol` at the given account `equity`, under the
/// trader's configured ladder (BTC/ETH piecewise-linear between 20 and 100
/// USDT equity; every other symbol flat).
pub fn min_notional_usd(symbol: &str, equity: f64, ladder: &MinNotionalLadder) -> f64 {
    ladder.for_symbol(symbol, equity)
}

/// Parse one LLM reply into a reasoning trace and a validated action list.
pub fn parse_reply(raw_reply: &str, ctx: &ParseContext) -> ParseOutcome {
    let sanitized = sanitize(raw_reply);
    let (reasoning, json_text) = extract(&sanitized);

    let Some(json_text) = json_text else {
        return fallback_outcome(&reasoning);
    };

    let json_text = collapse_array_brace_gap(&json_text);

    if has_invalid_numeric_tokens(&json_text) {
        return fallback_outcome(&reasoning);
    }

    let Ok(raw_actions) = serde_json::from_str::<Vec<Value>>(&json_text) else {
        return fallback_outcome(&reasoning);
    };

    let mut decisions = Vec::with_capacity(raw_actions.len());
    let mut rejections = Vec::new();

    for (index, raw) in raw_actions.iter().enumerate() {
        match validate_action(index, raw, ctx) {
            Ok(decision) => decisions.push(decision),
            Err(e) => rejections.push(e),
        }
    }

    ParseOutcome {
        reasoning,
        decisions,
        rejections,
        used_fallback: false,
    }
}

fn fallback_outcome(reasoning_trace: &str) -> ParseOutcome {
    let snippet: String = reasoning_trace.chars().take(240).collect();
    ParseOutcome {
        reasoning: reasoning_trace.to_string(),
        decisions: vec![Decision::bare(ActionKind::Wait, "ALL", snippet)],
        rejections: vec![ParseError::NoJsonFound],
        used_fallback: true,
    }
}

// =============================================================================
// Extraction protocol — four fallbacks in order
// =============================================================================

fn extract(reply: &str) -> (String, Option<String>) {
    let has_reasoning_tag = reply.contains("<reasoning>") && reply.contains("</reasoning>");
    let has_decision_tag = reply.contains("<decision>") && reply.contains("</decision>");

    if has_reasoning_tag && has_decision_tag {
        let reasoning = extract_between(reply, "<reasoning>", "</reasoning>").unwrap_or_default();
        let decision_block = extract_between(reply, "<decision>", "</decision>").unwrap_or_default();
        return (reasoning.trim().to_string(), extract_json_array(&decision_block));
    }

    if has_decision_tag {
        let idx = reply.find("<decision>").expect("has_decision_tag checked");
        let reasoning = reply[..idx].trim().to_string();
        let decision_block = extract_between(reply, "<decision>", "</decision>").unwrap_or_default();
        return (reasoning, extract_json_array(&decision_block));
    }

    if let Some(json_text) = extract_json_array(reply) {
        let idx = reply.find('[').expect("extract_json_array found a '['");
        let reasoning = reply[..idx].trim().to_string();
        return (reasoning, Some(json_text));
    }

    (reply.trim().to_string(), None)
}

fn extract_between(s: &str, start_tag: &str, end_tag: &str) -> Option<String> {
    let start = s.find(start_tag)? + start_tag.len();
    let end = s[start..].find(end_tag)? + start;
    Some(s[start..end].to_string())
}

fn extract_json_array(s: &str) -> Option<String> {
    let start = s.find('[')?;
    let end = s.rfind(']')?;
    if end < start {
        return None;
    }
    Some(s[start..=end].to_string())
}

// =============================================================================
// Sanitization
// =============================================================================

/// Strip zero-width characters/BOM and normalize full-width/CJK punctuation
/// to ASCII equivalents. Idempotent: running it twice is a no-op.
fn sanitize(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, '\u{FEFF}' | '\u{200B}' | '\u{200C}' | '\u{200D}'))
        .map(|c| match c {
            '［' => '[',
            '］' => ']',
            '｛' => '{',
            '｝' => '}',
            '：' => ':',
            '，' => ',',
            '【' => '[',
            '】' => ']',
            '〔' => '[',
            '〕' => ']',
            '、' => ',',
            '\u{3000}' => ' ',
            '“' | '”' => '"',
            '‘' | '’' => '\'',
            other => other,
        })
        .collect()
}

/// Collapse `[ {` (any whitespace between the array open and the first
/// object open) at the very start of the array into `[{`.
fn collapse_array_brace_gap(s: &str) -> String {
    let trimmed = s.trim_start();
    let leading_ws_len = s.len() - trimmed.len();

    if let Some(rest) = trimmed.strip_prefix('[') {
        let after_bracket = rest.trim_start();
        if after_bracket.starts_with('{') {
            let mut out = String::with_capacity(s.len());
            out.push_str(&s[..leading_ws_len]);
            out.push('[');
            out.push_str(after_bracket);
            return out;
        }
    }
    s.to_string()
}

/// Quote-aware scan that flags `~` range notation or thousands-separator
/// commas sitting inside a bare number (both outside string literals).
fn has_invalid_numeric_tokens(s: &str) -> bool {
    let chars: Vec<char> = s.chars().collect();
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        if c == '"' {
            in_string = true;
            i += 1;
            continue;
        }

        if c == '~' {
            let prev_digit = i > 0 && chars[i - 1].is_ascii_digit();
            let next_digit = i + 1 < chars.len() && chars[i + 1].is_ascii_digit();
            if prev_digit || next_digit {
                return true;
            }
        }

        if c.is_ascii_digit() && chars.get(i + 1) == Some(&',') {
            let three_after = chars.get(i + 2).is_some_and(char::is_ascii_digit)
                && chars.get(i + 3).is_some_and(char::is_ascii_digit)
                && chars.get(i + 4).is_some_and(char::is_ascii_digit);
            if three_after {
                return true;
            }
        }

        i += 1;
    }

    false
}

// =============================================================================
// Per-action validation
// =============================================================================

fn validate_action(index: usize, raw: &Value, ctx: &ParseContext) -> Result<Decision, ParseError> {
    let reject = |reason: &str| ParseError::ActionRejected {
        index,
        reason: reason.to_string(),
    };

    let kind_str = raw["action"].as_str().ok_or_else(|| reject("missing 'action' field"))?;
    let kind = ActionKind::from_str_loose(kind_str).ok_or_else(|| reject("unrecognized action tag"))?;
    let symbol = raw["symbol"].as_str().unwrap_or("").to_string();
    let reasoning = raw["reasoning"].as_str().unwrap_or("").to_string();

    match kind {
        ActionKind::OpenLong | ActionKind::OpenShort => {
            validate_open_action(index, kind, symbol, reasoning, raw, ctx)
        }
        ActionKind::UpdateStopLoss => {
            let new_stop_loss = raw["new_stop_loss"].as_f64().filter(|v| *v > 0.0).ok_or_else(|| reject("new_stop_loss must be > 0"))?;
            let mut d = Decision::bare(kind, symbol, reasoning);
            d.new_stop_loss = Some(new_stop_loss);
            Ok(d)
        }
        ActionKind::UpdateTakeProfit => {
            let new_take_profit = raw["new_take_profit"].as_f64().filter(|v| *v > 0.0).ok_or_else(|| reject("new_take_profit must be > 0"))?;
            let mut d = Decision::bare(kind, symbol, reasoning);
            d.new_take_profit = Some(new_take_profit);
            Ok(d)
        }
        ActionKind::PartialClose => {
            let close_percentage = raw["close_percentage"]
                .as_f64()
                .filter(|v| *v > 0.0 && *v <= 100.0)
                .ok_or_else(|| reject("close_percentage must be in (0, 100]"))?;
            let mut d = Decision::bare(kind, symbol, reasoning);
            d.close_percentage = Some(close_percentage);
            d.new_stop_loss = raw["new_stop_loss"].as_f64().filter(|v| *v > 0.0);
            d.new_take_profit = raw["new_take_profit"].as_f64().filter(|v| *v > 0.0);
            Ok(d)
        }
        ActionKind::CloseLong | ActionKind::CloseShort | ActionKind::Hold | ActionKind::Wait => {
            let mut d = Decision::bare(kind, symbol, reasoning);
            d.new_stop_loss = raw["new_stop_loss"].as_f64().filter(|v| *v > 0.0);
            d.new_take_profit = raw["new_take_profit"].as_f64().filter(|v| *v > 0.0);
            Ok(d)
        }
    }
}

fn validate_open_action(
    index: usize,
    kind: ActionKind,
    symbol: String,
    reasoning: String,
    raw: &Value,
    ctx: &ParseContext,
) -> Result<Decision, ParseError> {
    let reject = |reason: String| ParseError::ActionRejected { index, reason };

    let confidence = raw["confidence"].as_f64().ok_or_else(|| reject("confidence is required".to_string()))?;
    if confidence < ctx.min_confidence {
        return Err(reject(format!("confidence {confidence} below the required {}", ctx.min_confidence)));
    }

    let requested_leverage = raw["leverage"]
        .as_f64()
        .filter(|v| *v > 0.0)
        .ok_or_else(|| reject("leverage must be > 0".to_string()))?;

    let cap = ctx.leverage_caps.cap_for_symbol(&symbol);
    let mut adjustment_notes = Vec::new();
    let leverage = if requested_leverage > cap {
        adjustment_notes.push(format!("leverage clamped from {requested_leverage} to cap {cap}"));
        cap
    } else {
        requested_leverage
    };

    let mut position_size_usd = raw["position_size_usd"]
        .as_f64()
        .filter(|v| *v > 0.0)
        .ok_or_else(|| reject("position_size_usd must be > 0".to_string()))?;

    let stop_loss = raw["stop_loss"].as_f64().filter(|v| *v > 0.0).ok_or_else(|| reject("stop_loss must be > 0".to_string()))?;
    let take_profit = raw["take_profit"]
        .as_f64()
        .filter(|v| *v > 0.0)
        .ok_or_else(|| reject("take_profit must be > 0".to_string()))?;

    let ordering_ok = match kind {
        ActionKind::OpenLong => stop_loss < take_profit,
        ActionKind::OpenShort => stop_loss > take_profit,
        _ => unreachable!("validate_open_action only called for open_long/open_short"),
    };
    if !ordering_ok {
        return Err(reject("stop/take ordering inconsistent with direction".to_string()));
    }

    // No actual entry price is available from the reply, so one is assumed:
    // a tight 1% of the stop price away from the stop itself, on the side of
    // take-profit. Risk is that fixed offset; reward is whatever distance to
    // take-profit remains once it's subtracted out, so the ratio tracks the
    // real stop/take spread instead of collapsing to a fixed constant.
    let assumed_entry_offset = ASSUMED_ENTRY_OFFSET_PCT * stop_loss;
    let (risk, reward) = match kind {
        ActionKind::OpenLong => (assumed_entry_offset, take_profit - (stop_loss + assumed_entry_offset)),
        ActionKind::OpenShort => (assumed_entry_offset, (stop_loss - assumed_entry_offset) - take_profit),
        _ => unreachable!("validate_open_action only called for open_long/open_short"),
    };
    let rr = if risk > 0.0 { reward / risk } else { 0.0 };
    if rr < ctx.min_rr_ratio {
        return Err(reject(format!("reward/risk ratio {rr:.2} below the required {:.1}", ctx.min_rr_ratio)));
    }

    let min_notional = min_notional_usd(&symbol, ctx.equity, &ctx.min_notional);
    if position_size_usd < min_notional {
        let required_margin = min_notional / leverage + min_notional * ctx.taker_fee_rate;
        if required_margin > ctx.equity {
            return Err(reject(format!(
                "account cannot afford the {min_notional:.2} USDT minimum notional for {symbol}"
            )));
        }
        adjustment_notes.push(format!("position_size_usd raised from {position_size_usd} to minimum notional {min_notional:.2}"));
        position_size_usd = min_notional;
    }

    let risk_usd = raw["risk_usd"].as_f64();

    Ok(Decision {
        kind,
        symbol,
        reasoning,
        leverage: Some(leverage),
        position_size_usd: Some(position_size_usd),
        stop_loss: Some(stop_loss),
        take_profit: Some(take_profit),
        confidence: Some(confidence),
        risk_usd,
        new_stop_loss: None,
        new_take_profit: None,
        close_percentage: None,
        adjustment_notes,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LeverageCaps;

    fn ctx() -> ParseContext {
        ParseContext {
            equity: 1000.0,
            leverage_caps: LeverageCaps { major_cap: 10.0, altcoin_cap: 5.0 },
            taker_fee_rate: 0.0005,
            min_notional: MinNotionalLadder { others: 12.0, major_floor: 12.0, major_ceiling: 60.0 },
            min_confidence: 80.0,
            min_rr_ratio: 3.0,
        }
    }

    #[test]
    fn no_json_falls_back_to_wait() {
        let reply = "<reasoning>market unclear</reasoning>";
        let outcome = parse_reply(reply, &ctx());
        assert!(outcome.used_fallback);
        assert_eq!(outcome.decisions.len(), 1);
        assert_eq!(outcome.decisions[0].kind, ActionKind::Wait);
        assert_eq!(outcome.decisions[0].symbol, "ALL");
        assert!(outcome.reasoning.contains("market unclear"));
    }

    #[test]
    fn both_tags_present_parses_cleanly() {
        let reply = r#"<reasoning>looks bullish</reasoning><decision>[{"action":"hold","symbol":"BTCUSDT","reasoning":"wait for confirmation"}]</decision>"#;
        let outcome = parse_reply(reply, &ctx());
        assert!(!outcome.used_fallback);
        assert_eq!(outcome.reasoning, "looks bullish");
        assert_eq!(outcome.decisions.len(), 1);
        assert_eq!(outcome.decisions[0].kind, ActionKind::Hold);
    }

    #[test]
    fn bare_json_array_without_tags_is_recovered() {
        let reply = r#"here is my plan [{"action":"wait","symbol":"ALL","reasoning":"no edge"}] end"#;
        let outcome = parse_reply(reply, &ctx());
        assert!(!outcome.used_fallback);
        assert_eq!(outcome.reasoning, "here is my plan");
        assert_eq!(outcome.decisions.len(), 1);
    }

    #[test]
    fn confidence_79_is_rejected_80_is_accepted() {
        let low = r#"[{"action":"open_long","symbol":"BTCUSDT","leverage":5,"position_size_usd":500,"stop_loss":38000,"take_profit":45000,"confidence":79}]"#;
        let outcome_low = parse_reply(low, &ctx());
        assert_eq!(outcome_low.decisions.len(), 0);
        assert_eq!(outcome_low.rejections.len(), 1);

        let high = r#"[{"action":"open_long","symbol":"BTCUSDT","leverage":5,"position_size_usd":500,"stop_loss":38000,"take_profit":45000,"confidence":80}]"#;
        let outcome_high = parse_reply(high, &ctx());
        assert_eq!(outcome_high.decisions.len(), 1);
    }

    #[test]
    fn leverage_above_cap_is_clamped_not_rejected() {
        let reply = r#"[{"action":"open_long","symbol":"SOLUSDT","leverage":50,"position_size_usd":500,"stop_loss":100,"take_profit":200,"confidence":90}]"#;
        let outcome = parse_reply(reply, &ctx());
        assert_eq!(outcome.decisions.len(), 1);
        assert_eq!(outcome.decisions[0].leverage, Some(5.0));
        assert!(outcome.decisions[0].adjustment_notes.iter().any(|n| n.contains("clamped")));
    }

    #[test]
    fn low_reward_risk_is_rejected() {
        // SOL capped at 5x; stop just below take -> RR well under 3.0.
        let reply = r#"[{"action":"open_long","symbol":"SOLUSDT","leverage":50,"position_size_usd":200,"stop_loss":150,"take_profit":155,"confidence":90}]"#;
        let outcome = parse_reply(reply, &ctx());
        assert_eq!(outcome.decisions.len(), 0);
        assert_eq!(outcome.rejections.len(), 1);
    }

    #[test]
    fn minimum_notional_ladder_boundaries() {
        let ladder = MinNotionalLadder { others: 12.0, major_floor: 12.0, major_ceiling: 60.0 };
        assert_eq!(min_notional_usd("BTCUSDT", 19.0, &ladder), 12.0);
        assert_eq!(min_notional_usd("BTCUSDT", 20.0, &ladder), 12.0);
        assert!((min_notional_usd("BTCUSDT", 60.0, &ladder) - 36.0).abs() < 1e-9);
        assert_eq!(min_notional_usd("BTCUSDT", 100.0, &ladder), 60.0);
        assert_eq!(min_notional_usd("BTCUSDT", 10_000.0, &ladder), 60.0);
        assert_eq!(min_notional_usd("XRPUSDT", 10_000.0, &ladder), 12.0);
    }

    #[test]
    fn position_size_below_minimum_is_raised() {
        let reply = r#"[{"action":"open_long","symbol":"BTCUSDT","leverage":5,"position_size_usd":5,"stop_loss":38000,"take_profit":45000,"confidence":90}]"#;
        let mut c = ctx();
        c.equity = 1000.0;
        let outcome = parse_reply(reply, &c);
        assert_eq!(outcome.decisions.len(), 1);
        assert_eq!(outcome.decisions[0].position_size_usd, Some(60.0));
    }

    #[test]
    fn fullwidth_punctuation_is_normalized_idempotently() {
        let once = sanitize("［｛“hello”｝］");
        let twice = sanitize(&once);
        assert_eq!(once, twice);
        assert_eq!(once, "[{\"hello\"}]");
    }

    #[test]
    fn tilde_range_notation_triggers_fallback() {
        let reply = r#"[{"action":"open_long","symbol":"BTCUSDT","leverage":5,"position_size_usd":100~200,"stop_loss":38000,"take_profit":45000,"confidence":90}]"#;
        let outcome = parse_reply(reply, &ctx());
        assert!(outcome.used_fallback);
    }

    #[test]
    fn thousands_comma_triggers_fallback() {
        let reply = r#"[{"action":"open_long","symbol":"BTCUSDT","leverage":5,"position_size_usd":1,234,"stop_loss":38000,"take_profit":45000,"confidence":90}]"#;
        let outcome = parse_reply(reply, &ctx());
        assert!(outcome.used_fallback);
    }
}
