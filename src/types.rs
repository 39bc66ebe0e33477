// =============================================================================
// Shared data model — the Trading Context, Positions, Decisions and records
// that flow through a single trader cycle
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Operational modes
// =============================================================================

/// Whether a trader is actively trading, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Whether the trader runs against real funds or a paper-trading exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Demo,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

// =============================================================================
// Directional enums
// =============================================================================

/// Long or short side of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// Coarse market trend classification used in the market summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    StrongBull,
    Bull,
    Range,
    Bear,
    StrongBear,
    Unknown,
}

/// Coarse volatility classification used in the market summary and risk guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Volatility {
    Low,
    Normal,
    High,
    Extreme,
    Unknown,
}

/// Coarse liquidity classification used in the market summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liquidity {
    Low,
    Normal,
    High,
    Unknown,
}

/// Source(s) that nominated a symbol as a trading candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    UserSelected,
    Default,
    Ai500,
    OiTop,
    Custom,
}

// =============================================================================
// Account / position / order snapshots
// =============================================================================

/// Account-level balances for the current cycle, derived from the exchange
/// balance snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct AccountSummary {
    pub total_equity: f64,
    pub available_balance: f64,
    pub unrealized_pnl: f64,
    pub total_pnl: f64,
    pub total_pnl_pct: f64,
    pub margin_used: f64,
    pub margin_used_pct: f64,
    pub position_count: usize,
}

/// A single open position, reconciled from the exchange each cycle.
///
/// `side` and `quantity > 0` together encode direction. A trader holds at
/// most one `Position` per `(symbol, side)`; holding both sides of the same
/// symbol simultaneously is an anomaly that is flagged but never
/// automatically resolved (see `Trader::detect_double_sided_anomalies`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub mark_price: f64,
    pub quantity: f64,
    pub leverage: f64,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,
    /// Monotonic high-water mark of `unrealized_pnl_pct`, kept locally by the
    /// trader (not the exchange) and cleared when the position disappears.
    pub peak_pnl_pct: f64,
    pub liquidation_price: f64,
    pub margin_used: f64,
    /// First local timestamp at which this position was observed: "now" on
    /// the first cycle a position is seen, which can diverge from the true
    /// exchange entry time on a cold start. That divergence is accepted, not
    /// worked around.
    pub update_time: DateTime<Utc>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

impl Position {
    pub fn key(&self) -> (String, Side) {
        (self.symbol.clone(), self.side)
    }
}

/// An order resting on the exchange, not yet filled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub symbol: String,
    pub order_id: String,
    pub order_type: OrderType,
    pub side: Side,
    pub quantity: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
    StopMarket,
    TakeProfitMarket,
}

// =============================================================================
// Candidate symbols / market data / pattern analysis
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateSymbol {
    pub symbol: String,
    pub sources: Vec<CandidateSource>,
}

/// Fresh per-symbol market data from the market-data collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketData {
    pub symbol: String,
    pub last_price: f64,
    pub change_1h_pct: f64,
    pub change_4h_pct: f64,
    pub ema_fast: Option<f64>,
    pub ema_slow: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub rsi_14: Option<f64>,
    pub open_interest_notional: f64,
    /// Raw candles per configured timeframe, closed candles only.
    pub candles: HashMap<String, Vec<Candle>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub open_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time_ms: i64,
}

/// Sentiment of a detected chart pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternSentiment {
    Bullish,
    Bearish,
    Neutral,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternSignal {
    pub name: String,
    pub sentiment: PatternSentiment,
    pub confidence: f64,
    pub description: String,
    /// Index into the candle slice where the pattern was detected.
    pub position_index: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrendLineSegment {
    pub start_index: usize,
    pub start_price: f64,
    pub end_index: usize,
    pub end_price: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KeyLevels {
    pub current_price: f64,
    pub high_20: f64,
    pub low_20: f64,
    pub range_position_pct: f64,
}

/// Output of the pattern-analysis collaborator for one (symbol, timeframe).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternAnalysis {
    pub timeframe: String,
    pub signals: Vec<PatternSignal>,
    pub support_levels: Vec<f64>,
    pub resistance_levels: Vec<f64>,
    pub trend_lines: Vec<TrendLineSegment>,
    pub key_levels: KeyLevels,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSummary {
    pub trend: Trend,
    pub volatility: Volatility,
    pub liquidity: Liquidity,
    pub suggested_action: String,
    pub notes: Vec<String>,
}

// =============================================================================
// Trading context (cycle-local)
// =============================================================================

/// Leverage caps for the "major" tier (BTC/ETH) and the altcoin tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LeverageCaps {
    pub major_cap: f64,
    pub altcoin_cap: f64,
}

impl LeverageCaps {
    pub fn cap_for_symbol(&self, symbol: &str) -> f64 {
        if is_major_symbol(symbol) {
            self.major_cap
        } else {
            self.altcoin_cap
        }
    }
}

/// `true` for the two symbols that get the wider leverage/position-sizing
/// bands throughout the risk pipeline.
pub fn is_major_symbol(symbol: &str) -> bool {
    matches!(symbol, "BTCUSDT" | "ETHUSDT")
}

/// Piecewise-linear minimum-notional ladder, configurable per trader:
/// BTC/ETH run `major_floor` -> `major_ceiling` between 20 and 100 USDT
/// equity; every other symbol is flat at `others`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MinNotionalLadder {
    pub others: f64,
    pub major_floor: f64,
    pub major_ceiling: f64,
}

impl MinNotionalLadder {
    pub fn for_symbol(&self, symbol: &str, equity: f64) -> f64 {
        if !is_major_symbol(symbol) {
            return self.others;
        }
        if equity < 20.0 {
            self.major_floor
        } else if equity < 100.0 {
            let frac = (equity - 20.0) / (100.0 - 20.0);
            self.major_floor + frac * (self.major_ceiling - self.major_floor)
        } else {
            self.major_ceiling
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeRates {
    pub maker: f64,
    pub taker: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentTradeOutcome {
    pub symbol: String,
    pub side: Side,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub open_price: f64,
    pub close_price: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub leverage: f64,
    pub was_stop_loss: bool,
    pub duration_secs: i64,
}

/// Cycle-local snapshot of everything the prompt builder and risk guards
/// need. Recreated fresh every tick; never mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingContext {
    pub current_time: DateTime<Utc>,
    pub runtime_minutes: i64,
    pub cycle_index: u64,
    pub account: AccountSummary,
    pub positions: Vec<Position>,
    pub open_orders: Vec<OpenOrder>,
    pub candidate_symbols: Vec<CandidateSymbol>,
    pub market_data: HashMap<String, MarketData>,
    pub pattern_analyses: HashMap<String, HashMap<String, PatternAnalysis>>,
    pub market_summary: MarketSummary,
    pub timeframes: Vec<String>,
    pub leverage_caps: LeverageCaps,
    pub fee_rates: FeeRates,
    pub recent_trades: Vec<RecentTradeOutcome>,
}

// =============================================================================
// Decisions (LLM actions)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    UpdateStopLoss,
    UpdateTakeProfit,
    PartialClose,
    Hold,
    Wait,
}

impl ActionKind {
    pub fn from_str_loose(s: &str) -> Option<Self> {
        Some(match s.trim().to_lowercase().as_str() {
            "open_long" => Self::OpenLong,
            "open_short" => Self::OpenShort,
            "close_long" => Self::CloseLong,
            "close_short" => Self::CloseShort,
            "update_stop_loss" => Self::UpdateStopLoss,
            "update_take_profit" => Self::UpdateTakeProfit,
            "partial_close" => Self::PartialClose,
            "hold" => Self::Hold,
            "wait" => Self::Wait,
            _ => return None,
        })
    }

    /// Execution priority: close (1) -> update (2) -> open (3) -> hold/wait (4).
    pub fn priority(&self) -> u8 {
        match self {
            Self::CloseLong | Self::CloseShort | Self::PartialClose => 1,
            Self::UpdateStopLoss | Self::UpdateTakeProfit => 2,
            Self::OpenLong | Self::OpenShort => 3,
            Self::Hold | Self::Wait => 4,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::OpenLong | Self::OpenShort)
    }

    pub fn side(&self) -> Option<Side> {
        match self {
            Self::OpenLong | Self::CloseLong => Some(Side::Long),
            Self::OpenShort | Self::CloseShort => Some(Side::Short),
            _ => None,
        }
    }
}

/// A single validated trading action. Fields only meaningful for specific
/// `kind`s are `Option`s, enforced by the parser's per-action validation
/// rather than by the type system, since the upstream reply is dynamically
/// typed and only becomes a static action after parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub kind: ActionKind,
    pub symbol: String,
    pub reasoning: String,

    // open_* fields
    pub leverage: Option<f64>,
    pub position_size_usd: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub confidence: Option<f64>,
    pub risk_usd: Option<f64>,

    // update_stop_loss / update_take_profit
    pub new_stop_loss: Option<f64>,
    pub new_take_profit: Option<f64>,

    // partial_close
    pub close_percentage: Option<f64>,

    /// Notes appended by the normalizer/risk-guard chain (clamps, raises,
    /// warnings). Not part of the LLM's reply.
    #[serde(default)]
    pub adjustment_notes: Vec<String>,
}

impl Decision {
    /// A minimally-populated decision for a tag that carries only reasoning
    /// (`close_*`, `hold`, `wait`), or as the synthesized safe fallback.
    pub fn bare(kind: ActionKind, symbol: impl Into<String>, reasoning: impl Into<String>) -> Self {
        Self {
            kind,
            symbol: symbol.into(),
            reasoning: reasoning.into(),
            leverage: None,
            position_size_usd: None,
            stop_loss: None,
            take_profit: None,
            confidence: None,
            risk_usd: None,
            new_stop_loss: None,
            new_take_profit: None,
            close_percentage: None,
            adjustment_notes: Vec::new(),
        }
    }
}

/// The LLM's full reply for a cycle, before execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullDecision {
    pub system_prompt: String,
    pub user_prompt: String,
    pub reasoning: String,
    pub decisions: Vec<Decision>,
    pub timestamp: DateTime<Utc>,
    pub llm_latency_ms: u64,
}

// =============================================================================
// Execution records / decision log
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionAction {
    pub kind: ActionKind,
    pub symbol: String,
    pub quantity: Option<f64>,
    pub leverage: Option<f64>,
    pub price: Option<f64>,
    pub order_id: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub realized_pnl: Option<f64>,
    pub close_reason: Option<CloseReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Liquidation,
    StopLoss,
    TakeProfit,
    Manual,
    Unknown,
}

/// Persisted per-cycle record, appended even when parsing fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Unique id for this record (UUID v4), so one cycle can be cited
    /// unambiguously from outside the process.
    pub id: String,
    pub trader_id: String,
    pub exchange: String,
    pub cycle_index: u64,
    pub timestamp: DateTime<Utc>,
    pub account: AccountSummary,
    pub positions: Vec<Position>,
    pub candidate_symbols: Vec<CandidateSymbol>,
    pub system_prompt: String,
    pub user_prompt: String,
    pub reasoning: String,
    pub decisions: Vec<Decision>,
    pub actions: Vec<DecisionAction>,
    pub success: bool,
    pub error: Option<String>,
    pub log_lines: Vec<String>,
}

/// Aggregate performance statistics returned by the decision-log
/// collaborator's performance-analysis call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct PerformanceStats {
    pub trade_count: usize,
    pub win_rate: f64,
    pub average_pnl: f64,
    pub average_pnl_pct: f64,
    pub sharpe_like: f64,
}
