// =============================================================================
// Error taxonomy — the process-local error kinds a trading cycle can hit
// =============================================================================
//
// Local recovery is preferred everywhere: only `ConfigError` prevents a
// trader from being created at all. Every other kind is handled at the
// point it's raised (skip the action, emit a `wait`, log and continue).
// =============================================================================

use thiserror::Error;

/// Errors raised while parsing an LLM reply into validated decisions.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("no JSON array found in reply")]
    NoJsonFound,
    #[error("malformed JSON array: {0}")]
    MalformedJson(String),
    #[error("action {index} rejected: {reason}")]
    ActionRejected { index: usize, reason: String },
}

/// Errors raised while applying a risk guard or normalizing a decision.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RiskError {
    #[error("blocked: {0}")]
    Blocked(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Errors surfaced by an exchange adapter call.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transient exchange error: {0}")]
    Transient(String),
    #[error("exchange rejected request: {0}")]
    Semantic(String),
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
}

impl ExchangeError {
    /// `true` for exchange replies that should be converted into a no-op
    /// success by the orchestrator (e.g. "no open position").
    pub fn is_already_gone(&self) -> bool {
        matches!(self, ExchangeError::Semantic(msg) if {
            let m = msg.to_lowercase();
            m.contains("no open position")
                || m.contains("position does not exist")
                || m.contains("order does not exist")
                || m.contains("unknown order")
        })
    }
}

/// Errors that prevent a trader from being constructed at all.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("unknown exchange backend: {0}")]
    UnknownExchange(String),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}
