// =============================================================================
// Futures Intelligence Module
// =============================================================================
//
// Only the open-interest tracker survives here: the market/pattern
// collaborator needs a symbol's OpenInterest notional to enforce the
// context builder's liquidity floor, nothing else in this signal family is
// consumed.
// =============================================================================

pub mod open_interest;
