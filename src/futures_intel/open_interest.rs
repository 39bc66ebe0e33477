// =============================================================================
// Open Interest Tracker — liquidity gauge backing the OI-floor candidate filter
// =============================================================================
//
// Open Interest (OI) is the total outstanding derivative-contract notional
// for a symbol. The engine uses it only as a liquidity floor: symbols with
// too little open interest are dropped from the candidate set before the
// LLM ever sees them (`context::filter_by_open_interest`).
// =============================================================================

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Snapshot of the current open interest for a symbol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OIState {
    /// Current open interest in contracts.
    pub current_oi: f64,
}

/// Fetches open interest data from the Binance Futures API.
pub struct OpenInterestTracker {
    client: reqwest::Client,
}

impl OpenInterestTracker {
    /// Create a new tracker with a default HTTP client.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client for OpenInterestTracker"),
        }
    }

    /// Create a tracker that re-uses an existing HTTP client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Fetch the current open interest for `symbol`.
    pub async fn fetch(&self, symbol: &str) -> Result<OIState> {
        let url = format!(
            "https://fapi.binance.com/fapi/v1/openInterest?symbol={}",
            symbol
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET open interest for {symbol}"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse open interest response")?;

        if !status.is_success() {
            anyhow::bail!("open interest API returned {}: {}", status, body);
        }

        let current_oi: f64 = body["openInterest"]
            .as_str()
            .unwrap_or("0")
            .parse()
            .unwrap_or(0.0);

        debug!(symbol, current_oi, "open interest fetched");

        Ok(OIState { current_oi })
    }
}

impl Default for OpenInterestTracker {
    fn default() -> Self {
        Self::new()
    }
}
