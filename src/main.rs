// =============================================================================
// aurora-trader — Main Entry Point
// =============================================================================
//
// Every trader starts in Paused mode for safety; an operator must flip a
// trader to Live explicitly (`AURORA_LIVE_TRADERS`) before it places real
// orders.
// =============================================================================

mod config;
mod context;
mod decision_log;
mod error;
mod exchange;
mod execution;
mod futures_intel;
mod indicators;
mod llm;
mod manager;
mod market_data;
mod parser;
mod prompt;
mod risk;
mod trader;
mod types;

use std::path::Path;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::TraderConfig;
use crate::manager::TraderManager;
use crate::types::TradingMode;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("aurora-trader starting up");

    let traders_dir = std::env::var("AURORA_TRADERS_DIR").unwrap_or_else(|_| "traders".to_string());
    let configs = load_trader_configs(&traders_dir);

    if configs.is_empty() {
        warn!(dir = %traders_dir, "no trader configs found, nothing to run");
    }

    let live_ids: Vec<String> = std::env::var("AURORA_LIVE_TRADERS")
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let manager = std::sync::Arc::new(TraderManager::new());

    for config in configs {
        let id = config.id.clone();
        match manager.start(config).await {
            Ok(()) => {
                if live_ids.iter().any(|l| l == &id) {
                    manager.set_mode(&id, TradingMode::Live);
                    info!(trader_id = %id, "trader running in Live mode");
                } else {
                    info!(trader_id = %id, "trader running in Paused mode (set AURORA_LIVE_TRADERS to enable)");
                }
            }
            Err(err) => error!(trader_id = %id, error = %err, "failed to start trader"),
        }
    }

    info!("all traders started. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping all traders");

    manager.stop_all().await;

    info!("aurora-trader shut down complete");
    Ok(())
}

/// Load every `*.json` trader config from `dir`. A single bad file is
/// logged and skipped rather than aborting startup for the rest.
fn load_trader_configs(dir: &str) -> Vec<TraderConfig> {
    let path = Path::new(dir);
    let Ok(entries) = std::fs::read_dir(path) else {
        return Vec::new();
    };

    let mut configs = Vec::new();
    for entry in entries.flatten() {
        let file_path = entry.path();
        if file_path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match TraderConfig::load(&file_path) {
            Ok(cfg) => configs.push(cfg),
            Err(err) => error!(path = %file_path.display(), error = %err, "failed to load trader config, skipping"),
        }
    }
    configs
}
