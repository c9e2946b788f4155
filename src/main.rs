// =============================================================================
// Polaris Portfolio Nexus — Main Entry Point
// =============================================================================
//
// Wires the portfolio state engine together: configuration, the Polymarket
// gateway, the tracker with its background refresh loop, and a read-only
// REST surface for dashboards and sibling services.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod address;
mod api;
mod breaker;
mod caches;
mod dedup;
mod enrich;
mod entry_meta;
mod onchain;
mod outcome;
mod polymarket;
mod position;
mod runtime_config;
#[cfg(test)]
mod testutil;
mod tracker;
mod types;
mod validate;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::polymarket::client::PolymarketClient;
use crate::runtime_config::EngineConfig;
use crate::tracker::PortfolioTracker;

/// Conditional-Tokens contract on Polygon.
const DEFAULT_CTF_ADDRESS: &str = "0x4D97DCd97eC945f40cF65F87097ACe5EA0476045";

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Polaris Portfolio Nexus — Starting Up            ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = EngineConfig::load("runtime_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });

    let eoa = std::env::var("POLARIS_ADDRESS").unwrap_or_default();
    if eoa.is_empty() {
        anyhow::bail!("POLARIS_ADDRESS is not set — the engine needs the trader's EOA address");
    }

    let positions_base = env_or("POLARIS_DATA_API", "https://data-api.polymarket.com");
    let gamma_base = env_or("POLARIS_GAMMA_API", "https://gamma-api.polymarket.com");
    let clob_base = env_or("POLARIS_CLOB_API", "https://clob.polymarket.com");
    let rpc_url = env_or("POLARIS_RPC_URL", "https://polygon-rpc.com");
    let ctf_address = env_or("POLARIS_CTF_ADDRESS", DEFAULT_CTF_ADDRESS);

    info!(
        eoa = %eoa,
        refresh_interval_ms = config.refresh_interval_ms,
        positions_base = %positions_base,
        gamma_base = %gamma_base,
        clob_base = %clob_base,
        "engine configured"
    );

    // ── 2. Gateway & tracker ─────────────────────────────────────────────
    let gateway = Arc::new(PolymarketClient::new(
        positions_base,
        gamma_base,
        clob_base,
        rpc_url,
        ctf_address,
        config.api_timeout_ms,
    ));

    let save_config = config.clone();
    let tracker = Arc::new(PortfolioTracker::new(gateway, eoa, config));

    // ── 3. Background refresh loop ───────────────────────────────────────
    tokio::spawn(tracker.clone().run());

    // ── 4. REST surface ──────────────────────────────────────────────────
    let bind_addr = env_or("POLARIS_BIND_ADDR", "0.0.0.0:3001");
    let api_tracker = tracker.clone();
    let api_bind = bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_tracker);
        let listener = tokio::net::TcpListener::bind(&api_bind)
            .await
            .expect("Failed to bind API server");
        info!(addr = %api_bind, "API server listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    if let Err(e) = save_config.save("runtime_config.json") {
        error!(error = %e, "Failed to save engine config on shutdown");
    }

    info!("Polaris Portfolio Nexus shut down complete.");
    Ok(())
}
