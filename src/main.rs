// =============================================================================
// KIS Trading Gateway — Main Entry Point
// =============================================================================
//
// Startup order: env + logging, configuration, engine graph, then the
// background activities (streaming ingest, dispatch worker, reconciliation)
// and the HTTP surface. Missing credentials never abort startup — the
// live-readiness probe keeps the trading gate closed until the env is fixed.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod config;
mod error;
mod kis;
mod market_hours;
mod order;
mod quote;
mod risk;
mod session;
mod types;
mod upstream;

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::KisConfig;
use crate::kis::KisWsClient;
use crate::upstream::ApprovalKeyIssuer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║           KIS Trading Gateway — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = KisConfig::from_env();
    let missing = config.missing_required();
    if !missing.is_empty() {
        warn!(
            missing = ?missing,
            "required configuration incomplete — trading gate stays closed"
        );
    }

    // ── 2. Build shared state ────────────────────────────────────────────
    let (state, rest_client) = AppState::with_kis(config);
    let state = Arc::new(state);

    // ── 3. Streaming ingest task ─────────────────────────────────────────
    let issuer: Arc<dyn ApprovalKeyIssuer> = rest_client.clone();
    let ws_client = Arc::new(KisWsClient::new(
        state.config.ws_url().to_string(),
        state.config.ws_symbols.clone(),
        issuer,
        state.quote_ingest.clone(),
    ));
    let ws_runner = ws_client.clone();
    let ws_task = tokio::spawn(async move {
        let recovered = ws_runner.run().await;
        if !recovered {
            warn!("streaming client exhausted its reconnect budget — REST fallback remains active");
        }
    });
    info!(
        url = %state.config.ws_url(),
        symbols = ?state.config.ws_symbols,
        "streaming ingest launched"
    );

    // ── 4. Order dispatch & reconciliation workers ───────────────────────
    state.dispatcher.start();
    state.reconciler.start();

    // ── 5. HTTP surface ──────────────────────────────────────────────────
    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&state.config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", state.config.bind_addr))?;
    info!(addr = %state.config.bind_addr, "API server listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "API server exited");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    ws_client.stop();
    state.dispatcher.stop().await;
    state.reconciler.stop().await;
    ws_task.abort();
    server.abort();

    info!("KIS Trading Gateway shut down complete.");
    Ok(())
}
