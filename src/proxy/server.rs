//! Proxy server setup and initialization

use anyhow::{Context, Result};
use axum::routing::{any, get};
use axum::{Json, Router};
use tokio::net::TcpListener;

use super::handler::proxy_handler;
use super::state::ProxyState;

/// Assemble the full router: liveness, management API, and the
/// catch-all proxy surface.
pub fn build_router(state: ProxyState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .merge(crate::mgmt::routes(state.clone()))
        .route("/*path", any(proxy_handler))
        .with_state(state)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Bind and serve until the shutdown signal fires, then finish in-flight
/// requests and return.
pub async fn start_proxy(
    state: ProxyState,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let addr = state.config.listen_addr;
    let app = build_router(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("Proxy listening on {addr}");

    // When shutdown_rx fires the server stops accepting connections and
    // gracefully drains in-flight requests
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        })
        .await
        .context("Server error")?;

    tracing::info!("Proxy server shut down gracefully");
    Ok(())
}
