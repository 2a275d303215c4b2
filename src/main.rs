// llmgate - multi-tenant reverse proxy for LLM provider APIs
//
// Clients authenticate with short-lived, project-scoped withering tokens;
// the proxy swaps them for the tenant's long-lived upstream key, enforces
// per-token quotas and rate limits, streams responses back unchanged, and
// emits one structured event per request to a batched dispatch pipeline.
//
// Architecture:
// - Proxy server (axum): authenticates, admits, rewrites, forwards
// - Stores (SQLite): projects, withering tokens, audit events
// - Event bus: bounded pub/sub from the request path
// - Dispatcher: batches events into sinks (JSONL file, HTTP) with retry
// - Management API: project/token CRUD behind a static bearer token

mod bus;
mod cli;
mod config;
mod crypto;
mod dispatch;
mod events;
mod mgmt;
mod providers;
mod proxy;
mod ratelimit;
mod store;
mod util;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bus::EventBus;
use config::Config;
use crypto::KeyCipher;
use dispatch::plugins::{FileSink, FileSinkConfig, HttpSink, HttpSinkConfig};
use dispatch::{Dispatcher, EventSink};
use providers::ProviderRegistry;
use proxy::ProxyState;
use ratelimit::RateLimiter;
use store::{AuditWriter, ProjectStore, TokenStore};
use util::{obfuscate, ObfuscationStyle};

#[tokio::main]
async fn main() -> Result<()> {
    // Handle CLI subcommands first (config --show, providers)
    if cli::handle_cli() {
        return Ok(());
    }

    // Configuration is strict: a missing MANAGEMENT_TOKEN or a missing
    // encryption key under REQUIRE_ENCRYPTION aborts startup here
    let config = Config::from_env()?;

    // Precedence: RUST_LOG env var > config > default "info"
    let default_filter = format!("llmgate={},tower_http=info,axum=info", config.log_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // Crypto + persistence
    let cipher = Arc::new(KeyCipher::new(config.encryption_key));
    let pool = store::open_pool(&config.database_path)?;
    let providers = Arc::new(ProviderRegistry::load(config.providers_file.as_deref())?);
    let projects = Arc::new(ProjectStore::new(
        pool.clone(),
        cipher.clone(),
        config.project_cache_ttl,
    ));
    let tokens = Arc::new(TokenStore::new(pool.clone(), config.token_pepper.clone()));
    let audit = AuditWriter::new(config.database_path.clone(), config.audit.clone())
        .context("Failed to start audit writer")?;

    // Startup banner (secrets obfuscated)
    tracing::info!("llmgate v{} starting", config::VERSION);
    tracing::info!("Listen address: {}", config.listen_addr);
    tracing::info!("Database: {}", config.database_path.display());
    tracing::info!("Providers: {}", providers.ids().join(", "));
    tracing::info!(
        "Upstream key encryption: {}",
        if cipher.is_active() { "enabled" } else { "disabled" }
    );
    tracing::info!(
        "Management token: {}",
        obfuscate(&config.management_token, ObfuscationStyle::Generic)
    );

    // Event pipeline: bus, sinks, dispatcher
    let event_bus = Arc::new(EventBus::from_config(&config.bus)?);

    let mut sinks: Vec<Arc<dyn EventSink>> = Vec::new();
    if let Some(path) = &config.sinks.file_path {
        sinks.push(Arc::new(
            FileSink::new(FileSinkConfig { path: path.clone() })
                .context("Failed to initialize file sink")?,
        ));
        tracing::info!("File sink: {}", path.display());
    }
    if let Some(endpoint) = &config.sinks.http_endpoint {
        sinks.push(Arc::new(
            HttpSink::new(HttpSinkConfig {
                endpoint: endpoint.clone(),
                auth_header: config.sinks.http_auth.clone(),
                timeout: config.sinks.http_timeout,
            })
            .context("Failed to initialize HTTP sink")?,
        ));
        tracing::info!("HTTP sink: {endpoint}");
    }
    if sinks.is_empty() {
        tracing::warn!("No event sinks configured; events will be dropped at the bus");
    }

    let fallback: Option<Arc<dyn EventSink>> = if config.dispatcher.fallback_on_failure {
        Some(Arc::new(
            FileSink::new(FileSinkConfig {
                path: config.dispatcher.fallback_path.clone(),
            })
            .context("Failed to initialize fallback sink")?,
        ))
    } else {
        None
    };

    let dispatcher = Dispatcher::start(&event_bus, sinks, fallback, config.dispatcher.clone());

    // Admission control + idle-bucket sweeper
    let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
    let sweeper = {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                let evicted = limiter.evict_idle();
                if evicted > 0 {
                    tracing::trace!("Evicted {evicted} idle rate-limit buckets");
                }
            }
        })
    };

    let state = ProxyState {
        config: Arc::new(config),
        client: proxy::state::build_client()?,
        tokens,
        projects,
        providers,
        limiter,
        bus: event_bus.clone(),
        audit: audit.handle(),
        dispatch_metrics: dispatcher.metrics_handle(),
    };

    // Serve until Ctrl+C, then drain in order: server (in-flight
    // requests) → bus (stop propagates to dispatcher) → dispatcher
    // (final flush) → audit writer
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let mut server = tokio::spawn(proxy::start_proxy(state, shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down...");
            let _ = shutdown_tx.send(());
            match server.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("Server error during shutdown: {e:#}"),
                Err(e) => tracing::error!("Server task failed: {e}"),
            }
        }
        result = &mut server => {
            match result {
                Ok(Ok(())) => tracing::warn!("Proxy server exited unexpectedly"),
                Ok(Err(e)) => tracing::error!("Proxy server failed: {e:#}"),
                Err(e) => tracing::error!("Server task failed: {e}"),
            }
        }
    }

    event_bus.stop();
    dispatcher.shutdown().await;
    audit.shutdown();
    sweeper.abort();

    tracing::info!("Shutdown complete");
    Ok(())
}
