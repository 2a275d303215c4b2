//! Proxy state types and shared coordination structures

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::bus::EventBus;
use crate::config::Config;
use crate::dispatch::DispatchMetrics;
use crate::providers::ProviderRegistry;
use crate::ratelimit::RateLimiter;
use crate::store::{AuditHandle, ProjectStore, TokenStore};

/// Shared state for the proxy server.
///
/// Everything in here is either immutable after startup or internally
/// synchronized, so the whole struct is cheap to clone per request.
#[derive(Clone)]
pub struct ProxyState {
    /// Effective configuration.
    pub config: Arc<Config>,
    /// HTTP client for forwarding requests. No global timeout: the
    /// header-arrival deadline is applied per request, and streamed
    /// bodies may legitimately run for a long time.
    pub client: reqwest::Client,
    /// Withering-token store.
    pub tokens: Arc<TokenStore>,
    /// Project store with its read-through cache.
    pub projects: Arc<ProjectStore>,
    /// Immutable provider catalog.
    pub providers: Arc<ProviderRegistry>,
    /// Admission control.
    pub limiter: Arc<RateLimiter>,
    /// Event bus the request path publishes into.
    pub bus: Arc<EventBus>,
    /// Best-effort usage recording.
    pub audit: AuditHandle,
    /// Dispatcher counters, surfaced by the health endpoint.
    pub dispatch_metrics: Arc<DispatchMetrics>,
}

/// Build the forwarding client the way this proxy needs it: pooled,
/// with a connect ceiling, and without a whole-request timeout.
pub fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .pool_max_idle_per_host(10)
        .build()
        .context("Failed to create HTTP client")
}
