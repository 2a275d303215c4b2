//! Main proxy handler - authenticates, admits, rewrites, forwards,
//! streams, and emits exactly one event per request
//!
//! A request moves through Received → Authenticated → Admitted →
//! Forwarding → Streaming, terminating in Completed or Errored. Both
//! terminal states emit one event. For forwarded requests the event is
//! emitted when the response body finishes streaming (or the client
//! disconnects), so byte counts reflect what was actually delivered;
//! a drop-guard makes the emission exactly-once on every path,
//! including cancellation.
//!
//! Unexpected panics are caught at the top, converted to a 500 with the
//! canonical JSON body, and still emit an event.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::events::{ErrorKind, Outcome, RequestEvent};
use crate::ratelimit::LimitExceeded;
use crate::store::AuditHandle;

use super::error::ProxyError;
use super::forward::{forward, strip_response_header, upstream_url};
use super::state::ProxyState;

// ─────────────────────────────────────────────────────────────────────────────
// Event draft
// ─────────────────────────────────────────────────────────────────────────────

/// Accumulates event fields as the request advances. Converted into the
/// final `RequestEvent` exactly once.
struct EventDraft {
    request_id: Uuid,
    project_id: Option<String>,
    token_id: Option<String>,
    token_hash: Option<String>,
    method: String,
    path: String,
    status: Option<u16>,
    bytes_in: u64,
    bytes_out: u64,
    upstream_ms: Option<u64>,
    started_at: DateTime<Utc>,
    outcome: Outcome,
    error_kind: Option<ErrorKind>,
    metadata: Option<serde_json::Value>,
}

impl EventDraft {
    fn new(request_id: Uuid, method: String, path: String) -> Self {
        Self {
            request_id,
            project_id: None,
            token_id: None,
            token_hash: None,
            method,
            path,
            status: None,
            bytes_in: 0,
            bytes_out: 0,
            upstream_ms: None,
            started_at: Utc::now(),
            outcome: Outcome::Error,
            error_kind: None,
            metadata: None,
        }
    }

    fn into_event(self, duration_ms: u64) -> RequestEvent {
        RequestEvent {
            request_id: self.request_id,
            project_id: self.project_id,
            token_id: self.token_id,
            token_hash: self.token_hash,
            method: self.method,
            path: self.path,
            status: self.status,
            bytes_in: self.bytes_in,
            bytes_out: self.bytes_out,
            duration_ms,
            upstream_ms: self.upstream_ms,
            started_at: self.started_at,
            outcome: self.outcome,
            error_kind: self.error_kind,
            metadata: self.metadata,
        }
    }
}

fn emit(bus: &EventBus, audit: &AuditHandle, draft: EventDraft, started: Instant) {
    let event = draft.into_event(started.elapsed().as_millis() as u64);
    audit.record(event.clone());
    bus.publish(event);
}

// ─────────────────────────────────────────────────────────────────────────────
// Handler
// ─────────────────────────────────────────────────────────────────────────────

/// Entry point for every request on the proxy surface.
pub(super) async fn proxy_handler(
    State(state): State<ProxyState>,
    req: Request<Body>,
) -> Response<Body> {
    let started = Instant::now();
    let request_id = Uuid::new_v4();
    let mut draft = Some(EventDraft::new(
        request_id,
        req.method().to_string(),
        req.uri().path().to_string(),
    ));

    tracing::debug!(%request_id, method = %req.method(), path = %req.uri().path(), "Received");

    // Single top-of-handler recover: unexpected faults become a 500
    // and still produce an event
    let result = AssertUnwindSafe(handle(&state, req, &mut draft, started))
        .catch_unwind()
        .await;

    match result {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            if let Some(mut d) = draft.take() {
                d.outcome = if err.is_denial() {
                    Outcome::Denied
                } else {
                    Outcome::Error
                };
                d.error_kind = Some(err.event_kind());
                emit(&state.bus, &state.audit, d, started);
            }
            err.into_response()
        }
        Err(_) => {
            tracing::error!(%request_id, "Request handler panicked");
            if let Some(mut d) = draft.take() {
                d.outcome = Outcome::Error;
                d.error_kind = Some(ErrorKind::Internal);
                emit(&state.bus, &state.audit, d, started);
            }
            ProxyError::Internal("unexpected fault while handling the request".into())
                .into_response()
        }
    }
}

async fn handle(
    state: &ProxyState,
    req: Request<Body>,
    draft: &mut Option<EventDraft>,
    started: Instant,
) -> Result<Response<Body>, ProxyError> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let path = uri.path().to_string();
    let headers = req.headers().clone();

    if !path.starts_with(&state.config.proxy_path_prefix) {
        return Err(ProxyError::RouteNotFound);
    }

    // Bearer credential
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(ProxyError::MissingCredentials)?
        .to_string();

    // The keyed hash identifies the credential in events even when
    // validation fails below
    if let Some(d) = draft.as_mut() {
        d.token_hash = Some(state.tokens.hash_prefix(&presented));
    }

    // Global concurrency slot first: cheapest check, bounded wait
    let permit = state
        .limiter
        .admit()
        .await
        .map_err(|_| ProxyError::Overloaded)?;

    // Authenticate and resolve the tenant (SQLite is synchronous; keep
    // it off the async workers)
    let resolved = {
        let tokens = state.tokens.clone();
        let presented = presented.clone();
        let method_str = method.to_string();
        let path_str = path.clone();
        tokio::task::spawn_blocking(move || tokens.resolve(&presented, &method_str, &path_str))
            .await
            .map_err(|e| ProxyError::Internal(format!("token lookup task failed: {e}")))??
    };
    if let Some(d) = draft.as_mut() {
        d.project_id = Some(resolved.project.id.clone());
        d.token_id = Some(resolved.token_id.clone());
    }
    tracing::debug!(project = %resolved.project.id, "Authenticated");

    // Provider profile must also allow the call; checked before any
    // quota is spent
    let profile = state
        .providers
        .get(&resolved.project.provider_id)
        .ok_or_else(|| {
            ProxyError::Internal(format!(
                "provider '{}' is not configured",
                resolved.project.provider_id
            ))
        })?;
    if !profile.allows(method.as_str(), &path) {
        return Err(ProxyError::Forbidden);
    }

    // Per-token bucket, project override falling back to the default
    let per_minute = resolved
        .project
        .rate_limit_per_minute
        .unwrap_or(state.config.rate_limit.default_per_minute);
    state
        .limiter
        .check_token(&resolved.token_id, per_minute)
        .map_err(|e| match e {
            LimitExceeded::RateLimited { retry_after } => ProxyError::RateLimited {
                retry_after_secs: retry_after.as_secs().max(1),
            },
            LimitExceeded::Overloaded => ProxyError::Overloaded,
        })?;

    // Atomic quota reservation; concurrent racers beyond max_requests
    // fail here
    {
        let tokens = state.tokens.clone();
        let token_id = resolved.token_id.clone();
        tokio::task::spawn_blocking(move || tokens.reserve(&token_id))
            .await
            .map_err(|e| ProxyError::Internal(format!("quota reservation task failed: {e}")))??;
    }
    tracing::debug!("Admitted");

    // Upstream credential, decrypted lazily per request
    let upstream_key = state
        .projects
        .decrypt_key(&resolved.project)
        .map_err(|e| ProxyError::Internal(format!("failed to decrypt upstream key: {e}")))?;
    let auth_value = profile.auth_value(&upstream_key);

    let body_bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|e| ProxyError::BodyRead(e.to_string()))?;
    if let Some(d) = draft.as_mut() {
        d.bytes_in = body_bytes.len() as u64;
    }

    let url = upstream_url(&profile.base_url, &path, uri.query());
    tracing::debug!(%url, "Forwarding");

    let (upstream, upstream_time) = forward(
        &state.client,
        &method,
        &url,
        &headers,
        &profile.auth.header,
        &auth_value,
        body_bytes,
        state.config.request_timeout,
    )
    .await?;

    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();
    let content_type = upstream_headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let streaming = profile.is_streaming_content_type(content_type);

    if let Some(d) = draft.as_mut() {
        d.status = Some(status.as_u16());
        d.upstream_ms = Some(upstream_time.as_millis() as u64);
        d.outcome = if status.is_client_error() || status.is_server_error() {
            Outcome::Failure
        } else {
            Outcome::Success
        };
        d.metadata = Some(serde_json::json!({
            "provider": profile.id,
            "streaming": streaming,
        }));
    }

    // Mirror the upstream response; strip hop-by-hop, keep the rest
    // verbatim (content-length included, the body passes through
    // byte-identical)
    let mut builder = Response::builder().status(status.as_u16());
    for (name, value) in upstream_headers.iter() {
        if strip_response_header(name.as_str()) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes().to_vec());
    }
    let proxy_overhead = started.elapsed().saturating_sub(upstream_time);
    builder = builder
        .header("x-upstream-time-ms", upstream_time.as_millis().to_string())
        .header("x-proxy-time-ms", proxy_overhead.as_millis().to_string());

    tracing::debug!(status = status.as_u16(), streaming, "Streaming");

    // The accountant rides inside the body stream: it counts delivered
    // bytes and emits the event exactly once when the stream ends, errors,
    // or is dropped (client disconnect). The concurrency permit rides
    // along too, so a streaming response keeps its global slot.
    let accountant = BodyAccountant {
        draft: draft.take(),
        bus: state.bus.clone(),
        audit: state.audit.clone(),
        started,
        _permit: Some(permit),
    };

    let stream = futures::stream::unfold(
        (upstream.bytes_stream(), accountant),
        |(mut body, mut acct)| async move {
            match body.next().await {
                Some(Ok(chunk)) => {
                    acct.add_bytes(chunk.len());
                    Some((Ok::<_, std::io::Error>(chunk), (body, acct)))
                }
                Some(Err(e)) => {
                    tracing::warn!("Upstream body failed mid-stream: {e}");
                    acct.finish_upstream_error();
                    Some((
                        Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            e.to_string(),
                        )),
                        (body, acct),
                    ))
                }
                None => {
                    acct.finish_complete();
                    None
                }
            }
        },
    );

    builder
        .body(Body::from_stream(stream))
        .map_err(|e| ProxyError::Internal(format!("failed to build response: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Body accounting
// ─────────────────────────────────────────────────────────────────────────────

/// Counts delivered bytes and guarantees exactly-once event emission for
/// forwarded requests, whichever way the body ends.
struct BodyAccountant {
    draft: Option<EventDraft>,
    bus: Arc<EventBus>,
    audit: AuditHandle,
    started: Instant,
    _permit: Option<crate::ratelimit::ConcurrencyPermit>,
}

impl BodyAccountant {
    fn add_bytes(&mut self, n: usize) {
        if let Some(d) = self.draft.as_mut() {
            d.bytes_out += n as u64;
        }
    }

    fn emit_with(&mut self, adjust: impl FnOnce(&mut EventDraft)) {
        if let Some(mut draft) = self.draft.take() {
            adjust(&mut draft);
            emit(&self.bus, &self.audit, draft, self.started);
        }
    }

    /// Body fully relayed; the outcome set from the upstream status stands.
    fn finish_complete(&mut self) {
        self.emit_with(|_| {});
    }

    /// Upstream hung up mid-body.
    fn finish_upstream_error(&mut self) {
        self.emit_with(|d| {
            d.outcome = Outcome::Error;
            d.error_kind = Some(ErrorKind::UpstreamClosedEarly);
        });
    }
}

impl Drop for BodyAccountant {
    fn drop(&mut self) {
        // Reaching Drop with the draft still present means the body was
        // dropped before completion: the client went away. bytes_out
        // already reflects only what was delivered.
        self.emit_with(|d| {
            d.outcome = Outcome::Error;
            d.error_kind = Some(ErrorKind::ClientDisconnect);
        });
    }
}
