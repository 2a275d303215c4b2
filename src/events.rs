// Events that flow from the proxy request path to the dispatch pipeline
//
// One event is emitted per completed request (including rejected ones).
// Events carry outcome, timing, and size data but never secrets: the
// client credential appears only as a truncated keyed hash, and the
// upstream key does not appear at all.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal classification of a proxied request.
///
/// Values mirror the CHECK constraint on the `audit_events` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Upstream answered 2xx/3xx and the body was fully relayed.
    Success,
    /// Upstream answered 4xx/5xx; the response was still relayed.
    Failure,
    /// The proxy refused the request locally (auth, quota, rate limit).
    Denied,
    /// Transport or internal fault; no usable upstream response.
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Denied => "denied",
            Outcome::Error => "error",
        }
    }
}

/// What went wrong, when something did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing, unknown, expired, or revoked credential.
    Auth,
    /// Request-count cap reached.
    Quota,
    /// Per-token rate limit tripped.
    RateLimited,
    /// Method or path not allowed for the project/provider.
    Forbidden,
    /// Global concurrency cap; the client should retry.
    Overloaded,
    /// Could not reach the upstream at all.
    DialFailed,
    /// Upstream response headers did not arrive within the deadline.
    UpstreamTimeout,
    /// Upstream hung up mid-body.
    UpstreamClosedEarly,
    /// The client went away before the body finished.
    ClientDisconnect,
    /// Unexpected fault inside the proxy.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::Quota => "quota",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::DialFailed => "dial_failed",
            ErrorKind::UpstreamTimeout => "upstream_timeout",
            ErrorKind::UpstreamClosedEarly => "upstream_closed_early",
            ErrorKind::ClientDisconnect => "client_disconnect",
            ErrorKind::Internal => "internal",
        }
    }
}

/// One record per completed proxied request.
///
/// Created by the proxy handler at request completion and owned by the
/// event bus after publication; the publisher never mutates it afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEvent {
    /// Assigned at admission, echoed in logs and audit rows.
    pub request_id: Uuid,
    /// Tenant the credential resolved to, when authentication got that far.
    pub project_id: Option<String>,
    /// Token row id (a UUID, not the credential itself).
    pub token_id: Option<String>,
    /// Truncated keyed hash of the presented credential. Never the raw token.
    pub token_hash: Option<String>,
    pub method: String,
    pub path: String,
    /// Upstream status, when an upstream response was obtained.
    pub status: Option<u16>,
    /// Request body bytes received from the client.
    pub bytes_in: u64,
    /// Response body bytes actually delivered to the client.
    pub bytes_out: u64,
    /// Wall-clock duration on the proxy side, admission to completion.
    pub duration_ms: u64,
    /// Time spent waiting on the upstream (dial to response headers).
    pub upstream_ms: Option<u64>,
    /// Wall-clock start of the request.
    pub started_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub error_kind: Option<ErrorKind>,
    /// Redacted extras (provider id, streaming flag). Free-form but small.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}
