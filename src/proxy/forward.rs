//! Upstream forwarding - the thin I/O core
//!
//! Builds the outgoing request (header rewrite, credential swap, URL
//! rebase), dials the upstream, and classifies transport failures. The
//! configured timeout covers only the arrival of upstream response
//! headers; the body phase is unbounded and ends on upstream EOF or
//! client disconnect.

use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use bytes::Bytes;
use thiserror::Error;

/// Transport-level failure talking to the upstream.
#[derive(Debug, Error)]
pub(crate) enum ForwardError {
    #[error("{0}")]
    DialFailed(String),
    #[error("upstream response headers did not arrive in time")]
    UpstreamTimeout,
    #[error("{0}")]
    UpstreamClosedEarly(String),
}

/// Hop-by-hop headers are a property of one connection and must not be
/// forwarded. `host` and `content-length` are recomputed by the client.
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Whether an inbound request header is dropped before forwarding.
/// Client credentials never travel upstream.
pub(crate) fn strip_request_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    is_hop_by_hop(&lower) || matches!(lower.as_str(), "host" | "content-length" | "authorization" | "x-api-key")
}

/// Whether an upstream response header is dropped before relaying.
pub(crate) fn strip_response_header(name: &str) -> bool {
    is_hop_by_hop(&name.to_ascii_lowercase())
}

/// Rebase the request URL onto the provider.
pub(crate) fn upstream_url(base_url: &str, path: &str, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{base_url}{path}?{q}"),
        _ => format!("{base_url}{path}"),
    }
}

/// Send the rewritten request and wait for response headers within
/// `timeout`. Returns the response plus the upstream-side duration.
pub(crate) async fn forward(
    client: &reqwest::Client,
    method: &axum::http::Method,
    url: &str,
    inbound_headers: &HeaderMap,
    auth_header: &str,
    auth_value: &str,
    body: Bytes,
    timeout: Duration,
) -> Result<(reqwest::Response, Duration), ForwardError> {
    let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|e| ForwardError::DialFailed(format!("invalid HTTP method: {e}")))?;

    let mut request = client.request(method, url).body(body);

    // Copy surviving request headers verbatim
    for (name, value) in inbound_headers.iter() {
        if strip_request_header(name.as_str()) {
            continue;
        }
        request = request.header(name.as_str(), value.as_bytes().to_vec());
    }
    // Swap in the tenant's upstream credential
    request = request.header(auth_header, auth_value);

    let dial_start = Instant::now();
    let sent = tokio::time::timeout(timeout, request.send()).await;
    let upstream_time = dial_start.elapsed();

    match sent {
        Ok(Ok(response)) => Ok((response, upstream_time)),
        Ok(Err(e)) => {
            if e.is_connect() {
                Err(ForwardError::DialFailed(format!("connect failed: {e}")))
            } else if e.is_timeout() {
                Err(ForwardError::UpstreamTimeout)
            } else {
                Err(ForwardError::UpstreamClosedEarly(format!(
                    "upstream request failed: {e}"
                )))
            }
        }
        Err(_) => Err(ForwardError::UpstreamTimeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::{HeaderName, HeaderValue};

    #[test]
    fn test_request_header_stripping() {
        // Client credentials never travel upstream
        assert!(strip_request_header("Authorization"));
        assert!(strip_request_header("authorization"));
        assert!(strip_request_header("x-api-key"));
        // Hop-by-hop
        for name in [
            "Connection",
            "Keep-Alive",
            "Proxy-Authorization",
            "TE",
            "Trailer",
            "Transfer-Encoding",
            "Upgrade",
            "host",
        ] {
            assert!(strip_request_header(name), "{name} should be stripped");
        }
        // Everything else passes through
        assert!(!strip_request_header("content-type"));
        assert!(!strip_request_header("anthropic-version"));
        assert!(!strip_request_header("x-request-source"));
    }

    #[test]
    fn test_response_header_stripping() {
        assert!(strip_response_header("Transfer-Encoding"));
        assert!(strip_response_header("connection"));
        assert!(!strip_response_header("content-type"));
        assert!(!strip_response_header("content-length"));
        assert!(!strip_response_header("x-request-id"));
    }

    #[test]
    fn test_upstream_url() {
        assert_eq!(
            upstream_url("https://api.openai.com", "/v1/chat/completions", None),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            upstream_url("https://api.openai.com", "/v1/models", Some("limit=5")),
            "https://api.openai.com/v1/models?limit=5"
        );
        assert_eq!(
            upstream_url("https://api.openai.com", "/v1/models", Some("")),
            "https://api.openai.com/v1/models"
        );
    }

    #[test]
    fn test_headers_survive_filter() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("authorization"),
            HeaderValue::from_static("Bearer wt-secret"),
        );
        headers.insert(
            HeaderName::from_static("content-type"),
            HeaderValue::from_static("application/json"),
        );
        headers.insert(
            HeaderName::from_static("connection"),
            HeaderValue::from_static("keep-alive"),
        );

        let surviving: Vec<&str> = headers
            .iter()
            .filter(|(name, _)| !strip_request_header(name.as_str()))
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(surviving, vec!["content-type"]);
    }
}
