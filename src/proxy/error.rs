//! Proxy error taxonomy and response mapping
//!
//! Every rejection and fault maps to a canonical status code and a JSON
//! body of the form `{"error": {"type": "...", "message": "..."}}`.
//! Rate-limit style rejections carry a `Retry-After` header.

use axum::body::Body;
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use thiserror::Error;

use crate::events::ErrorKind;
use crate::store::tokens::ValidateError;

use super::forward::ForwardError;

/// Errors that can occur during proxying.
#[derive(Debug, Error)]
pub(crate) enum ProxyError {
    #[error("missing or malformed Authorization header")]
    MissingCredentials,
    #[error("unknown credential")]
    UnknownToken,
    #[error("credential has expired")]
    TokenExpired,
    #[error("credential has been revoked")]
    TokenRevoked,
    #[error("request quota exhausted for this credential")]
    QuotaExhausted,
    #[error("method or path not allowed")]
    Forbidden,
    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },
    #[error("server is at capacity")]
    Overloaded,
    #[error("no route matches this path")]
    RouteNotFound,
    #[error("failed to read request body: {0}")]
    BodyRead(String),
    #[error("failed to reach upstream: {0}")]
    DialFailed(String),
    #[error("upstream did not respond in time")]
    UpstreamTimeout,
    #[error("upstream closed the connection early: {0}")]
    UpstreamClosedEarly(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub(crate) fn status(&self) -> StatusCode {
        match self {
            ProxyError::MissingCredentials
            | ProxyError::UnknownToken
            | ProxyError::TokenExpired
            | ProxyError::TokenRevoked => StatusCode::UNAUTHORIZED,
            ProxyError::QuotaExhausted | ProxyError::RateLimited { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ProxyError::Forbidden => StatusCode::FORBIDDEN,
            ProxyError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::RouteNotFound => StatusCode::NOT_FOUND,
            ProxyError::BodyRead(_) => StatusCode::BAD_REQUEST,
            ProxyError::DialFailed(_) | ProxyError::UpstreamClosedEarly(_) => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ProxyError::MissingCredentials
            | ProxyError::UnknownToken
            | ProxyError::TokenExpired
            | ProxyError::TokenRevoked => "authentication_error",
            ProxyError::QuotaExhausted | ProxyError::RateLimited { .. } => "rate_limit_error",
            ProxyError::Forbidden => "permission_error",
            ProxyError::Overloaded => "overloaded_error",
            ProxyError::RouteNotFound => "not_found_error",
            ProxyError::BodyRead(_) => "invalid_request_error",
            ProxyError::DialFailed(_)
            | ProxyError::UpstreamClosedEarly(_)
            | ProxyError::UpstreamTimeout => "upstream_error",
            ProxyError::Internal(_) => "internal_error",
        }
    }

    /// Classification carried on the emitted event.
    pub(crate) fn event_kind(&self) -> ErrorKind {
        match self {
            ProxyError::MissingCredentials
            | ProxyError::UnknownToken
            | ProxyError::TokenExpired
            | ProxyError::TokenRevoked => ErrorKind::Auth,
            ProxyError::QuotaExhausted => ErrorKind::Quota,
            ProxyError::RateLimited { .. } => ErrorKind::RateLimited,
            ProxyError::Forbidden | ProxyError::RouteNotFound => ErrorKind::Forbidden,
            ProxyError::Overloaded => ErrorKind::Overloaded,
            ProxyError::BodyRead(_) => ErrorKind::Internal,
            ProxyError::DialFailed(_) => ErrorKind::DialFailed,
            ProxyError::UpstreamTimeout => ErrorKind::UpstreamTimeout,
            ProxyError::UpstreamClosedEarly(_) => ErrorKind::UpstreamClosedEarly,
            ProxyError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the proxy refused locally (vs. an upstream/internal fault).
    pub(crate) fn is_denial(&self) -> bool {
        matches!(
            self,
            ProxyError::MissingCredentials
                | ProxyError::UnknownToken
                | ProxyError::TokenExpired
                | ProxyError::TokenRevoked
                | ProxyError::QuotaExhausted
                | ProxyError::Forbidden
                | ProxyError::RateLimited { .. }
                | ProxyError::Overloaded
                | ProxyError::RouteNotFound
        )
    }
}

impl From<ValidateError> for ProxyError {
    fn from(e: ValidateError) -> Self {
        match e {
            ValidateError::NotFound => ProxyError::UnknownToken,
            ValidateError::Expired => ProxyError::TokenExpired,
            ValidateError::Revoked => ProxyError::TokenRevoked,
            ValidateError::QuotaExhausted => ProxyError::QuotaExhausted,
            ValidateError::Forbidden => ProxyError::Forbidden,
            ValidateError::Store(e) => ProxyError::Internal(e.to_string()),
        }
    }
}

impl From<ForwardError> for ProxyError {
    fn from(e: ForwardError) -> Self {
        match e {
            ForwardError::DialFailed(msg) => ProxyError::DialFailed(msg),
            ForwardError::UpstreamTimeout => ProxyError::UpstreamTimeout,
            ForwardError::UpstreamClosedEarly(msg) => ProxyError::UpstreamClosedEarly(msg),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response<Body> {
        let status = self.status();
        let body = serde_json::json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
            }
        });

        if status.is_server_error() {
            tracing::error!("Proxy error: {} - {}", status, self);
        } else {
            tracing::debug!("Proxy rejection: {} - {}", status, self);
        }

        let mut builder = Response::builder()
            .status(status)
            .header("content-type", "application/json");
        if let ProxyError::RateLimited { retry_after_secs } = &self {
            builder = builder.header("retry-after", retry_after_secs.max(&1).to_string());
        }
        if matches!(self, ProxyError::Overloaded) {
            builder = builder.header("retry-after", "1");
        }

        builder
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| {
                Response::new(Body::from(
                    r#"{"error":{"type":"internal_error","message":"failed to build error response"}}"#,
                ))
            })
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ProxyError::MissingCredentials.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ProxyError::TokenExpired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ProxyError::QuotaExhausted.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            ProxyError::RateLimited { retry_after_secs: 2 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(ProxyError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(ProxyError::Overloaded.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            ProxyError::DialFailed("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(ProxyError::UpstreamTimeout.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_validate_error_mapping() {
        assert!(matches!(
            ProxyError::from(ValidateError::Revoked),
            ProxyError::TokenRevoked
        ));
        assert!(matches!(
            ProxyError::from(ValidateError::QuotaExhausted),
            ProxyError::QuotaExhausted
        ));
    }

    #[test]
    fn test_denials() {
        assert!(ProxyError::QuotaExhausted.is_denial());
        assert!(ProxyError::Overloaded.is_denial());
        assert!(!ProxyError::UpstreamTimeout.is_denial());
        assert!(!ProxyError::Internal("x".into()).is_denial());
    }
}
