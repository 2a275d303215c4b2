//! Management API - the administrative surface over the same stores
//!
//! Everything here sits behind a static bearer token
//! (`MANAGEMENT_TOKEN`), compared in constant time. Responses sanitize
//! secrets: stored upstream keys come back obfuscated, issued tokens
//! appear exactly once in the issuance response and never again.

use std::time::Duration;

use axum::extract::{Path, Request, State};
use axum::http::{header::AUTHORIZATION, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::constant_time_eq;
use crate::proxy::ProxyState;
use crate::store::{NewProject, Project, StoreError, TokenInfo};
use crate::util::{obfuscate, ObfuscationStyle};

/// Build the `/admin` routes with the auth layer applied.
pub fn routes(state: ProxyState) -> Router<ProxyState> {
    Router::new()
        .route("/admin/projects", get(list_projects).post(create_project))
        .route("/admin/projects/:id", delete(delete_project))
        .route("/admin/tokens", get(list_tokens).post(issue_token))
        .route("/admin/tokens/:id", delete(revoke_token))
        .route("/admin/health", get(health))
        .layer(middleware::from_fn_with_state(state, require_management_auth))
}

// ─────────────────────────────────────────────────────────────────────────────
// Auth
// ─────────────────────────────────────────────────────────────────────────────

async fn require_management_auth(
    State(state): State<ProxyState>,
    req: Request,
    next: Next,
) -> Response {
    let authorized = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| constant_time_eq(t.trim(), &state.config.management_token))
        .unwrap_or(false);

    if !authorized {
        return MgmtError::unauthorized().into_response();
    }
    next.run(req).await
}

// ─────────────────────────────────────────────────────────────────────────────
// Error shape
// ─────────────────────────────────────────────────────────────────────────────

struct MgmtError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl MgmtError {
    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            kind: "authentication_error",
            message: "missing or invalid management token".into(),
        }
    }

    fn not_found(what: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: "not_found_error",
            message: format!("{what} not found"),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "invalid_request_error",
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal_error",
            message: message.into(),
        }
    }
}

impl From<StoreError> for MgmtError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Invalid(msg) => MgmtError::bad_request(msg),
            other => MgmtError::internal(other.to_string()),
        }
    }
}

impl IntoResponse for MgmtError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("Management API error: {}", self.message);
        }
        let body = serde_json::json!({
            "error": { "type": self.kind, "message": self.message }
        });
        (self.status, Json(body)).into_response()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Projects
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateProjectRequest {
    name: String,
    provider_id: String,
    upstream_key: String,
    #[serde(default)]
    allowed_methods: Option<Vec<String>>,
    #[serde(default)]
    allowed_paths: Option<Vec<String>>,
    #[serde(default)]
    rate_limit_per_minute: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ProjectResponse {
    id: String,
    name: String,
    provider_id: String,
    /// Always obfuscated; the raw key never leaves the store.
    upstream_key: String,
    allowed_methods: Option<Vec<String>>,
    allowed_paths: Option<Vec<String>>,
    rate_limit_per_minute: Option<u32>,
    created_at: DateTime<Utc>,
}

fn project_response(state: &ProxyState, project: Project) -> ProjectResponse {
    let obfuscated = state
        .projects
        .decrypt_key(&project)
        .map(|key| obfuscate(&key, ObfuscationStyle::Generic))
        .unwrap_or_else(|_| "****".to_string());
    ProjectResponse {
        id: project.id,
        name: project.name,
        provider_id: project.provider_id,
        upstream_key: obfuscated,
        allowed_methods: project.allowed_methods,
        allowed_paths: project.allowed_paths,
        rate_limit_per_minute: project.rate_limit_per_minute,
        created_at: project.created_at,
    }
}

async fn create_project(
    State(state): State<ProxyState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<ProjectResponse>), MgmtError> {
    if !state.providers.contains(&req.provider_id) {
        return Err(MgmtError::bad_request(format!(
            "unknown provider '{}'",
            req.provider_id
        )));
    }
    let projects = state.projects.clone();
    let project = tokio::task::spawn_blocking(move || {
        projects.create(NewProject {
            name: req.name,
            provider_id: req.provider_id,
            upstream_key: req.upstream_key,
            allowed_methods: req.allowed_methods,
            allowed_paths: req.allowed_paths,
            rate_limit_per_minute: req.rate_limit_per_minute,
        })
    })
    .await
    .map_err(|e| MgmtError::internal(e.to_string()))??;

    Ok((StatusCode::CREATED, Json(project_response(&state, project))))
}

async fn list_projects(
    State(state): State<ProxyState>,
) -> Result<Json<Vec<ProjectResponse>>, MgmtError> {
    let projects = state.projects.clone();
    let all = tokio::task::spawn_blocking(move || projects.list())
        .await
        .map_err(|e| MgmtError::internal(e.to_string()))??;
    Ok(Json(
        all.into_iter()
            .map(|p| project_response(&state, p))
            .collect(),
    ))
}

async fn delete_project(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
) -> Result<StatusCode, MgmtError> {
    let projects = state.projects.clone();
    let deleted = tokio::task::spawn_blocking(move || projects.delete(&id))
        .await
        .map_err(|e| MgmtError::internal(e.to_string()))??;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(MgmtError::not_found("project"))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tokens
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct IssueTokenRequest {
    project_id: String,
    /// Lifetime in seconds; absent means no absolute expiry.
    #[serde(default)]
    ttl_secs: Option<u64>,
    #[serde(default)]
    max_requests: Option<u32>,
}

#[derive(Debug, Serialize)]
struct IssueTokenResponse {
    /// The withering token. Shown exactly once.
    token: String,
    token_id: String,
    expires_at: Option<DateTime<Utc>>,
}

async fn issue_token(
    State(state): State<ProxyState>,
    Json(req): Json<IssueTokenRequest>,
) -> Result<(StatusCode, Json<IssueTokenResponse>), MgmtError> {
    let tokens = state.tokens.clone();
    let issued = tokio::task::spawn_blocking(move || {
        tokens.issue(
            &req.project_id,
            req.ttl_secs.map(Duration::from_secs),
            req.max_requests,
        )
    })
    .await
    .map_err(|e| MgmtError::internal(e.to_string()))??;

    Ok((
        StatusCode::CREATED,
        Json(IssueTokenResponse {
            token: issued.token,
            token_id: issued.token_id,
            expires_at: issued.expires_at,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct ListTokensQuery {
    #[serde(default)]
    project_id: Option<String>,
}

async fn list_tokens(
    State(state): State<ProxyState>,
    axum::extract::Query(query): axum::extract::Query<ListTokensQuery>,
) -> Result<Json<Vec<TokenInfo>>, MgmtError> {
    let tokens = state.tokens.clone();
    let list = tokio::task::spawn_blocking(move || tokens.list(query.project_id.as_deref()))
        .await
        .map_err(|e| MgmtError::internal(e.to_string()))??;
    Ok(Json(list))
}

async fn revoke_token(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
) -> Result<StatusCode, MgmtError> {
    let tokens = state.tokens.clone();
    let revoked = tokio::task::spawn_blocking(move || tokens.revoke(&id))
        .await
        .map_err(|e| MgmtError::internal(e.to_string()))??;
    if revoked {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(MgmtError::not_found("token"))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Health
// ─────────────────────────────────────────────────────────────────────────────

async fn health(State(state): State<ProxyState>) -> Result<Json<serde_json::Value>, MgmtError> {
    let projects = state.projects.clone();
    let tokens = state.tokens.clone();
    let (project_count, token_count) =
        tokio::task::spawn_blocking(move || -> Result<(u64, u64), StoreError> {
            Ok((projects.count()?, tokens.count()?))
        })
        .await
        .map_err(|e| MgmtError::internal(e.to_string()))??;

    Ok(Json(serde_json::json!({
        "status": "ok",
        "projects": project_count,
        "tokens": token_count,
        "bus": state.bus.metrics(),
        "dispatch": state.dispatch_metrics.snapshot(),
        "audit": state.audit.metrics(),
        "rate_limiter": {
            "buckets": state.limiter.bucket_count(),
            "available_slots": state.limiter.available_slots(),
        },
    })))
}
