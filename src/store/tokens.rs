//! Withering-token store - issuance, validation, quota, revocation
//!
//! Tokens are never stored raw: rows carry a keyed SHA-256 hash, looked
//! up by a truncated prefix column and verified against the full hash in
//! constant time. Quota reservation is a single conditional UPDATE whose
//! affected-row count decides admission, which makes the decrement
//! linearizable: N concurrent requests against `max_requests = N` admit
//! exactly N.
//!
//! Validation failures are classified in a fixed order so clients get
//! the most actionable reason: Revoked > Expired > QuotaExhausted >
//! Forbidden, with NotFound reserved for unknown tokens.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use thiserror::Error;
use uuid::Uuid;

use super::projects::{project_from_row, Project};
use super::{DbPool, StoreError};
use crate::crypto::{constant_time_eq, generate_token, hash_token};
use crate::util::{fmt_ts, parse_ts};

/// Why validation refused a token.
#[derive(Debug, Error)]
pub enum ValidateError {
    #[error("token not found")]
    NotFound,
    #[error("token expired")]
    Expired,
    #[error("token revoked")]
    Revoked,
    #[error("request quota exhausted")]
    QuotaExhausted,
    #[error("method or path not allowed for this project")]
    Forbidden,
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ValidateError {
    fn from(e: StoreError) -> Self {
        ValidateError::Store(e)
    }
}

impl From<rusqlite::Error> for ValidateError {
    fn from(e: rusqlite::Error) -> Self {
        ValidateError::Store(StoreError::Db(e))
    }
}

impl From<r2d2::Error> for ValidateError {
    fn from(e: r2d2::Error) -> Self {
        ValidateError::Store(StoreError::Pool(e))
    }
}

/// Returned once at issuance; the raw token is not recoverable later.
#[derive(Debug)]
pub struct IssuedToken {
    pub token: String,
    pub token_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A validated credential with its project projection.
#[derive(Debug, Clone)]
pub struct ResolvedToken {
    pub token_id: String,
    /// Truncated keyed hash, safe for events and logs.
    pub hash_prefix: String,
    pub project: Project,
}

/// Token metadata for listings. Never contains the raw token.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TokenInfo {
    pub id: String,
    pub project_id: String,
    pub hash_prefix: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_requests: Option<u32>,
    pub requests_used: u32,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

struct TokenRow {
    id: String,
    token_hash: String,
    expires_at: Option<DateTime<Utc>>,
    max_requests: Option<u32>,
    requests_used: u32,
    revoked_at: Option<DateTime<Utc>>,
}

fn token_row(row: &Row<'_>, prefix: &str) -> rusqlite::Result<TokenRow> {
    let get_ts = |name: &str| -> rusqlite::Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = row.get(format!("{prefix}{name}").as_str())?;
        Ok(raw.as_deref().and_then(parse_ts))
    };
    Ok(TokenRow {
        id: row.get(format!("{prefix}id").as_str())?,
        token_hash: row.get(format!("{prefix}token_hash").as_str())?,
        expires_at: get_ts("expires_at")?,
        max_requests: row.get(format!("{prefix}max_requests").as_str())?,
        requests_used: row.get(format!("{prefix}requests_used").as_str())?,
        revoked_at: get_ts("revoked_at")?,
    })
}

/// Persistent token store.
pub struct TokenStore {
    pool: DbPool,
    pepper: String,
}

impl TokenStore {
    pub fn new(pool: DbPool, pepper: String) -> Self {
        Self { pool, pepper }
    }

    // ─────────────────────────────────────────────────────────────────
    // Issuance and lifecycle
    // ─────────────────────────────────────────────────────────────────

    /// Generate and persist a fresh token for a project.
    pub fn issue(
        &self,
        project_id: &str,
        ttl: Option<Duration>,
        max_requests: Option<u32>,
    ) -> Result<IssuedToken, StoreError> {
        let conn = self.pool.get()?;
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM projects WHERE id = ?1",
                [project_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::Invalid(format!(
                "project '{project_id}' does not exist"
            )));
        }

        let token = generate_token();
        let hash = hash_token(&self.pepper, &token);
        let token_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires_at = ttl.and_then(|d| {
            chrono::Duration::from_std(d)
                .ok()
                .map(|delta| now + delta)
        });

        conn.execute(
            "INSERT INTO tokens (id, lookup_hash, token_hash, project_id, expires_at,
                                 max_requests, requests_used, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
            params![
                token_id,
                hash.lookup(),
                hash.full,
                project_id,
                expires_at.map(fmt_ts),
                max_requests,
                fmt_ts(now),
            ],
        )?;

        Ok(IssuedToken {
            token,
            token_id,
            expires_at,
        })
    }

    /// Mark a token revoked. Returns false when the id is unknown.
    pub fn revoke(&self, token_id: &str) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        let updated = conn.execute(
            "UPDATE tokens SET revoked_at = ?1 WHERE id = ?2 AND revoked_at IS NULL",
            params![fmt_ts(Utc::now()), token_id],
        )?;
        Ok(updated > 0)
    }

    /// List token metadata, optionally scoped to a project.
    pub fn list(&self, project_id: Option<&str>) -> Result<Vec<TokenInfo>, StoreError> {
        let conn = self.pool.get()?;
        let sql = "SELECT id, lookup_hash, project_id, expires_at, max_requests, requests_used,
                          revoked_at, created_at, last_used_at
                   FROM tokens WHERE (?1 IS NULL OR project_id = ?1) ORDER BY created_at";
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![project_id], |row| {
            let get_ts = |name: &str| -> rusqlite::Result<Option<DateTime<Utc>>> {
                let raw: Option<String> = row.get(name)?;
                Ok(raw.as_deref().and_then(parse_ts))
            };
            let lookup: String = row.get("lookup_hash")?;
            Ok(TokenInfo {
                id: row.get("id")?,
                project_id: row.get("project_id")?,
                hash_prefix: lookup.chars().take(12).collect(),
                expires_at: get_ts("expires_at")?,
                max_requests: row.get("max_requests")?,
                requests_used: row.get("requests_used")?,
                revoked_at: get_ts("revoked_at")?,
                created_at: get_ts("created_at")?.unwrap_or_else(Utc::now),
                last_used_at: get_ts("last_used_at")?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM tokens", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Display form of a presented credential's keyed hash. Safe for
    /// events and logs, computable without touching the database.
    pub fn hash_prefix(&self, presented: &str) -> String {
        hash_token(&self.pepper, presented)
            .lookup()
            .chars()
            .take(12)
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────
    // Validation
    // ─────────────────────────────────────────────────────────────────

    /// Resolve a presented token to its project without reserving quota.
    ///
    /// The proxy calls this first so the per-token rate limit (which
    /// needs the project's override) can reject before any quota is
    /// spent; [`Self::reserve`] then performs the atomic reservation.
    pub fn resolve(
        &self,
        presented: &str,
        method: &str,
        path: &str,
    ) -> Result<ResolvedToken, ValidateError> {
        let hash = hash_token(&self.pepper, presented);
        let conn = self.pool.get()?;

        let sql = "SELECT t.id AS t_id, t.token_hash AS t_token_hash, t.expires_at AS t_expires_at,
                          t.max_requests AS t_max_requests, t.requests_used AS t_requests_used,
                          t.revoked_at AS t_revoked_at,
                          p.id, p.name, p.provider_id, p.upstream_key, p.key_encrypted,
                          p.allowed_methods, p.allowed_paths, p.rate_limit_per_minute, p.created_at
                   FROM tokens t JOIN projects p ON p.id = t.project_id
                   WHERE t.lookup_hash = ?1";
        let mut stmt = conn.prepare(sql)?;
        let candidates = stmt.query_map([hash.lookup()], |row| {
            Ok((token_row(row, "t_")?, project_from_row(row)?))
        })?;

        // Prefix collisions are vanishingly rare but handled: the full
        // hash decides, compared in constant time.
        let mut matched: Option<(TokenRow, Project)> = None;
        for candidate in candidates {
            let (token, project) = candidate?;
            if constant_time_eq(&token.token_hash, &hash.full) {
                matched = Some((token, project));
            }
        }
        let (token, project) = matched.ok_or(ValidateError::NotFound)?;

        Self::classify(&token, &project, method, path)?;

        Ok(ResolvedToken {
            hash_prefix: hash.lookup().chars().take(12).collect(),
            token_id: token.id,
            project,
        })
    }

    /// Atomically reserve one request slot on a token.
    ///
    /// The conditional UPDATE re-verifies revocation, expiry, and quota,
    /// so a stale `resolve` can never over-admit; a zero row count is
    /// re-read and classified.
    pub fn reserve(&self, token_id: &str) -> Result<(), ValidateError> {
        let conn = self.pool.get()?;
        let now = fmt_ts(Utc::now());
        let updated = conn.execute(
            "UPDATE tokens
             SET requests_used = requests_used + 1, last_used_at = ?1
             WHERE id = ?2
               AND revoked_at IS NULL
               AND (expires_at IS NULL OR expires_at > ?1)
               AND (max_requests IS NULL OR requests_used < max_requests)",
            params![now, token_id],
        )?;
        if updated == 1 {
            return Ok(());
        }

        // Reservation lost a race (or resolve was stale): re-read and
        // report the precise reason
        let sql = "SELECT id AS t_id, token_hash AS t_token_hash, expires_at AS t_expires_at,
                          max_requests AS t_max_requests, requests_used AS t_requests_used,
                          revoked_at AS t_revoked_at
                   FROM tokens WHERE id = ?1";
        let token = conn
            .query_row(sql, [token_id], |row| token_row(row, "t_"))
            .optional()?
            .ok_or(ValidateError::NotFound)?;

        if token.revoked_at.is_some() {
            Err(ValidateError::Revoked)
        } else if token.expires_at.is_some_and(|at| at <= Utc::now()) {
            Err(ValidateError::Expired)
        } else {
            Err(ValidateError::QuotaExhausted)
        }
    }

    /// Resolve and reserve in one call: the full Validate contract.
    pub fn validate(
        &self,
        presented: &str,
        method: &str,
        path: &str,
    ) -> Result<ResolvedToken, ValidateError> {
        let resolved = self.resolve(presented, method, path)?;
        self.reserve(&resolved.token_id)?;
        Ok(resolved)
    }

    /// Fixed tie-break order: Revoked > Expired > QuotaExhausted > Forbidden.
    fn classify(
        token: &TokenRow,
        project: &Project,
        method: &str,
        path: &str,
    ) -> Result<(), ValidateError> {
        if token.revoked_at.is_some() {
            return Err(ValidateError::Revoked);
        }
        if token.expires_at.is_some_and(|at| at <= Utc::now()) {
            return Err(ValidateError::Expired);
        }
        if token
            .max_requests
            .is_some_and(|max| token.requests_used >= max)
        {
            return Err(ValidateError::QuotaExhausted);
        }
        if !project.allows(method, path) {
            return Err(ValidateError::Forbidden);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyCipher;
    use crate::store::projects::{NewProject, ProjectStore};
    use crate::store::{open_pool, open_test_pool};
    use std::sync::Arc;

    fn fixture() -> (TokenStore, ProjectStore, String) {
        let pool = open_test_pool();
        let projects = ProjectStore::new(
            pool.clone(),
            Arc::new(KeyCipher::new(None)),
            Duration::from_secs(60),
        );
        let project = projects
            .create(NewProject {
                name: "acme".into(),
                provider_id: "openai".into(),
                upstream_key: "sk-upstream".into(),
                allowed_methods: Some(vec!["POST".into(), "GET".into()]),
                allowed_paths: Some(vec!["/v1/".into()]),
                rate_limit_per_minute: None,
            })
            .unwrap();
        (TokenStore::new(pool, "pepper".into()), projects, project.id)
    }

    #[test]
    fn test_issue_and_validate_happy_path() {
        let (tokens, _projects, project_id) = fixture();
        let issued = tokens.issue(&project_id, None, Some(10)).unwrap();
        assert!(issued.token.starts_with("wt-"));

        let resolved = tokens
            .validate(&issued.token, "POST", "/v1/chat/completions")
            .unwrap();
        assert_eq!(resolved.project.id, project_id);
        assert_eq!(resolved.token_id, issued.token_id);
        assert_eq!(resolved.hash_prefix.len(), 12);

        // Usage is recorded and last_used_at set
        let info = &tokens.list(Some(&project_id)).unwrap()[0];
        assert_eq!(info.requests_used, 1);
        assert!(info.last_used_at.is_some());
    }

    #[test]
    fn test_unknown_token_not_found() {
        let (tokens, _projects, _) = fixture();
        assert!(matches!(
            tokens.validate("wt-does-not-exist", "POST", "/v1/x"),
            Err(ValidateError::NotFound)
        ));
    }

    #[test]
    fn test_expired_token() {
        let (tokens, _projects, project_id) = fixture();
        let issued = tokens
            .issue(&project_id, Some(Duration::from_secs(0)), None)
            .unwrap();
        // Zero TTL is already in the past
        assert!(matches!(
            tokens.validate(&issued.token, "POST", "/v1/x"),
            Err(ValidateError::Expired)
        ));
    }

    #[test]
    fn test_revoked_token() {
        let (tokens, _projects, project_id) = fixture();
        let issued = tokens.issue(&project_id, None, None).unwrap();
        assert!(tokens.revoke(&issued.token_id).unwrap());
        // Second revoke is a no-op
        assert!(!tokens.revoke(&issued.token_id).unwrap());
        assert!(matches!(
            tokens.validate(&issued.token, "POST", "/v1/x"),
            Err(ValidateError::Revoked)
        ));
    }

    #[test]
    fn test_revoked_wins_over_expired() {
        let (tokens, _projects, project_id) = fixture();
        let issued = tokens
            .issue(&project_id, Some(Duration::from_secs(0)), None)
            .unwrap();
        tokens.revoke(&issued.token_id).unwrap();
        assert!(matches!(
            tokens.validate(&issued.token, "POST", "/v1/x"),
            Err(ValidateError::Revoked)
        ));
    }

    #[test]
    fn test_quota_exhaustion_sequential() {
        let (tokens, _projects, project_id) = fixture();
        let issued = tokens.issue(&project_id, None, Some(2)).unwrap();
        assert!(tokens.validate(&issued.token, "POST", "/v1/x").is_ok());
        assert!(tokens.validate(&issued.token, "POST", "/v1/x").is_ok());
        // The (max+1)-th attempt is rejected
        assert!(matches!(
            tokens.validate(&issued.token, "POST", "/v1/x"),
            Err(ValidateError::QuotaExhausted)
        ));
    }

    #[test]
    fn test_forbidden_method_and_path() {
        let (tokens, _projects, project_id) = fixture();
        let issued = tokens.issue(&project_id, None, None).unwrap();
        assert!(matches!(
            tokens.validate(&issued.token, "DELETE", "/v1/x"),
            Err(ValidateError::Forbidden)
        ));
        assert!(matches!(
            tokens.validate(&issued.token, "POST", "/v2/x"),
            Err(ValidateError::Forbidden)
        ));
        // Forbidden attempts must not burn quota
        let info = &tokens.list(Some(&project_id)).unwrap()[0];
        assert_eq!(info.requests_used, 0);
    }

    #[test]
    fn test_issue_for_missing_project_fails() {
        let (tokens, _projects, _) = fixture();
        assert!(tokens.issue("ghost", None, None).is_err());
    }

    #[test]
    fn test_quota_exhaustion_concurrent() {
        // File-backed pool so multiple connections race for real
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("race.db")).unwrap();
        let projects = ProjectStore::new(
            pool.clone(),
            Arc::new(KeyCipher::new(None)),
            Duration::from_secs(60),
        );
        let project = projects
            .create(NewProject {
                name: "race".into(),
                provider_id: "openai".into(),
                upstream_key: "sk-upstream".into(),
                allowed_methods: None,
                allowed_paths: None,
                rate_limit_per_minute: None,
            })
            .unwrap();
        let tokens = Arc::new(TokenStore::new(pool, "pepper".into()));
        let issued = tokens.issue(&project.id, None, Some(1)).unwrap();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let tokens = tokens.clone();
            let presented = issued.token.clone();
            handles.push(std::thread::spawn(move || {
                tokens.validate(&presented, "POST", "/v1/x").is_ok()
            }));
        }
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap_or(false))
            .filter(|ok| *ok)
            .count();

        // max_requests = 1: exactly one of the five racers gets through
        assert_eq!(admitted, 1);
        let info = &tokens.list(Some(&project.id)).unwrap()[0];
        assert_eq!(info.requests_used, 1);
    }
}
