//! Persistence - SQLite behind a connection pool
//!
//! Three tables: `projects`, `tokens`, `audit_events`, plus a `metadata`
//! table tracking the schema version. Migrations are versioned and each
//! version is applied in a single transaction at startup, so a crashed
//! upgrade leaves the previous version intact.
//!
//! The request path reads through `TokenStore`/`ProjectStore`; audit
//! writes go through a dedicated writer thread (`audit`) so SQLite never
//! sits on the async hot path.

use std::path::Path;

use anyhow::{Context, Result};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use thiserror::Error;

pub mod audit;
pub mod projects;
pub mod tokens;

pub use audit::{AuditHandle, AuditWriter};
pub use projects::{NewProject, Project, ProjectStore};
pub use tokens::{IssuedToken, ResolvedToken, TokenInfo, TokenStore, ValidateError};

/// Pooled SQLite handle shared by the stores.
pub type DbPool = r2d2::Pool<SqliteConnectionManager>;

/// Failures below the domain level.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
    #[error("{0}")]
    Invalid(String),
}

/// Per-connection pragmas. WAL lets the audit writer and the request
/// path proceed concurrently; busy_timeout covers the rare write/write
/// collision between revocation and reservation.
const PRAGMAS: &str = r#"
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;
PRAGMA busy_timeout=5000;
"#;

/// Open the pool, creating the database file (and parent directory) on
/// first run, and bring the schema up to date.
pub fn open_pool(path: &Path) -> Result<DbPool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let manager = SqliteConnectionManager::file(path)
        .with_init(|conn| conn.execute_batch(PRAGMAS));
    let pool = r2d2::Pool::builder()
        .max_size(8)
        .build(manager)
        .context("Failed to build SQLite pool")?;

    let conn = pool.get().context("Failed to check out a connection")?;
    run_migrations(&conn).context("Schema migration failed")?;
    Ok(pool)
}

/// In-memory pool for tests. A single connection keeps the shared
/// in-memory database alive and serializes access.
#[cfg(test)]
pub fn open_test_pool() -> DbPool {
    let manager = SqliteConnectionManager::memory().with_init(|conn| conn.execute_batch(PRAGMAS));
    let pool = r2d2::Pool::builder().max_size(1).build(manager).unwrap();
    run_migrations(&pool.get().unwrap()).unwrap();
    pool
}

// ─────────────────────────────────────────────────────────────────────────────
// Migrations
// ─────────────────────────────────────────────────────────────────────────────

const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id                     TEXT PRIMARY KEY,
            name                   TEXT NOT NULL,
            provider_id            TEXT NOT NULL,
            upstream_key           BLOB NOT NULL,
            key_encrypted          INTEGER NOT NULL DEFAULT 0,
            allowed_methods        TEXT,
            allowed_paths          TEXT,
            rate_limit_per_minute  INTEGER,
            created_at             TEXT NOT NULL
        );
        "#,
    ),
    (
        2,
        r#"
        CREATE TABLE IF NOT EXISTS tokens (
            id             TEXT PRIMARY KEY,
            lookup_hash    TEXT NOT NULL,
            token_hash     TEXT NOT NULL,
            project_id     TEXT NOT NULL,
            expires_at     TEXT,
            max_requests   INTEGER,
            requests_used  INTEGER NOT NULL DEFAULT 0,
            revoked_at     TEXT,
            created_at     TEXT NOT NULL,
            last_used_at   TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_tokens_lookup ON tokens(lookup_hash);
        CREATE INDEX IF NOT EXISTS idx_tokens_project ON tokens(project_id);
        "#,
    ),
    (
        3,
        r#"
        CREATE TABLE IF NOT EXISTS audit_events (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id   TEXT NOT NULL,
            project_id   TEXT,
            token_id     TEXT,
            method       TEXT NOT NULL,
            path         TEXT NOT NULL,
            status       INTEGER,
            bytes_in     INTEGER NOT NULL DEFAULT 0,
            bytes_out    INTEGER NOT NULL DEFAULT 0,
            duration_ms  INTEGER NOT NULL DEFAULT 0,
            upstream_ms  INTEGER,
            outcome      TEXT NOT NULL CHECK (outcome IN ('success','failure','denied','error')),
            error_kind   TEXT,
            started_at   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_audit_started ON audit_events(started_at);
        CREATE INDEX IF NOT EXISTS idx_audit_project ON audit_events(project_id);
        "#,
    ),
];

/// Apply pending migrations, one transaction per version.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS metadata (key TEXT PRIMARY KEY, value TEXT)",
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(
                (SELECT CAST(value AS INTEGER) FROM metadata WHERE key = 'schema_version'),
                0
            )",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    for (version, sql) in MIGRATIONS {
        if current < *version {
            conn.execute_batch("BEGIN")?;
            let applied = conn.execute_batch(sql).and_then(|_| {
                conn.execute(
                    "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
                    [version.to_string()],
                )
                .map(|_| ())
            });
            match applied {
                Ok(()) => conn.execute_batch("COMMIT")?,
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(e).with_context(|| format!("migration v{version}"));
                }
            }
            tracing::debug!("Applied schema migration v{version}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_apply_and_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version: i64 = conn
            .query_row(
                "SELECT CAST(value AS INTEGER) FROM metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, 3);

        // All three tables exist
        for table in ["projects", "tokens", "audit_events"] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }

    #[test]
    fn test_outcome_check_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let ok = conn.execute(
            "INSERT INTO audit_events (request_id, method, path, outcome, started_at)
             VALUES ('r1', 'POST', '/v1/x', 'success', '2025-01-01T00:00:00.000Z')",
            [],
        );
        assert!(ok.is_ok());

        let bad = conn.execute(
            "INSERT INTO audit_events (request_id, method, path, outcome, started_at)
             VALUES ('r2', 'POST', '/v1/x', 'bogus', '2025-01-01T00:00:00.000Z')",
            [],
        );
        assert!(bad.is_err());
    }
}
