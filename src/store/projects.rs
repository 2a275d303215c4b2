//! Project store - tenants and their upstream credentials
//!
//! The proxy only ever reads the projection needed per request (provider
//! reference, sealed upstream key, filters, rate override), served from
//! a TTL read-through cache. Mutations come from the management API and
//! invalidate the cache entry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::{params, Row};
use uuid::Uuid;

use super::{DbPool, StoreError};
use crate::crypto::KeyCipher;
use crate::util::{fmt_ts, parse_ts};

/// Proxy-relevant projection of a tenant.
#[derive(Debug, Clone)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub provider_id: String,
    /// Sealed blob; decrypt via [`ProjectStore::decrypt_key`].
    pub upstream_key: Vec<u8>,
    pub key_encrypted: bool,
    /// Method whitelist; `None` means no project-level restriction.
    pub allowed_methods: Option<Vec<String>>,
    /// Path-prefix whitelist; `None` means no project-level restriction.
    pub allowed_paths: Option<Vec<String>>,
    pub rate_limit_per_minute: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl Project {
    /// Whether this project allows the given method and path. Absent
    /// filters allow everything (the provider profile still applies).
    pub fn allows(&self, method: &str, path: &str) -> bool {
        if let Some(methods) = &self.allowed_methods {
            if !methods.iter().any(|m| m.eq_ignore_ascii_case(method)) {
                return false;
            }
        }
        if let Some(paths) = &self.allowed_paths {
            if !paths.iter().any(|p| path.starts_with(p.as_str())) {
                return false;
            }
        }
        true
    }
}

/// Fields for creating a project.
#[derive(Debug)]
pub struct NewProject {
    pub name: String,
    pub provider_id: String,
    /// Raw upstream key; sealed before it touches disk.
    pub upstream_key: String,
    pub allowed_methods: Option<Vec<String>>,
    pub allowed_paths: Option<Vec<String>>,
    pub rate_limit_per_minute: Option<u32>,
}

pub(crate) fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    let allowed_methods: Option<String> = row.get("allowed_methods")?;
    let allowed_paths: Option<String> = row.get("allowed_paths")?;
    let created_at: String = row.get("created_at")?;
    Ok(Project {
        id: row.get("id")?,
        name: row.get("name")?,
        provider_id: row.get("provider_id")?,
        upstream_key: row.get("upstream_key")?,
        key_encrypted: row.get::<_, i64>("key_encrypted")? != 0,
        allowed_methods: allowed_methods.and_then(|s| serde_json::from_str(&s).ok()),
        allowed_paths: allowed_paths.and_then(|s| serde_json::from_str(&s).ok()),
        rate_limit_per_minute: row.get("rate_limit_per_minute")?,
        created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
    })
}

const PROJECT_COLUMNS: &str = "id, name, provider_id, upstream_key, key_encrypted, \
     allowed_methods, allowed_paths, rate_limit_per_minute, created_at";

/// Persistent project store with a TTL read-through cache.
pub struct ProjectStore {
    pool: DbPool,
    cipher: Arc<KeyCipher>,
    cache: DashMap<String, (Project, Instant)>,
    cache_ttl: Duration,
}

impl ProjectStore {
    pub fn new(pool: DbPool, cipher: Arc<KeyCipher>, cache_ttl: Duration) -> Self {
        Self {
            pool,
            cipher,
            cache: DashMap::new(),
            cache_ttl,
        }
    }

    /// Create a project; the upstream key is sealed with the configured
    /// cipher before storage.
    pub fn create(&self, new: NewProject) -> Result<Project, StoreError> {
        if new.name.trim().is_empty() {
            return Err(StoreError::Invalid("project name is required".into()));
        }
        if new.upstream_key.trim().is_empty() {
            return Err(StoreError::Invalid("upstream key is required".into()));
        }
        let (blob, encrypted) = self.cipher.seal(new.upstream_key.as_bytes())?;
        let project = Project {
            id: Uuid::new_v4().to_string(),
            name: new.name,
            provider_id: new.provider_id,
            upstream_key: blob,
            key_encrypted: encrypted,
            allowed_methods: new.allowed_methods,
            allowed_paths: new.allowed_paths,
            rate_limit_per_minute: new.rate_limit_per_minute,
            created_at: Utc::now(),
        };

        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO projects (id, name, provider_id, upstream_key, key_encrypted,
                                   allowed_methods, allowed_paths, rate_limit_per_minute, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                project.id,
                project.name,
                project.provider_id,
                project.upstream_key,
                project.key_encrypted as i64,
                project
                    .allowed_methods
                    .as_ref()
                    .map(|v| serde_json::to_string(v).unwrap_or_default()),
                project
                    .allowed_paths
                    .as_ref()
                    .map(|v| serde_json::to_string(v).unwrap_or_default()),
                project.rate_limit_per_minute,
                fmt_ts(project.created_at),
            ],
        )?;
        Ok(project)
    }

    /// Fetch a project, serving from cache while fresh.
    pub fn get(&self, id: &str) -> Result<Option<Project>, StoreError> {
        if let Some(entry) = self.cache.get(id) {
            let (project, cached_at) = entry.value();
            if cached_at.elapsed() < self.cache_ttl {
                return Ok(Some(project.clone()));
            }
        }
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"
        ))?;
        let mut rows = stmt.query_map([id], project_from_row)?;
        match rows.next() {
            Some(row) => {
                let project = row?;
                self.cache
                    .insert(id.to_string(), (project.clone(), Instant::now()));
                Ok(Some(project))
            }
            None => {
                self.cache.remove(id);
                Ok(None)
            }
        }
    }

    pub fn list(&self) -> Result<Vec<Project>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects ORDER BY created_at"
        ))?;
        let rows = stmt.query_map([], project_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Delete a project and all its tokens in one transaction.
    /// Returns false when the project does not exist.
    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM tokens WHERE project_id = ?1", [id])?;
        let deleted = tx.execute("DELETE FROM projects WHERE id = ?1", [id])?;
        tx.commit()?;
        self.cache.remove(id);
        Ok(deleted > 0)
    }

    /// Decrypt a project's upstream key. Lazily called per request.
    pub fn decrypt_key(&self, project: &Project) -> Result<String, StoreError> {
        let plain = self
            .cipher
            .open(&project.upstream_key, project.key_encrypted)?;
        String::from_utf8(plain)
            .map_err(|_| StoreError::Invalid("upstream key is not valid UTF-8".into()))
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM projects", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Drop a cache entry (used after external mutation).
    pub fn invalidate(&self, id: &str) {
        self.cache.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_test_pool;

    fn store_with_cipher(cipher: KeyCipher) -> ProjectStore {
        ProjectStore::new(open_test_pool(), Arc::new(cipher), Duration::from_secs(60))
    }

    fn new_project(name: &str) -> NewProject {
        NewProject {
            name: name.to_string(),
            provider_id: "openai".to_string(),
            upstream_key: "sk-upstream-123456".to_string(),
            allowed_methods: Some(vec!["POST".to_string()]),
            allowed_paths: Some(vec!["/v1/chat".to_string()]),
            rate_limit_per_minute: Some(10),
        }
    }

    #[test]
    fn test_create_get_roundtrip_plaintext() {
        let store = store_with_cipher(KeyCipher::new(None));
        let created = store.create(new_project("acme")).unwrap();
        assert!(!created.key_encrypted);

        let fetched = store.get(&created.id).unwrap().unwrap();
        assert_eq!(fetched.name, "acme");
        assert_eq!(fetched.provider_id, "openai");
        assert_eq!(fetched.rate_limit_per_minute, Some(10));
        assert_eq!(store.decrypt_key(&fetched).unwrap(), "sk-upstream-123456");
    }

    #[test]
    fn test_key_encrypted_at_rest() {
        let store = store_with_cipher(KeyCipher::new(Some([3u8; 32])));
        let created = store.create(new_project("acme")).unwrap();
        assert!(created.key_encrypted);
        // The stored blob is not the raw key
        assert_ne!(created.upstream_key, b"sk-upstream-123456".to_vec());
        let fetched = store.get(&created.id).unwrap().unwrap();
        assert_eq!(store.decrypt_key(&fetched).unwrap(), "sk-upstream-123456");
    }

    #[test]
    fn test_allows_filters() {
        let store = store_with_cipher(KeyCipher::new(None));
        let project = store.create(new_project("acme")).unwrap();
        assert!(project.allows("POST", "/v1/chat/completions"));
        assert!(project.allows("post", "/v1/chat"));
        assert!(!project.allows("GET", "/v1/chat"));
        assert!(!project.allows("POST", "/v1/embeddings"));

        let open = store
            .create(NewProject {
                allowed_methods: None,
                allowed_paths: None,
                ..new_project("open")
            })
            .unwrap();
        assert!(open.allows("DELETE", "/anything"));
    }

    #[test]
    fn test_delete_missing_returns_false() {
        let store = store_with_cipher(KeyCipher::new(None));
        assert!(!store.delete("nope").unwrap());
    }

    #[test]
    fn test_cache_serves_fresh_entries() {
        let store = store_with_cipher(KeyCipher::new(None));
        let created = store.create(new_project("acme")).unwrap();
        // Prime the cache
        store.get(&created.id).unwrap().unwrap();
        // Mutate behind the cache's back
        {
            let conn = store.pool.get().unwrap();
            conn.execute("UPDATE projects SET name = 'renamed' WHERE id = ?1", [
                created.id.as_str(),
            ])
            .unwrap();
        }
        // Fresh cache still answers with the old projection
        assert_eq!(store.get(&created.id).unwrap().unwrap().name, "acme");
        // Invalidation forces a re-read
        store.invalidate(&created.id);
        assert_eq!(store.get(&created.id).unwrap().unwrap().name, "renamed");
    }

    #[test]
    fn test_validation_errors() {
        let store = store_with_cipher(KeyCipher::new(None));
        assert!(store
            .create(NewProject {
                name: " ".into(),
                ..new_project("x")
            })
            .is_err());
        assert!(store
            .create(NewProject {
                upstream_key: "".into(),
                ..new_project("x")
            })
            .is_err());
    }
}
