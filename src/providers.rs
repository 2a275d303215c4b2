//! Provider catalog - static profiles of the upstream APIs we front
//!
//! Loaded once at startup from a YAML file (or built-in defaults when no
//! file is configured) and immutable afterward. A profile says where a
//! provider lives, which paths and methods a tenant may call, how the
//! upstream expects its credential, and which content types mark a
//! streaming response.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// How the upstream credential is presented.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderAuth {
    /// Header name, e.g. `Authorization` or `x-api-key`.
    #[serde(default = "default_auth_header")]
    pub header: String,
    /// Optional scheme prefix; `Bearer` yields `Bearer <key>`, absent
    /// yields the bare key (Anthropic style).
    #[serde(default = "default_auth_scheme")]
    pub scheme: Option<String>,
}

fn default_auth_header() -> String {
    "Authorization".to_string()
}

fn default_auth_scheme() -> Option<String> {
    Some("Bearer".to_string())
}

impl Default for ProviderAuth {
    fn default() -> Self {
        Self {
            header: default_auth_header(),
            scheme: default_auth_scheme(),
        }
    }
}

/// A single upstream provider profile.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderProfile {
    pub id: String,
    /// Scheme + host (+ optional port), no trailing slash.
    pub base_url: String,
    /// Path prefixes a request must match. Empty = allow all.
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    /// Method whitelist. Empty = POST and GET.
    #[serde(default)]
    pub allowed_methods: Vec<String>,
    #[serde(default)]
    pub auth: ProviderAuth,
    /// Content-type substrings that mark a streaming response.
    #[serde(default = "default_streaming_markers")]
    pub streaming_content_types: Vec<String>,
}

fn default_streaming_markers() -> Vec<String> {
    vec!["text/event-stream".to_string()]
}

impl ProviderProfile {
    /// Whether this profile allows the given method and path.
    pub fn allows(&self, method: &str, path: &str) -> bool {
        let method_ok = if self.allowed_methods.is_empty() {
            matches!(method, "POST" | "GET")
        } else {
            self.allowed_methods.iter().any(|m| m.eq_ignore_ascii_case(method))
        };
        if !method_ok {
            return false;
        }
        self.allowed_paths.is_empty() || self.allowed_paths.iter().any(|p| path.starts_with(p))
    }

    /// Whether a response content type marks a streaming body.
    pub fn is_streaming_content_type(&self, content_type: &str) -> bool {
        self.streaming_content_types
            .iter()
            .any(|marker| content_type.contains(marker.as_str()))
    }

    /// The full header value for the decrypted upstream key.
    pub fn auth_value(&self, key: &str) -> String {
        match &self.auth.scheme {
            Some(scheme) => format!("{scheme} {key}"),
            None => key.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProvidersFile {
    providers: Vec<ProviderProfile>,
}

/// Immutable, id-indexed catalog of provider profiles.
#[derive(Debug)]
pub struct ProviderRegistry {
    profiles: HashMap<String, ProviderProfile>,
}

impl ProviderRegistry {
    /// Load from YAML; falls back to built-in defaults when `path` is None.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read providers file {}", path.display()))?;
                Self::from_yaml(&raw)
            }
            None => Ok(Self::builtin()),
        }
    }

    /// Parse a providers YAML document.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let file: ProvidersFile =
            serde_yaml::from_str(raw).context("Failed to parse providers YAML")?;
        if file.providers.is_empty() {
            bail!("providers file declares no providers");
        }
        let mut profiles = HashMap::with_capacity(file.providers.len());
        for profile in file.providers {
            if profile.base_url.ends_with('/') {
                bail!("provider '{}': base_url must not end with '/'", profile.id);
            }
            if profiles.insert(profile.id.clone(), profile).is_some() {
                bail!("duplicate provider id in providers file");
            }
        }
        Ok(Self { profiles })
    }

    /// Built-in catalog covering the common OpenAI-compatible and
    /// Anthropic endpoints. Enough to run without a providers file.
    pub fn builtin() -> Self {
        let openai = ProviderProfile {
            id: "openai".to_string(),
            base_url: "https://api.openai.com".to_string(),
            allowed_paths: vec![
                "/v1/chat/completions".to_string(),
                "/v1/completions".to_string(),
                "/v1/embeddings".to_string(),
                "/v1/models".to_string(),
            ],
            allowed_methods: vec!["POST".to_string(), "GET".to_string()],
            auth: ProviderAuth::default(),
            streaming_content_types: default_streaming_markers(),
        };
        let anthropic = ProviderProfile {
            id: "anthropic".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            allowed_paths: vec!["/v1/messages".to_string(), "/v1/models".to_string()],
            allowed_methods: vec!["POST".to_string(), "GET".to_string()],
            auth: ProviderAuth {
                header: "x-api-key".to_string(),
                scheme: None,
            },
            streaming_content_types: default_streaming_markers(),
        };
        let mut profiles = HashMap::new();
        profiles.insert(openai.id.clone(), openai);
        profiles.insert(anthropic.id.clone(), anthropic);
        Self { profiles }
    }

    pub fn get(&self, id: &str) -> Option<&ProviderProfile> {
        self.profiles.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.profiles.contains_key(id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
providers:
  - id: openai
    base_url: https://api.openai.com
    allowed_paths: ["/v1/chat/completions", "/v1/embeddings"]
    allowed_methods: ["POST"]
  - id: anthropic
    base_url: https://api.anthropic.com
    allowed_paths: ["/v1/messages"]
    auth:
      header: x-api-key
      scheme: null
    streaming_content_types: ["text/event-stream"]
"#;

    #[test]
    fn test_parse_yaml() {
        let registry = ProviderRegistry::from_yaml(SAMPLE).unwrap();
        let openai = registry.get("openai").unwrap();
        assert_eq!(openai.base_url, "https://api.openai.com");
        assert_eq!(openai.auth.header, "Authorization");
        assert_eq!(openai.auth.scheme.as_deref(), Some("Bearer"));

        let anthropic = registry.get("anthropic").unwrap();
        assert_eq!(anthropic.auth.header, "x-api-key");
        assert!(anthropic.auth.scheme.is_none());
    }

    #[test]
    fn test_allows_method_and_path() {
        let registry = ProviderRegistry::from_yaml(SAMPLE).unwrap();
        let openai = registry.get("openai").unwrap();
        assert!(openai.allows("POST", "/v1/chat/completions"));
        assert!(!openai.allows("GET", "/v1/chat/completions"));
        assert!(!openai.allows("POST", "/v1/files"));
        // Prefix match admits subpaths
        assert!(openai.allows("POST", "/v1/chat/completions/extra"));
    }

    #[test]
    fn test_auth_value() {
        let registry = ProviderRegistry::from_yaml(SAMPLE).unwrap();
        assert_eq!(
            registry.get("openai").unwrap().auth_value("sk-k"),
            "Bearer sk-k"
        );
        assert_eq!(registry.get("anthropic").unwrap().auth_value("sk-k"), "sk-k");
    }

    #[test]
    fn test_streaming_markers() {
        let registry = ProviderRegistry::from_yaml(SAMPLE).unwrap();
        let anthropic = registry.get("anthropic").unwrap();
        assert!(anthropic.is_streaming_content_type("text/event-stream; charset=utf-8"));
        assert!(!anthropic.is_streaming_content_type("application/json"));
    }

    #[test]
    fn test_builtin_catalog() {
        let registry = ProviderRegistry::builtin();
        assert!(registry.contains("openai"));
        assert!(registry.contains("anthropic"));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let raw = r#"
providers:
  - id: a
    base_url: https://x.example
  - id: a
    base_url: https://y.example
"#;
        assert!(ProviderRegistry::from_yaml(raw).is_err());
    }

    #[test]
    fn test_trailing_slash_rejected() {
        let raw = r#"
providers:
  - id: a
    base_url: https://x.example/
"#;
        assert!(ProviderRegistry::from_yaml(raw).is_err());
    }
}
