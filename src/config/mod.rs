//! Configuration for the proxy
//!
//! Everything is driven by environment variables (12-factor style) plus
//! an optional providers YAML file. Precedence is simple: environment
//! variable, then built-in default. Two things are hard requirements and
//! fail startup when absent: `MANAGEMENT_TOKEN`, and `ENCRYPTION_KEY`
//! when `REQUIRE_ENCRYPTION` is set.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::crypto::parse_master_key;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ─────────────────────────────────────────────────────────────────────────────
// Application configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the proxy server to
    pub listen_addr: SocketAddr,

    /// Bearer token protecting the management API
    pub management_token: String,

    /// SQLite database file
    pub database_path: PathBuf,

    /// Master key for upstream-key encryption at rest (32 bytes)
    pub encryption_key: Option<[u8; 32]>,

    /// Refuse to start without an encryption key
    pub require_encryption: bool,

    /// Process-wide pepper mixed into token hashes
    pub token_pepper: String,

    /// Providers YAML file; built-in catalog when unset
    pub providers_file: Option<PathBuf>,

    /// Path prefix the proxy forwards (everything else 404s)
    pub proxy_path_prefix: String,

    /// Deadline for upstream response headers (not the body stream)
    pub request_timeout: Duration,

    /// Rate limiting knobs
    pub rate_limit: RateLimitConfig,

    /// Event bus knobs
    pub bus: BusConfig,

    /// Dispatcher knobs
    pub dispatcher: DispatcherSettings,

    /// Event sink wiring
    pub sinks: SinkSettings,

    /// Audit writer knobs
    pub audit: AuditConfig,

    /// Seconds a cached project projection stays fresh
    pub project_cache_ttl: Duration,

    /// Log level when RUST_LOG is not set
    pub log_level: String,

    /// Emit logs as JSON instead of plain text
    pub log_json: bool,
}

/// Rate limiting configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Global in-flight request cap
    pub max_concurrent_requests: usize,
    /// Longest a request waits for a concurrency slot
    pub admission_wait: Duration,
    /// Per-token requests per minute when the project sets no override
    pub default_per_minute: u32,
}

/// Event bus configuration
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// `memory` or `amqp`
    pub backend: BusBackend,
    /// Ring capacity of the in-process bus (and the publish queue of the
    /// AMQP bridge)
    pub capacity: usize,
    /// Broker URL for the AMQP backend
    pub amqp_url: Option<String>,
    /// Queue name for the AMQP backend
    pub amqp_queue: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusBackend {
    Memory,
    Amqp,
}

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Events per delivery batch
    pub batch_size: usize,
    /// Flush a partial batch after this long
    pub flush_interval: Duration,
    /// Total send attempts per batch
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt, capped at 30 s
    pub retry_base_delay: Duration,
    /// Hand failed batches to the fallback sink instead of dropping
    pub fallback_on_failure: bool,
    /// JSONL file backing the fallback sink
    pub fallback_path: PathBuf,
    /// Upper bound on the final flush during shutdown
    pub shutdown_flush_deadline: Duration,
}

/// Which sinks the dispatcher delivers to
#[derive(Debug, Clone, Default)]
pub struct SinkSettings {
    /// JSONL file sink (enabled when a path is configured)
    pub file_path: Option<PathBuf>,
    /// HTTP sink endpoint
    pub http_endpoint: Option<String>,
    /// Value for the HTTP sink's Authorization header
    pub http_auth: Option<String>,
    /// Per-request timeout for the HTTP sink
    pub http_timeout: Duration,
}

/// Audit writer configuration
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Queue size between the request path and the writer thread
    pub channel_buffer: usize,
    /// Rows per write transaction
    pub batch_size: usize,
    /// Flush a partial batch after this long
    pub flush_interval: Duration,
    /// Days of audit rows to keep; 0 keeps forever
    pub retention_days: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 100,
            admission_wait: Duration::from_millis(100),
            default_per_minute: 60,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::Memory,
            capacity: 1024,
            amqp_url: None,
            amqp_queue: "llmgate.events".to_string(),
        }
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_interval: Duration::from_secs(1),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(200),
            fallback_on_failure: true,
            fallback_path: PathBuf::from("./data/events-fallback.jsonl"),
            shutdown_flush_deadline: Duration::from_secs(5),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            channel_buffer: 10_000,
            batch_size: 100,
            flush_interval: Duration::from_secs(1),
            retention_days: 90,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".parse().unwrap(),
            management_token: String::new(),
            database_path: PathBuf::from("./data/llmgate.db"),
            encryption_key: None,
            require_encryption: false,
            token_pepper: String::new(),
            providers_file: None,
            proxy_path_prefix: "/v1".to_string(),
            request_timeout: Duration::from_secs(30),
            rate_limit: RateLimitConfig::default(),
            bus: BusConfig::default(),
            dispatcher: DispatcherSettings::default(),
            sinks: SinkSettings {
                http_timeout: Duration::from_secs(10),
                ..Default::default()
            },
            audit: AuditConfig::default(),
            project_cache_ttl: Duration::from_secs(60),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Environment loading
// ─────────────────────────────────────────────────────────────────────────────

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_string(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env_string(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Fails when a hard requirement is missing, so misconfiguration
    /// surfaces at startup rather than on the first request.
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        let management_token = env_string("MANAGEMENT_TOKEN")
            .context("MANAGEMENT_TOKEN is required (bearer token for the management API)")?;

        let require_encryption = env_bool("REQUIRE_ENCRYPTION", false);
        let encryption_key = match env_string("ENCRYPTION_KEY") {
            Some(raw) => Some(parse_master_key(&raw).context("Invalid ENCRYPTION_KEY")?),
            None => None,
        };
        if require_encryption && encryption_key.is_none() {
            bail!("REQUIRE_ENCRYPTION is set but no ENCRYPTION_KEY was supplied");
        }

        let listen_addr: SocketAddr = env_string("LISTEN_ADDR")
            .unwrap_or_else(|| defaults.listen_addr.to_string())
            .parse()
            .context("Invalid LISTEN_ADDR")?;

        let bus_backend = match env_string("EVENT_BUS_BACKEND").as_deref() {
            None | Some("memory") => BusBackend::Memory,
            Some("amqp") => BusBackend::Amqp,
            Some(other) => bail!("Unknown EVENT_BUS_BACKEND '{other}' (expected memory or amqp)"),
        };
        let amqp_url = env_string("AMQP_URL");
        if bus_backend == BusBackend::Amqp && amqp_url.is_none() {
            bail!("EVENT_BUS_BACKEND=amqp requires AMQP_URL");
        }

        Ok(Self {
            listen_addr,
            management_token,
            database_path: env_string("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            encryption_key,
            require_encryption,
            token_pepper: env_string("TOKEN_PEPPER").unwrap_or_default(),
            providers_file: env_string("PROVIDERS_FILE").map(PathBuf::from),
            proxy_path_prefix: env_string("PROXY_PATH_PREFIX")
                .unwrap_or(defaults.proxy_path_prefix),
            request_timeout: Duration::from_secs(env_parse("REQUEST_TIMEOUT_SECS", 30u64)),
            rate_limit: RateLimitConfig {
                max_concurrent_requests: env_parse("MAX_CONCURRENT_REQUESTS", 100usize),
                admission_wait: Duration::from_millis(env_parse("ADMISSION_WAIT_MS", 100u64)),
                default_per_minute: env_parse("DEFAULT_RATE_LIMIT_PER_MINUTE", 60u32),
            },
            bus: BusConfig {
                backend: bus_backend,
                capacity: env_parse("EVENT_BUS_CAPACITY", 1024usize),
                amqp_url,
                amqp_queue: env_string("AMQP_QUEUE")
                    .unwrap_or_else(|| defaults.bus.amqp_queue.clone()),
            },
            dispatcher: DispatcherSettings {
                batch_size: env_parse("DISPATCH_BATCH_SIZE", 50usize),
                flush_interval: Duration::from_millis(env_parse(
                    "DISPATCH_FLUSH_INTERVAL_MS",
                    1000u64,
                )),
                max_retries: env_parse("DISPATCH_MAX_RETRIES", 3u32),
                retry_base_delay: Duration::from_millis(env_parse(
                    "DISPATCH_RETRY_BASE_DELAY_MS",
                    200u64,
                )),
                fallback_on_failure: env_bool("DISPATCH_FALLBACK", true),
                fallback_path: env_string("FALLBACK_EVENTS_FILE")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.dispatcher.fallback_path),
                shutdown_flush_deadline: Duration::from_secs(env_parse(
                    "DISPATCH_SHUTDOWN_FLUSH_SECS",
                    5u64,
                )),
            },
            sinks: SinkSettings {
                file_path: env_string("EVENT_LOG_FILE").map(PathBuf::from),
                http_endpoint: env_string("EVENT_HTTP_ENDPOINT"),
                http_auth: env_string("EVENT_HTTP_AUTH"),
                http_timeout: Duration::from_millis(env_parse("EVENT_HTTP_TIMEOUT_MS", 10_000u64)),
            },
            audit: AuditConfig {
                channel_buffer: env_parse("AUDIT_CHANNEL_BUFFER", 10_000usize),
                batch_size: env_parse("AUDIT_BATCH_SIZE", 100usize),
                flush_interval: Duration::from_millis(env_parse("AUDIT_FLUSH_INTERVAL_MS", 1000u64)),
                retention_days: env_parse("RETENTION_DAYS", 90u32),
            },
            project_cache_ttl: Duration::from_secs(env_parse("PROJECT_CACHE_TTL_SECS", 60u64)),
            log_level: env_string("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_json: env_bool("LOG_FORMAT_JSON", false),
        })
    }
}

#[cfg(test)]
mod tests;
