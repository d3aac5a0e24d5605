//! Environment-driven configuration, assembled once and threaded through the
//! registry, fetcher, normalizer, processor, and orchestrator constructors.
//!
//! No global mutable config: `Config::from_env()` is called once at startup
//! and passed by reference from there on, the same separation the original
//! crate draws between construction-time `BuildError`s and runtime state.

use crate::error::ConfigError;
use std::collections::HashMap;
use std::time::Duration;

fn env_var(key: &'static str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_or_default<T: std::str::FromStr>(key: &'static str, default: T) -> T {
    match env_var(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::debug!(key, raw, "unparseable config value, using default");
            default
        }),
        None => default,
    }
}

fn clamp_u64(key: &'static str, value: u64, min: u64, max: u64) -> u64 {
    let clamped = value.clamp(min, max);
    if clamped != value {
        tracing::warn!(key, value, clamped, "config value clamped to bounds");
    }
    clamped
}

fn clamp_f64(key: &'static str, value: f64, min: f64, max: f64) -> f64 {
    let clamped = value.clamp(min, max);
    if clamped != value {
        tracing::warn!(key, value, clamped, "config value clamped to bounds");
    }
    clamped
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub deadline: Duration,
    pub max_retries: usize,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter_factor: f64,
    pub circuit_breaker_threshold: usize,
    pub circuit_breaker_reset: Duration,
    pub circuit_breaker_half_open_max_calls: usize,
    pub max_concurrency: usize,
    pub rate_limit_per_sec: f64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_millis(15_000),
            max_retries: 3,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_millis(10_000),
            jitter_factor: 0.2,
            circuit_breaker_threshold: 5,
            circuit_breaker_reset: Duration::from_secs(30),
            circuit_breaker_half_open_max_calls: 1,
            max_concurrency: 10,
            rate_limit_per_sec: 5.0,
        }
    }
}

impl HttpConfig {
    fn from_env() -> Self {
        let deadline_ms = clamp_u64("HTTP_DEADLINE_MS", parse_or_default("HTTP_DEADLINE_MS", 15_000), 1, 30_000);
        let max_redirects_backoff_ms = parse_or_default("HTTP_BASE_BACKOFF_MS", 200u64);
        let max_backoff_ms = parse_or_default("HTTP_MAX_BACKOFF_MS", 10_000u64);
        let jitter = clamp_f64("HTTP_JITTER_FACTOR", parse_or_default("HTTP_JITTER_FACTOR", 0.2), 0.0, 1.0);
        let half_open = clamp_u64(
            "HTTP_CIRCUIT_BREAKER_HALF_OPEN_MAX_CALLS",
            parse_or_default("HTTP_CIRCUIT_BREAKER_HALF_OPEN_MAX_CALLS", 1u64),
            1,
            1000,
        );
        let max_retries = clamp_u64("HTTP_MAX_RETRIES", parse_or_default("HTTP_MAX_RETRIES", 3u64), 0, 10);

        Self {
            deadline: Duration::from_millis(deadline_ms),
            max_retries: max_retries as usize,
            base_backoff: Duration::from_millis(max_redirects_backoff_ms),
            max_backoff: Duration::from_millis(max_backoff_ms),
            jitter_factor: jitter,
            circuit_breaker_threshold: clamp_u64(
                "HTTP_CIRCUIT_BREAKER_THRESHOLD",
                parse_or_default("HTTP_CIRCUIT_BREAKER_THRESHOLD", 5u64),
                1,
                1000,
            ) as usize,
            circuit_breaker_reset: Duration::from_millis(parse_or_default("HTTP_CIRCUIT_BREAKER_RESET_MS", 30_000u64)),
            circuit_breaker_half_open_max_calls: half_open as usize,
            max_concurrency: clamp_u64(
                "HTTP_MAX_CONCURRENCY",
                parse_or_default("HTTP_MAX_CONCURRENCY", 10u64),
                1,
                10_000,
            ) as usize,
            rate_limit_per_sec: parse_or_default("HTTP_RATE_LIMIT_PER_SEC", 5.0),
        }
    }
}

/// A partial per-host override merged onto `HttpConfig`'s defaults at lookup
/// time, keyed by normalized hostname.
#[derive(Debug, Clone, Default)]
pub struct HostOverride {
    pub rps: Option<f64>,
    pub burst: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct HostOverrides(pub HashMap<String, HostOverride>);

impl HostOverrides {
    /// Scan the environment for `HOST_LIMIT__<host>__RPS|BURST` and rebuild
    /// the original hostname from its underscore-escaped form.
    fn from_env() -> Self {
        let mut map: HashMap<String, HostOverride> = HashMap::new();
        for (key, value) in std::env::vars() {
            let Some(rest) = key.strip_prefix("HOST_LIMIT__") else { continue };
            let Some((host_escaped, field)) = rest.rsplit_once("__") else { continue };
            let host = host_escaped.replace('_', ".").to_lowercase();
            let entry = map.entry(host).or_default();
            match field {
                "RPS" => entry.rps = value.parse().ok(),
                "BURST" => entry.burst = value.parse().ok(),
                _ => {}
            }
        }
        Self(map)
    }

    pub fn get(&self, host: &str) -> Option<&HostOverride> {
        self.0.get(host)
    }
}

#[derive(Debug, Clone)]
pub struct FetchSecurityConfig {
    pub max_body_bytes: u64,
    pub max_redirects: u8,
    pub block_downgrade: bool,
    pub denylist_suffixes: Vec<String>,
}

impl Default for FetchSecurityConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 20 * 1024 * 1024,
            max_redirects: 5,
            block_downgrade: true,
            denylist_suffixes: Vec::new(),
        }
    }
}

impl FetchSecurityConfig {
    fn from_env() -> Self {
        let max_redirects = clamp_u64(
            "FETCH_URL_MAX_REDIRECTS",
            parse_or_default("FETCH_URL_MAX_REDIRECTS", 5u64),
            0,
            10,
        ) as u8;
        let denylist = env_var("FETCH_URL_DENYLIST")
            .map(|raw| raw.split(',').map(|s| s.trim().to_lowercase()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        Self {
            max_body_bytes: parse_or_default("FETCH_URL_MAX_BYTES", 20 * 1024 * 1024u64),
            max_redirects,
            block_downgrade: parse_or_default("FETCH_URL_BLOCK_DOWNGRADE", true),
            denylist_suffixes: denylist,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub input_cap: usize,
    pub default_concurrency: usize,
    pub default_item_retries: usize,
    pub error_sample_cap: usize,
    pub graceful_shutdown_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            input_cap: 1500,
            default_concurrency: 10,
            default_item_retries: 3,
            error_sample_cap: 50,
            graceful_shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub retention: Duration,
    pub bind_addr: Option<String>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self { retention: Duration::from_secs(24 * 60 * 60), bind_addr: None }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub http: HttpConfig,
    pub host_overrides: HostOverrides,
    pub security: FetchSecurityConfig,
    pub batch: BatchConfig,
    pub job: JobConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            http: HttpConfig::from_env(),
            host_overrides: HostOverrides::from_env(),
            security: FetchSecurityConfig::from_env(),
            batch: BatchConfig::default(),
            job: JobConfig {
                retention: Duration::from_secs(parse_or_default("JOB_RETENTION_SECS", 24 * 60 * 60u64)),
                bind_addr: env_var("JOB_BIND_ADDR"),
            },
        })
    }
}
