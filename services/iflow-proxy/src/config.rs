//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Every section and key has a default, so an empty file is valid. The
//! `IFLOW_*` environment variables are applied over the file before
//! validation.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use iflow_pool::{DispatchConfig, SelectionStrategy};
use serde::Deserialize;
use tracing::warn;

/// Allowed range for `max_request_iterations`.
pub const ITERATIONS_RANGE: std::ops::RangeInclusive<u32> = 10..=1000;

/// Allowed range for `request_timeout_ms`.
pub const REQUEST_TIMEOUT_RANGE: std::ops::RangeInclusive<u64> = 60_000..=600_000;

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub pool: PoolConfig,
    pub logging: LoggingConfig,
}

/// HTTP gateway settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    /// Admin API listener; disabled when absent
    pub admin_addr: Option<SocketAddr>,
    pub upstream_url: String,
    /// Per-attempt HTTP timeout
    pub attempt_timeout_secs: u64,
    pub max_connections: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8787)),
            admin_addr: None,
            upstream_url: iflow_auth::BASE_URL.to_string(),
            attempt_timeout_secs: 120,
            max_connections: 1000,
        }
    }
}

/// Account pool and dispatch budgets
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub accounts_path: PathBuf,
    pub selection_strategy: SelectionStrategy,
    pub max_request_iterations: u32,
    pub request_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            accounts_path: PathBuf::from("iflow-accounts.json"),
            selection_strategy: SelectionStrategy::RoundRobin,
            max_request_iterations: 50,
            request_timeout_ms: 300_000,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log shaped outbound request bodies at debug level
    pub enable_log_api_request: bool,
}

impl Config {
    /// Load configuration from a TOML file, overlay environment variables,
    /// then validate.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `IFLOW_*` overrides from `lookup`.
    ///
    /// An invalid strategy falls back to round-robin. Unparseable numbers
    /// and booleans keep the file value.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("IFLOW_ACCOUNT_SELECTION_STRATEGY") {
            self.pool.selection_strategy = value.trim().parse().unwrap_or_else(|e| {
                warn!(error = %e, "invalid IFLOW_ACCOUNT_SELECTION_STRATEGY, using round-robin");
                SelectionStrategy::RoundRobin
            });
        }
        if let Some(value) = lookup("IFLOW_MAX_REQUEST_ITERATIONS") {
            match value.trim().parse() {
                Ok(n) => self.pool.max_request_iterations = n,
                Err(_) => warn!(value, "ignoring unparseable IFLOW_MAX_REQUEST_ITERATIONS"),
            }
        }
        if let Some(value) = lookup("IFLOW_REQUEST_TIMEOUT_MS") {
            match value.trim().parse() {
                Ok(ms) => self.pool.request_timeout_ms = ms,
                Err(_) => warn!(value, "ignoring unparseable IFLOW_REQUEST_TIMEOUT_MS"),
            }
        }
        if let Some(value) = lookup("IFLOW_ENABLE_LOG_API_REQUEST") {
            match value.trim() {
                "1" | "true" => self.logging.enable_log_api_request = true,
                "0" | "false" => self.logging.enable_log_api_request = false,
                other => warn!(value = other, "ignoring invalid IFLOW_ENABLE_LOG_API_REQUEST"),
            }
        }
    }

    pub fn validate(&self) -> common::Result<()> {
        if !self.proxy.upstream_url.starts_with("http://")
            && !self.proxy.upstream_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream_url must start with http:// or https://, got: {}",
                self.proxy.upstream_url
            )));
        }
        if self.proxy.attempt_timeout_secs == 0 {
            return Err(common::Error::Config(
                "attempt_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.proxy.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if !ITERATIONS_RANGE.contains(&self.pool.max_request_iterations) {
            return Err(common::Error::Config(format!(
                "max_request_iterations must be within {}..={}, got: {}",
                ITERATIONS_RANGE.start(),
                ITERATIONS_RANGE.end(),
                self.pool.max_request_iterations
            )));
        }
        if !REQUEST_TIMEOUT_RANGE.contains(&self.pool.request_timeout_ms) {
            return Err(common::Error::Config(format!(
                "request_timeout_ms must be within {}..={}, got: {}",
                REQUEST_TIMEOUT_RANGE.start(),
                REQUEST_TIMEOUT_RANGE.end(),
                self.pool.request_timeout_ms
            )));
        }
        Ok(())
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            max_iterations: self.pool.max_request_iterations,
            timeout: Duration::from_millis(self.pool.request_timeout_ms),
            log_request_bodies: self.logging.enable_log_api_request,
        }
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("iflow-proxy.toml")
    }
}
