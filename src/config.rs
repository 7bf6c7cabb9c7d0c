//! Configuration management for Slidegate.
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! environment variables prefixed with `SLIDEGATE__` (for example
//! `SLIDEGATE__STORE__URL=redis://cache:6379`).

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SlidegateError};

/// Prefix for environment variable overrides.
const ENV_PREFIX: &str = "SLIDEGATE";

/// Main configuration for the Slidegate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlidegateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Window store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Admin HTTP server address
    #[serde(default = "default_admin_addr")]
    pub admin_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            admin_addr: default_admin_addr(),
        }
    }
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which window store implementation to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis sorted sets
    #[default]
    Redis,
    /// In-process memory, for single-node use
    Memory,
}

/// Window store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store implementation
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix prepended to every rate-limit key in the store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on a single store operation, in milliseconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// Extra key lifetime beyond the window, in milliseconds
    #[serde(default = "default_ttl_slack")]
    pub ttl_slack_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            operation_timeout_ms: default_operation_timeout(),
            ttl_slack_ms: default_ttl_slack(),
        }
    }
}

impl StoreConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn ttl_slack(&self) -> Duration {
        Duration::from_millis(self.ttl_slack_ms)
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "ratelimit:".to_string()
}

fn default_operation_timeout() -> u64 {
    250
}

fn default_ttl_slack() -> u64 {
    1000
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to the limiter rules file; the standard limiters apply when unset
    pub rules_path: Option<String>,
}

impl SlidegateConfig {
    /// Load configuration from an optional file, overlaid with environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| SlidegateError::Config(format!("Failed to load configuration: {}", e)))
    }

    /// Parse configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| SlidegateError::Config(format!("Failed to parse configuration: {}", e)))
    }
}
