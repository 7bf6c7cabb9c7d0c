//! Limiter rules configuration.
//!
//! Rules are a YAML list of named limiters. Each limiter binds a window,
//! a maximum event count, a key strategy and a rejection message:
//!
//! ```yaml
//! limiters:
//!   - name: login
//!     window_ms: 900000
//!     max_events: 10
//!     key: client_address
//!     message: Too many login attempts, please try again later.
//!   - name: chat
//!     window_ms: 60000
//!     max_events: 60
//!     key:
//!       subject_and_resource:
//!         param: persona_id
//!     message: Too many messages, please slow down.
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::key::KeyStrategy;
use crate::error::{Result, SlidegateError};

const MINUTE_MS: u64 = 60 * 1000;
const HOUR_MS: u64 = 60 * MINUTE_MS;

/// Configuration of one named limiter. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Limiter name, also the key namespace
    pub name: String,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Maximum attempts admitted per window (inclusive)
    pub max_events: u64,
    /// How the throttled caller is identified
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub key: KeyStrategy,
    /// Message returned to denied callers
    pub message: String,
    /// Only count attempts whose response succeeded
    #[serde(default)]
    pub skip_failed_requests: bool,
}

impl LimiterConfig {
    pub fn new(
        name: impl Into<String>,
        window: Duration,
        max_events: u64,
        key: KeyStrategy,
        message: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            max_events,
            key,
            message: message.into(),
            skip_failed_requests: false,
        }
    }

    /// Count only attempts whose downstream response succeeded.
    pub fn skipping_failed_requests(mut self) -> Self {
        self.skip_failed_requests = true;
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(SlidegateError::Config(format!(
                "limiter `{}`: {}",
                self.name, reason
            )))
        };

        if self.name.is_empty() {
            return invalid("name must not be empty");
        }
        if self.name.contains(':') {
            return invalid("name must not contain ':'");
        }
        if self.window_ms == 0 {
            return invalid("window_ms must be positive");
        }
        if self.max_events == 0 {
            return invalid("max_events must be positive");
        }
        if self.message.trim().is_empty() {
            return invalid("message must not be empty");
        }
        if let KeyStrategy::SubjectAndResource { param } = &self.key {
            if param.is_empty() {
                return invalid("resource param must not be empty");
            }
        }
        Ok(())
    }
}

/// A validated set of limiters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterRules {
    pub limiters: Vec<LimiterConfig>,
}

impl LimiterRules {
    /// Build a rule set, rejecting invalid or duplicate limiters.
    pub fn new(limiters: Vec<LimiterConfig>) -> Result<Self> {
        let rules = Self { limiters };
        rules.validate()?;
        Ok(rules)
    }

    /// The limiters guarding account and conversation endpoints.
    pub fn standard() -> Self {
        let by_address = || KeyStrategy::ClientAddress;
        let hour = Duration::from_millis(HOUR_MS);
        let minute = Duration::from_millis(MINUTE_MS);

        Self {
            limiters: vec![
                LimiterConfig::new(
                    "register",
                    hour,
                    5,
                    by_address(),
                    "Too many accounts created from this address, please try again after an hour.",
                ),
                LimiterConfig::new(
                    "resend_verification",
                    hour,
                    5,
                    by_address(),
                    "Too many verification emails requested, please try again after an hour.",
                ),
                LimiterConfig::new(
                    "login",
                    Duration::from_millis(15 * MINUTE_MS),
                    10,
                    by_address(),
                    "Too many login attempts, please try again after 15 minutes.",
                ),
                LimiterConfig::new(
                    "password_reset",
                    hour,
                    3,
                    by_address(),
                    "Too many password reset requests, please try again after an hour.",
                ),
                LimiterConfig::new(
                    "chat",
                    minute,
                    60,
                    KeyStrategy::SubjectAndResource {
                        param: "persona_id".to_string(),
                    },
                    "Too many messages sent, please slow down.",
                ),
                LimiterConfig::new(
                    "persona",
                    minute,
                    100,
                    KeyStrategy::Subject,
                    "Too many requests, please try again later.",
                ),
            ],
        }
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: LimiterRules = serde_yaml::from_str(yaml)
            .map_err(|e| SlidegateError::Config(format!("Failed to parse limiter rules: {}", e)))?;
        rules.validate()?;
        Ok(rules)
    }

    /// Find a limiter by name.
    pub fn get(&self, name: &str) -> Option<&LimiterConfig> {
        self.limiters.iter().find(|limiter| limiter.name == name)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for limiter in &self.limiters {
            limiter.validate()?;
            if !seen.insert(limiter.name.as_str()) {
                return Err(SlidegateError::Config(format!(
                    "limiter `{}` is defined more than once",
                    limiter.name
                )));
            }
        }
        Ok(())
    }
}

impl Default for LimiterRules {
    fn default() -> Self {
        Self::standard()
    }
}
