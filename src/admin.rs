//! Operational introspection and remediation.
//!
//! Used by admin tooling, never by the request path.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::ratelimit::RateLimitKey;
use crate::store::{HealthReport, WindowStore};

/// Current state of one rate-limit key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyStatus {
    pub key: String,
    pub exists: bool,
    pub count: u64,
    pub ttl_ms: i64,
}

/// Health and management operations over the window store.
#[derive(Clone)]
pub struct Admin {
    store: Arc<dyn WindowStore>,
}

impl Admin {
    pub fn new(store: Arc<dyn WindowStore>) -> Self {
        Self { store }
    }

    /// Probe the window store.
    pub async fn check_health(&self) -> HealthReport {
        self.store.health_check().await
    }

    /// Delete every key in the namespace `pattern`, returning how many were removed.
    ///
    /// A trailing `*` is accepted, so `login:` and `login:*` are equivalent. A
    /// bare limiter name such as `login` is read as its namespace `login:`, so
    /// it never reaches into `login_extra:`.
    pub async fn clear_limiter(&self, pattern: &str) -> Result<u64> {
        let prefix = namespace_prefix(pattern);
        let cleared = self.store.clear_prefix(&prefix).await?;
        info!(prefix = %prefix, cleared = cleared, "Cleared rate limit keys");
        Ok(cleared)
    }

    /// Report the count and expiry of `key`.
    ///
    /// A missing key and an unreachable store both read as an empty window.
    pub async fn get_status(&self, key: &str) -> KeyStatus {
        match self.store.inspect(key).await {
            Ok(inspection) => KeyStatus {
                key: key.to_string(),
                exists: inspection.count > 0 || inspection.ttl_ms >= 0,
                count: inspection.count,
                ttl_ms: inspection.ttl_ms,
            },
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read rate limit status");
                KeyStatus {
                    key: key.to_string(),
                    exists: false,
                    count: 0,
                    ttl_ms: -1,
                }
            }
        }
    }
}

fn namespace_prefix(pattern: &str) -> String {
    let prefix = pattern.trim_end_matches('*');
    if prefix.is_empty() || prefix.contains(':') {
        prefix.to_string()
    } else {
        RateLimitKey::namespace(prefix)
    }
}
