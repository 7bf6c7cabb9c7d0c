//! Window store trait for abstracting the remote and in-process implementations.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Errors raised by a window store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The Redis client reported a failure.
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    /// The operation did not complete within the configured bound.
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },
    /// The store cannot serve requests right now.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The state of a key's window after an attempt or a peek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Number of events inside the window
    pub count: u64,
    /// Epoch milliseconds at which the oldest event leaves the window
    pub reset_at_ms: i64,
}

impl WindowCount {
    /// Compute the reset time from the oldest remaining event, if any.
    pub fn from_oldest(count: u64, oldest_ms: Option<i64>, now_ms: i64, window: Duration) -> Self {
        let window_ms = window_millis(window);
        Self {
            count,
            reset_at_ms: oldest_ms.unwrap_or(now_ms).saturating_add(window_ms),
        }
    }
}

/// Non-mutating view of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KeyInspection {
    /// Number of events stored under the key
    pub count: u64,
    /// Remaining expiry in milliseconds, `-1` when unset or absent
    pub ttl_ms: i64,
}

impl KeyInspection {
    /// The inspection of a key that does not exist.
    pub const ABSENT: KeyInspection = KeyInspection {
        count: 0,
        ttl_ms: -1,
    };
}

/// Outcome of a store round-trip probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub message: String,
}

impl HealthReport {
    pub fn healthy(message: impl Into<String>) -> Self {
        Self {
            healthy: true,
            message: message.into(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: message.into(),
        }
    }
}

/// Shared, atomic storage of timestamped events per rate-limit key.
///
/// Implementations must execute `record_attempt` as one indivisible unit:
/// two concurrent callers against the same key each observe a distinct count.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Trim events older than the window, insert one at `now_ms`, count,
    /// and refresh the key's expiry.
    async fn record_attempt(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
    ) -> StoreResult<WindowCount>;

    /// Count events inside `(now_ms - window, now_ms]` without recording.
    async fn count_in_window(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
    ) -> StoreResult<WindowCount>;

    /// Remove all state for `key`, returning the number of events removed.
    async fn clear(&self, key: &str) -> StoreResult<u64>;

    /// Remove every key starting with `prefix`, returning the number of keys removed.
    async fn clear_prefix(&self, prefix: &str) -> StoreResult<u64>;

    /// Read the current count and expiry of `key`.
    async fn inspect(&self, key: &str) -> StoreResult<KeyInspection>;

    /// Perform a lightweight round-trip to the store.
    async fn ping(&self) -> StoreResult<()>;

    /// Short name of the backend, for logs and health messages.
    fn backend_name(&self) -> &'static str;

    /// Probe the store. Never fails; a failure is reported in the result.
    async fn health_check(&self) -> HealthReport {
        match self.ping().await {
            Ok(()) => HealthReport::healthy(format!("{} store reachable", self.backend_name())),
            Err(e) => HealthReport::unhealthy(format!(
                "{} store unreachable: {}",
                self.backend_name(),
                e
            )),
        }
    }
}

/// Window length in whole milliseconds, saturating at `i64::MAX`.
pub(crate) fn window_millis(window: Duration) -> i64 {
    i64::try_from(window.as_millis()).unwrap_or(i64::MAX)
}
