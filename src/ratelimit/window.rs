//! Sliding window admission.
//!
//! The window covers `(now - window, now]` and moves with every attempt.
//! The attempt that breaches the limit is still recorded, so a count reports
//! attempts including any overflow rather than accepted requests.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::key::RateLimitKey;
use crate::store::{window_millis, StoreResult, WindowCount, WindowStore};

/// Result of asking the store about a key's window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    /// The store answered
    Counted(WindowCount),
    /// The store failed or did not answer in time
    Unavailable { reason: String },
}

impl Attempt {
    /// Resolve to a window count, admitting the attempt when the store is down.
    pub fn or_fail_open(self, key: &RateLimitKey, now_ms: i64, window: Duration) -> WindowCount {
        match self {
            Attempt::Counted(count) => count,
            Attempt::Unavailable { reason } => {
                warn!(
                    key = %key,
                    reason = %reason,
                    "Window store unavailable, failing open"
                );
                WindowCount {
                    count: 1,
                    reset_at_ms: now_ms.saturating_add(window_millis(window)),
                }
            }
        }
    }
}

/// Admission verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
}

/// The outcome of evaluating one attempt against a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub verdict: Verdict,
    /// Configured maximum events per window
    pub limit: u64,
    /// Attempts in the window, including this one
    pub count: u64,
    /// Attempts left before denial
    pub remaining: u64,
    /// Epoch milliseconds at which the window next frees capacity
    pub reset_at_ms: i64,
    /// Seconds until retrying can succeed; zero when allowed
    pub retry_after_secs: u64,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        self.verdict == Verdict::Allow
    }

    /// Reset time as whole epoch seconds, rounded up.
    pub fn reset_epoch_secs(&self) -> i64 {
        self.reset_at_ms.div_euclid(1000) + i64::from(self.reset_at_ms.rem_euclid(1000) != 0)
    }
}

/// Compare a window count against `max_events`.
pub fn decide(window: WindowCount, max_events: u64, now_ms: i64) -> Decision {
    let allowed = window.count <= max_events;
    let retry_after_secs = if allowed {
        0
    } else {
        let wait_ms = window.reset_at_ms.saturating_sub(now_ms).max(0) as u64;
        wait_ms.div_ceil(1000)
    };

    Decision {
        verdict: if allowed { Verdict::Allow } else { Verdict::Deny },
        limit: max_events,
        count: window.count,
        remaining: max_events.saturating_sub(window.count),
        reset_at_ms: window.reset_at_ms,
        retry_after_secs,
    }
}

/// A window store bound to a deadline for request-path calls.
#[derive(Clone)]
pub struct SlidingWindow {
    store: Arc<dyn WindowStore>,
    deadline: Duration,
}

impl SlidingWindow {
    pub fn new(store: Arc<dyn WindowStore>, deadline: Duration) -> Self {
        Self { store, deadline }
    }

    pub fn store(&self) -> &Arc<dyn WindowStore> {
        &self.store
    }

    /// Record an attempt for `key` at `now_ms`.
    pub async fn record(&self, key: &RateLimitKey, now_ms: i64, window: Duration) -> Attempt {
        let call = self.store.record_attempt(key.as_str(), now_ms, window);
        self.bounded(call).await
    }

    /// Count the attempts already in the window without recording one.
    pub async fn peek(&self, key: &RateLimitKey, now_ms: i64, window: Duration) -> Attempt {
        let call = self.store.count_in_window(key.as_str(), now_ms, window);
        self.bounded(call).await
    }

    async fn bounded<F>(&self, call: F) -> Attempt
    where
        F: std::future::Future<Output = StoreResult<WindowCount>>,
    {
        match tokio::time::timeout(self.deadline, call).await {
            Ok(Ok(count)) => Attempt::Counted(count),
            Ok(Err(e)) => Attempt::Unavailable {
                reason: e.to_string(),
            },
            Err(_) => Attempt::Unavailable {
                reason: format!("no response within {:?}", self.deadline),
            },
        }
    }
}
