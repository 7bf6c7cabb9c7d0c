//! Named admission gates.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace};

use super::key::{KeyError, KeyInputs, RateLimitKey};
use super::rules::{LimiterConfig, LimiterRules};
use super::window::{decide, Attempt, Decision, SlidingWindow};
use crate::error::{Result, SlidegateError};
use crate::store::WindowCount;

/// A limiter bound to its configuration and the shared window store.
///
/// Cloning is cheap; clones share the same configuration and store.
#[derive(Clone)]
pub struct RateLimiter {
    config: Arc<LimiterConfig>,
    window: SlidingWindow,
}

impl RateLimiter {
    pub fn new(config: LimiterConfig, window: SlidingWindow) -> Self {
        Self {
            config: Arc::new(config),
            window,
        }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Derive the key for a request under this limiter's namespace.
    pub fn key_for(&self, inputs: &KeyInputs) -> std::result::Result<RateLimitKey, KeyError> {
        RateLimitKey::derive(&self.config.name, &self.config.key, inputs)
    }

    /// Record an attempt for `key` now and decide whether it is admitted.
    pub async fn admit(&self, key: &RateLimitKey) -> Decision {
        self.admit_at(key, now_ms()).await
    }

    /// Record an attempt for `key` at `now_ms` and decide whether it is admitted.
    pub async fn admit_at(&self, key: &RateLimitKey, now_ms: i64) -> Decision {
        let window = self.config.window();
        let counted = self
            .window
            .record(key, now_ms, window)
            .await
            .or_fail_open(key, now_ms, window);

        let decision = decide(counted, self.config.max_events, now_ms);
        self.trace_decision(key, &decision);
        decision
    }

    /// Decide whether an attempt for `key` would be admitted, without recording it.
    pub async fn preview(&self, key: &RateLimitKey) -> Decision {
        self.preview_at(key, now_ms()).await
    }

    /// Like [`preview`](Self::preview), at an explicit time.
    pub async fn preview_at(&self, key: &RateLimitKey, now_ms: i64) -> Decision {
        let window = self.config.window();
        // A peek sees earlier attempts only, so count this one on top. The
        // fail-open default already includes it.
        let counted = match self.window.peek(key, now_ms, window).await {
            Attempt::Counted(peeked) => WindowCount {
                count: peeked.count + 1,
                ..peeked
            },
            unavailable => unavailable.or_fail_open(key, now_ms, window),
        };

        let decision = decide(counted, self.config.max_events, now_ms);
        self.trace_decision(key, &decision);
        decision
    }

    fn trace_decision(&self, key: &RateLimitKey, decision: &Decision) {
        if decision.is_allowed() {
            trace!(
                limiter = %self.config.name,
                key = %key,
                count = decision.count,
                limit = decision.limit,
                "Attempt admitted"
            );
        } else {
            debug!(
                limiter = %self.config.name,
                key = %key,
                count = decision.count,
                limit = decision.limit,
                retry_after_secs = decision.retry_after_secs,
                "Rate limit exceeded"
            );
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish()
    }
}

/// All configured limiters, sharing one window store.
#[derive(Clone, Debug, Default)]
pub struct LimiterRegistry {
    limiters: HashMap<String, RateLimiter>,
}

impl LimiterRegistry {
    /// Build a limiter for every rule.
    pub fn from_rules(rules: &LimiterRules, window: &SlidingWindow) -> Self {
        let limiters = rules
            .limiters
            .iter()
            .map(|config| {
                (
                    config.name.clone(),
                    RateLimiter::new(config.clone(), window.clone()),
                )
            })
            .collect();
        Self { limiters }
    }

    pub fn get(&self, name: &str) -> Option<&RateLimiter> {
        self.limiters.get(name)
    }

    /// Look up a limiter that route wiring requires.
    pub fn require(&self, name: &str) -> Result<RateLimiter> {
        self.get(name)
            .cloned()
            .ok_or_else(|| SlidegateError::Config(format!("unknown limiter `{}`", name)))
    }

    /// Limiter configurations, sorted by name.
    pub fn configs(&self) -> Vec<LimiterConfig> {
        let mut configs: Vec<LimiterConfig> = self
            .limiters
            .values()
            .map(|limiter| limiter.config().clone())
            .collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
