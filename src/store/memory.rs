//! In-process window store.
//!
//! Holds one ordered event log per key in a sharded map. Each operation runs
//! under the key's shard lock, which gives the same all-or-nothing behaviour
//! the Redis store gets from `MULTI/EXEC`. Useful for single-node
//! deployments and tests; state is not shared between processes.
//!
//! Idle keys are evicted by a sweep that runs on the record path at most once
//! per [`SWEEP_INTERVAL_MS`].

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::backend::{
    window_millis, KeyInspection, StoreResult, WindowCount, WindowStore,
};

/// Minimum time between sweeps for expired keys, in milliseconds.
pub const SWEEP_INTERVAL_MS: i64 = 60_000;

/// Events for one key, ordered by (timestamp, nonce).
#[derive(Debug, Default)]
struct EventLog {
    events: BTreeSet<(i64, u64)>,
    expires_at_ms: i64,
}

impl EventLog {
    fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms
    }

    /// Drop every event with a timestamp at or before `cutoff_ms`.
    fn trim(&mut self, cutoff_ms: i64) {
        self.events = self.events.split_off(&(cutoff_ms.saturating_add(1), 0));
    }

    fn oldest(&self) -> Option<i64> {
        self.events.first().map(|(ts, _)| *ts)
    }
}

/// A [`WindowStore`] kept in process memory.
#[derive(Debug)]
pub struct MemoryWindowStore {
    windows: DashMap<String, EventLog>,
    sequence: AtomicU64,
    next_sweep_ms: AtomicI64,
    ttl_slack: Duration,
}

impl MemoryWindowStore {
    /// Create an empty store whose keys expire `ttl_slack` after their window.
    pub fn new(ttl_slack: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            sequence: AtomicU64::new(0),
            next_sweep_ms: AtomicI64::new(i64::MIN),
            ttl_slack,
        }
    }

    /// Number of keys currently held, expired or not.
    pub fn key_count(&self) -> usize {
        self.windows.len()
    }

    /// Remove every key whose expiry has passed at `now_ms`.
    pub fn evict_expired(&self, now_ms: i64) -> usize {
        let mut evicted = 0usize;
        self.windows.retain(|_, log| {
            let expired = log.is_expired(now_ms);
            if expired {
                evicted += 1;
            }
            !expired
        });
        if evicted > 0 {
            debug!(evicted = evicted, "Evicted idle keys from memory store");
        }
        evicted
    }

    /// Sweep when the interval has elapsed. Only one caller wins each sweep.
    fn maybe_sweep(&self, now_ms: i64) {
        let due = self.next_sweep_ms.load(Ordering::Relaxed);
        if now_ms < due {
            return;
        }
        let next = now_ms.saturating_add(SWEEP_INTERVAL_MS);
        if self
            .next_sweep_ms
            .compare_exchange(due, next, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.evict_expired(now_ms);
        }
    }

    fn wall_clock_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

impl Default for MemoryWindowStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn record_attempt(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
    ) -> StoreResult<WindowCount> {
        let window_ms = window_millis(window);
        let nonce = self.sequence.fetch_add(1, Ordering::Relaxed);
        // Must run before the entry guard below is taken.
        self.maybe_sweep(now_ms);

        let mut log = self.windows.entry(key.to_string()).or_default();
        if log.is_expired(now_ms) {
            log.events.clear();
        }
        log.trim(now_ms.saturating_sub(window_ms));
        log.events.insert((now_ms, nonce));
        log.expires_at_ms = now_ms
            .saturating_add(window_ms)
            .saturating_add(window_millis(self.ttl_slack));

        let count = log.events.len() as u64;
        trace!(key = %key, count = count, "Recorded attempt in memory store");
        Ok(WindowCount::from_oldest(count, log.oldest(), now_ms, window))
    }

    async fn count_in_window(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
    ) -> StoreResult<WindowCount> {
        let cutoff_ms = now_ms.saturating_sub(window_millis(window));
        let Some(log) = self.windows.get(key) else {
            return Ok(WindowCount::from_oldest(0, None, now_ms, window));
        };
        if log.is_expired(now_ms) {
            return Ok(WindowCount::from_oldest(0, None, now_ms, window));
        }

        let mut live = log
            .events
            .range((cutoff_ms.saturating_add(1), 0)..)
            .filter(|(ts, _)| *ts <= now_ms);
        let oldest = live.next().map(|(ts, _)| *ts);
        let count = oldest.map_or(0, |_| 1 + live.count() as u64);
        Ok(WindowCount::from_oldest(count, oldest, now_ms, window))
    }

    async fn clear(&self, key: &str) -> StoreResult<u64> {
        let now_ms = Self::wall_clock_ms();
        Ok(self
            .windows
            .remove(key)
            .filter(|(_, log)| !log.is_expired(now_ms))
            .map_or(0, |(_, log)| log.events.len() as u64))
    }

    async fn clear_prefix(&self, prefix: &str) -> StoreResult<u64> {
        let now_ms = Self::wall_clock_ms();
        let mut removed = 0u64;
        self.windows.retain(|key, log| {
            let matches = key.starts_with(prefix);
            // Expired keys are dropped too but were already gone as far as
            // callers can tell.
            if matches && !log.is_expired(now_ms) {
                removed += 1;
            }
            !matches
        });
        Ok(removed)
    }

    async fn inspect(&self, key: &str) -> StoreResult<KeyInspection> {
        let now_ms = Self::wall_clock_ms();
        match self.windows.get(key) {
            Some(log) if !log.is_expired(now_ms) => Ok(KeyInspection {
                count: log.events.len() as u64,
                ttl_ms: log.expires_at_ms - now_ms,
            }),
            _ => Ok(KeyInspection::ABSENT),
        }
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
