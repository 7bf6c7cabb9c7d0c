//! Redis-backed window store.
//!
//! Each key is a sorted set of event members scored by their timestamp in
//! milliseconds. `record_attempt` runs trim, insert, count and expiry refresh
//! as a single `MULTI/EXEC` transaction so concurrent callers never observe
//! a partial update.

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisResult};
use tokio::sync::OnceCell;
use tracing::{debug, info, trace};
use uuid::Uuid;

use super::backend::{
    window_millis, KeyInspection, StoreError, StoreResult, WindowCount, WindowStore,
};
use crate::config::StoreConfig;

/// Keys removed per `DEL` when clearing a namespace.
const DELETE_BATCH: usize = 500;

/// A [`WindowStore`] backed by Redis sorted sets.
pub struct RedisWindowStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    key_prefix: String,
    operation_timeout: Duration,
    ttl_slack: Duration,
}

impl std::fmt::Debug for RedisWindowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisWindowStore")
            .field("key_prefix", &self.key_prefix)
            .field("operation_timeout", &self.operation_timeout)
            .field("connected", &self.connection.initialized())
            .finish()
    }
}

impl RedisWindowStore {
    /// Create a store for the configured Redis URL.
    ///
    /// No connection is made here; the first operation connects, and a failed
    /// connection is retried by the next operation.
    pub fn new(config: &StoreConfig) -> StoreResult<Self> {
        let client = Client::open(config.url.as_str())?;
        info!(
            key_prefix = %config.key_prefix,
            timeout_ms = config.operation_timeout_ms,
            "Redis window store configured"
        );

        Ok(Self {
            client,
            connection: OnceCell::new(),
            key_prefix: config.key_prefix.clone(),
            operation_timeout: config.operation_timeout(),
            ttl_slack: config.ttl_slack(),
        })
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn connection(&self) -> RedisResult<ConnectionManager> {
        let conn = self
            .connection
            .get_or_try_init(|| async {
                debug!("Connecting to Redis");
                self.client.get_connection_manager().await
            })
            .await?;
        Ok(conn.clone())
    }

    /// Run `op` against a live connection, bounded by the operation timeout.
    async fn run<T, F, Fut>(&self, operation: &'static str, op: F) -> StoreResult<T>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let started = Instant::now();
        let work = async {
            let conn = self.connection().await?;
            op(conn).await
        };

        match tokio::time::timeout(self.operation_timeout, work).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout {
                operation,
                elapsed: started.elapsed(),
            }),
        }
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn record_attempt(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
    ) -> StoreResult<WindowCount> {
        let store_key = self.store_key(key);
        let window_ms = window_millis(window);
        let cutoff_ms = now_ms.saturating_sub(window_ms);
        let expire_ms = window_ms.saturating_add(window_millis(self.ttl_slack));
        let member = format!("{}-{}", now_ms, Uuid::new_v4().simple());

        let (count, oldest): (u64, Vec<(String, f64)>) = self
            .run("record_attempt", |mut conn| async move {
                redis::pipe()
                    .atomic()
                    .zrembyscore(&store_key, "-inf", cutoff_ms)
                    .ignore()
                    .zadd(&store_key, &member, now_ms)
                    .ignore()
                    .zcard(&store_key)
                    .zrange_withscores(&store_key, 0, 0)
                    .pexpire(&store_key, expire_ms)
                    .ignore()
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        trace!(key = %key, count = count, "Recorded attempt in Redis");
        let oldest_ms = oldest.first().map(|(_, score)| *score as i64);
        Ok(WindowCount::from_oldest(count, oldest_ms, now_ms, window))
    }

    async fn count_in_window(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
    ) -> StoreResult<WindowCount> {
        let store_key = self.store_key(key);
        let min = format!("({}", now_ms.saturating_sub(window_millis(window)));

        let (count, oldest): (u64, Vec<(String, f64)>) = self
            .run("count_in_window", |mut conn| async move {
                redis::pipe()
                    .atomic()
                    .zcount(&store_key, &min, now_ms)
                    .zrangebyscore_limit_withscores(&store_key, &min, now_ms, 0, 1)
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        let oldest_ms = oldest.first().map(|(_, score)| *score as i64);
        Ok(WindowCount::from_oldest(count, oldest_ms, now_ms, window))
    }

    async fn clear(&self, key: &str) -> StoreResult<u64> {
        let store_key = self.store_key(key);
        let (removed,): (u64,) = self
            .run("clear", |mut conn| async move {
                redis::pipe()
                    .atomic()
                    .zcard(&store_key)
                    .del(&store_key)
                    .ignore()
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(removed)
    }

    async fn clear_prefix(&self, prefix: &str) -> StoreResult<u64> {
        let pattern = format!("{}*", glob_escape(&self.store_key(prefix)));

        self.run("clear_prefix", |mut conn| async move {
            let keys: Vec<String> = {
                let iter = conn.scan_match::<_, String>(&pattern).await?;
                iter.collect().await
            };

            let mut removed = 0u64;
            for batch in keys.chunks(DELETE_BATCH) {
                let deleted: u64 = conn.del(batch).await?;
                removed += deleted;
            }
            debug!(pattern = %pattern, removed = removed, "Cleared Redis keys");
            Ok(removed)
        })
        .await
    }

    async fn inspect(&self, key: &str) -> StoreResult<KeyInspection> {
        let store_key = self.store_key(key);
        let (count, ttl_ms): (u64, i64) = self
            .run("inspect", |mut conn| async move {
                redis::pipe()
                    .zcard(&store_key)
                    .pttl(&store_key)
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        // PTTL reports -2 for a missing key and -1 for a key without expiry.
        Ok(KeyInspection {
            count,
            ttl_ms: ttl_ms.max(-1),
        })
    }

    async fn ping(&self) -> StoreResult<()> {
        self.run("ping", |mut conn| async move {
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

/// Escape Redis glob metacharacters so a prefix matches literally.
fn glob_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
