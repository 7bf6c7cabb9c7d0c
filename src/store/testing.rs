//! Window stores that misbehave, for exercising failure paths.

use std::time::Duration;

use async_trait::async_trait;

use super::backend::{KeyInspection, StoreError, StoreResult, WindowCount, WindowStore};

/// Fails every operation as if the store were unreachable.
#[derive(Debug, Default)]
pub struct FailingStore;

#[async_trait]
impl WindowStore for FailingStore {
    async fn record_attempt(
        &self,
        _key: &str,
        _now_ms: i64,
        _window: Duration,
    ) -> StoreResult<WindowCount> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn count_in_window(
        &self,
        _key: &str,
        _now_ms: i64,
        _window: Duration,
    ) -> StoreResult<WindowCount> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn clear(&self, _key: &str) -> StoreResult<u64> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn clear_prefix(&self, _prefix: &str) -> StoreResult<u64> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn inspect(&self, _key: &str) -> StoreResult<KeyInspection> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn ping(&self) -> StoreResult<()> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    fn backend_name(&self) -> &'static str {
        "failing"
    }
}

/// Never answers within any reasonable deadline.
#[derive(Debug, Default)]
pub struct StalledStore;

impl StalledStore {
    async fn stall<T>() -> StoreResult<T> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Err(StoreError::Unavailable("stalled".to_string()))
    }
}

#[async_trait]
impl WindowStore for StalledStore {
    async fn record_attempt(
        &self,
        _key: &str,
        _now_ms: i64,
        _window: Duration,
    ) -> StoreResult<WindowCount> {
        Self::stall().await
    }

    async fn count_in_window(
        &self,
        _key: &str,
        _now_ms: i64,
        _window: Duration,
    ) -> StoreResult<WindowCount> {
        Self::stall().await
    }

    async fn clear(&self, _key: &str) -> StoreResult<u64> {
        Self::stall().await
    }

    async fn clear_prefix(&self, _prefix: &str) -> StoreResult<u64> {
        Self::stall().await
    }

    async fn inspect(&self, _key: &str) -> StoreResult<KeyInspection> {
        Self::stall().await
    }

    async fn ping(&self) -> StoreResult<()> {
        Self::stall().await
    }

    fn backend_name(&self) -> &'static str {
        "stalled"
    }
}
