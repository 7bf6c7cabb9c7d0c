//! Shared window storage for rate-limit events.

mod backend;
mod memory;
mod redis_store;
#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

pub use backend::{
    HealthReport, KeyInspection, StoreError, StoreResult, WindowCount, WindowStore,
};
pub(crate) use backend::window_millis;
pub use memory::MemoryWindowStore;
pub use redis_store::RedisWindowStore;

use crate::config::{StoreBackend, StoreConfig};

/// Build the configured window store.
pub fn from_config(config: &StoreConfig) -> StoreResult<Arc<dyn WindowStore>> {
    match config.backend {
        StoreBackend::Redis => Ok(Arc::new(RedisWindowStore::new(config)?)),
        StoreBackend::Memory => Ok(Arc::new(MemoryWindowStore::new(config.ttl_slack()))),
    }
}
