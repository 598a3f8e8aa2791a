//! Per-plugin key/value cache over a shared store.

mod memory;
#[cfg(feature = "redis")]
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::PluginError;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis::RedisStore;

/// Operations every cache backend must implement.
///
/// `incr` and `expire` must be single atomic operations at the store.
#[async_trait]
pub trait KeyedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, PluginError>;

    /// Store a value. A `None` TTL clears any previous expiry.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>)
        -> Result<(), PluginError>;

    /// Increment an integer counter, treating an absent key as 0.
    async fn incr(&self, key: &str) -> Result<i64, PluginError>;

    /// Reset the TTL of an existing key. Returns whether the key existed.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, PluginError>;
}

/// Cache handle given to one plugin. Every key is prefixed with the
/// plugin id so plugins never see each other's entries.
#[derive(Clone)]
pub struct PluginCache {
    store: Arc<dyn KeyedStore>,
    prefix: String,
}

impl PluginCache {
    pub fn new(store: Arc<dyn KeyedStore>, plugin_id: Uuid) -> Self {
        Self {
            store,
            prefix: format!("@plugin/{plugin_id}/"),
        }
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Stored value for `key`, or `default` if absent or expired.
    pub async fn get(&self, key: &str, default: impl Into<Value>) -> Result<Value, PluginError> {
        Ok(self
            .store
            .get(&self.scoped(key))
            .await?
            .unwrap_or_else(|| default.into()))
    }

    pub async fn set(
        &self,
        key: &str,
        value: impl Into<Value>,
        ttl_seconds: Option<u64>,
    ) -> Result<(), PluginError> {
        self.store
            .set(
                &self.scoped(key),
                value.into(),
                ttl_seconds.map(Duration::from_secs),
            )
            .await
    }

    pub async fn incr(&self, key: &str) -> Result<i64, PluginError> {
        self.store.incr(&self.scoped(key)).await
    }

    pub async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool, PluginError> {
        self.store
            .expire(&self.scoped(key), Duration::from_secs(ttl_seconds))
            .await
    }
}

impl std::fmt::Debug for PluginCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginCache")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
