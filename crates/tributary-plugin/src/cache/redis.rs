use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::AsyncCommands;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use serde_json::Value;

use super::KeyedStore;
use crate::error::PluginError;

/// Redis-backed store. Values are kept as JSON strings so that integer
/// values remain usable by `INCR`.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    pub fn connect(url: &str) -> Result<Self, PluginError> {
        let pool = Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| PluginError::Cache(format!("failed to create redis pool: {e}")))?;
        Ok(Self { pool })
    }

    /// Build from `REDIS_URL`, if set.
    pub fn from_env() -> Option<Result<Self, PluginError>> {
        std::env::var("REDIS_URL").ok().map(|url| Self::connect(&url))
    }

    async fn conn(&self) -> Result<Connection, PluginError> {
        self.pool
            .get()
            .await
            .map_err(|e| PluginError::Cache(format!("redis pool: {e}")))
    }
}

fn redis_err(e: deadpool_redis::redis::RedisError) -> PluginError {
    PluginError::Cache(e.to_string())
}

#[async_trait]
impl KeyedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, PluginError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(key).await.map_err(redis_err)?;
        raw.map(|s| serde_json::from_str(&s).map_err(PluginError::from))
            .transpose()
    }

    async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), PluginError> {
        let mut conn = self.conn().await?;
        let encoded = serde_json::to_string(&value)?;
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, encoded, ttl.as_secs().max(1))
                .await
                .map_err(redis_err),
            None => conn.set::<_, _, ()>(key, encoded).await.map_err(redis_err),
        }
    }

    async fn incr(&self, key: &str) -> Result<i64, PluginError> {
        let mut conn = self.conn().await?;
        conn.incr(key, 1i64).await.map_err(redis_err)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, PluginError> {
        let mut conn = self.conn().await?;
        let secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        conn.expire(key, secs).await.map_err(redis_err)
    }
}
