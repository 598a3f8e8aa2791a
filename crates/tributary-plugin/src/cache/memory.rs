use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use super::KeyedStore;
use crate::error::PluginError;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Writes between full sweeps of expired entries.
const SWEEP_EVERY: u64 = 1024;

/// In-process store. Expired entries are evicted on access and by a
/// sweep every [`SWEEP_EVERY`] writes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        Self::sweep(&mut self.entries.lock())
    }

    fn sweep(entries: &mut HashMap<String, Entry>) -> usize {
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        before - entries.len()
    }

    fn note_write(&self, entries: &mut HashMap<String, Entry>) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_EVERY == 0 {
            let removed = Self::sweep(entries);
            if removed > 0 {
                tracing::trace!(removed, remaining = entries.len(), "swept expired cache entries");
            }
        }
    }

    /// Live entry for `key`, dropping it if it has expired.
    fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }
}

#[async_trait]
impl KeyedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, PluginError> {
        let mut entries = self.entries.lock();
        Ok(Self::live(&mut entries, key).map(|e| e.value.clone()))
    }

    async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), PluginError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), Entry { value, expires_at });
        self.note_write(&mut entries);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, PluginError> {
        let mut entries = self.entries.lock();
        match Self::live(&mut entries, key) {
            Some(entry) => {
                let current = as_counter(&entry.value).ok_or_else(|| {
                    PluginError::Cache(format!("value at '{key}' is not an integer"))
                })?;
                let next = current
                    .checked_add(1)
                    .ok_or_else(|| PluginError::Cache(format!("counter '{key}' overflowed")))?;
                entry.value = Value::from(next);
                Ok(next)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::from(1),
                        expires_at: None,
                    },
                );
                self.note_write(&mut entries);
                Ok(1)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, PluginError> {
        let mut entries = self.entries.lock();
        match Self::live(&mut entries, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Integer value of a counter. Whole-number floats such as `5.0` count.
fn as_counter(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64)
            .map(|f| f as i64)
    })
}
