//! In-process TTL cache for read-heavy API responses.
//!
//! The cache is an explicit, injectable object: services that want caching
//! receive a [`ResponseCache`] handle through their constructor and must call
//! [`ResponseCache::invalidate`] after every mutation of the underlying rows.
//! There is no ambient singleton.

use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Cache lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }
}

/// Bounded-TTL key/value cache backed by an in-memory map.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    store: Arc<RwLock<HashMap<String, CacheEntry>>>,
    default_ttl: Duration,
}

impl ResponseCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            store: Arc::new(RwLock::new(HashMap::new())),
            default_ttl,
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let store = self.store.read().ok()?;
        let entry = store.get(key)?;
        if entry.is_expired() {
            drop(store);
            if let Ok(mut store) = self.store.write() {
                store.remove(key);
            }
            return None;
        }
        serde_json::from_str(&entry.value).ok()
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        self.put_with_ttl(key, value, self.default_ttl)
    }

    pub fn put_with_ttl<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let serialized = serde_json::to_string(value)?;
        let mut store = self.store.write().map_err(|_| CacheError::Poisoned)?;
        store.insert(
            key.to_string(),
            CacheEntry {
                value: serialized,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    /// Drops a single key. Call after any mutation touching the cached row.
    pub fn invalidate(&self, key: &str) {
        if let Ok(mut store) = self.store.write() {
            store.remove(key);
        }
    }

    /// Drops every key starting with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) {
        if let Ok(mut store) = self.store.write() {
            store.retain(|k, _| !k.starts_with(prefix));
        }
    }

    /// Removes expired entries. Invoked from a periodic maintenance task.
    pub fn evict_expired(&self) {
        if let Ok(mut store) = self.store.write() {
            store.retain(|_, entry| !entry.is_expired());
        }
    }

    pub fn len(&self) -> usize {
        self.store.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
