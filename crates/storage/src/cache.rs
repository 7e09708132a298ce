//! Cache management system
//!
//! This module provides a persisted, versioned snapshot cache of fetched
//! data. Entries are stamped with their write time so callers can decide
//! whether to refetch, and an LRU index bounds how many entries survive.
//!
//! Every storage failure is logged and converted to a safe default: reads
//! yield `None`, writes become no-ops.

use lru::LruCache;
use parking_lot::Mutex;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::kv::{KeyValueStorage, KvError};

/// Default staleness window (five minutes)
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(300);

/// Namespace prepended to every cache key in storage
pub const DEFAULT_CACHE_PREFIX: &str = "@cache_";

/// Default ceiling on the number of persisted cache entries
pub const DEFAULT_MAX_ENTRIES: usize = 500;

/// Cache error types
#[derive(Debug, Error)]
pub enum CacheError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// KV store error
    #[error("KV store error: {0}")]
    Kv(#[from] KvError),
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Cache entry with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntry<T> {
    /// Write time in milliseconds since the Unix epoch
    pub timestamp: u64,
    /// The cached value
    pub data: T,
    /// Schema or version tag of the cached value
    pub version: String,
}

impl<T> CachedEntry<T> {
    /// Age of the entry at `now_millis`
    pub fn age(&self, now_millis: u64) -> Duration {
        Duration::from_millis(now_millis.saturating_sub(self.timestamp))
    }

    /// Whether the entry is older than `max_age` (an entry exactly `max_age` old is fresh)
    pub fn is_stale(&self, now_millis: u64, max_age: Duration) -> bool {
        self.age(now_millis) > max_age
    }
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Storage key namespace
    pub prefix: String,
    /// Maximum number of persisted entries
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_CACHE_PREFIX.to_string(),
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl CacheConfig {
    /// Create a new cache configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the storage key namespace
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set maximum entries
    pub fn max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }
}

/// Persisted snapshot cache with an LRU entry ceiling
pub struct CacheStore {
    storage: Arc<dyn KeyValueStorage>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    index: Mutex<LruCache<String, ()>>,
}

impl CacheStore {
    /// Open the cache, rebuilding the LRU index from persisted entries
    ///
    /// Entries are indexed oldest-first by write time. If more entries are
    /// persisted than the ceiling allows, the oldest are removed.
    pub async fn open(
        storage: Arc<dyn KeyValueStorage>,
        clock: Arc<dyn Clock>,
        config: CacheConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        let cache = Self {
            storage,
            clock,
            config,
            index: Mutex::new(LruCache::new(capacity)),
        };

        if let Err(e) = cache.rebuild_index().await {
            error!(error = %e, "Failed to rebuild cache index; starting empty");
        }

        cache
    }

    /// Write `data` under `key`, overwriting any previous entry
    pub async fn set_cached_data<T>(&self, key: &str, data: &T, version: &str)
    where
        T: Serialize + ?Sized,
    {
        match self.try_set(key, data, version).await {
            Ok(()) => debug!(key, version, "Cached data"),
            Err(e) => error!(key, error = %e, "Failed to write cache entry"),
        }
    }

    /// Read the payload cached under `key`
    pub async fn get_cached_data<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_cached_entry(key).await.map(|entry| entry.data)
    }

    /// Read the full entry (payload, write time and version) cached under `key`
    pub async fn get_cached_entry<T: DeserializeOwned>(&self, key: &str) -> Option<CachedEntry<T>> {
        match self.try_get(key).await {
            Ok(entry) => entry,
            Err(e) => {
                error!(key, error = %e, "Failed to read cache entry");
                None
            }
        }
    }

    /// Whether the entry under `key` is missing or older than `max_age`
    pub async fn is_data_stale(&self, key: &str, max_age: Duration) -> bool {
        match self.get_cached_entry::<IgnoredAny>(key).await {
            Some(entry) => entry.is_stale(self.clock.now_millis(), max_age),
            None => true,
        }
    }

    /// [`is_data_stale`](Self::is_data_stale) with the five minute default window
    pub async fn is_data_stale_default(&self, key: &str) -> bool {
        self.is_data_stale(key, DEFAULT_MAX_AGE).await
    }

    /// Remove every cache entry, leaving unrelated storage keys untouched
    ///
    /// Returns the number of removed entries.
    pub async fn clear_cache(&self) -> usize {
        match self.try_clear().await {
            Ok(removed) => {
                info!(removed, "Cleared cache");
                removed
            }
            Err(e) => {
                error!(error = %e, "Failed to clear cache");
                0
            }
        }
    }

    /// Number of indexed entries
    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.index.lock().is_empty()
    }

    /// The cache configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.config.prefix, key)
    }

    async fn try_set<T>(&self, key: &str, data: &T, version: &str) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let entry = CachedEntry {
            timestamp: self.clock.now_millis(),
            data,
            version: version.to_string(),
        };
        let json = serde_json::to_string(&entry)?;
        self.storage.set(&self.storage_key(key), &json).await?;

        // `push` hands back the old value for an existing key, or the evicted LRU entry.
        let evicted = self
            .index
            .lock()
            .push(key.to_string(), ())
            .map(|(old, _)| old)
            .filter(|old| old != key);

        if let Some(evicted) = evicted {
            debug!(key = %evicted, "Evicting least recently used cache entry");
            if let Err(e) = self.storage.remove(&self.storage_key(&evicted)).await {
                warn!(key = %evicted, error = %e, "Failed to remove evicted cache entry");
            }
        }

        Ok(())
    }

    async fn try_get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<CachedEntry<T>>> {
        let Some(raw) = self.storage.get(&self.storage_key(key)).await? else {
            return Ok(None);
        };

        let entry: CachedEntry<T> = serde_json::from_str(&raw)?;
        self.index.lock().promote(key);
        Ok(Some(entry))
    }

    async fn try_clear(&self) -> Result<usize> {
        let keys: Vec<String> = self
            .storage
            .all_keys()
            .await?
            .into_iter()
            .filter(|k| k.starts_with(&self.config.prefix))
            .collect();

        if !keys.is_empty() {
            self.storage.multi_remove(&keys).await?;
        }

        self.index.lock().clear();
        Ok(keys.len())
    }

    async fn rebuild_index(&self) -> Result<()> {
        let mut stamped = Vec::new();
        let mut overflow = Vec::new();

        for storage_key in self.storage.all_keys().await? {
            let Some(key) = storage_key.strip_prefix(&self.config.prefix) else {
                continue;
            };
            let Some(raw) = self.storage.get(&storage_key).await? else {
                continue;
            };
            match serde_json::from_str::<CachedEntry<IgnoredAny>>(&raw) {
                Ok(entry) => stamped.push((entry.timestamp, key.to_string())),
                Err(e) => {
                    warn!(key, error = %e, "Dropping unreadable cache entry");
                    overflow.push(storage_key.clone());
                }
            }
        }

        stamped.sort();

        {
            let mut index = self.index.lock();
            for (_, key) in stamped {
                if let Some((evicted, _)) = index.push(key, ()) {
                    overflow.push(self.storage_key(&evicted));
                }
            }
        }

        if !overflow.is_empty() {
            warn!(count = overflow.len(), "Trimming unreadable or excess cache entries");
            self.storage.multi_remove(&overflow).await?;
        }

        debug!(entries = self.len(), "Rebuilt cache index");
        Ok(())
    }
}
