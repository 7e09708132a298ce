//! Offline layer configuration
//!
//! Defaults match the mobile apps: a 30 second sync timer, three delivery
//! attempts per mutation and a five minute cache staleness window.
//! Configuration can also be read from JSON, where every field is optional
//! and durations are given in milliseconds:
//!
//! ```json
//! { "sync_interval_ms": 15000, "max_retries": 5, "cache_max_entries": 200 }
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use storage::{
    CacheConfig, DEFAULT_CACHE_PREFIX, DEFAULT_DEAD_LETTER_CAPACITY, DEFAULT_DEAD_LETTER_KEY,
    DEFAULT_MAX_AGE, DEFAULT_MAX_ENTRIES, DEFAULT_QUEUE_KEY,
};
use thiserror::Error;

/// Interval of the automatic sync timer
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Delivery attempts before a mutation is dropped
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Capacity of the sync event broadcast channel
pub const DEFAULT_EVENT_BUFFER: usize = 64;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Configuration for the offline layer
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "OfflineConfigFile")]
pub struct OfflineConfig {
    /// How often to flush the queue while online and in the foreground
    pub sync_interval: Duration,

    /// Delivery attempts before a mutation is dropped
    pub max_retries: u32,

    /// Staleness window used when callers do not pass one
    pub default_max_age: Duration,

    /// Storage key namespace of cache entries
    pub cache_prefix: String,

    /// Maximum number of persisted cache entries
    pub cache_max_entries: usize,

    /// Storage key of the sync queue
    pub queue_key: String,

    /// Storage key of the dead letters
    pub dead_letter_key: String,

    /// Maximum number of dead letters kept (0 disables the store)
    pub dead_letter_capacity: usize,

    /// Upper bound on a single delivery; `None` leaves it to the HTTP client
    pub delivery_timeout: Option<Duration>,

    /// Capacity of the sync event channel
    pub event_buffer: usize,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            sync_interval: DEFAULT_SYNC_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            default_max_age: DEFAULT_MAX_AGE,
            cache_prefix: DEFAULT_CACHE_PREFIX.to_string(),
            cache_max_entries: DEFAULT_MAX_ENTRIES,
            queue_key: DEFAULT_QUEUE_KEY.to_string(),
            dead_letter_key: DEFAULT_DEAD_LETTER_KEY.to_string(),
            dead_letter_capacity: DEFAULT_DEAD_LETTER_CAPACITY,
            delivery_timeout: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl OfflineConfig {
    /// Create a configuration with the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sync timer interval
    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Set the retry ceiling
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the default staleness window
    pub fn default_max_age(mut self, max_age: Duration) -> Self {
        self.default_max_age = max_age;
        self
    }

    /// Set the cache key namespace
    pub fn cache_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.cache_prefix = prefix.into();
        self
    }

    /// Set the cache entry ceiling
    pub fn cache_max_entries(mut self, max: usize) -> Self {
        self.cache_max_entries = max;
        self
    }

    /// Set the dead-letter capacity
    pub fn dead_letter_capacity(mut self, capacity: usize) -> Self {
        self.dead_letter_capacity = capacity;
        self
    }

    /// Bound every delivery attempt
    pub fn delivery_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// Cache settings derived from this configuration
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::new()
            .prefix(self.cache_prefix.clone())
            .max_entries(self.cache_max_entries)
    }

    /// Check value ranges and key layout
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be at least 1".to_string()));
        }
        if self.sync_interval.is_zero() {
            return Err(ConfigError::Invalid("sync_interval must be non-zero".to_string()));
        }
        if self.cache_max_entries == 0 {
            return Err(ConfigError::Invalid("cache_max_entries must be at least 1".to_string()));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid("event_buffer must be at least 1".to_string()));
        }
        if self.cache_prefix.is_empty() {
            return Err(ConfigError::Invalid("cache_prefix must not be empty".to_string()));
        }
        for key in [&self.queue_key, &self.dead_letter_key] {
            if key.is_empty() {
                return Err(ConfigError::Invalid("storage keys must not be empty".to_string()));
            }
            // clear_cache would wipe the queue otherwise
            if key.starts_with(&self.cache_prefix) {
                return Err(ConfigError::Invalid(format!(
                    "storage key {key} falls inside cache prefix {}",
                    self.cache_prefix
                )));
            }
        }
        if self.queue_key == self.dead_letter_key {
            return Err(ConfigError::Invalid(
                "queue_key and dead_letter_key must differ".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read, parse and validate a JSON configuration file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json_str(&contents)
    }
}

/// On-disk form of [`OfflineConfig`]
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct OfflineConfigFile {
    sync_interval_ms: Option<u64>,
    max_retries: Option<u32>,
    default_max_age_ms: Option<u64>,
    cache_prefix: Option<String>,
    cache_max_entries: Option<usize>,
    queue_key: Option<String>,
    dead_letter_key: Option<String>,
    dead_letter_capacity: Option<usize>,
    delivery_timeout_ms: Option<u64>,
    event_buffer: Option<usize>,
}

impl TryFrom<OfflineConfigFile> for OfflineConfig {
    type Error = ConfigError;

    fn try_from(file: OfflineConfigFile) -> Result<Self> {
        let defaults = OfflineConfig::default();
        let config = OfflineConfig {
            sync_interval: file
                .sync_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.sync_interval),
            max_retries: file.max_retries.unwrap_or(defaults.max_retries),
            default_max_age: file
                .default_max_age_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.default_max_age),
            cache_prefix: file.cache_prefix.unwrap_or(defaults.cache_prefix),
            cache_max_entries: file.cache_max_entries.unwrap_or(defaults.cache_max_entries),
            queue_key: file.queue_key.unwrap_or(defaults.queue_key),
            dead_letter_key: file.dead_letter_key.unwrap_or(defaults.dead_letter_key),
            dead_letter_capacity: file
                .dead_letter_capacity
                .unwrap_or(defaults.dead_letter_capacity),
            delivery_timeout: file.delivery_timeout_ms.map(Duration::from_millis),
            event_buffer: file.event_buffer.unwrap_or(defaults.event_buffer),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OfflineConfig::default();
        assert_eq!(config.sync_interval, Duration::from_secs(30));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.default_max_age, Duration::from_secs(300));
        assert_eq!(config.cache_prefix, "@cache_");
        assert_eq!(config.queue_key, "@sync_queue");
        assert!(config.delivery_timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = OfflineConfig::new()
            .sync_interval(Duration::from_secs(10))
            .max_retries(5)
            .cache_max_entries(20)
            .delivery_timeout(Some(Duration::from_secs(3)));

        assert_eq!(config.sync_interval, Duration::from_secs(10));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.cache_config().max_entries, 20);
        assert_eq!(config.delivery_timeout, Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_from_json_partial() {
        let config =
            OfflineConfig::from_json_str(r#"{ "sync_interval_ms": 15000, "max_retries": 4 }"#)
                .unwrap();

        assert_eq!(config.sync_interval, Duration::from_secs(15));
        assert_eq!(config.max_retries, 4);
        assert_eq!(config.default_max_age, DEFAULT_MAX_AGE);
    }

    #[test]
    fn test_from_json_empty_object_is_default() {
        let config = OfflineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, OfflineConfig::default());
    }

    #[test]
    fn test_from_json_rejects_unknown_field() {
        let result = OfflineConfig::from_json_str(r#"{ "sync_every": 5 }"#);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_from_json_rejects_zero_retries() {
        let result = OfflineConfig::from_json_str(r#"{ "max_retries": 0 }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_queue_key_inside_cache_prefix_is_invalid() {
        let config = OfflineConfig::new().cache_prefix("@");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offline.json");
        tokio::fs::write(&path, r#"{ "cache_max_entries": 12, "delivery_timeout_ms": 2500 }"#)
            .await
            .unwrap();

        let config = OfflineConfig::load(&path).await.unwrap();
        assert_eq!(config.cache_max_entries, 12);
        assert_eq!(config.delivery_timeout, Some(Duration::from_millis(2500)));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let result = OfflineConfig::load("/nonexistent/offline.json").await;
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
