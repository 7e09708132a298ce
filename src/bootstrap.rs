//! App composition
//!
//! Reads one JSON file describing where data lives, how to reach the API
//! and how the offline layer behaves, then builds the storage, HTTP client
//! and [`OfflineSupport`] from it:
//!
//! ```json
//! {
//!   "data_dir": "/var/lib/tidybook",
//!   "api": { "base_url": "https://api.tidybook.app/v1", "timeout_ms": 15000 },
//!   "offline": { "sync_interval_ms": 30000, "max_retries": 3 }
//! }
//! ```

use anyhow::Context;
use networking::{HttpClient, HttpClientConfig, HttpError, UpdateMethod};
use offline::{FetchError, OfflineConfig, OfflineSupport};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use storage::{KvConfig, KvStore};
use tracing::info;

/// Name of the sled database inside `data_dir`
const STORE_DIR: &str = "kv";

fn default_timeout_ms() -> u64 {
    30_000
}

/// API connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiSection {
    /// API base URL
    pub base_url: String,
    /// Request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Bearer token sent with every request
    #[serde(default)]
    pub bearer_token: Option<String>,
    /// User agent override
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Method for `update` mutations
    #[serde(default)]
    pub update_method: UpdateMethod,
    /// Extra headers sent with every request
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl ApiSection {
    /// API settings with defaults for everything but the URL
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_ms: default_timeout_ms(),
            bearer_token: None,
            user_agent: None,
            update_method: UpdateMethod::default(),
            headers: HashMap::new(),
        }
    }

    /// HTTP client configuration for these settings
    pub fn http_config(&self) -> HttpClientConfig {
        let mut config = HttpClientConfig::new(&self.base_url)
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_update_method(self.update_method);

        if let Some(user_agent) = &self.user_agent {
            config = config.with_user_agent(user_agent);
        }
        if let Some(token) = &self.bearer_token {
            config = config.with_bearer_token(token);
        }
        for (key, value) in &self.headers {
            config = config.with_header(key, value);
        }
        config
    }
}

/// Everything needed to start one app instance
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootstrapConfig {
    /// Directory holding the persistent store
    pub data_dir: PathBuf,
    /// API connection
    pub api: ApiSection,
    /// Offline layer settings
    #[serde(default)]
    pub offline: OfflineConfig,
}

impl BootstrapConfig {
    /// Configuration with default offline settings
    pub fn new(data_dir: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            api: ApiSection::new(base_url),
            offline: OfflineConfig::default(),
        }
    }

    /// Replace the offline settings
    pub fn with_offline(mut self, offline: OfflineConfig) -> Self {
        self.offline = offline;
        self
    }

    /// Parse a JSON configuration
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("Invalid bootstrap configuration")
    }

    /// Read and parse a JSON configuration file
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json_str(&contents)
    }
}

/// A running app instance
pub struct Tidybook {
    /// Cache, sync queue and connectivity handling
    pub offline: OfflineSupport,
    /// API client used for deliveries and cache fills
    pub api: HttpClient,
    store: KvStore,
}

impl Tidybook {
    /// Serve `key` from cache or fetch it from `endpoint`
    pub async fn fetch_cached<T>(
        &self,
        key: &str,
        endpoint: &str,
        version: &str,
        max_age: Option<Duration>,
    ) -> Result<T, FetchError<HttpError>>
    where
        T: Serialize + DeserializeOwned,
    {
        self.offline
            .fetch_with_cache(key, version, max_age, move || self.api.get_json::<T>(endpoint))
            .await
    }

    /// Flush the store to disk
    pub async fn close(self) -> anyhow::Result<()> {
        self.store.flush().await.context("Failed to flush store")?;
        info!("Store flushed");
        Ok(())
    }
}

/// Open storage, build the API client and load the offline layer
pub async fn bootstrap(config: BootstrapConfig) -> anyhow::Result<Tidybook> {
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;

    let store_path = config.data_dir.join(STORE_DIR);
    let store = KvStore::new(KvConfig::new(store_path.to_string_lossy()))
        .with_context(|| format!("Failed to open store at {}", store_path.display()))?;

    let api = HttpClient::new(config.api.http_config()).context("Failed to build API client")?;

    let offline = OfflineSupport::new(
        Arc::new(store.clone()),
        Arc::new(api.clone()),
        config.offline,
    )
    .await
    .context("Failed to start offline support")?;

    info!(
        data_dir = %config.data_dir.display(),
        base_url = %config.api.base_url,
        pending = offline.pending_count().await,
        "Tidybook started"
    );

    Ok(Tidybook { offline, api, store })
}
