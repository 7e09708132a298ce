//! HTTP client for the booking API
//!
//! Maps queued mutations onto REST calls: `create` is a POST, `update` a
//! PUT or PATCH and `delete` a DELETE without a body. The mutation payload
//! is sent as JSON. Any non-2xx answer is a rejection.

use async_trait::async_trait;
use offline::{DeliveryError, MutationSink};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Client as ReqwestClient, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use storage::{SyncAction, SyncQueueItem};
use thiserror::Error;
use tracing::{debug, warn};

/// HTTP client error types
#[derive(Debug, Error)]
pub enum HttpError {
    /// The client could not be built from its configuration
    #[error("Invalid client configuration: {0}")]
    Build(String),

    /// The request did not complete
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered with a non-success status
    #[error("HTTP {status}: {body}")]
    Status {
        /// Status code
        status: u16,
        /// Response body
        body: String,
    },

    /// The response body was not the expected JSON
    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, HttpError>;

impl From<HttpError> for DeliveryError {
    fn from(error: HttpError) -> Self {
        match error {
            HttpError::Status { status, body } => DeliveryError::Rejected { status, message: body },
            other => DeliveryError::Transport(other.to_string()),
        }
    }
}

/// HTTP method used for `update` mutations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UpdateMethod {
    /// Full replacement
    #[default]
    Put,
    /// Partial update
    Patch,
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// API base URL (e.g., "https://api.tidybook.app/v1")
    pub base_url: String,
    /// Request timeout
    pub timeout: Duration,
    /// User agent string
    pub user_agent: String,
    /// Headers sent with every request
    pub default_headers: HashMap<String, String>,
    /// Bearer token sent as `Authorization`
    pub bearer_token: Option<String>,
    /// Method for `update` mutations
    pub update_method: UpdateMethod,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            timeout: Duration::from_secs(30),
            user_agent: format!("Tidybook/{}", env!("CARGO_PKG_VERSION")),
            default_headers: HashMap::new(),
            bearer_token: None,
            update_method: UpdateMethod::Put,
        }
    }
}

impl HttpClientConfig {
    /// Create a config for an API base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), ..Default::default() }
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the user agent
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Add a default header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(key.into(), value.into());
        self
    }

    /// Set the bearer token
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Set the method for `update` mutations
    pub fn with_update_method(mut self, method: UpdateMethod) -> Self {
        self.update_method = method;
        self
    }
}

/// HTTP client for the booking API
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: ReqwestClient,
    config: HttpClientConfig,
}

impl HttpClient {
    /// Create a new client
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let headers = default_headers(&config)?;
        let client = ReqwestClient::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .default_headers(headers)
            .build()?;

        Ok(Self { client, config })
    }

    /// Absolute URL for an endpoint path
    ///
    /// Endpoints that already are absolute URLs are used as-is.
    pub fn url_for(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }
        let base = self.config.base_url.trim_end_matches('/');
        let path = endpoint.trim_start_matches('/');
        format!("{base}/{path}")
    }

    /// Send one queued mutation
    pub async fn send_mutation(&self, item: &SyncQueueItem) -> Result<()> {
        let url = self.url_for(&item.endpoint);
        let request = match item.action {
            SyncAction::Create => self.client.post(&url).json(&item.data),
            SyncAction::Update => match self.config.update_method {
                UpdateMethod::Put => self.client.put(&url).json(&item.data),
                UpdateMethod::Patch => self.client.patch(&url).json(&item.data),
            },
            SyncAction::Delete => self.client.delete(&url),
        };

        debug!(item_id = %item.id, action = %item.action, url = %url, "Sending mutation");
        self.execute(request).await.map(|_| ())
    }

    /// GET an endpoint and decode its JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let url = self.url_for(endpoint);
        let body = self.execute(self.client.get(&url)).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Get the client configuration
    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    async fn execute(&self, request: RequestBuilder) -> Result<String> {
        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Request rejected");
            return Err(HttpError::Status { status: status.as_u16(), body });
        }
        Ok(response.text().await?)
    }
}

#[async_trait]
impl MutationSink for HttpClient {
    async fn deliver(&self, item: &SyncQueueItem) -> std::result::Result<(), DeliveryError> {
        self.send_mutation(item).await.map_err(DeliveryError::from)
    }
}

fn default_headers(config: &HttpClientConfig) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();

    for (key, value) in &config.default_headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| HttpError::Build(format!("header name {key}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| HttpError::Build(format!("header {key}: {e}")))?;
        headers.insert(name, value);
    }

    if let Some(token) = &config.bearer_token {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| HttpError::Build(format!("bearer token: {e}")))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }

    Ok(headers)
}
