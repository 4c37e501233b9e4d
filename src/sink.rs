use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use crate::{
    error::{Result, WearableError},
    storage::KeyValueStore,
    types::{HealthDataBatch, SinkConfig, WireHealthRecord},
};

/// Key of the bearer token in the key-value store
pub const ACCESS_TOKEN_KEY: &str = "@access_token";

/// Acknowledgement returned by the remote API
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SinkResponse {
    /// Server supplied message
    #[serde(default)]
    pub message: String,
}

/// Destination of uploaded health records
#[async_trait]
pub trait RemoteSink: Send + Sync {
    /// Upload one batch, records in arrival order
    async fn send(&self, device_id: &str, records: &[WireHealthRecord]) -> Result<SinkResponse>;
}

/// Source of the bearer credential attached to uploads
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Current access token, if logged in
    async fn access_token(&self) -> Option<String>;

    /// Drop the credential after the server rejected it
    async fn clear(&self);
}

/// [`TokenStore`] keeping the token in a [`KeyValueStore`]
#[derive(Clone)]
pub struct KeyValueTokenStore {
    store: Arc<dyn KeyValueStore>,
}

impl KeyValueTokenStore {
    /// Create a token store on top of a key-value store
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Save a freshly issued token
    ///
    /// # Errors
    ///
    /// Returns the underlying store error.
    pub async fn save_access_token(&self, token: &str) -> Result<()> {
        self.store.set(ACCESS_TOKEN_KEY, token.to_string()).await?;
        info!("Access token saved");
        Ok(())
    }
}

#[async_trait]
impl TokenStore for KeyValueTokenStore {
    async fn access_token(&self) -> Option<String> {
        match self.store.get(ACCESS_TOKEN_KEY).await {
            Ok(token) => token,
            Err(e) => {
                warn!("Failed to read access token: {}", e);
                None
            }
        }
    }

    async fn clear(&self) {
        if let Err(e) = self.store.remove(ACCESS_TOKEN_KEY).await {
            warn!("Failed to clear access token: {}", e);
        } else {
            info!("Access token cleared");
        }
    }
}

/// [`RemoteSink`] posting JSON batches to the health data endpoint
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
    tokens: Arc<dyn TokenStore>,
}

impl HttpSink {
    /// Create a sink for the configured API
    ///
    /// # Errors
    ///
    /// Returns [`WearableError::Http`] if the HTTP client cannot be built.
    pub fn new(config: &SinkConfig, tokens: Arc<dyn TokenStore>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}{}",
                config.base_url.trim_end_matches('/'),
                config.health_data_path
            ),
            tokens,
        })
    }

    /// Full URL batches are posted to
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Pick the most useful message out of an error response body
fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<SinkResponse>(body) {
        if !parsed.message.is_empty() {
            return parsed.message;
        }
    }
    if body.trim().is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        body.trim().to_string()
    }
}

#[async_trait]
impl RemoteSink for HttpSink {
    async fn send(&self, device_id: &str, records: &[WireHealthRecord]) -> Result<SinkResponse> {
        info!("Sending health data: {} points", records.len());

        let batch = HealthDataBatch {
            device_uuid: device_id.to_string(),
            data_points: records.to_vec(),
        };

        let mut request = self.client.post(&self.endpoint).json(&batch);
        if let Some(token) = self.tokens.access_token().await {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            if body.trim().is_empty() {
                return Ok(SinkResponse::default());
            }
            return Ok(serde_json::from_str(&body).unwrap_or_else(|_| SinkResponse {
                message: body.trim().to_string(),
            }));
        }

        let message = error_message(status, &body);
        debug!("Upload rejected: {} {}", status, message);

        if status == StatusCode::UNAUTHORIZED {
            self.tokens.clear().await;
            return Err(WearableError::Unauthorized(message));
        }

        Err(WearableError::Upload {
            status: status.as_u16(),
            message,
        })
    }
}
