// src/storage.rs
// Object storage for final assembled artifacts (plain HTTP PUT).

use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use std::time::Duration;

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Stores `bytes` under `filename` and returns its public URL.
    async fn put(&self, filename: &str, bytes: Vec<u8>, content_type: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct HttpObjectStorage {
    client: reqwest::Client,
    base_url: String,
    backoff: ExponentialBackoff,
}

impl HttpObjectStorage {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            backoff: ExponentialBackoff {
                initial_interval: Duration::from_secs(1),
                max_interval: Duration::from_secs(30),
                multiplier: 2.0,
                max_elapsed_time: Some(Duration::from_secs(300)),
                ..Default::default()
            },
        }
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.backoff.initial_interval = Duration::from_millis(50).min(max_elapsed);
        self.backoff.max_elapsed_time = Some(max_elapsed);
        self
    }

    pub fn object_url(&self, filename: &str) -> String {
        format!("{}/{}", self.base_url, filename.trim_start_matches('/'))
    }
}

#[async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn put(&self, filename: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        let url = self.object_url(filename);
        tracing::info!("☁️ Uploading {} ({} bytes) to {}", filename, bytes.len(), url);

        // 429 / 5xx and connection errors are retried; any other failure is final
        let operation = || async {
            let response = self
                .client
                .put(&url)
                .header("Content-Type", content_type)
                .timeout(Duration::from_secs(300))
                .body(bytes.clone())
                .send()
                .await
                .map_err(|e| {
                    if e.is_connect() || e.is_timeout() {
                        tracing::warn!("Storage connection error (retrying): {}", e);
                        backoff::Error::transient(format!("Connection error: {}", e))
                    } else {
                        backoff::Error::permanent(format!("Request error: {}", e))
                    }
                })?;

            let status = response.status();
            if status.as_u16() == 429 || status.is_server_error() {
                let body = response.text().await.unwrap_or_default();
                tracing::warn!("Storage returned {} (retrying): {}", status, body);
                return Err(backoff::Error::transient(format!("Storage error ({}): {}", status, body)));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(backoff::Error::permanent(format!("Storage error ({}): {}", status, body)));
            }
            Ok(())
        };

        retry(self.backoff.clone(), operation)
            .await
            .map_err(OrchestratorError::Storage)?;

        tracing::info!("✅ Stored {}", url);
        Ok(url)
    }
}
