// src/worker/http.rs
use super::api::{ArtifactRef, HistoryEntry, QueueSnapshot, UploadedInput, WorkerApi};
use super::WorkerEndpoint;
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

const USER_AGENT: &str = "Mozilla/5.0";
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const FETCH_TIMEOUT: Duration = Duration::from_secs(120);

/// reqwest client for the worker fleet's HTTP API
#[derive(Debug, Clone)]
pub struct HttpWorkerApi {
    client: Client,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    prompt_id: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize, Default)]
struct QueueResponse {
    #[serde(default)]
    queue_running: Vec<Vec<Value>>,
    #[serde(default)]
    queue_pending: Vec<Vec<Value>>,
}

impl QueueResponse {
    /// Queue items are `[number, job_id, graph, extra, outputs]`
    fn ids(items: &[Vec<Value>]) -> Vec<String> {
        items
            .iter()
            .filter_map(|item| item.get(1))
            .filter_map(|id| id.as_str())
            .map(|id| id.to_string())
            .collect()
    }
}

impl HttpWorkerApi {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str, context: &str) -> Result<T> {
        let response = self
            .client
            .get(url)
            .header("User-Agent", USER_AGENT)
            .timeout(QUERY_TIMEOUT)
            .send()
            .await
            .map_err(|e| OrchestratorError::network(context, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OrchestratorError::NetworkUnavailable(format!(
                "{}: HTTP {}",
                context, status
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| OrchestratorError::network(context, e))
    }
}

impl Default for HttpWorkerApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerApi for HttpWorkerApi {
    async fn probe(&self, endpoint: &WorkerEndpoint, timeout: Duration) -> Result<()> {
        let response = self
            .client
            .get(endpoint.url("object_info"))
            .header("User-Agent", USER_AGENT)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| OrchestratorError::network("probe", e))?;

        if response.status().as_u16() == 200 {
            Ok(())
        } else {
            Err(OrchestratorError::NetworkUnavailable(format!(
                "probe of {} returned HTTP {}",
                endpoint,
                response.status()
            )))
        }
    }

    async fn submit(&self, endpoint: &WorkerEndpoint, graph: &Value, client_id: &str) -> Result<String> {
        let body = json!({ "prompt": graph, "client_id": client_id });
        let response = self
            .client
            .post(endpoint.url("prompt"))
            .header("User-Agent", USER_AGENT)
            .timeout(QUERY_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| OrchestratorError::network("submit", e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| OrchestratorError::network("submit", e))?;

        if !status.is_success() {
            return Err(OrchestratorError::SubmitRejected {
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: SubmitResponse = serde_json::from_str(&text)?;
        match parsed.prompt_id {
            Some(id) if !id.is_empty() => Ok(id),
            _ => Err(OrchestratorError::SubmitRejected {
                status: status.as_u16(),
                body: parsed
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "response carried no job id".to_string()),
            }),
        }
    }

    async fn history(&self, endpoint: &WorkerEndpoint, job_id: &str) -> Result<Option<HistoryEntry>> {
        tracing::debug!("Fetching job history from {} for {}", endpoint, job_id);
        let mut history: HashMap<String, HistoryEntry> = self
            .get_json(&endpoint.url(&format!("history/{}", job_id)), "history")
            .await?;
        Ok(history.remove(job_id))
    }

    async fn queue(&self, endpoint: &WorkerEndpoint) -> Result<QueueSnapshot> {
        let queue: QueueResponse = self.get_json(&endpoint.url("queue"), "queue").await?;
        Ok(QueueSnapshot {
            running: QueueResponse::ids(&queue.queue_running),
            pending: QueueResponse::ids(&queue.queue_pending),
        })
    }

    async fn upload_input(&self, endpoint: &WorkerEndpoint, path: &Path) -> Result<UploadedInput> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| OrchestratorError::InvalidRequest(format!("bad input path {}", path.display())))?
            .to_string();

        let form = reqwest::multipart::Form::new()
            .part("image", reqwest::multipart::Part::bytes(bytes).file_name(file_name))
            .text("overwrite", "true")
            .text("subfolder", "");

        let response = self
            .client
            .post(endpoint.url("upload/image"))
            .header("User-Agent", USER_AGENT)
            .timeout(UPLOAD_TIMEOUT)
            .multipart(form)
            .send()
            .await
            .map_err(|e| OrchestratorError::network("upload", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::SubmitRejected {
                status: status.as_u16(),
                body: format!("upload failed: {}", body),
            });
        }

        response
            .json::<UploadedInput>()
            .await
            .map_err(|e| OrchestratorError::network("upload", e))
    }

    async fn fetch_output(&self, endpoint: &WorkerEndpoint, artifact: &ArtifactRef) -> Result<Vec<u8>> {
        tracing::info!("📥 Fetching {} from {}", artifact.filename, endpoint);
        let response = self
            .client
            .get(endpoint.url("view"))
            .header("User-Agent", USER_AGENT)
            .query(&[
                ("filename", artifact.filename.as_str()),
                ("subfolder", artifact.subfolder.as_str()),
                ("type", artifact.folder.as_str()),
            ])
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| OrchestratorError::network("fetch", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OrchestratorError::NetworkUnavailable(format!(
                "fetch of {} returned HTTP {}",
                artifact.filename, status
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| OrchestratorError::network("fetch", e))?;
        Ok(bytes.to_vec())
    }

    async fn cancel(&self, endpoint: &WorkerEndpoint, job_id: &str) -> Result<()> {
        if let Err(e) = self
            .client
            .post(endpoint.url("queue"))
            .timeout(QUERY_TIMEOUT)
            .json(&json!({ "delete": [job_id] }))
            .send()
            .await
        {
            tracing::warn!("Failed to drop {} from queue on {}: {}", job_id, endpoint, e);
        }

        let queue = self.queue(endpoint).await?;
        if queue.is_running(job_id) {
            self.client
                .post(endpoint.url("interrupt"))
                .timeout(QUERY_TIMEOUT)
                .send()
                .await
                .map_err(|e| OrchestratorError::network("interrupt", e))?;
            tracing::info!("⏹️ Interrupted running job {} on {}", job_id, endpoint);
        }
        Ok(())
    }
}
