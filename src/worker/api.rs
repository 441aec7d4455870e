// src/worker/api.rs
//! Worker HTTP API seam. `HttpWorkerApi` talks to real nodes; tests use `FakeWorker`.

use super::WorkerEndpoint;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Output category, ordered by selection priority (highest first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Video,
    AnimatedImage,
    Image,
    Audio,
}

impl ArtifactKind {
    pub fn priority(self) -> u8 {
        match self {
            ArtifactKind::Video => 3,
            ArtifactKind::AnimatedImage => 2,
            ArtifactKind::Image => 1,
            ArtifactKind::Audio => 0,
        }
    }

    pub fn content_type(self, filename: &str) -> &'static str {
        let ext = extension(filename);
        match (self, ext.as_str()) {
            (_, "mp4") => "video/mp4",
            (_, "webm") => "video/webm",
            (_, "mov") => "video/quicktime",
            (_, "gif") => "image/gif",
            (_, "webp") => "image/webp",
            (_, "png") => "image/png",
            (_, "jpg") | (_, "jpeg") => "image/jpeg",
            (_, "wav") => "audio/wav",
            (_, "mp3") => "audio/mpeg",
            (_, "flac") => "audio/flac",
            (ArtifactKind::Video, _) => "video/mp4",
            (ArtifactKind::Audio, _) => "audio/mpeg",
            _ => "application/octet-stream",
        }
    }
}

pub(crate) fn extension(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Reference to a file produced on a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// Worker-side folder ("output", "temp", "input")
    #[serde(default = "default_folder")]
    pub folder: String,
    pub kind: ArtifactKind,
}

fn default_folder() -> String {
    "output".to_string()
}

/// One file entry in a stage's history outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputFile {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_folder")]
    pub folder: String,
    /// Container hint some stages attach, e.g. "video/h264-mp4"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutputs {
    #[serde(default)]
    pub gifs: Vec<OutputFile>,
    #[serde(default)]
    pub videos: Vec<OutputFile>,
    #[serde(default)]
    pub images: Vec<OutputFile>,
    #[serde(default)]
    pub audio: Vec<OutputFile>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStatus {
    #[serde(default)]
    pub status_str: Option<String>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,
}

/// Completed-history record for one job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub outputs: BTreeMap<String, StageOutputs>,
    #[serde(default)]
    pub status: Option<ExecutionStatus>,
}

impl HistoryEntry {
    /// Worker reported an execution error for this job
    pub fn error_message(&self) -> Option<String> {
        let status = self.status.as_ref()?;
        if status.status_str.as_deref() != Some("error") {
            return None;
        }
        let detail = status
            .messages
            .iter()
            .filter_map(|m| m.get(1))
            .filter_map(|payload| payload.get("exception_message"))
            .filter_map(|v| v.as_str())
            .last()
            .unwrap_or("execution error");
        Some(detail.trim().to_string())
    }
}

/// Job ids currently held in a worker's live queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub running: Vec<String>,
    pub pending: Vec<String>,
}

impl QueueSnapshot {
    pub fn is_running(&self, job_id: &str) -> bool {
        self.running.iter().any(|id| id == job_id)
    }

    pub fn is_pending(&self, job_id: &str) -> bool {
        self.pending.iter().any(|id| id == job_id)
    }
}

/// Server-side name assigned to an uploaded input file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedInput {
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
}

impl UploadedInput {
    /// Name as a template input slot expects it
    pub fn slot_value(&self) -> String {
        if self.subfolder.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.subfolder, self.name)
        }
    }
}

#[async_trait]
pub trait WorkerApi: Send + Sync {
    /// Lightweight capability query; Ok only on HTTP 200 within `timeout`.
    async fn probe(&self, endpoint: &WorkerEndpoint, timeout: Duration) -> Result<()>;

    /// Queues a filled template graph and returns the worker's job id.
    async fn submit(
        &self,
        endpoint: &WorkerEndpoint,
        graph: &serde_json::Value,
        client_id: &str,
    ) -> Result<String>;

    /// `Ok(None)` when the worker has no completed-history record for the job.
    async fn history(&self, endpoint: &WorkerEndpoint, job_id: &str) -> Result<Option<HistoryEntry>>;

    async fn queue(&self, endpoint: &WorkerEndpoint) -> Result<QueueSnapshot>;

    async fn upload_input(&self, endpoint: &WorkerEndpoint, path: &Path) -> Result<UploadedInput>;

    async fn fetch_output(&self, endpoint: &WorkerEndpoint, artifact: &ArtifactRef) -> Result<Vec<u8>>;

    /// Drops the job from the queue, interrupting it if it is the running one.
    async fn cancel(&self, endpoint: &WorkerEndpoint, job_id: &str) -> Result<()>;
}
