// src/worker/testing.rs
//! Scripted in-memory worker fleet for unit tests.

use super::api::{
    ArtifactKind, ArtifactRef, ExecutionStatus, HistoryEntry, OutputFile, QueueSnapshot, StageOutputs,
    UploadedInput, WorkerApi,
};
use super::WorkerEndpoint;
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SubmittedJob {
    pub host: String,
    pub job_id: String,
    pub graph: Value,
}

#[derive(Default)]
pub struct FakeWorker {
    probe_latency: Mutex<HashMap<String, Duration>>,
    down: Mutex<HashSet<String>>,
    history: Mutex<HashMap<(String, String), HistoryEntry>>,
    queues: Mutex<HashMap<String, QueueSnapshot>>,
    submitted: Mutex<Vec<SubmittedJob>>,
    reject_submissions: Mutex<HashSet<usize>>,
    uploads: Mutex<Vec<(String, String)>>,
    cancelled: Mutex<Vec<(String, String)>>,
    history_calls: AtomicUsize,
    counter: AtomicUsize,
}

impl FakeWorker {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(endpoint: &WorkerEndpoint) -> String {
        endpoint.host().to_string()
    }

    fn check_up(&self, endpoint: &WorkerEndpoint) -> Result<()> {
        if self.down.lock().unwrap().contains(&Self::key(endpoint)) {
            Err(OrchestratorError::NetworkUnavailable(format!("{} is down", endpoint)))
        } else {
            Ok(())
        }
    }

    pub fn set_probe_latency(&self, host: &str, latency: Duration) {
        self.probe_latency.lock().unwrap().insert(host.to_string(), latency);
    }

    pub fn set_down(&self, host: &str, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(host.to_string());
        } else {
            set.remove(host);
        }
    }

    /// The n-th submission (1-based) is rejected by the worker.
    pub fn reject_submission(&self, nth: usize) {
        self.reject_submissions.lock().unwrap().insert(nth);
    }

    pub fn set_queue(&self, host: &str, running: &[&str], pending: &[&str]) {
        self.queues.lock().unwrap().insert(
            host.to_string(),
            QueueSnapshot {
                running: running.iter().map(|s| s.to_string()).collect(),
                pending: pending.iter().map(|s| s.to_string()).collect(),
            },
        );
    }

    pub fn set_history(&self, host: &str, job_id: &str, entry: HistoryEntry) {
        self.history
            .lock()
            .unwrap()
            .insert((host.to_string(), job_id.to_string()), entry);
    }

    /// Marks a job finished with a single video output on `stage`.
    pub fn complete_with_video(&self, host: &str, job_id: &str, stage: &str, filename: &str) {
        let mut outputs = BTreeMap::new();
        outputs.insert(
            stage.to_string(),
            StageOutputs {
                videos: vec![output_file(filename)],
                ..Default::default()
            },
        );
        self.set_history(host, job_id, HistoryEntry { outputs, status: None });
    }

    /// Marks a job finished with a single audio output on `stage`.
    pub fn complete_with_audio(&self, host: &str, job_id: &str, stage: &str, filename: &str) {
        let mut outputs = BTreeMap::new();
        outputs.insert(
            stage.to_string(),
            StageOutputs {
                audio: vec![output_file(filename)],
                ..Default::default()
            },
        );
        self.set_history(host, job_id, HistoryEntry { outputs, status: None });
    }

    pub fn fail_job(&self, host: &str, job_id: &str, message: &str) {
        self.set_history(
            host,
            job_id,
            HistoryEntry {
                outputs: BTreeMap::new(),
                status: Some(ExecutionStatus {
                    status_str: Some("error".to_string()),
                    completed: false,
                    messages: vec![json!(["execution_error", {"exception_message": message}])],
                }),
            },
        );
    }

    pub fn submitted(&self) -> Vec<SubmittedJob> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<(String, String)> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<(String, String)> {
        self.cancelled.lock().unwrap().clone()
    }

    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }
}

pub fn output_file(filename: &str) -> OutputFile {
    OutputFile {
        filename: filename.to_string(),
        subfolder: String::new(),
        folder: "output".to_string(),
        format: None,
    }
}

pub fn video_ref(filename: &str) -> ArtifactRef {
    ArtifactRef {
        filename: filename.to_string(),
        subfolder: String::new(),
        folder: "output".to_string(),
        kind: ArtifactKind::Video,
    }
}

#[async_trait]
impl WorkerApi for FakeWorker {
    async fn probe(&self, endpoint: &WorkerEndpoint, _timeout: Duration) -> Result<()> {
        let latency = self.probe_latency.lock().unwrap().get(&Self::key(endpoint)).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.check_up(endpoint)
    }

    async fn submit(&self, endpoint: &WorkerEndpoint, graph: &Value, _client_id: &str) -> Result<String> {
        self.check_up(endpoint)?;
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        if self.reject_submissions.lock().unwrap().contains(&n) {
            return Err(OrchestratorError::SubmitRejected {
                status: 400,
                body: "invalid prompt".to_string(),
            });
        }
        let job_id = format!("job-{}", n);
        self.submitted.lock().unwrap().push(SubmittedJob {
            host: Self::key(endpoint),
            job_id: job_id.clone(),
            graph: graph.clone(),
        });
        Ok(job_id)
    }

    async fn history(&self, endpoint: &WorkerEndpoint, job_id: &str) -> Result<Option<HistoryEntry>> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        self.check_up(endpoint)?;
        Ok(self
            .history
            .lock()
            .unwrap()
            .get(&(Self::key(endpoint), job_id.to_string()))
            .cloned())
    }

    async fn queue(&self, endpoint: &WorkerEndpoint) -> Result<QueueSnapshot> {
        self.check_up(endpoint)?;
        Ok(self
            .queues
            .lock()
            .unwrap()
            .get(&Self::key(endpoint))
            .cloned()
            .unwrap_or_default())
    }

    async fn upload_input(&self, endpoint: &WorkerEndpoint, path: &Path) -> Result<UploadedInput> {
        self.check_up(endpoint)?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("input.bin")
            .to_string();
        self.uploads.lock().unwrap().push((Self::key(endpoint), name.clone()));
        Ok(UploadedInput {
            name,
            subfolder: String::new(),
        })
    }

    async fn fetch_output(&self, endpoint: &WorkerEndpoint, artifact: &ArtifactRef) -> Result<Vec<u8>> {
        self.check_up(endpoint)?;
        Ok(format!("{}:{}", Self::key(endpoint), artifact.filename).into_bytes())
    }

    async fn cancel(&self, endpoint: &WorkerEndpoint, job_id: &str) -> Result<()> {
        self.check_up(endpoint)?;
        self.cancelled
            .lock()
            .unwrap()
            .push((Self::key(endpoint), job_id.to_string()));
        Ok(())
    }
}
