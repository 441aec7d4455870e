// src/error.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Worker could not be reached. Never terminal on its own.
    #[error("Worker unavailable: {0}")]
    NetworkUnavailable(String),
    #[error("Job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },
    #[error("Job template not found: {0}")]
    TemplateMissing(String),
    #[error("Invalid job template '{name}': {reason}")]
    TemplateInvalid { name: String, reason: String },
    #[error("Slot binding error: {0}")]
    SlotBinding(String),
    #[error("Worker rejected submission ({status}): {body}")]
    SubmitRejected { status: u16, body: String },
    #[error("Group timed out after {0} seconds")]
    GroupTimeout(u64),
    #[error("Assembly failed: {0}")]
    AssemblyFailed(String),
    #[error("Transcode failed: {0}")]
    Transcode(String),
    #[error("Storage upload failed: {0}")]
    Storage(String),
    #[error("Group not found: {0}")]
    GroupNotFound(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OrchestratorError {
    /// Whether a later attempt may succeed without any caller action.
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestratorError::NetworkUnavailable(_) => true,
            OrchestratorError::SubmitRejected { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub(crate) fn network(context: &str, err: reqwest::Error) -> Self {
        OrchestratorError::NetworkUnavailable(format!("{}: {}", context, err))
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
