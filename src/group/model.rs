// src/group/model.rs
use crate::worker::{ArtifactRef, WorkerEndpoint};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub type GroupId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// One remote job inside a group. Only the group's monitor mutates it, and
/// not at all once it is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub owning_worker: Option<WorkerEndpoint>,
    pub status: JobStatus,
    pub result_artifact: Option<ArtifactRef>,
    pub error: Option<String>,
    /// Position in the assembled output
    pub segment_index: usize,
    /// Stage preferred when ranking this job's outputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_stage: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(job_id: String, owning_worker: Option<WorkerEndpoint>, segment_index: usize) -> Self {
        Self {
            job_id,
            owning_worker,
            status: JobStatus::Pending,
            result_artifact: None,
            error: None,
            segment_index,
            final_stage: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_final_stage(mut self, stage: Option<String>) -> Self {
        self.final_stage = stage;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    Segment,
    Transition,
    SingleStage,
    /// One still animated once per prompt, clips joined in prompt order
    PromptSequence,
    /// Generated voice track; its output starts an `Avatar` group
    Speech,
    /// Lip-synced character clips driven by a speech track
    Avatar,
}

/// Already-available local file placed at a fixed index of the output
/// (raw anchor clips of a transition group).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalPart {
    pub index: usize,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskGroup {
    pub group_id: GroupId,
    pub kind: GroupKind,
    pub status: GroupStatus,
    pub jobs: Vec<JobRecord>,
    pub local_parts: Vec<LocalPart>,
    pub created_at: DateTime<Utc>,
    pub timeout_budget: Duration,
    /// No more jobs will be added; assembly may run once all jobs are terminal.
    pub sealed: bool,
    pub final_artifact: Option<String>,
    pub error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskGroup {
    pub fn new(group_id: GroupId, kind: GroupKind, timeout_budget: Duration) -> Self {
        Self {
            group_id,
            kind,
            status: GroupStatus::Processing,
            jobs: Vec::new(),
            local_parts: Vec::new(),
            created_at: Utc::now(),
            timeout_budget,
            sealed: false,
            final_artifact: None,
            error: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != GroupStatus::Processing
    }

    pub fn all_jobs_terminal(&self) -> bool {
        self.jobs.iter().all(|j| j.status.is_terminal())
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        self.elapsed(now) > self.timeout_budget
    }

    /// (terminal jobs, total jobs)
    pub fn progress(&self) -> (usize, usize) {
        let done = self.jobs.iter().filter(|j| j.status.is_terminal()).count();
        (done, self.jobs.len())
    }

    /// processing → completed, once. Returns false if already terminal.
    pub fn complete(&mut self, final_artifact: String) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = GroupStatus::Completed;
        self.final_artifact = Some(final_artifact);
        self.finished_at = Some(Utc::now());
        true
    }

    /// processing → failed, once. Returns false if already terminal.
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        let error = error.into();
        self.status = GroupStatus::Failed;
        self.error = Some(if error.trim().is_empty() { "unknown error".to_string() } else { error });
        self.finished_at = Some(Utc::now());
        true
    }

    pub fn snapshot(&self) -> GroupSnapshot {
        let (completed, total) = self.progress();
        GroupSnapshot {
            group_id: self.group_id.clone(),
            kind: self.kind,
            status: self.status,
            completed,
            total,
            progress: if total == 0 { 0.0 } else { completed as f64 / total as f64 },
            final_artifact: self.final_artifact.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            finished_at: self.finished_at,
            jobs: self.jobs.clone(),
        }
    }
}

/// Caller-facing view of a group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub group_id: GroupId,
    pub kind: GroupKind,
    pub status: GroupStatus,
    pub completed: usize,
    pub total: usize,
    pub progress: f64,
    pub final_artifact: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub jobs: Vec<JobRecord>,
}
