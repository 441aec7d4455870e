// src/status.rs
//! Job status tracker.
//!
//! Per-job state machine: `Pending → Running → {Succeeded | Failed}`, plus
//! `Unknown` for a poll that could not reach a worker. A poll yields one of
//! three outcomes: terminal, still in flight, or a transient error the caller
//! must treat as "keep waiting".

use crate::worker::api::{extension, ArtifactKind, ArtifactRef, HistoryEntry, OutputFile};
use crate::worker::{WorkerDirectory, WorkerEndpoint};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TerminalResult {
    Succeeded(ArtifactRef),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Authoritative answer from completed history (or "not found anywhere")
    Terminal {
        worker: Option<WorkerEndpoint>,
        result: TerminalResult,
    },
    /// Present in a live queue
    InFlight { worker: WorkerEndpoint, running: bool },
    /// No authoritative answer and at least one worker was unreachable
    TransientError(String),
}

impl PollOutcome {
    pub fn state(&self) -> JobState {
        match self {
            PollOutcome::Terminal { result: TerminalResult::Succeeded(_), .. } => JobState::Succeeded,
            PollOutcome::Terminal { result: TerminalResult::Failed(_), .. } => JobState::Failed,
            PollOutcome::InFlight { running: true, .. } => JobState::Running,
            PollOutcome::InFlight { running: false, .. } => JobState::Pending,
            PollOutcome::TransientError(_) => JobState::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PollOutcome::Terminal { .. })
    }
}

pub struct JobStatusTracker {
    directory: Arc<WorkerDirectory>,
}

impl JobStatusTracker {
    pub fn new(directory: Arc<WorkerDirectory>) -> Self {
        Self { directory }
    }

    /// Polls the owning worker, or every known worker when the owner is unknown.
    /// `final_stage` breaks ties between equally ranked outputs.
    pub async fn poll(&self, job_id: &str, owner: Option<&WorkerEndpoint>, final_stage: Option<&str>) -> PollOutcome {
        let targets: Vec<WorkerEndpoint> = match owner {
            Some(owner) => vec![owner.clone()],
            None => self.directory.candidates().to_vec(),
        };
        let api = self.directory.api();
        let mut network_errors: Vec<String> = Vec::new();
        let mut reachable: Vec<WorkerEndpoint> = Vec::new();

        for worker in &targets {
            match api.history(worker, job_id).await {
                Ok(Some(entry)) => return terminal(worker, &entry, final_stage),
                Ok(None) => reachable.push(worker.clone()),
                Err(e) => {
                    tracing::debug!("History lookup for {} on {} failed: {}", job_id, worker, e);
                    network_errors.push(format!("{}: {}", worker, e));
                }
            }
        }

        let mut in_flight: Option<PollOutcome> = None;
        for worker in &reachable {
            match api.queue(worker).await {
                Ok(queue) if queue.is_running(job_id) => {
                    return PollOutcome::InFlight { worker: worker.clone(), running: true };
                }
                Ok(queue) if queue.is_pending(job_id) => {
                    in_flight.get_or_insert(PollOutcome::InFlight { worker: worker.clone(), running: false });
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("Queue lookup on {} failed: {}", worker, e);
                    network_errors.push(format!("{}: {}", worker, e));
                }
            }
        }
        if let Some(outcome) = in_flight {
            return outcome;
        }

        // The job may have finished between the history and queue lookups.
        for worker in &reachable {
            if let Ok(Some(entry)) = api.history(worker, job_id).await {
                return terminal(worker, &entry, final_stage);
            }
        }

        if network_errors.is_empty() {
            PollOutcome::Terminal {
                worker: owner.cloned(),
                result: TerminalResult::Failed("Task not found".to_string()),
            }
        } else {
            PollOutcome::TransientError(network_errors.join("; "))
        }
    }
}

fn terminal(worker: &WorkerEndpoint, entry: &HistoryEntry, final_stage: Option<&str>) -> PollOutcome {
    let result = if let Some(message) = entry.error_message() {
        TerminalResult::Failed(message)
    } else {
        match select_output(entry, final_stage) {
            Some(artifact) => TerminalResult::Succeeded(artifact),
            None => TerminalResult::Failed("No output found".to_string()),
        }
    };
    PollOutcome::Terminal {
        worker: Some(worker.clone()),
        result,
    }
}

fn classify(list: &str, file: &OutputFile) -> ArtifactKind {
    let ext = extension(&file.filename);
    let format = file.format.as_deref().unwrap_or("");
    let animated = matches!(ext.as_str(), "gif" | "webp" | "apng");
    let video = matches!(ext.as_str(), "mp4" | "webm" | "mov" | "mkv" | "avi") || format.starts_with("video/");
    match list {
        "audio" => ArtifactKind::Audio,
        _ if video => ArtifactKind::Video,
        _ if animated => ArtifactKind::AnimatedImage,
        "videos" => ArtifactKind::Video,
        "gifs" => ArtifactKind::AnimatedImage,
        _ => ArtifactKind::Image,
    }
}

/// Picks one output: video > animated image > still image > audio; ties go to
/// `final_stage`, then to the first stage in id order.
pub fn select_output(entry: &HistoryEntry, final_stage: Option<&str>) -> Option<ArtifactRef> {
    let mut best: Option<((u8, bool), ArtifactRef)> = None;

    for (stage, outputs) in &entry.outputs {
        let lists: [(&str, &Vec<OutputFile>); 4] = [
            ("gifs", &outputs.gifs),
            ("videos", &outputs.videos),
            ("images", &outputs.images),
            ("audio", &outputs.audio),
        ];
        for (list, files) in lists {
            for file in files {
                let kind = classify(list, file);
                let rank = (kind.priority(), Some(stage.as_str()) == final_stage);
                if best.as_ref().map_or(true, |(current, _)| rank > *current) {
                    best = Some((
                        rank,
                        ArtifactRef {
                            filename: file.filename.clone(),
                            subfolder: file.subfolder.clone(),
                            folder: file.folder.clone(),
                            kind,
                        },
                    ));
                }
            }
        }
    }

    best.map(|(_, artifact)| artifact)
}
