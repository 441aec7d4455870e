// lib.rs - Orchestrates multi-stage media jobs across a pool of GPU workers
pub mod config;
pub mod error;
pub mod group;
pub mod media;
pub mod pipeline;
pub mod service;
pub mod status;
pub mod storage;
pub mod submit;
pub mod template;
pub mod worker;

// Re-export commonly used types for convenience
pub use config::Settings;
pub use error::{OrchestratorError, Result};
pub use group::{GroupId, GroupKind, GroupSnapshot, GroupStatus, Orchestrator};
pub use pipeline::{AvatarRequest, PromptSequenceRequest, SegmentRequest, SingleStageRequest, TransitionRequest};
pub use service::{GroupRequest, MediaService};
pub use status::{JobState, JobStatusTracker, PollOutcome};
pub use submit::{InputBinding, InputValue, JobSubmitter};
pub use worker::{HttpWorkerApi, WorkerApi, WorkerDirectory, WorkerEndpoint};
