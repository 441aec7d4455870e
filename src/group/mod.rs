// src/group/mod.rs
//! Task groups: records, the shared store and the monitoring orchestrator.

pub mod model;
pub mod orchestrator;
pub mod store;

pub use model::{GroupId, GroupKind, GroupSnapshot, GroupStatus, JobRecord, JobStatus, LocalPart, TaskGroup};
pub use orchestrator::{ChainLink, Orchestrator, OrchestratorConfig, TickOutcome, CANCELLED};
pub use store::GroupStore;
