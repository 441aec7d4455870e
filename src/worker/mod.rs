// src/worker/mod.rs
//! Worker pool client: endpoint handling, the HTTP API seam and the directory.

pub mod api;
pub mod directory;
pub mod endpoint;
pub mod http;
#[cfg(test)]
pub(crate) mod testing;

pub use api::{ArtifactKind, ArtifactRef, HistoryEntry, QueueSnapshot, UploadedInput, WorkerApi};
pub use directory::{WorkerDirectory, WorkerSelection};
pub use endpoint::WorkerEndpoint;
pub use http::HttpWorkerApi;
