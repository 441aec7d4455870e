// src/pipeline/mod.rs
//! Pipelines built on top of the group orchestrator. Each one submits its
//! jobs and hands the orchestrator an [`Assembler`] that turns finished parts
//! into a single published artifact.

pub mod avatar;
pub mod segment;
pub mod sequence;
pub mod single;
pub mod transition;

use crate::error::{OrchestratorError, Result};
use crate::group::GroupKind;
use crate::storage::ObjectStorage;
use crate::worker::{ArtifactRef, WorkerDirectory, WorkerEndpoint};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use avatar::{AvatarPipeline, AvatarRequest};
pub use segment::{split_windows, SegmentPipeline, SegmentRequest};
pub use sequence::{PromptSequencePipeline, PromptSequenceRequest};
pub use single::{SingleStagePipeline, SingleStageRequest};
pub use transition::{TransitionPipeline, TransitionRequest};

#[derive(Debug, Clone, PartialEq)]
pub enum PartSource {
    /// Result of a succeeded job, still on its worker
    Remote {
        job_id: String,
        worker: Option<WorkerEndpoint>,
        artifact: ArtifactRef,
    },
    /// Already on local disk
    Local(PathBuf),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssemblyPart {
    pub index: usize,
    pub source: PartSource,
}

/// Everything an assembler may touch while building a group's output.
pub struct AssemblyContext {
    pub group_id: String,
    pub directory: Arc<WorkerDirectory>,
    pub storage: Option<Arc<dyn ObjectStorage>>,
    /// Scratch directory private to this group
    pub work_dir: PathBuf,
}

impl AssemblyContext {
    /// Local path for `part`, downloading it from its worker when needed.
    pub async fn materialize(&self, part: &AssemblyPart) -> Result<PathBuf> {
        match &part.source {
            PartSource::Local(path) => Ok(path.clone()),
            PartSource::Remote { job_id, worker, artifact } => {
                let worker = match worker {
                    Some(worker) => worker.clone(),
                    None => self.directory.active().await,
                };
                let bytes = self.directory.api().fetch_output(&worker, artifact).await?;
                tokio::fs::create_dir_all(&self.work_dir).await?;
                let path = self.work_dir.join(format!("part_{:03}_{}", part.index, local_name(&artifact.filename)));
                tokio::fs::write(&path, &bytes).await?;
                tracing::debug!("⬇️ Fetched {} for job {} from {} ({} bytes)", artifact.filename, job_id, worker, bytes.len());
                Ok(path)
            }
        }
    }

    pub async fn materialize_all(&self, parts: &[AssemblyPart]) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::with_capacity(parts.len());
        for part in parts {
            paths.push(self.materialize(part).await?);
        }
        Ok(paths)
    }

    pub fn scratch(&self, filename: &str) -> PathBuf {
        self.work_dir.join(filename)
    }

    /// Uploads `path` when storage is configured; otherwise the local path
    /// is the final artifact.
    pub async fn publish(&self, path: &Path, content_type: &str) -> Result<String> {
        let Some(storage) = &self.storage else {
            return Ok(path.to_string_lossy().to_string());
        };
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("bin");
        let filename = format!("{}.{}", self.group_id, extension);
        let bytes = tokio::fs::read(path).await?;
        storage.put(&filename, bytes, content_type).await
    }
}

fn local_name(filename: &str) -> String {
    Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "output.bin".to_string())
}

/// Orders parts by index and rejects duplicates.
pub fn order_parts(mut parts: Vec<AssemblyPart>) -> Result<Vec<AssemblyPart>> {
    parts.sort_by_key(|p| p.index);
    if let Some(dup) = parts.windows(2).find(|w| w[0].index == w[1].index) {
        return Err(OrchestratorError::AssemblyFailed(format!("duplicate part index {}", dup[0].index)));
    }
    Ok(parts)
}

/// Group-specific finishing step, chosen when the group is created.
#[async_trait]
pub trait Assembler: Send + Sync {
    fn kind(&self) -> GroupKind;

    /// `parts` arrive sorted by index and contain only usable results.
    /// Returns the final artifact reference.
    async fn assemble(&self, ctx: &AssemblyContext, parts: Vec<AssemblyPart>) -> Result<String>;
}
