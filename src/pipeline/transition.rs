// src/pipeline/transition.rs
//! Sliding-window transition pipeline.
//!
//! Anchors are accepted one at a time. Anchor `i` sits at index `2i`; the
//! generated transition from anchor `i-1` into anchor `i` sits at `2i - 1`,
//! built from the last frame of the previous anchor and the first frame of
//! the new one. Assembly follows those indices, never submission order.

use super::{Assembler, AssemblyContext, AssemblyPart};
use crate::error::{OrchestratorError, Result};
use crate::group::{GroupId, GroupKind, GroupStatus, JobRecord, LocalPart, Orchestrator};
use crate::media::Transcoder;
use crate::submit::{ComputedParams, InputBinding, JobSubmitter};
use crate::template::{SeedPolicy, SlotSpec, TemplateProfile};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const ANCHOR_MAX_SIDE: u32 = 640;
pub const ANCHOR_FPS: u32 = 16;
/// How far before the end the closing frame of an anchor is sampled
const END_FRAME_OFFSET: f64 = 0.1;

pub fn anchor_index(anchor: usize) -> usize {
    anchor * 2
}

/// Index of the transition leading into `anchor` (`anchor >= 1`).
pub fn transition_index(anchor: usize) -> usize {
    anchor * 2 - 1
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRequest {
    pub group_id: Option<GroupId>,
    pub first_anchor: PathBuf,
    /// Used for every transition in the group
    pub prompt: Option<String>,
}

impl TransitionRequest {
    pub fn new(first_anchor: impl Into<PathBuf>) -> Self {
        Self {
            group_id: None,
            first_anchor: first_anchor.into(),
            prompt: None,
        }
    }
}

#[derive(Debug, Default)]
struct AnchorChain {
    /// Normalized anchors in acceptance order
    anchors: Vec<PathBuf>,
    prompt: Option<String>,
}

pub struct TransitionPipeline {
    orchestrator: Arc<Orchestrator>,
    submitter: Arc<JobSubmitter>,
    transcoder: Arc<dyn Transcoder>,
    profile: TemplateProfile,
    chains: Mutex<HashMap<GroupId, Arc<Mutex<AnchorChain>>>>,
}

impl TransitionPipeline {
    pub fn new(orchestrator: Arc<Orchestrator>, submitter: Arc<JobSubmitter>, transcoder: Arc<dyn Transcoder>) -> Self {
        Self {
            orchestrator,
            submitter,
            transcoder,
            profile: Self::default_profile(),
            chains: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_profile(mut self, profile: TemplateProfile) -> Self {
        self.profile = profile;
        self
    }

    /// First/last-frame template producing a 640x640, 16-frame transition.
    pub fn default_profile() -> TemplateProfile {
        TemplateProfile::new("transition")
            .with_slot(SlotSpec::required("start_image", "52", "image"))
            .with_slot(SlotSpec::required("end_image", "72", "image"))
            .with_slot(SlotSpec::optional("prompt", "6", "text"))
            .with_fixed("83", "width", json!(ANCHOR_MAX_SIDE))
            .with_fixed("83", "height", json!(ANCHOR_MAX_SIDE))
            .with_fixed("83", "length", json!(16))
            .with_seed(&["3"], SeedPolicy::Random)
    }

    /// Opens a group with its first anchor and starts monitoring it. The
    /// group is assembled only after [`finish`](Self::finish).
    pub async fn start(&self, request: TransitionRequest) -> Result<GroupId> {
        let assembler = Arc::new(TransitionAssembler {
            transcoder: self.transcoder.clone(),
        });
        let group_id = self.orchestrator.create_group(request.group_id.clone(), assembler).await?;

        let anchor = match self.normalize(&group_id, 0, &request.first_anchor).await {
            Ok(anchor) => anchor,
            Err(e) => {
                self.orchestrator
                    .fail_group(&group_id, &format!("first anchor unusable: {}", e))
                    .await;
                return Err(e);
            }
        };
        self.orchestrator
            .add_local_part(&group_id, LocalPart { index: anchor_index(0), path: anchor.clone() })
            .await?;

        self.chains.lock().await.insert(
            group_id.clone(),
            Arc::new(Mutex::new(AnchorChain {
                anchors: vec![anchor],
                prompt: request.prompt,
            })),
        );
        self.orchestrator.start_monitor(&group_id).await?;
        tracing::info!(group_id = %group_id, "🎞️ Transition group started");
        Ok(group_id)
    }

    /// Accepts the next anchor and submits the transition leading into it.
    /// Returns the transition's index. A failed submission leaves the chain
    /// unchanged so the same clip can be offered again.
    pub async fn add_anchor(&self, group_id: &str, clip: &Path) -> Result<usize> {
        let chain = self.chain(group_id).await?;
        let mut chain = chain.lock().await;
        if self.orchestrator.group_status(group_id).await?.status != GroupStatus::Processing {
            self.chains.lock().await.remove(group_id);
            return Err(OrchestratorError::InvalidRequest(format!("group {} is no longer processing", group_id)));
        }

        let anchor_no = chain.anchors.len();
        let previous = chain
            .anchors
            .last()
            .cloned()
            .ok_or_else(|| OrchestratorError::InvalidRequest(format!("group {} has no anchors", group_id)))?;
        let anchor = self.normalize(group_id, anchor_no, clip).await?;

        let frames_dir = self.group_dir(group_id).join("frames");
        tokio::fs::create_dir_all(&frames_dir).await?;
        let end_frame = frames_dir.join(format!("end_{:03}.png", anchor_no - 1));
        let start_frame = frames_dir.join(format!("start_{:03}.png", anchor_no));

        let previous_seconds = self.transcoder.probe(&previous).await?.duration_seconds;
        self.transcoder
            .extract_frame(&previous, &end_frame, (previous_seconds - END_FRAME_OFFSET).max(0.0))
            .await?;
        self.transcoder.extract_frame(&anchor, &start_frame, 0.0).await?;

        let mut bindings = vec![
            InputBinding::file("start_image", &end_frame),
            InputBinding::file("end_image", &start_frame),
        ];
        if let Some(prompt) = &chain.prompt {
            bindings.push(InputBinding::text("prompt", prompt));
        }
        let job = self
            .submitter
            .submit(&self.profile, &bindings, &ComputedParams::default())
            .await?;

        let index = transition_index(anchor_no);
        self.orchestrator
            .add_job(
                group_id,
                JobRecord::new(job.job_id.clone(), Some(job.worker), index)
                    .with_final_stage(self.profile.final_stage.clone()),
            )
            .await?;
        self.orchestrator
            .add_local_part(group_id, LocalPart { index: anchor_index(anchor_no), path: anchor.clone() })
            .await?;
        chain.anchors.push(anchor);

        tracing::info!(group_id = %group_id, job_id = %job.job_id, "🔀 Transition {} → {} queued at index {}", anchor_no - 1, anchor_no, index);
        Ok(index)
    }

    /// No more anchors. Assembly runs once every transition is terminal.
    pub async fn finish(&self, group_id: &str) -> Result<()> {
        let chain = self.chain(group_id).await?;
        let count = chain.lock().await.anchors.len();
        if count < 2 {
            return Err(OrchestratorError::InvalidRequest(format!(
                "group {} needs at least two anchors, has {}",
                group_id, count
            )));
        }
        let sealed = self.orchestrator.seal(group_id).await;
        self.chains.lock().await.remove(group_id);
        sealed?;
        tracing::info!(group_id = %group_id, "📥 Transition group sealed with {} anchors", count);
        Ok(())
    }

    async fn chain(&self, group_id: &str) -> Result<Arc<Mutex<AnchorChain>>> {
        self.chains
            .lock()
            .await
            .get(group_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::GroupNotFound(group_id.to_string()))
    }

    fn group_dir(&self, group_id: &str) -> PathBuf {
        self.orchestrator.config().work_dir.join(group_id)
    }

    async fn normalize(&self, group_id: &str, anchor_no: usize, clip: &Path) -> Result<PathBuf> {
        let dir = self.group_dir(group_id).join("anchors");
        tokio::fs::create_dir_all(&dir).await?;
        let output = dir.join(format!("anchor_{:03}.mp4", anchor_no));
        self.transcoder.resize(clip, &output, ANCHOR_MAX_SIDE, ANCHOR_FPS).await?;
        Ok(output)
    }
}

pub struct TransitionAssembler {
    transcoder: Arc<dyn Transcoder>,
}

#[async_trait]
impl Assembler for TransitionAssembler {
    fn kind(&self) -> GroupKind {
        GroupKind::Transition
    }

    async fn assemble(&self, ctx: &AssemblyContext, parts: Vec<AssemblyPart>) -> Result<String> {
        let order: Vec<usize> = parts.iter().map(|p| p.index).collect();
        tracing::info!(group_id = %ctx.group_id, "🎬 Joining transition sequence {:?}", order);
        let paths = ctx.materialize_all(&parts).await?;
        tokio::fs::create_dir_all(&ctx.work_dir).await?;
        let output = ctx.scratch("transition_final.mp4");
        self.transcoder.concat(&paths, &output).await?;
        ctx.publish(&output, "video/mp4").await
    }
}
