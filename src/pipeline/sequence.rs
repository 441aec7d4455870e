// src/pipeline/sequence.rs
//! Prompt sequence: one still, several prompts. Every prompt becomes its own
//! image-to-video job and the clips are joined in prompt order.

use super::segment::SegmentAssembler;
use super::single::image_to_video_profile;
use crate::error::{OrchestratorError, Result};
use crate::group::{GroupId, GroupKind, JobRecord, Orchestrator};
use crate::media::Transcoder;
use crate::submit::{ComputedParams, InputBinding, JobSubmitter};
use crate::template::TemplateProfile;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct PromptSequenceRequest {
    pub group_id: Option<GroupId>,
    /// Shared by every clip
    pub image: PathBuf,
    pub prompts: Vec<String>,
    pub audio: Option<PathBuf>,
}

impl PromptSequenceRequest {
    pub fn new(image: impl Into<PathBuf>, prompts: Vec<String>) -> Self {
        Self {
            group_id: None,
            image: image.into(),
            prompts,
            audio: None,
        }
    }
}

pub struct PromptSequencePipeline {
    orchestrator: Arc<Orchestrator>,
    submitter: Arc<JobSubmitter>,
    transcoder: Arc<dyn Transcoder>,
    profile: TemplateProfile,
}

impl PromptSequencePipeline {
    pub fn new(orchestrator: Arc<Orchestrator>, submitter: Arc<JobSubmitter>, transcoder: Arc<dyn Transcoder>) -> Self {
        Self {
            orchestrator,
            submitter,
            transcoder,
            profile: image_to_video_profile(),
        }
    }

    pub fn with_profile(mut self, profile: TemplateProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Blank prompts and rejected submissions are skipped. Clip indices stay
    /// contiguous over the jobs actually submitted.
    pub async fn submit(&self, request: PromptSequenceRequest) -> Result<GroupId> {
        let prompts: Vec<&str> = request
            .prompts
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect();
        if prompts.is_empty() {
            return Err(OrchestratorError::InvalidRequest("prompt sequence needs at least one prompt".to_string()));
        }

        let assembler = Arc::new(SegmentAssembler::new(
            GroupKind::PromptSequence,
            self.transcoder.clone(),
            request.audio.clone(),
        ));
        let group_id = self.orchestrator.create_group(request.group_id.clone(), assembler).await?;
        tracing::info!(
            group_id = %group_id,
            "🖼️ Animating {} with {} prompts",
            request.image.display(),
            prompts.len()
        );

        let mut next_index = 0usize;
        let mut last_error: Option<String> = None;
        for (position, prompt) in prompts.iter().enumerate() {
            let bindings = vec![
                InputBinding::file("image", &request.image),
                InputBinding::text("prompt", *prompt),
            ];
            match self.submitter.submit(&self.profile, &bindings, &ComputedParams::default()).await {
                Ok(job) => {
                    let record = JobRecord::new(job.job_id, Some(job.worker), next_index)
                        .with_final_stage(self.profile.final_stage.clone());
                    self.orchestrator.add_job(&group_id, record).await?;
                    next_index += 1;
                }
                Err(e) => {
                    tracing::warn!(group_id = %group_id, "⚠️ Skipping prompt {}: {}", position, e);
                    last_error = Some(e.to_string());
                }
            }
        }

        if next_index == 0 {
            let reason = format!(
                "no clip could be submitted: {}",
                last_error.unwrap_or_else(|| "unknown error".to_string())
            );
            self.orchestrator.fail_group(&group_id, &reason).await;
            return Ok(group_id);
        }

        tracing::info!(group_id = %group_id, "🚀 Submitted {}/{} clips", next_index, prompts.len());
        self.orchestrator.seal(&group_id).await?;
        self.orchestrator.start_monitor(&group_id).await?;
        Ok(group_id)
    }
}
