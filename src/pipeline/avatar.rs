// src/pipeline/avatar.rs
//! Talking-character chain.
//!
//! A speech group turns text into a voice track. When that track is
//! published, the same assembly starts an avatar group: the track is cut
//! into fixed windows, each window drives one lip-sync job against the
//! character image, and the clips are joined with the full track laid back
//! under them. The orchestrator's link map records which speech job started
//! which avatar group.

use super::segment::{split_windows, SegmentAssembler};
use super::{Assembler, AssemblyContext, AssemblyPart, PartSource};
use crate::error::{OrchestratorError, Result};
use crate::group::{GroupId, GroupKind, JobRecord, Orchestrator};
use crate::media::Transcoder;
use crate::submit::{ComputedParams, InputBinding, JobSubmitter};
use crate::template::{SeedPolicy, SlotSpec, TemplateProfile};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct AvatarRequest {
    /// Id of the speech group
    pub group_id: Option<GroupId>,
    pub text: String,
    pub character_image: PathBuf,
    /// Falls back to the pipeline default when absent
    pub segment_seconds: Option<f64>,
}

impl AvatarRequest {
    pub fn new(text: impl Into<String>, character_image: impl Into<PathBuf>) -> Self {
        Self {
            group_id: None,
            text: text.into(),
            character_image: character_image.into(),
            segment_seconds: None,
        }
    }
}

/// Text-to-speech template.
pub fn speech_profile() -> TemplateProfile {
    TemplateProfile::new("audio").with_slot(SlotSpec::required("text", "27", "text"))
}

/// Lip-sync template. The seed is pinned so every window renders the
/// character the same way.
pub fn avatar_profile() -> TemplateProfile {
    TemplateProfile::new("avatar")
        .with_slot(SlotSpec::required("image", "49", "image"))
        .with_slot(SlotSpec::required("audio", "58", "audio"))
        .with_seed(&["64"], SeedPolicy::Fixed(0))
}

pub struct AvatarPipeline {
    stage: Arc<AvatarStage>,
    speech: TemplateProfile,
    segment_seconds: f64,
}

impl AvatarPipeline {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        submitter: Arc<JobSubmitter>,
        transcoder: Arc<dyn Transcoder>,
        segment_seconds: f64,
    ) -> Self {
        Self {
            stage: Arc::new(AvatarStage {
                orchestrator,
                submitter,
                transcoder,
                profile: avatar_profile(),
            }),
            speech: speech_profile(),
            segment_seconds,
        }
    }

    /// Submits the speech job and starts monitoring it. Returns the speech
    /// group id; the avatar group shows up under
    /// [`Orchestrator::follow_up_of`] once the track is published.
    pub async fn submit(&self, request: AvatarRequest) -> Result<GroupId> {
        if request.text.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest("speech text is empty".to_string()));
        }
        let segment_seconds = request.segment_seconds.unwrap_or(self.segment_seconds);
        if !(segment_seconds > 0.0) {
            return Err(OrchestratorError::InvalidRequest(format!(
                "segment length must be positive, got {}",
                segment_seconds
            )));
        }

        let orchestrator = &self.stage.orchestrator;
        let assembler = Arc::new(SpeechAssembler {
            stage: self.stage.clone(),
            character_image: request.character_image.clone(),
            segment_seconds,
        });
        let group_id = orchestrator.create_group(request.group_id.clone(), assembler).await?;

        let bindings = vec![InputBinding::text("text", request.text.trim())];
        let job = match self
            .stage
            .submitter
            .submit(&self.speech, &bindings, &ComputedParams::default())
            .await
        {
            Ok(job) => job,
            Err(e) => {
                orchestrator
                    .fail_group(&group_id, &format!("submission failed: {}", e))
                    .await;
                return Err(e);
            }
        };

        let job_id = job.job_id.clone();
        orchestrator
            .add_job(
                &group_id,
                JobRecord::new(job.job_id, Some(job.worker), 0).with_final_stage(self.speech.final_stage.clone()),
            )
            .await?;
        orchestrator.link_job(&job_id).await?;
        orchestrator.seal(&group_id).await?;
        orchestrator.start_monitor(&group_id).await?;
        tracing::info!(group_id = %group_id, job_id = %job_id, "🗣️ Speech job queued for avatar");
        Ok(group_id)
    }
}

/// Second half of the chain, shared with every speech assembler.
struct AvatarStage {
    orchestrator: Arc<Orchestrator>,
    submitter: Arc<JobSubmitter>,
    transcoder: Arc<dyn Transcoder>,
    profile: TemplateProfile,
}

impl AvatarStage {
    /// Cuts `track` into windows and submits one lip-sync job per window.
    async fn start(&self, track: &Path, character_image: &Path, segment_seconds: f64) -> Result<GroupId> {
        let info = self.transcoder.probe(track).await?;
        if !info.has_audio {
            return Err(OrchestratorError::InvalidRequest(format!(
                "{} has no audio stream",
                track.display()
            )));
        }
        let windows = split_windows(info.duration_seconds, segment_seconds);
        if windows.is_empty() {
            return Err(OrchestratorError::InvalidRequest(format!(
                "{} has no usable duration",
                track.display()
            )));
        }

        // The track is copied next to the avatar clips so it outlives the
        // speech group's scratch directory.
        let group_id = Uuid::new_v4().to_string();
        let extension = track.extension().and_then(|e| e.to_str()).unwrap_or("wav").to_string();
        let group_dir = self.orchestrator.config().work_dir.join(&group_id);
        let window_dir = group_dir.join("audio");
        tokio::fs::create_dir_all(&window_dir).await?;
        let full_track = group_dir.join(format!("speech.{}", extension));
        tokio::fs::copy(track, &full_track).await?;

        let assembler = Arc::new(SegmentAssembler::new(
            GroupKind::Avatar,
            self.transcoder.clone(),
            Some(full_track),
        ));
        let group_id = self.orchestrator.create_group(Some(group_id), assembler).await?;
        tracing::info!(
            group_id = %group_id,
            "🎙️ Splitting {:.2}s track into {} windows of {}s",
            info.duration_seconds,
            windows.len(),
            segment_seconds
        );

        let mut submitted = 0usize;
        let mut last_error: Option<String> = None;
        for (index, (start, end)) in windows.iter().copied().enumerate() {
            let window = window_dir.join(format!("audio_{:03}.{}", index, extension));
            if let Err(e) = self.transcoder.cut(track, &window, start, end).await {
                tracing::warn!(group_id = %group_id, "⚠️ Skipping window {}: cut failed: {}", index, e);
                last_error = Some(e.to_string());
                continue;
            }
            let bindings = vec![
                InputBinding::file("image", character_image),
                InputBinding::file("audio", &window),
            ];
            match self.submitter.submit(&self.profile, &bindings, &ComputedParams::default()).await {
                Ok(job) => {
                    let record = JobRecord::new(job.job_id, Some(job.worker), index)
                        .with_final_stage(self.profile.final_stage.clone());
                    self.orchestrator.add_job(&group_id, record).await?;
                    submitted += 1;
                }
                Err(e) => {
                    tracing::warn!(group_id = %group_id, "⚠️ Skipping window {}: submission failed: {}", index, e);
                    last_error = Some(e.to_string());
                }
            }
        }

        if submitted == 0 {
            let reason = format!(
                "no avatar window could be submitted: {}",
                last_error.unwrap_or_else(|| "unknown error".to_string())
            );
            self.orchestrator.fail_group(&group_id, &reason).await;
            return Ok(group_id);
        }

        self.orchestrator.seal(&group_id).await?;
        self.orchestrator.start_monitor(&group_id).await?;
        Ok(group_id)
    }
}

/// Publishes the voice track, then hands it to the avatar stage.
struct SpeechAssembler {
    stage: Arc<AvatarStage>,
    character_image: PathBuf,
    segment_seconds: f64,
}

#[async_trait]
impl Assembler for SpeechAssembler {
    fn kind(&self) -> GroupKind {
        GroupKind::Speech
    }

    async fn assemble(&self, ctx: &AssemblyContext, parts: Vec<AssemblyPart>) -> Result<String> {
        let part = parts
            .into_iter()
            .next()
            .ok_or_else(|| OrchestratorError::AssemblyFailed("no speech track to publish".to_string()))?;
        let (job_id, content_type) = match &part.source {
            PartSource::Remote { job_id, artifact, .. } => {
                (job_id.clone(), artifact.kind.content_type(&artifact.filename))
            }
            PartSource::Local(path) => {
                return Err(OrchestratorError::AssemblyFailed(format!(
                    "speech track {} did not come from a job",
                    path.display()
                )))
            }
        };

        let track = ctx.materialize(&part).await?;
        let url = ctx.publish(&track, content_type).await?;
        tracing::info!(group_id = %ctx.group_id, "🎵 Speech track ready: {}", url);

        let follow_up = self
            .stage
            .start(&track, &self.character_image, self.segment_seconds)
            .await
            .map_err(|e| e.to_string());
        if let Err(e) = self.stage.orchestrator.resolve_link(&job_id, follow_up).await {
            tracing::warn!(group_id = %ctx.group_id, "Follow-up not recorded: {}", e);
        }
        Ok(url)
    }
}
