// src/pipeline/single.rs
//! One job, one artifact: image-to-video, audio generation and any other
//! template whose output needs no joining.

use super::{Assembler, AssemblyContext, AssemblyPart, PartSource};
use crate::error::{OrchestratorError, Result};
use crate::group::{GroupId, GroupKind, JobRecord, Orchestrator};
use crate::submit::{ComputedParams, InputBinding, InputValue, JobSubmitter};
use crate::template::{SeedPolicy, SlotSpec, TemplateProfile};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct SingleStageRequest {
    pub group_id: Option<GroupId>,
    pub profile: TemplateProfile,
    pub bindings: Vec<InputBinding>,
    pub params: ComputedParams,
}

impl SingleStageRequest {
    pub fn new(profile: TemplateProfile, bindings: Vec<InputBinding>) -> Self {
        Self {
            group_id: None,
            profile,
            bindings,
            params: ComputedParams::default(),
        }
    }

    /// Binds `stage.input` slot names straight onto `template`, without a
    /// predeclared profile.
    pub fn ad_hoc(template: &str, bindings: Vec<InputBinding>) -> Result<Self> {
        let mut profile = TemplateProfile::new(template);
        for binding in &bindings {
            let (stage, input) = binding.slot.rsplit_once('.').ok_or_else(|| {
                OrchestratorError::SlotBinding(format!("'{}' is not of the form stage.input", binding.slot))
            })?;
            if stage.is_empty() || input.is_empty() {
                return Err(OrchestratorError::SlotBinding(format!(
                    "'{}' is not of the form stage.input",
                    binding.slot
                )));
            }
            profile = profile.with_slot(SlotSpec::required(&binding.slot, stage, input));
        }
        Ok(Self::new(profile, bindings))
    }
}

/// Image-to-video template: one still plus an optional prompt.
pub fn image_to_video_profile() -> TemplateProfile {
    TemplateProfile::new("i2v")
        .with_slot(SlotSpec::required("image", "97", "image"))
        .with_slot(SlotSpec::optional("prompt", "93", "text"))
        .with_seed(&["3"], SeedPolicy::Random)
}

/// Parses CLI-style `slot=value` pairs. Values naming an existing file are
/// uploaded; anything else binds as text.
pub fn parse_binding(pair: &str) -> Result<InputBinding> {
    let (slot, value) = pair
        .split_once('=')
        .ok_or_else(|| OrchestratorError::InvalidRequest(format!("expected slot=value, got '{}'", pair)))?;
    let slot = slot.trim();
    if slot.is_empty() {
        return Err(OrchestratorError::InvalidRequest(format!("empty slot name in '{}'", pair)));
    }
    let value = if Path::new(value).is_file() {
        InputValue::LocalFile(value.into())
    } else {
        InputValue::Text(value.to_string())
    };
    Ok(InputBinding {
        slot: slot.to_string(),
        value,
    })
}

pub struct SingleStagePipeline {
    orchestrator: Arc<Orchestrator>,
    submitter: Arc<JobSubmitter>,
}

impl SingleStagePipeline {
    pub fn new(orchestrator: Arc<Orchestrator>, submitter: Arc<JobSubmitter>) -> Self {
        Self { orchestrator, submitter }
    }

    /// Submits the job and starts monitoring. A submission error fails the
    /// group and is also returned.
    pub async fn submit(&self, request: SingleStageRequest) -> Result<GroupId> {
        let group_id = self
            .orchestrator
            .create_group(request.group_id.clone(), Arc::new(SingleStageAssembler))
            .await?;

        let job = match self
            .submitter
            .submit(&request.profile, &request.bindings, &request.params)
            .await
        {
            Ok(job) => job,
            Err(e) => {
                self.orchestrator
                    .fail_group(&group_id, &format!("submission failed: {}", e))
                    .await;
                return Err(e);
            }
        };

        self.orchestrator
            .add_job(
                &group_id,
                JobRecord::new(job.job_id, Some(job.worker), 0).with_final_stage(request.profile.final_stage.clone()),
            )
            .await?;
        self.orchestrator.seal(&group_id).await?;
        self.orchestrator.start_monitor(&group_id).await?;
        Ok(group_id)
    }
}

pub struct SingleStageAssembler;

#[async_trait]
impl Assembler for SingleStageAssembler {
    fn kind(&self) -> GroupKind {
        GroupKind::SingleStage
    }

    async fn assemble(&self, ctx: &AssemblyContext, parts: Vec<AssemblyPart>) -> Result<String> {
        let part = parts
            .into_iter()
            .next()
            .ok_or_else(|| OrchestratorError::AssemblyFailed("no output to publish".to_string()))?;
        let content_type = match &part.source {
            PartSource::Remote { artifact, .. } => artifact.kind.content_type(&artifact.filename),
            PartSource::Local(_) => "application/octet-stream",
        };
        let path = ctx.materialize(&part).await?;
        ctx.publish(&path, content_type).await
    }
}
