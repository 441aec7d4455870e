// src/submit.rs
//! Job submission adapter: template → bound graph → worker job id.

use crate::error::{OrchestratorError, Result};
use crate::template::{TemplateProfile, TemplateStore};
use crate::worker::{WorkerDirectory, WorkerEndpoint};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    /// Uploaded to the chosen worker first; the slot gets the server-side name.
    LocalFile(PathBuf),
    /// Already present on the worker
    RemoteFile(String),
    Text(String),
    Json(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputBinding {
    pub slot: String,
    pub value: InputValue,
}

impl InputBinding {
    pub fn file(slot: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            slot: slot.to_string(),
            value: InputValue::LocalFile(path.into()),
        }
    }

    pub fn text(slot: &str, text: impl Into<String>) -> Self {
        Self {
            slot: slot.to_string(),
            value: InputValue::Text(text.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComputedParams {
    /// Drives the profile's length rule when present
    pub segment_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedJob {
    pub job_id: String,
    pub worker: WorkerEndpoint,
    pub seed: Option<u64>,
}

pub struct JobSubmitter {
    directory: Arc<WorkerDirectory>,
    templates: TemplateStore,
    client_id: String,
}

impl JobSubmitter {
    pub fn new(directory: Arc<WorkerDirectory>, templates: TemplateStore) -> Self {
        Self {
            directory,
            templates,
            client_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn directory(&self) -> &Arc<WorkerDirectory> {
        &self.directory
    }

    /// Fills `profile.template` with `bindings` and queues it on the active
    /// worker. Every failure is returned to the caller.
    pub async fn submit(
        &self,
        profile: &TemplateProfile,
        bindings: &[InputBinding],
        params: &ComputedParams,
    ) -> Result<SubmittedJob> {
        let mut template = self.templates.load(&profile.template).await?;
        validate_bindings(profile, bindings)?;

        let selection = self.directory.check_connection().await;
        if let Some(reason) = &selection.error {
            tracing::warn!("⚠️ Submitting {} to best-effort worker {}: {}", profile.template, selection.endpoint, reason);
        }
        let endpoint = selection.endpoint;
        let api = self.directory.api();

        for binding in bindings {
            let Some(slot) = profile.slot(&binding.slot) else {
                continue;
            };
            let value = match &binding.value {
                InputValue::LocalFile(path) => {
                    let uploaded = api.upload_input(&endpoint, path).await?;
                    tracing::debug!("Uploaded {} as {} on {}", path.display(), uploaded.name, endpoint);
                    Value::String(uploaded.slot_value())
                }
                InputValue::RemoteFile(name) => Value::String(name.clone()),
                InputValue::Text(text) => Value::String(text.clone()),
                InputValue::Json(value) => value.clone(),
            };
            template.set_input(&slot.stage, &slot.input, value);
        }

        for (stage, input, value) in &profile.fixed {
            template.set_input(stage, input, value.clone());
        }

        if let (Some(rule), Some(seconds)) = (&profile.length, params.segment_seconds) {
            if let Some(frames) = rule.apply(&mut template, seconds) {
                tracing::debug!("{}: {:.2}s → {} frames", profile.template, seconds, frames);
            }
        }

        let seed = profile.seed.as_ref().map(|rule| rule.apply(&mut template));

        let graph = template.to_graph()?;
        let job_id = api.submit(&endpoint, &graph, &self.client_id).await?;
        tracing::info!(job_id = %job_id, worker = %endpoint, "🚀 Submitted {} job", profile.template);

        Ok(SubmittedJob {
            job_id,
            worker: endpoint,
            seed,
        })
    }
}

fn validate_bindings(profile: &TemplateProfile, bindings: &[InputBinding]) -> Result<()> {
    for binding in bindings {
        if profile.slot(&binding.slot).is_none() {
            return Err(OrchestratorError::SlotBinding(format!(
                "template {} declares no slot '{}'",
                profile.template, binding.slot
            )));
        }
    }
    for slot in profile.slots.iter().filter(|s| s.required) {
        if !bindings.iter().any(|b| b.slot == slot.name) {
            return Err(OrchestratorError::SlotBinding(format!(
                "template {} requires slot '{}'",
                profile.template, slot.name
            )));
        }
    }
    Ok(())
}
