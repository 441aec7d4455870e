// src/template.rs
//! Job templates: named stage graphs loaded from `<TEMPLATE_DIR>/<name>.json`,
//! plus the per-pipeline profile that says which stage inputs are slots and
//! which are derived.

use crate::error::{OrchestratorError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One processing stage of a template graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub class_type: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobTemplate {
    pub name: String,
    pub stages: BTreeMap<String, Stage>,
}

impl JobTemplate {
    pub fn from_value(name: &str, value: Value) -> Result<Self> {
        let stages: BTreeMap<String, Stage> =
            serde_json::from_value(value).map_err(|e| OrchestratorError::TemplateInvalid {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        if stages.is_empty() {
            return Err(OrchestratorError::TemplateInvalid {
                name: name.to_string(),
                reason: "template has no stages".to_string(),
            });
        }
        Ok(Self {
            name: name.to_string(),
            stages,
        })
    }

    /// Sets `stage.inputs[input]`. Returns false (and changes nothing) when the
    /// stage is not part of this template.
    pub fn set_input(&mut self, stage: &str, input: &str, value: Value) -> bool {
        match self.stages.get_mut(stage) {
            Some(s) => {
                s.inputs.insert(input.to_string(), value);
                true
            }
            None => {
                tracing::debug!("Template {} has no stage {}, skipping input {}", self.name, stage, input);
                false
            }
        }
    }

    /// Like `set_input` but only overwrites inputs the stage already declares.
    pub fn replace_input(&mut self, stage: &str, input: &str, value: Value) -> bool {
        match self.stages.get_mut(stage).and_then(|s| s.inputs.get_mut(input)) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn input(&self, stage: &str, input: &str) -> Option<&Value> {
        self.stages.get(stage).and_then(|s| s.inputs.get(input))
    }

    pub fn to_graph(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.stages)?)
    }
}

/// Loads templates by name from a directory
#[derive(Debug, Clone)]
pub struct TemplateStore {
    dir: PathBuf,
}

impl TemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub async fn load(&self, name: &str) -> Result<JobTemplate> {
        if name.is_empty() || name.contains("..") || name.contains('/') || name.contains('\\') {
            return Err(OrchestratorError::TemplateMissing(name.to_string()));
        }
        let path = self.dir.join(format!("{}.json", name));
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(OrchestratorError::TemplateMissing(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let value: Value = serde_json::from_str(&raw).map_err(|e| OrchestratorError::TemplateInvalid {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        JobTemplate::from_value(name, value)
    }
}

/// A declared input slot: caller-facing name → stage input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSpec {
    pub name: String,
    pub stage: String,
    pub input: String,
    pub required: bool,
}

impl SlotSpec {
    pub fn required(name: &str, stage: &str, input: &str) -> Self {
        Self {
            name: name.to_string(),
            stage: stage.to_string(),
            input: input.to_string(),
            required: true,
        }
    }

    pub fn optional(name: &str, stage: &str, input: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, stage, input)
        }
    }
}

/// target length = ceil(seconds × fps), clamped to [min, max]. When `max` is
/// unset the value already present in the template acts as the ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct LengthRule {
    pub stages: Vec<String>,
    pub input: String,
    pub fps: f64,
    pub min: Option<u64>,
    pub max: Option<u64>,
}

impl LengthRule {
    pub fn frames_for(&self, seconds: f64, template_ceiling: Option<u64>) -> u64 {
        let raw = (seconds * self.fps).ceil().max(0.0) as u64;
        let mut length = raw;
        if let Some(max) = self.max.or(template_ceiling) {
            length = length.min(max);
        }
        length.max(self.min.unwrap_or(1))
    }

    pub fn apply(&self, template: &mut JobTemplate, seconds: f64) -> Option<u64> {
        let mut applied = None;
        for stage in &self.stages {
            let ceiling = template.input(stage, &self.input).and_then(|v| v.as_u64());
            if !template.stages.contains_key(stage) {
                continue;
            }
            let frames = self.frames_for(seconds, ceiling);
            template.set_input(stage, &self.input, Value::from(frames));
            applied = Some(frames);
        }
        applied
    }
}

/// Seed selection is a per-pipeline decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedPolicy {
    Fixed(u64),
    /// Uniform in [1, 2^32 - 1]
    Random,
}

impl SeedPolicy {
    pub fn draw(&self) -> u64 {
        match self {
            SeedPolicy::Fixed(seed) => *seed,
            SeedPolicy::Random => rand::thread_rng().gen_range(1..=u32::MAX as u64),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeedRule {
    pub stages: Vec<String>,
    pub input: String,
    pub policy: SeedPolicy,
}

impl SeedRule {
    /// Writes one seed into every stage that already has a seed input.
    pub fn apply(&self, template: &mut JobTemplate) -> u64 {
        let seed = self.policy.draw();
        for stage in &self.stages {
            template.replace_input(stage, &self.input, Value::from(seed));
        }
        seed
    }
}

/// How one pipeline kind fills its template
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateProfile {
    pub template: String,
    pub slots: Vec<SlotSpec>,
    pub length: Option<LengthRule>,
    pub seed: Option<SeedRule>,
    /// Constant overrides applied on every submission: (stage, input, value)
    pub fixed: Vec<(String, String, Value)>,
    /// Stage preferred when several outputs tie on kind
    pub final_stage: Option<String>,
}

impl TemplateProfile {
    pub fn new(template: &str) -> Self {
        Self {
            template: template.to_string(),
            slots: Vec::new(),
            length: None,
            seed: None,
            fixed: Vec::new(),
            final_stage: None,
        }
    }

    pub fn with_slot(mut self, slot: SlotSpec) -> Self {
        self.slots.push(slot);
        self
    }

    pub fn with_length(mut self, rule: LengthRule) -> Self {
        self.length = Some(rule);
        self
    }

    pub fn with_seed(mut self, stages: &[&str], policy: SeedPolicy) -> Self {
        self.seed = Some(SeedRule {
            stages: stages.iter().map(|s| s.to_string()).collect(),
            input: "seed".to_string(),
            policy,
        });
        self
    }

    pub fn with_fixed(mut self, stage: &str, input: &str, value: Value) -> Self {
        self.fixed.push((stage.to_string(), input.to_string(), value));
        self
    }

    pub fn with_final_stage(mut self, stage: &str) -> Self {
        self.final_stage = Some(stage.to_string());
        self
    }

    pub fn slot(&self, name: &str) -> Option<&SlotSpec> {
        self.slots.iter().find(|s| s.name == name)
    }
}
