// src/pipeline/segment.rs
//! Segment pipeline: cut the source into fixed windows, run one job per
//! window against a shared reference image, then concatenate the results in
//! window order and lay the optional audio track back under them.

use super::{Assembler, AssemblyContext, AssemblyPart};
use crate::error::{OrchestratorError, Result};
use crate::group::{GroupId, GroupKind, JobRecord, Orchestrator};
use crate::media::{AudioFit, Transcoder};
use crate::submit::{ComputedParams, InputBinding, JobSubmitter};
use crate::template::{LengthRule, SeedPolicy, SlotSpec, TemplateProfile};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

// Absorbs float noise such as 4.2 / 0.6 = 7.000000000000001
const WINDOW_EPSILON: f64 = 1e-9;

/// `ceil(duration / segment)` consecutive windows covering `[0, duration)`,
/// the last one ending exactly at `duration`. Never yields an empty window.
pub fn split_windows(duration: f64, segment_seconds: f64) -> Vec<(f64, f64)> {
    if !(duration > 0.0) || !(segment_seconds > 0.0) || !duration.is_finite() {
        return Vec::new();
    }
    let count = ((duration / segment_seconds - WINDOW_EPSILON).ceil() as usize).max(1);
    (0..count)
        .map(|i| i as f64 * segment_seconds)
        .take_while(|start| *start < duration)
        .enumerate()
        .map(|(i, start)| {
            let end = if i + 1 == count { duration } else { ((i + 1) as f64 * segment_seconds).min(duration) };
            (start, end)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRequest {
    pub group_id: Option<GroupId>,
    pub source: PathBuf,
    /// Shared by every segment job
    pub reference_image: PathBuf,
    pub audio: Option<PathBuf>,
    pub prompt: Option<String>,
    /// Falls back to the pipeline default when absent
    pub segment_seconds: Option<f64>,
}

impl SegmentRequest {
    pub fn new(source: impl Into<PathBuf>, reference_image: impl Into<PathBuf>) -> Self {
        Self {
            group_id: None,
            source: source.into(),
            reference_image: reference_image.into(),
            audio: None,
            prompt: None,
            segment_seconds: None,
        }
    }
}

pub struct SegmentPipeline {
    orchestrator: Arc<Orchestrator>,
    submitter: Arc<JobSubmitter>,
    transcoder: Arc<dyn Transcoder>,
    profile: TemplateProfile,
    segment_seconds: f64,
}

impl SegmentPipeline {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        submitter: Arc<JobSubmitter>,
        transcoder: Arc<dyn Transcoder>,
        segment_seconds: f64,
    ) -> Self {
        Self {
            orchestrator,
            submitter,
            transcoder,
            profile: Self::default_profile(),
            segment_seconds,
        }
    }

    pub fn with_profile(mut self, profile: TemplateProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Character-replacement template. Every segment gets its own random seed;
    /// output length follows the segment duration at 16 fps, capped by the
    /// template's own value.
    pub fn default_profile() -> TemplateProfile {
        TemplateProfile::new("animate")
            .with_slot(SlotSpec::required("reference", "10", "image"))
            .with_slot(SlotSpec::required("video", "145", "file"))
            .with_slot(SlotSpec::optional("prompt", "21", "text"))
            .with_length(LengthRule {
                stages: vec!["232:62".into(), "242:90".into()],
                input: "length".into(),
                fps: 16.0,
                min: None,
                max: None,
            })
            .with_seed(&["232:63", "242:91", "64"], SeedPolicy::Random)
            .with_final_stage("243")
    }

    /// Cuts, submits and starts monitoring. A segment that cannot be cut or
    /// submitted is skipped; the group fails only if none could be submitted.
    pub async fn submit(&self, request: SegmentRequest) -> Result<GroupId> {
        let segment_seconds = request.segment_seconds.unwrap_or(self.segment_seconds);
        if !(segment_seconds > 0.0) {
            return Err(OrchestratorError::InvalidRequest(format!(
                "segment length must be positive, got {}",
                segment_seconds
            )));
        }

        let info = self.transcoder.probe(&request.source).await?;
        let windows = split_windows(info.duration_seconds, segment_seconds);
        if windows.is_empty() {
            return Err(OrchestratorError::InvalidRequest(format!(
                "{} has no usable duration",
                request.source.display()
            )));
        }

        let assembler = Arc::new(SegmentAssembler::new(
            GroupKind::Segment,
            self.transcoder.clone(),
            request.audio.clone(),
        ));
        let group_id = self.orchestrator.create_group(request.group_id.clone(), assembler).await?;
        tracing::info!(
            group_id = %group_id,
            "✂️ Splitting {} ({}x{}, {:.2}s) into {} segments of {}s",
            request.source.display(),
            info.width,
            info.height,
            info.duration_seconds,
            windows.len(),
            segment_seconds
        );

        let segment_dir = self.orchestrator.config().work_dir.join(&group_id).join("segments");
        tokio::fs::create_dir_all(&segment_dir).await?;

        let mut submitted = 0usize;
        let mut last_error: Option<String> = None;
        for (index, (start, end)) in windows.iter().copied().enumerate() {
            let segment_path = segment_dir.join(format!("segment_{:03}.mp4", index));
            if let Err(e) = self.transcoder.cut(&request.source, &segment_path, start, end).await {
                tracing::warn!(group_id = %group_id, "⚠️ Skipping segment {}: cut failed: {}", index, e);
                last_error = Some(e.to_string());
                continue;
            }

            let mut bindings = vec![
                InputBinding::file("reference", &request.reference_image),
                InputBinding::file("video", &segment_path),
            ];
            if let Some(prompt) = &request.prompt {
                bindings.push(InputBinding::text("prompt", prompt));
            }
            let params = ComputedParams {
                segment_seconds: Some(end - start),
            };

            match self.submitter.submit(&self.profile, &bindings, &params).await {
                Ok(job) => {
                    let record = JobRecord::new(job.job_id, Some(job.worker), index)
                        .with_final_stage(self.profile.final_stage.clone());
                    self.orchestrator.add_job(&group_id, record).await?;
                    submitted += 1;
                }
                Err(e) => {
                    tracing::warn!(group_id = %group_id, "⚠️ Skipping segment {}: submission failed: {}", index, e);
                    last_error = Some(e.to_string());
                }
            }
        }

        if submitted == 0 {
            let reason = format!(
                "no segment could be submitted: {}",
                last_error.unwrap_or_else(|| "unknown error".to_string())
            );
            self.orchestrator.fail_group(&group_id, &reason).await;
            return Ok(group_id);
        }

        tracing::info!(group_id = %group_id, "🚀 Submitted {}/{} segments", submitted, windows.len());
        self.orchestrator.seal(&group_id).await?;
        self.orchestrator.start_monitor(&group_id).await?;
        Ok(group_id)
    }
}

/// Joins clips in index order and lays an optional track under the result.
/// Shared by every group whose output is a plain concatenation.
pub struct SegmentAssembler {
    kind: GroupKind,
    transcoder: Arc<dyn Transcoder>,
    audio: Option<PathBuf>,
}

impl SegmentAssembler {
    pub fn new(kind: GroupKind, transcoder: Arc<dyn Transcoder>, audio: Option<PathBuf>) -> Self {
        Self { kind, transcoder, audio }
    }
}

#[async_trait]
impl Assembler for SegmentAssembler {
    fn kind(&self) -> GroupKind {
        self.kind
    }

    async fn assemble(&self, ctx: &AssemblyContext, parts: Vec<AssemblyPart>) -> Result<String> {
        let paths = ctx.materialize_all(&parts).await?;
        tokio::fs::create_dir_all(&ctx.work_dir).await?;

        let joined = ctx.scratch("assembled.mp4");
        self.transcoder.concat(&paths, &joined).await?;
        tracing::info!(group_id = %ctx.group_id, "🎬 Concatenated {} clips", paths.len());

        let output = match &self.audio {
            Some(audio) => {
                let video_seconds = self.transcoder.probe(&joined).await?.duration_seconds;
                let audio_seconds = self.transcoder.probe(audio).await?.duration_seconds;
                let fit = AudioFit::for_durations(video_seconds, audio_seconds);
                tracing::info!(
                    group_id = %ctx.group_id,
                    "🎵 Fitting {:.2}s audio to {:.2}s video ({:?})",
                    audio_seconds,
                    video_seconds,
                    fit
                );
                let merged = ctx.scratch("final.mp4");
                self.transcoder.merge_audio(&joined, audio, &merged, fit, video_seconds).await?;
                merged
            }
            None => joined,
        };

        ctx.publish(&output, "video/mp4").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{GroupStatus, OrchestratorConfig, TickOutcome};
    use crate::media::testing::FakeTranscoder;
    use crate::template::TemplateStore;
    use crate::worker::testing::FakeWorker;
    use crate::worker::WorkerDirectory;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_split_25_by_5() {
        assert_eq!(
            split_windows(25.0, 5.0),
            vec![(0.0, 5.0), (5.0, 10.0), (10.0, 15.0), (15.0, 20.0), (20.0, 25.0)]
        );
    }

    #[test]
    fn test_split_covers_without_gaps() {
        let cases = [
            (25.04, 5.0, 6),
            (3.2, 5.0, 1),
            (10.0, 3.0, 4),
            (7.77, 0.5, 16),
            (59.9, 6.0, 10),
            (4.2, 0.6, 7),
            (2.1, 0.3, 7),
            (8.4, 0.15, 56),
        ];
        for &(duration, segment, expected) in &cases {
            let windows = split_windows(duration, segment);
            assert_eq!(windows.len(), expected, "{} / {}", duration, segment);
            assert_eq!(windows[0].0, 0.0);
            assert_eq!(windows.last().unwrap().1, duration);
            for pair in windows.windows(2) {
                assert_eq!(pair[0].1, pair[1].0);
            }
            assert!(windows.iter().all(|(s, e)| e > s));
        }
    }

    #[test]
    fn test_split_degenerate_inputs() {
        assert!(split_windows(0.0, 5.0).is_empty());
        assert!(split_windows(10.0, 0.0).is_empty());
        assert!(split_windows(f64::NAN, 5.0).is_empty());
    }

    struct Fixture {
        fake: Arc<FakeWorker>,
        transcoder: Arc<FakeTranscoder>,
        orchestrator: Arc<Orchestrator>,
        pipeline: SegmentPipeline,
        dir: PathBuf,
    }

    async fn fixture() -> Fixture {
        let dir = std::env::temp_dir().join(format!("segment-{}", uuid::Uuid::new_v4()));
        let templates = dir.join("templates");
        tokio::fs::create_dir_all(&templates).await.unwrap();
        let graph = json!({
            "10": {"class_type": "LoadImage", "inputs": {"image": ""}},
            "145": {"class_type": "LoadVideo", "inputs": {"file": ""}},
            "21": {"class_type": "TextEncode", "inputs": {"text": ""}},
            "232:62": {"class_type": "Animate", "inputs": {"length": 77}},
            "242:90": {"class_type": "Animate", "inputs": {"length": 77}},
            "232:63": {"class_type": "Sampler", "inputs": {"seed": 0}},
            "242:91": {"class_type": "Sampler", "inputs": {"seed": 0}},
            "64": {"class_type": "Sampler", "inputs": {"seed": 0}},
        });
        tokio::fs::write(templates.join("animate.json"), graph.to_string()).await.unwrap();
        tokio::fs::write(dir.join("face.png"), b"png").await.unwrap();

        let fake = Arc::new(FakeWorker::new());
        let directory = Arc::new(WorkerDirectory::new(fake.clone(), &["gpu-a:1".to_string()], Duration::from_secs(5)).unwrap());
        let orchestrator = Arc::new(Orchestrator::new(
            directory.clone(),
            None,
            OrchestratorConfig {
                poll_interval: Duration::from_secs(3600),
                group_timeout: Duration::from_secs(3600),
                max_concurrent_monitors: 4,
                group_retention: Duration::from_secs(3600),
                retention_sweep_interval: Duration::from_secs(3600),
                work_dir: dir.join("work"),
            },
        ));
        let submitter = Arc::new(JobSubmitter::new(directory, TemplateStore::new(&templates)));
        let transcoder = Arc::new(FakeTranscoder::new());
        let pipeline = SegmentPipeline::new(orchestrator.clone(), submitter, transcoder.clone(), 5.0);
        Fixture { fake, transcoder, orchestrator, pipeline, dir }
    }

    #[tokio::test]
    async fn test_segments_submit_with_shared_reference_and_lengths() {
        let f = fixture().await;
        f.transcoder.set_duration("source", 12.0);
        f.fake.set_queue("gpu-a:1", &[], &["job-1", "job-2", "job-3"]);
        let mut request = SegmentRequest::new(f.dir.join("source.mp4"), f.dir.join("face.png"));
        request.prompt = Some("a dancer".into());

        let group_id = f.pipeline.submit(request).await.unwrap();
        let sent = f.fake.submitted();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|s| s.graph["10"]["inputs"]["image"] == "face.png"));
        assert_eq!(sent[0].graph["145"]["inputs"]["file"], "segment_000.mp4");
        assert_eq!(sent[2].graph["145"]["inputs"]["file"], "segment_002.mp4");
        // 5s → 80 frames, capped at the template's 77; the 2s tail → 32
        assert_eq!(sent[0].graph["232:62"]["inputs"]["length"], 77);
        assert_eq!(sent[2].graph["242:90"]["inputs"]["length"], 32);
        assert_eq!(sent[1].graph["21"]["inputs"]["text"], "a dancer");

        let snap = f.orchestrator.group_status(&group_id).await.unwrap();
        assert_eq!(snap.total, 3);
        assert_eq!(snap.jobs[1].final_stage.as_deref(), Some("243"));
        assert!(f.transcoder.calls().contains(&"cut source.mp4 10.0-12.0".to_string()));

        tokio::fs::remove_dir_all(&f.dir).await.ok();
    }

    #[tokio::test]
    async fn test_rejected_segment_skipped_and_rest_assembled_in_order() {
        let f = fixture().await;
        f.transcoder.set_duration("source", 15.0);
        f.transcoder.set_duration("assembled", 10.0);
        f.transcoder.set_duration("song", 4.0);
        f.fake.reject_submission(2);
        // keeps the monitor's first round from seeing the jobs as lost
        f.fake.set_queue("gpu-a:1", &[], &["job-1", "job-3"]);
        let mut request = SegmentRequest::new(f.dir.join("source.mp4"), f.dir.join("face.png"));
        request.audio = Some(f.dir.join("song.mp3"));

        let group_id = f.pipeline.submit(request).await.unwrap();
        let snap = f.orchestrator.group_status(&group_id).await.unwrap();
        let ids: Vec<_> = snap.jobs.iter().map(|j| (j.job_id.clone(), j.segment_index)).collect();
        assert_eq!(ids, vec![("job-1".to_string(), 0), ("job-3".to_string(), 2)]);

        f.fake.set_queue("gpu-a:1", &[], &[]);
        f.fake.complete_with_video("gpu-a:1", "job-3", "243", "third.mp4");
        f.fake.complete_with_video("gpu-a:1", "job-1", "243", "first.mp4");
        assert_eq!(f.orchestrator.tick(&group_id).await, TickOutcome::Terminal(GroupStatus::Completed));

        let snap = f.orchestrator.group_status(&group_id).await.unwrap();
        let artifact = snap.final_artifact.unwrap();
        assert!(artifact.ends_with("final.mp4"));
        let contents = tokio::fs::read_to_string(&artifact).await.unwrap();
        assert_eq!(contents, "gpu-a:1:first.mp4|gpu-a:1:third.mp4");
        assert!(f.transcoder.calls().contains(&"merge song.mp3 Loop 10.0".to_string()));

        tokio::fs::remove_dir_all(&f.dir).await.ok();
    }

    #[tokio::test]
    async fn test_concat_failure_fails_group() {
        let f = fixture().await;
        f.transcoder.set_duration("source", 8.0);
        f.fake.set_queue("gpu-a:1", &[], &["job-1", "job-2"]);
        let group_id = f
            .pipeline
            .submit(SegmentRequest::new(f.dir.join("source.mp4"), f.dir.join("face.png")))
            .await
            .unwrap();

        f.transcoder.fail_concat.store(true, std::sync::atomic::Ordering::SeqCst);
        f.fake.set_queue("gpu-a:1", &[], &[]);
        f.fake.complete_with_video("gpu-a:1", "job-1", "243", "first.mp4");
        f.fake.complete_with_video("gpu-a:1", "job-2", "243", "second.mp4");
        assert_eq!(f.orchestrator.tick(&group_id).await, TickOutcome::Terminal(GroupStatus::Failed));

        let snap = f.orchestrator.group_status(&group_id).await.unwrap();
        let error = snap.error.unwrap();
        assert!(error.starts_with("Assembly failed"), "{}", error);
        assert!(error.contains("concat exploded"));
        assert!(snap.final_artifact.is_none());
        assert!(f.transcoder.calls().contains(&"concat 2".to_string()));

        tokio::fs::remove_dir_all(&f.dir).await.ok();
    }

    #[tokio::test]
    async fn test_group_fails_when_nothing_submitted() {
        let f = fixture().await;
        f.transcoder.set_duration("source", 4.0);
        f.fake.set_down("gpu-a:1", true);

        let group_id = f
            .pipeline
            .submit(SegmentRequest::new(f.dir.join("source.mp4"), f.dir.join("face.png")))
            .await
            .unwrap();
        let snap = f.orchestrator.group_status(&group_id).await.unwrap();
        assert_eq!(snap.status, GroupStatus::Failed);
        assert!(snap.error.unwrap().starts_with("no segment could be submitted"));

        tokio::fs::remove_dir_all(&f.dir).await.ok();
    }

    #[tokio::test]
    async fn test_invalid_segment_length_rejected() {
        let f = fixture().await;
        let mut request = SegmentRequest::new(f.dir.join("source.mp4"), f.dir.join("face.png"));
        request.segment_seconds = Some(0.0);
        assert!(matches!(f.pipeline.submit(request).await, Err(OrchestratorError::InvalidRequest(_))));
        tokio::fs::remove_dir_all(&f.dir).await.ok();
    }
}
