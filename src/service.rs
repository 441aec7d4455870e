// src/service.rs
//! Caller-facing facade: submit a group of any kind, follow its status.

use crate::config::Settings;
use crate::error::Result;
use crate::group::{GroupId, GroupSnapshot, Orchestrator, OrchestratorConfig};
use crate::media::{FfmpegTranscoder, Transcoder};
use crate::pipeline::{
    AvatarPipeline, AvatarRequest, PromptSequencePipeline, PromptSequenceRequest, SegmentPipeline, SegmentRequest,
    SingleStagePipeline, SingleStageRequest, TransitionPipeline, TransitionRequest,
};
use crate::storage::{HttpObjectStorage, ObjectStorage};
use crate::submit::JobSubmitter;
use crate::template::TemplateStore;
use crate::worker::{HttpWorkerApi, WorkerApi, WorkerDirectory, WorkerSelection};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum GroupRequest {
    Segment(SegmentRequest),
    /// Opens a transition group with its first anchor
    Transition(TransitionRequest),
    SingleStage(SingleStageRequest),
    PromptSequence(PromptSequenceRequest),
    /// Opens the speech group; the avatar group follows on its own
    Avatar(AvatarRequest),
}

pub struct MediaService {
    orchestrator: Arc<Orchestrator>,
    segment: SegmentPipeline,
    transition: TransitionPipeline,
    single: SingleStagePipeline,
    sequence: PromptSequencePipeline,
    avatar: AvatarPipeline,
}

impl MediaService {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        submitter: Arc<JobSubmitter>,
        transcoder: Arc<dyn Transcoder>,
        segment_seconds: f64,
        avatar_segment_seconds: f64,
    ) -> Self {
        Self {
            segment: SegmentPipeline::new(orchestrator.clone(), submitter.clone(), transcoder.clone(), segment_seconds),
            transition: TransitionPipeline::new(orchestrator.clone(), submitter.clone(), transcoder.clone()),
            single: SingleStagePipeline::new(orchestrator.clone(), submitter.clone()),
            sequence: PromptSequencePipeline::new(orchestrator.clone(), submitter.clone(), transcoder.clone()),
            avatar: AvatarPipeline::new(orchestrator.clone(), submitter, transcoder, avatar_segment_seconds),
            orchestrator,
        }
    }

    /// Wires the HTTP worker client, ffmpeg and (optionally) object storage
    /// from settings.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let api: Arc<dyn WorkerApi> = Arc::new(HttpWorkerApi::new());
        let directory = Arc::new(WorkerDirectory::new(api, &settings.worker_endpoints, settings.probe_timeout)?);
        let storage: Option<Arc<dyn ObjectStorage>> = settings
            .storage_base_url
            .as_deref()
            .map(|url| Arc::new(HttpObjectStorage::new(url)) as Arc<dyn ObjectStorage>);
        let transcoder: Arc<dyn Transcoder> = Arc::new(FfmpegTranscoder::new(&settings.ffmpeg_bin, &settings.ffprobe_bin));

        let orchestrator = Arc::new(Orchestrator::new(
            directory.clone(),
            storage,
            OrchestratorConfig::from(settings),
        ));
        let submitter = Arc::new(JobSubmitter::new(directory, TemplateStore::new(&settings.template_dir)));
        Ok(Self::new(
            orchestrator,
            submitter,
            transcoder,
            settings.segment_seconds,
            settings.avatar_segment_seconds,
        ))
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Probes every configured worker and makes the fastest one active.
    pub async fn select_worker(&self) -> WorkerSelection {
        self.orchestrator.directory().select_worker().await
    }

    pub async fn submit_group(&self, request: GroupRequest) -> Result<GroupId> {
        match request {
            GroupRequest::Segment(request) => self.segment.submit(request).await,
            GroupRequest::Transition(request) => self.transition.start(request).await,
            GroupRequest::SingleStage(request) => self.single.submit(request).await,
            GroupRequest::PromptSequence(request) => self.sequence.submit(request).await,
            GroupRequest::Avatar(request) => self.avatar.submit(request).await,
        }
    }

    /// Group started from the output of `group_id`, once there is one.
    pub async fn follow_up_of(&self, group_id: &str) -> Option<GroupId> {
        self.orchestrator.follow_up_of(group_id).await
    }

    pub async fn group_status(&self, group_id: &str) -> Result<GroupSnapshot> {
        self.orchestrator.group_status(group_id).await
    }

    pub async fn list_groups(&self) -> Vec<GroupSnapshot> {
        self.orchestrator.list_groups().await
    }

    pub async fn add_anchor(&self, group_id: &str, clip: &Path) -> Result<usize> {
        self.transition.add_anchor(group_id, clip).await
    }

    pub async fn finish_transition(&self, group_id: &str) -> Result<()> {
        self.transition.finish(group_id).await
    }

    pub async fn cancel_group(&self, group_id: &str) -> Result<()> {
        self.orchestrator.cancel_group(group_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestratorError;
    use crate::group::{GroupKind, GroupStatus, CANCELLED};
    use crate::media::testing::FakeTranscoder;
    use crate::pipeline::single::image_to_video_profile;
    use crate::submit::InputBinding;
    use crate::worker::testing::FakeWorker;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_submit_status_and_cancel() {
        let dir = std::env::temp_dir().join(format!("service-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let graph = json!({"97": {"class_type": "LoadImage", "inputs": {"image": ""}}});
        tokio::fs::write(dir.join("i2v.json"), graph.to_string()).await.unwrap();

        let fake = Arc::new(FakeWorker::new());
        fake.set_queue("gpu-a:1", &[], &["job-1"]);
        let directory = Arc::new(WorkerDirectory::new(fake.clone(), &["gpu-a:1".to_string()], Duration::from_secs(5)).unwrap());
        let orchestrator = Arc::new(Orchestrator::new(
            directory.clone(),
            None,
            OrchestratorConfig {
                poll_interval: Duration::from_secs(3600),
                group_timeout: Duration::from_secs(3600),
                max_concurrent_monitors: 2,
                group_retention: Duration::from_secs(3600),
                retention_sweep_interval: Duration::from_secs(3600),
                work_dir: dir.join("work"),
            },
        ));
        let submitter = Arc::new(JobSubmitter::new(directory, TemplateStore::new(&dir)));
        let service = MediaService::new(orchestrator, submitter, Arc::new(FakeTranscoder::new()), 5.0, 10.0);

        let request = SingleStageRequest::new(image_to_video_profile(), vec![InputBinding::text("image", "still.png")]);
        let group_id = service.submit_group(GroupRequest::SingleStage(request)).await.unwrap();

        let snap = service.group_status(&group_id).await.unwrap();
        assert_eq!(snap.kind, GroupKind::SingleStage);
        assert_eq!(snap.status, GroupStatus::Processing);
        assert_eq!((snap.completed, snap.total), (0, 1));

        service.cancel_group(&group_id).await.unwrap();
        let snap = service.group_status(&group_id).await.unwrap();
        assert_eq!(snap.status, GroupStatus::Failed);
        assert_eq!(snap.error.as_deref(), Some(CANCELLED));
        assert_eq!(fake.cancelled(), vec![("gpu-a:1".to_string(), "job-1".to_string())]);

        assert!(matches!(
            service.group_status("missing").await,
            Err(OrchestratorError::GroupNotFound(_))
        ));
        assert_eq!(service.list_groups().await.len(), 1);
        assert!(service.follow_up_of(&group_id).await.is_none());

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
