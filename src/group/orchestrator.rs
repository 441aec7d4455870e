// src/group/orchestrator.rs
//! Task-group orchestrator.
//!
//! One monitor task per group polls its jobs on a fixed interval, enforces the
//! group's wall-clock budget and runs the group's assembler once every job is
//! terminal. Monitors share nothing but the [`GroupStore`]; the number running
//! at once is capped by a semaphore. All failures end up as group state.
//!
//! Chained pipelines record which job feeds which follow-up group in a
//! separate locked map, keyed by job id.

use super::model::{GroupId, GroupSnapshot, GroupStatus, JobRecord, JobStatus, LocalPart, TaskGroup};
use super::store::GroupStore;
use crate::config::Settings;
use crate::error::{OrchestratorError, Result};
use crate::pipeline::{order_parts, Assembler, AssemblyContext, AssemblyPart, PartSource};
use crate::status::{JobStatusTracker, PollOutcome, TerminalResult};
use crate::storage::ObjectStorage;
use crate::worker::WorkerDirectory;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const CANCELLED: &str = "cancelled";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub poll_interval: Duration,
    pub group_timeout: Duration,
    pub max_concurrent_monitors: usize,
    pub group_retention: Duration,
    pub retention_sweep_interval: Duration,
    pub work_dir: PathBuf,
}

impl From<&Settings> for OrchestratorConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            poll_interval: settings.poll_interval,
            group_timeout: settings.group_timeout,
            max_concurrent_monitors: settings.max_concurrent_monitors,
            group_retention: settings.group_retention,
            retention_sweep_interval: settings.retention_sweep_interval,
            work_dir: settings.work_dir.clone(),
        }
    }
}

/// Result of one monitor round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Keep polling
    Waiting,
    Terminal(GroupStatus),
    /// Group no longer in the store
    Gone,
}

/// Follow-up work hanging off one job of another group.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainLink {
    pub source_group: GroupId,
    pub follow_up: Option<GroupId>,
    /// Why the follow-up could not be started
    pub error: Option<String>,
}

struct GroupRuntime {
    assembler: Arc<dyn Assembler>,
    cancel: CancellationToken,
}

pub struct Orchestrator {
    store: Arc<GroupStore>,
    directory: Arc<WorkerDirectory>,
    tracker: JobStatusTracker,
    storage: Option<Arc<dyn ObjectStorage>>,
    config: OrchestratorConfig,
    permits: Arc<Semaphore>,
    runtimes: Mutex<HashMap<GroupId, GroupRuntime>>,
    links: Mutex<HashMap<String, ChainLink>>,
    assembling: Mutex<HashSet<GroupId>>,
}

impl Orchestrator {
    pub fn new(
        directory: Arc<WorkerDirectory>,
        storage: Option<Arc<dyn ObjectStorage>>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store: Arc::new(GroupStore::new()),
            tracker: JobStatusTracker::new(directory.clone()),
            directory,
            storage,
            permits: Arc::new(Semaphore::new(config.max_concurrent_monitors.max(1))),
            config,
            runtimes: Mutex::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            assembling: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<GroupStore> {
        &self.store
    }

    pub fn directory(&self) -> &Arc<WorkerDirectory> {
        &self.directory
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Registers a new processing group. `group_id` is generated when absent.
    pub async fn create_group(&self, group_id: Option<GroupId>, assembler: Arc<dyn Assembler>) -> Result<GroupId> {
        let group_id = match group_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => Uuid::new_v4().to_string(),
        };
        let kind = assembler.kind();
        self.store
            .insert(TaskGroup::new(group_id.clone(), kind, self.config.group_timeout))
            .await?;
        self.runtimes.lock().await.insert(
            group_id.clone(),
            GroupRuntime {
                assembler,
                cancel: CancellationToken::new(),
            },
        );
        tracing::info!(group_id = %group_id, "🆕 Created {:?} group", kind);
        Ok(group_id)
    }

    pub async fn add_job(&self, group_id: &str, job: JobRecord) -> Result<()> {
        tracing::debug!(group_id = %group_id, job_id = %job.job_id, "Tracking job at index {}", job.segment_index);
        self.store.update_processing(group_id, |g| g.jobs.push(job)).await
    }

    pub async fn add_local_part(&self, group_id: &str, part: LocalPart) -> Result<()> {
        self.store.update_processing(group_id, |g| g.local_parts.push(part)).await
    }

    /// No more jobs will be added; assembly runs once the current ones finish.
    pub async fn seal(&self, group_id: &str) -> Result<()> {
        self.store.update_processing(group_id, |g| g.sealed = true).await
    }

    /// Marks a still-processing group failed. Returns false if it was already terminal.
    pub async fn fail_group(&self, group_id: &str, error: &str) -> bool {
        let failed = self
            .store
            .update_processing(group_id, |g| g.fail(error))
            .await
            .unwrap_or(false);
        if failed {
            tracing::error!(group_id = %group_id, "❌ Group failed: {}", error);
            self.release(group_id).await;
        }
        failed
    }

    pub async fn group_status(&self, group_id: &str) -> Result<GroupSnapshot> {
        self.store
            .snapshot(group_id)
            .await
            .ok_or_else(|| OrchestratorError::GroupNotFound(group_id.to_string()))
    }

    pub async fn list_groups(&self) -> Vec<GroupSnapshot> {
        self.store.list().await
    }

    /// Spawns the group's monitor. It waits for a capacity permit first; the
    /// timeout budget keeps running while it waits, and a group whose budget
    /// runs out in the queue is failed without ever taking a permit.
    pub async fn start_monitor(self: &Arc<Self>, group_id: &str) -> Result<JoinHandle<()>> {
        let cancel = self
            .runtimes
            .lock()
            .await
            .get(group_id)
            .map(|rt| rt.cancel.clone())
            .ok_or_else(|| OrchestratorError::GroupNotFound(group_id.to_string()))?;

        let this = Arc::clone(self);
        let group_id = group_id.to_string();
        Ok(tokio::spawn(async move {
            let permit = loop {
                let Some(remaining) = this.remaining_budget(&group_id).await else {
                    return;
                };
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    permit = this.permits.clone().acquire_owned() => break permit,
                    _ = tokio::time::sleep(remaining) => {
                        if let Some(outcome) = this.expire_if_timed_out(&group_id).await {
                            tracing::warn!(group_id = %group_id, "⏰ Monitor never got a slot: {:?}", outcome);
                            return;
                        }
                    }
                }
            };
            let Ok(_permit) = permit else {
                tracing::error!(group_id = %group_id, "Monitor capacity closed");
                return;
            };
            tracing::info!(group_id = %group_id, "🔄 Monitor started");

            loop {
                match this.tick(&group_id).await {
                    TickOutcome::Waiting => {}
                    TickOutcome::Terminal(status) => {
                        tracing::info!(group_id = %group_id, "🏁 Monitor finished: {:?}", status);
                        break;
                    }
                    TickOutcome::Gone => break,
                }
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!(group_id = %group_id, "🛑 Monitor stopped by cancel");
                        break;
                    }
                    _ = tokio::time::sleep(this.config.poll_interval) => {}
                }
            }
        }))
    }

    /// One monitor round: timeout check, job polling, then assembly when the
    /// group is sealed and every job is terminal.
    pub async fn tick(&self, group_id: &str) -> TickOutcome {
        let Some(group) = self.store.get(group_id).await else {
            return TickOutcome::Gone;
        };
        if group.is_terminal() {
            return TickOutcome::Terminal(group.status);
        }

        if let Some(outcome) = self.expire_if_timed_out(group_id).await {
            return outcome;
        }

        self.poll_jobs(&group).await;

        let Some(group) = self.store.get(group_id).await else {
            return TickOutcome::Gone;
        };
        if group.is_terminal() {
            return TickOutcome::Terminal(group.status);
        }

        let (done, total) = group.progress();
        tracing::info!(group_id = %group_id, "📊 Progress {}/{}", done, total);

        if group.sealed && group.all_jobs_terminal() {
            self.assemble(&group).await;
            return self.current(group_id).await;
        }
        TickOutcome::Waiting
    }

    /// Time left before the group's budget runs out; `None` once the group
    /// is terminal or gone.
    async fn remaining_budget(&self, group_id: &str) -> Option<Duration> {
        let group = self.store.get(group_id).await?;
        if group.is_terminal() {
            return None;
        }
        Some(group.timeout_budget.saturating_sub(group.elapsed(Utc::now())))
    }

    /// Fails the group if its budget is spent. `None` while it still has time.
    async fn expire_if_timed_out(&self, group_id: &str) -> Option<TickOutcome> {
        let Some(group) = self.store.get(group_id).await else {
            return Some(TickOutcome::Gone);
        };
        if group.is_terminal() {
            return Some(TickOutcome::Terminal(group.status));
        }
        if !group.is_timed_out(Utc::now()) {
            return None;
        }
        let error = OrchestratorError::GroupTimeout(group.timeout_budget.as_secs()).to_string();
        self.fail_group(group_id, &error).await;
        Some(self.current(group_id).await)
    }

    async fn current(&self, group_id: &str) -> TickOutcome {
        match self.store.get(group_id).await {
            Some(g) if g.is_terminal() => TickOutcome::Terminal(g.status),
            Some(_) => TickOutcome::Waiting,
            None => TickOutcome::Gone,
        }
    }

    async fn poll_jobs(&self, group: &TaskGroup) {
        let pending: Vec<&JobRecord> = group.jobs.iter().filter(|j| !j.status.is_terminal()).collect();
        if pending.is_empty() {
            return;
        }

        let polls = pending.iter().map(|job| async move {
            let outcome = self
                .tracker
                .poll(&job.job_id, job.owning_worker.as_ref(), job.final_stage.as_deref())
                .await;
            (job.job_id.clone(), outcome)
        });
        let outcomes: Vec<(String, PollOutcome)> = futures::future::join_all(polls).await;

        let group_id = group.group_id.clone();
        let applied = self
            .store
            .update_processing(&group_id, |g| {
                for (job_id, outcome) in outcomes {
                    if let Some(job) = g.jobs.iter_mut().find(|j| j.job_id == job_id) {
                        apply_outcome(&group_id, job, outcome);
                    }
                }
            })
            .await;
        if let Err(e) = applied {
            tracing::debug!(group_id = %group_id, "Skipped job updates: {}", e);
        }
    }

    /// Runs the assembler at most once at a time per group; a concurrent
    /// tick (monitor plus an explicit caller) leaves the group to the first.
    async fn assemble(&self, group: &TaskGroup) {
        let group_id = group.group_id.as_str();
        if !self.assembling.lock().await.insert(group_id.to_string()) {
            tracing::debug!(group_id = %group_id, "Assembly already running");
            return;
        }
        self.run_assembly(group).await;
        self.assembling.lock().await.remove(group_id);
    }

    async fn run_assembly(&self, group: &TaskGroup) {
        let group_id = group.group_id.as_str();
        let succeeded: Vec<&JobRecord> = group
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Succeeded && j.result_artifact.is_some())
            .collect();

        if succeeded.is_empty() {
            let error = if group.jobs.is_empty() {
                "no jobs were submitted".to_string()
            } else {
                format!("all {} jobs failed", group.jobs.len())
            };
            self.fail_group(group_id, &error).await;
            return;
        }

        let mut parts: Vec<AssemblyPart> = succeeded
            .iter()
            .filter_map(|job| {
                job.result_artifact.as_ref().map(|artifact| AssemblyPart {
                    index: job.segment_index,
                    source: PartSource::Remote {
                        job_id: job.job_id.clone(),
                        worker: job.owning_worker.clone(),
                        artifact: artifact.clone(),
                    },
                })
            })
            .collect();
        parts.extend(group.local_parts.iter().map(|p| AssemblyPart {
            index: p.index,
            source: PartSource::Local(p.path.clone()),
        }));

        let assembler = self.runtimes.lock().await.get(group_id).map(|rt| rt.assembler.clone());
        let Some(assembler) = assembler else {
            self.fail_group(group_id, "no assembler registered for group").await;
            return;
        };

        tracing::info!(
            group_id = %group_id,
            "🧩 Assembling {} parts ({} of {} jobs succeeded)",
            parts.len(),
            succeeded.len(),
            group.jobs.len()
        );

        let ctx = AssemblyContext {
            group_id: group_id.to_string(),
            directory: self.directory.clone(),
            storage: self.storage.clone(),
            work_dir: self.config.work_dir.join(group_id),
        };
        let result = match order_parts(parts) {
            Ok(parts) => assembler.assemble(&ctx, parts).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(artifact) if !artifact.trim().is_empty() => {
                let completed = self
                    .store
                    .update_processing(group_id, |g| g.complete(artifact.clone()))
                    .await
                    .unwrap_or(false);
                if completed {
                    tracing::info!(group_id = %group_id, "✅ Group completed: {}", artifact);
                    self.release(group_id).await;
                }
            }
            Ok(_) => {
                let error = OrchestratorError::AssemblyFailed("no artifact produced".to_string()).to_string();
                self.fail_group(group_id, &error).await;
            }
            Err(e) => {
                let error = if matches!(e, OrchestratorError::AssemblyFailed(_)) {
                    e.to_string()
                } else {
                    OrchestratorError::AssemblyFailed(e.to_string()).to_string()
                };
                self.fail_group(group_id, &error).await;
            }
        }
    }

    /// Fails the group and its open jobs with `"cancelled"`, stops the monitor
    /// and asks the owning workers to drop those jobs.
    pub async fn cancel_group(&self, group_id: &str) -> Result<()> {
        let open_jobs = self
            .store
            .update_processing(group_id, |g| {
                let open: Vec<JobRecord> = g.jobs.iter().filter(|j| !j.status.is_terminal()).cloned().collect();
                let now = Utc::now();
                for job in g.jobs.iter_mut().filter(|j| !j.status.is_terminal()) {
                    job.status = JobStatus::Failed;
                    job.error = Some(CANCELLED.to_string());
                    job.updated_at = now;
                }
                g.fail(CANCELLED);
                open
            })
            .await?;
        tracing::warn!(group_id = %group_id, "🛑 Group cancelled with {} open jobs", open_jobs.len());
        self.release(group_id).await;

        let api = self.directory.api();
        for job in open_jobs {
            let worker = match &job.owning_worker {
                Some(worker) => worker.clone(),
                None => self.directory.active().await,
            };
            if let Err(e) = api.cancel(&worker, &job.job_id).await {
                tracing::warn!(job_id = %job.job_id, "Failed to cancel on {}: {}", worker, e);
            }
        }
        Ok(())
    }

    /// Records that the output of `job_id` feeds a follow-up group that does
    /// not exist yet. The job must already belong to a group.
    pub async fn link_job(&self, job_id: &str) -> Result<()> {
        let source_group = self
            .store
            .find_by_job(job_id)
            .await
            .ok_or_else(|| OrchestratorError::InvalidRequest(format!("job {} belongs to no group", job_id)))?;
        tracing::debug!(group_id = %source_group, job_id = %job_id, "🔗 Linked job to a follow-up");
        self.links.lock().await.insert(
            job_id.to_string(),
            ChainLink {
                source_group,
                follow_up: None,
                error: None,
            },
        );
        Ok(())
    }

    /// Settles a link once its follow-up was started (or could not be).
    pub async fn resolve_link(&self, job_id: &str, follow_up: std::result::Result<GroupId, String>) -> Result<()> {
        let mut links = self.links.lock().await;
        let link = links
            .get_mut(job_id)
            .ok_or_else(|| OrchestratorError::InvalidRequest(format!("job {} has no follow-up link", job_id)))?;
        match follow_up {
            Ok(group_id) => {
                tracing::info!(group_id = %link.source_group, job_id = %job_id, "🔗 Follow-up group {} started", group_id);
                link.follow_up = Some(group_id);
                link.error = None;
            }
            Err(error) => {
                tracing::error!(group_id = %link.source_group, job_id = %job_id, "❌ Follow-up not started: {}", error);
                link.error = Some(error);
            }
        }
        Ok(())
    }

    pub async fn chain_link(&self, job_id: &str) -> Option<ChainLink> {
        self.links.lock().await.get(job_id).cloned()
    }

    /// Follow-up group started from any job of `group_id`.
    pub async fn follow_up_of(&self, group_id: &str) -> Option<GroupId> {
        self.links
            .lock()
            .await
            .values()
            .filter(|link| link.source_group == group_id)
            .find_map(|link| link.follow_up.clone())
    }

    /// Fires the cancel token and forgets the assembler of a terminal group.
    async fn release(&self, group_id: &str) {
        if let Some(runtime) = self.runtimes.lock().await.remove(group_id) {
            runtime.cancel.cancel();
        }
    }

    /// Evicts terminal groups past retention, with their scratch directories.
    pub async fn sweep_expired(&self) -> Vec<GroupId> {
        let evicted = self
            .store
            .evict_expired(self.config.group_retention, Utc::now())
            .await;
        if !evicted.is_empty() {
            self.links
                .lock()
                .await
                .retain(|_, link| !evicted.contains(&link.source_group));
        }
        for group_id in &evicted {
            self.release(group_id).await;
            let dir = self.config.work_dir.join(group_id);
            if tokio::fs::metadata(&dir).await.is_ok() {
                if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                    tracing::warn!(group_id = %group_id, "Failed to remove {}: {}", dir.display(), e);
                }
            }
        }
        if !evicted.is_empty() {
            tracing::info!("🗑️ Evicted {} expired groups", evicted.len());
        }
        evicted
    }

    pub fn spawn_retention_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(this.config.retention_sweep_interval).await;
                this.sweep_expired().await;
            }
        })
    }
}

fn apply_outcome(group_id: &str, job: &mut JobRecord, outcome: PollOutcome) {
    if job.status.is_terminal() {
        return;
    }
    match outcome {
        PollOutcome::Terminal { worker, result } => {
            if let Some(worker) = worker {
                job.owning_worker = Some(worker);
            }
            match result {
                TerminalResult::Succeeded(artifact) => {
                    tracing::info!(group_id = %group_id, job_id = %job.job_id, "✅ Job succeeded: {}", artifact.filename);
                    job.status = JobStatus::Succeeded;
                    job.result_artifact = Some(artifact);
                }
                TerminalResult::Failed(reason) => {
                    let error = OrchestratorError::JobFailed {
                        job_id: job.job_id.clone(),
                        reason,
                    };
                    tracing::warn!(group_id = %group_id, job_id = %job.job_id, "❌ {}", error);
                    job.status = JobStatus::Failed;
                    job.error = Some(error.to_string());
                }
            }
        }
        PollOutcome::InFlight { worker, running } => {
            if job.owning_worker.is_none() {
                job.owning_worker = Some(worker);
            }
            job.status = if running { JobStatus::Running } else { JobStatus::Pending };
        }
        PollOutcome::TransientError(reason) => {
            tracing::debug!(group_id = %group_id, job_id = %job.job_id, "⏳ Transient poll error, waiting: {}", reason);
            return;
        }
    }
    job.updated_at = Utc::now();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::model::GroupKind;
    use crate::worker::testing::FakeWorker;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct RecordingAssembler {
        parts: StdMutex<Vec<AssemblyPart>>,
        fail_with: Option<String>,
    }

    impl RecordingAssembler {
        fn ok() -> Arc<Self> {
            Arc::new(Self { parts: StdMutex::new(Vec::new()), fail_with: None })
        }

        fn failing(message: &str) -> Arc<Self> {
            Arc::new(Self { parts: StdMutex::new(Vec::new()), fail_with: Some(message.to_string()) })
        }

        fn job_order(&self) -> Vec<String> {
            self.parts
                .lock()
                .unwrap()
                .iter()
                .map(|p| match &p.source {
                    PartSource::Remote { job_id, .. } => job_id.clone(),
                    PartSource::Local(path) => path.to_string_lossy().to_string(),
                })
                .collect()
        }
    }

    #[async_trait]
    impl Assembler for RecordingAssembler {
        fn kind(&self) -> GroupKind {
            GroupKind::Segment
        }

        async fn assemble(&self, ctx: &AssemblyContext, parts: Vec<AssemblyPart>) -> Result<String> {
            *self.parts.lock().unwrap() = parts;
            match &self.fail_with {
                Some(message) => Err(OrchestratorError::Storage(message.clone())),
                None => Ok(format!("{}.mp4", ctx.group_id)),
            }
        }
    }

    fn orchestrator(fake: &Arc<FakeWorker>, hosts: &[&str], max_monitors: usize) -> Arc<Orchestrator> {
        let hosts: Vec<String> = hosts.iter().map(|h| h.to_string()).collect();
        let directory = Arc::new(WorkerDirectory::new(fake.clone(), &hosts, Duration::from_secs(5)).unwrap());
        Arc::new(Orchestrator::new(
            directory,
            None,
            OrchestratorConfig {
                poll_interval: Duration::from_secs(15),
                group_timeout: Duration::from_secs(3600),
                max_concurrent_monitors: max_monitors,
                group_retention: Duration::from_secs(60),
                retention_sweep_interval: Duration::from_secs(30),
                work_dir: std::env::temp_dir().join("orchestrator-tests"),
            },
        ))
    }

    async fn group_with_jobs(orch: &Orchestrator, assembler: Arc<dyn Assembler>, jobs: &[&str]) -> GroupId {
        let id = orch.create_group(None, assembler).await.unwrap();
        for (index, job) in jobs.iter().enumerate() {
            orch.add_job(&id, JobRecord::new(job.to_string(), Some(crate::worker::WorkerEndpoint::new("gpu-a:1")), index))
                .await
                .unwrap();
        }
        orch.seal(&id).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_partial_failure_assembles_survivors_in_order() {
        let fake = Arc::new(FakeWorker::new());
        let orch = orchestrator(&fake, &["gpu-a:1"], 4);
        let assembler = RecordingAssembler::ok();
        let id = group_with_jobs(&orch, assembler.clone(), &["job-1", "job-2", "job-3"]).await;

        fake.complete_with_video("gpu-a:1", "job-3", "243", "c.mp4");
        fake.fail_job("gpu-a:1", "job-2", "CUDA out of memory");
        fake.set_queue("gpu-a:1", &["job-1"], &[]);
        assert_eq!(orch.tick(&id).await, TickOutcome::Waiting);
        let snap = orch.group_status(&id).await.unwrap();
        assert_eq!((snap.completed, snap.total), (2, 3));
        assert_eq!(snap.jobs[0].status, JobStatus::Running);
        assert!(snap.jobs[1].error.as_deref().unwrap().contains("CUDA out of memory"));

        fake.set_queue("gpu-a:1", &[], &[]);
        fake.complete_with_video("gpu-a:1", "job-1", "243", "a.mp4");
        assert_eq!(orch.tick(&id).await, TickOutcome::Terminal(GroupStatus::Completed));

        assert_eq!(assembler.job_order(), vec!["job-1", "job-3"]);
        let snap = orch.group_status(&id).await.unwrap();
        assert_eq!(snap.final_artifact, Some(format!("{}.mp4", id)));
        assert_eq!(snap.jobs[1].status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_all_jobs_failed_fails_group_without_assembly() {
        let fake = Arc::new(FakeWorker::new());
        let orch = orchestrator(&fake, &["gpu-a:1"], 4);
        let assembler = RecordingAssembler::ok();
        let id = group_with_jobs(&orch, assembler.clone(), &["job-1", "job-2"]).await;
        fake.fail_job("gpu-a:1", "job-1", "bad");
        fake.fail_job("gpu-a:1", "job-2", "bad");

        assert_eq!(orch.tick(&id).await, TickOutcome::Terminal(GroupStatus::Failed));
        let snap = orch.group_status(&id).await.unwrap();
        assert_eq!(snap.error.as_deref(), Some("all 2 jobs failed"));
        assert!(assembler.job_order().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_fails_group_even_with_pending_jobs() {
        let fake = Arc::new(FakeWorker::new());
        let orch = orchestrator(&fake, &["gpu-a:1"], 4);
        let id = group_with_jobs(&orch, RecordingAssembler::ok(), &["job-1"]).await;
        fake.set_queue("gpu-a:1", &[], &["job-1"]);
        orch.store()
            .update_processing(&id, |g| g.created_at = Utc::now() - chrono::Duration::seconds(3601))
            .await
            .unwrap();

        assert_eq!(orch.tick(&id).await, TickOutcome::Terminal(GroupStatus::Failed));
        let snap = orch.group_status(&id).await.unwrap();
        assert!(snap.error.unwrap().contains("timed out"));
        assert_eq!(fake.history_calls(), 0);
    }

    #[tokio::test]
    async fn test_network_errors_keep_group_waiting() {
        let fake = Arc::new(FakeWorker::new());
        let orch = orchestrator(&fake, &["gpu-a:1"], 4);
        let id = group_with_jobs(&orch, RecordingAssembler::ok(), &["job-1"]).await;
        fake.set_down("gpu-a:1", true);

        for _ in 0..3 {
            assert_eq!(orch.tick(&id).await, TickOutcome::Waiting);
        }
        let snap = orch.group_status(&id).await.unwrap();
        assert_eq!(snap.status, GroupStatus::Processing);
        assert_eq!(snap.jobs[0].status, JobStatus::Pending);
        assert!(snap.jobs[0].error.is_none());
    }

    #[tokio::test]
    async fn test_assembly_failure_fails_group() {
        let fake = Arc::new(FakeWorker::new());
        let orch = orchestrator(&fake, &["gpu-a:1"], 4);
        let id = group_with_jobs(&orch, RecordingAssembler::failing("bucket said 403"), &["job-1"]).await;
        fake.complete_with_video("gpu-a:1", "job-1", "243", "a.mp4");

        assert_eq!(orch.tick(&id).await, TickOutcome::Terminal(GroupStatus::Failed));
        let error = orch.group_status(&id).await.unwrap().error.unwrap();
        assert!(error.starts_with("Assembly failed"));
        assert!(error.contains("bucket said 403"));
    }

    #[tokio::test]
    async fn test_unsealed_group_waits_for_more_jobs() {
        let fake = Arc::new(FakeWorker::new());
        let orch = orchestrator(&fake, &["gpu-a:1"], 4);
        let assembler = RecordingAssembler::ok();
        let id = orch.create_group(Some("transitions".into()), assembler.clone()).await.unwrap();
        assert_eq!(id, "transitions");
        orch.add_job(&id, JobRecord::new("job-1".into(), None, 1)).await.unwrap();
        orch.add_local_part(&id, LocalPart { index: 0, path: PathBuf::from("anchor0.mp4") }).await.unwrap();
        orch.add_local_part(&id, LocalPart { index: 2, path: PathBuf::from("anchor1.mp4") }).await.unwrap();
        fake.complete_with_video("gpu-a:1", "job-1", "243", "t.mp4");

        assert_eq!(orch.tick(&id).await, TickOutcome::Waiting);
        assert!(assembler.job_order().is_empty());

        orch.seal(&id).await.unwrap();
        assert_eq!(orch.tick(&id).await, TickOutcome::Terminal(GroupStatus::Completed));
        assert_eq!(assembler.job_order(), vec!["anchor0.mp4", "job-1", "anchor1.mp4"]);
    }

    #[tokio::test]
    async fn test_cancel_marks_failed_and_cancels_open_jobs() {
        let fake = Arc::new(FakeWorker::new());
        let orch = orchestrator(&fake, &["gpu-a:1"], 4);
        let id = group_with_jobs(&orch, RecordingAssembler::ok(), &["job-1", "job-2"]).await;
        fake.complete_with_video("gpu-a:1", "job-1", "243", "a.mp4");
        fake.set_queue("gpu-a:1", &["job-2"], &[]);
        orch.tick(&id).await;

        orch.cancel_group(&id).await.unwrap();
        let snap = orch.group_status(&id).await.unwrap();
        assert_eq!(snap.status, GroupStatus::Failed);
        assert_eq!(snap.error.as_deref(), Some(CANCELLED));
        assert_eq!(fake.cancelled(), vec![("gpu-a:1".to_string(), "job-2".to_string())]);
        assert_eq!(snap.jobs[0].status, JobStatus::Succeeded);
        assert_eq!(snap.jobs[1].status, JobStatus::Failed);
        assert_eq!(snap.jobs[1].error.as_deref(), Some(CANCELLED));

        assert!(orch.cancel_group(&id).await.is_err());
        assert_eq!(orch.tick(&id).await, TickOutcome::Terminal(GroupStatus::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitors_run_to_completion_under_capacity_limit() {
        let fake = Arc::new(FakeWorker::new());
        let orch = orchestrator(&fake, &["gpu-a:1"], 1);
        let first = group_with_jobs(&orch, RecordingAssembler::ok(), &["job-1"]).await;
        let second = orch.create_group(None, RecordingAssembler::ok()).await.unwrap();
        orch.add_job(&second, JobRecord::new("job-2".into(), None, 0)).await.unwrap();
        orch.seal(&second).await.unwrap();

        fake.set_queue("gpu-a:1", &["job-1"], &["job-2"]);
        let h1 = orch.start_monitor(&first).await.unwrap();
        let h2 = orch.start_monitor(&second).await.unwrap();

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(orch.group_status(&second).await.unwrap().jobs[0].status, JobStatus::Pending);

        fake.set_queue("gpu-a:1", &[], &[]);
        fake.complete_with_video("gpu-a:1", "job-1", "243", "a.mp4");
        fake.complete_with_video("gpu-a:1", "job-2", "243", "b.mp4");
        h1.await.unwrap();
        h2.await.unwrap();

        for id in [&first, &second] {
            assert_eq!(orch.group_status(id).await.unwrap().status, GroupStatus::Completed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_running_monitor() {
        let fake = Arc::new(FakeWorker::new());
        let orch = orchestrator(&fake, &["gpu-a:1"], 2);
        let id = group_with_jobs(&orch, RecordingAssembler::ok(), &["job-1"]).await;
        fake.set_queue("gpu-a:1", &["job-1"], &[]);
        let handle = orch.start_monitor(&id).await.unwrap();

        tokio::time::sleep(Duration::from_secs(40)).await;
        orch.cancel_group(&id).await.unwrap();
        handle.await.unwrap();
        assert_eq!(orch.group_status(&id).await.unwrap().error.as_deref(), Some(CANCELLED));
    }

    #[tokio::test]
    async fn test_sweep_evicts_only_expired_terminal_groups() {
        let fake = Arc::new(FakeWorker::new());
        let orch = orchestrator(&fake, &["gpu-a:1"], 2);
        let done = group_with_jobs(&orch, RecordingAssembler::ok(), &["job-1"]).await;
        orch.fail_group(&done, "boom").await;

        // still inside the 60s retention window
        assert!(orch.sweep_expired().await.is_empty());
        assert!(orch.group_status(&done).await.is_ok());
    }

    #[tokio::test]
    async fn test_sweep_removes_group_and_scratch_dir() {
        let fake = Arc::new(FakeWorker::new());
        let hosts = vec!["gpu-a:1".to_string()];
        let directory = Arc::new(WorkerDirectory::new(fake.clone(), &hosts, Duration::from_secs(5)).unwrap());
        let work_dir = std::env::temp_dir().join(format!("sweep-{}", Uuid::new_v4()));
        let orch = Arc::new(Orchestrator::new(
            directory,
            None,
            OrchestratorConfig {
                poll_interval: Duration::from_secs(15),
                group_timeout: Duration::from_secs(3600),
                max_concurrent_monitors: 2,
                group_retention: Duration::ZERO,
                retention_sweep_interval: Duration::from_secs(30),
                work_dir: work_dir.clone(),
            },
        ));
        let done = group_with_jobs(&orch, RecordingAssembler::ok(), &["job-1"]).await;
        let live = group_with_jobs(&orch, RecordingAssembler::ok(), &["job-2"]).await;
        orch.link_job("job-1").await.unwrap();
        let scratch = work_dir.join(&done);
        tokio::fs::create_dir_all(&scratch).await.unwrap();
        tokio::fs::write(scratch.join("part_000_a.mp4"), b"a").await.unwrap();
        orch.fail_group(&done, "boom").await;

        assert_eq!(orch.sweep_expired().await, vec![done.clone()]);
        assert!(tokio::fs::metadata(&scratch).await.is_err());
        assert!(matches!(orch.group_status(&done).await, Err(OrchestratorError::GroupNotFound(_))));
        assert!(orch.chain_link("job-1").await.is_none());
        assert_eq!(orch.group_status(&live).await.unwrap().status, GroupStatus::Processing);
        assert_eq!(orch.tick(&done).await, TickOutcome::Gone);

        tokio::fs::remove_dir_all(&work_dir).await.ok();
    }

    #[tokio::test]
    async fn test_queued_monitor_still_enforces_timeout() {
        let fake = Arc::new(FakeWorker::new());
        let orch = orchestrator(&fake, &["gpu-a:1"], 1);
        let stale = group_with_jobs(&orch, RecordingAssembler::ok(), &["job-1"]).await;
        fake.set_queue("gpu-a:1", &[], &["job-1"]);
        orch.store()
            .update_processing(&stale, |g| g.created_at = Utc::now() - chrono::Duration::hours(2))
            .await
            .unwrap();

        // every monitor slot is taken
        let _slot = orch.permits.clone().acquire_owned().await.unwrap();
        let handle = orch.start_monitor(&stale).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

        let snap = orch.group_status(&stale).await.unwrap();
        assert_eq!(snap.status, GroupStatus::Failed);
        assert!(snap.error.unwrap().starts_with("Group timed out"));
        assert_eq!(fake.history_calls(), 0);
    }

    #[tokio::test]
    async fn test_chain_links_follow_their_source_job() {
        let fake = Arc::new(FakeWorker::new());
        let orch = orchestrator(&fake, &["gpu-a:1"], 2);
        let speech = group_with_jobs(&orch, RecordingAssembler::ok(), &["job-1"]).await;

        assert!(orch.link_job("job-404").await.is_err());
        assert!(orch.resolve_link("job-404", Ok("x".into())).await.is_err());

        orch.link_job("job-1").await.unwrap();
        let link = orch.chain_link("job-1").await.unwrap();
        assert_eq!(link.source_group, speech);
        assert!(link.follow_up.is_none());
        assert!(orch.follow_up_of(&speech).await.is_none());

        orch.resolve_link("job-1", Err("worker unreachable".into())).await.unwrap();
        assert_eq!(orch.chain_link("job-1").await.unwrap().error.as_deref(), Some("worker unreachable"));

        orch.resolve_link("job-1", Ok("video-group".into())).await.unwrap();
        let link = orch.chain_link("job-1").await.unwrap();
        assert_eq!(link.follow_up.as_deref(), Some("video-group"));
        assert!(link.error.is_none());
        assert_eq!(orch.follow_up_of(&speech).await.as_deref(), Some("video-group"));
    }
}
