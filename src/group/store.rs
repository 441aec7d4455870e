// src/group/store.rs
//! Shared group map. Every concurrently running monitor goes through these
//! locked accessors; nothing else holds group state.

use super::model::{GroupId, GroupSnapshot, TaskGroup};
use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct GroupStore {
    groups: RwLock<HashMap<GroupId, TaskGroup>>,
}

impl GroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, group: TaskGroup) -> Result<()> {
        let mut groups = self.groups.write().await;
        if groups.contains_key(&group.group_id) {
            return Err(OrchestratorError::InvalidRequest(format!(
                "group {} already exists",
                group.group_id
            )));
        }
        tracing::debug!("📦 Stored group {}", group.group_id);
        groups.insert(group.group_id.clone(), group);
        Ok(())
    }

    pub async fn get(&self, group_id: &str) -> Option<TaskGroup> {
        self.groups.read().await.get(group_id).cloned()
    }

    pub async fn snapshot(&self, group_id: &str) -> Option<GroupSnapshot> {
        self.groups.read().await.get(group_id).map(|g| g.snapshot())
    }

    pub async fn list(&self) -> Vec<GroupSnapshot> {
        let groups = self.groups.read().await;
        let mut snapshots: Vec<GroupSnapshot> = groups.values().map(|g| g.snapshot()).collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        snapshots
    }

    /// Runs `f` against a group that is still processing. Terminal groups are
    /// frozen and yield `InvalidRequest`.
    pub async fn update_processing<F, R>(&self, group_id: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut TaskGroup) -> R,
    {
        let mut groups = self.groups.write().await;
        let group = groups
            .get_mut(group_id)
            .ok_or_else(|| OrchestratorError::GroupNotFound(group_id.to_string()))?;
        if group.is_terminal() {
            return Err(OrchestratorError::InvalidRequest(format!(
                "group {} is already {:?}",
                group_id, group.status
            )));
        }
        Ok(f(group))
    }

    pub async fn find_by_job(&self, job_id: &str) -> Option<GroupId> {
        self.groups
            .read()
            .await
            .values()
            .find(|g| g.jobs.iter().any(|j| j.job_id == job_id))
            .map(|g| g.group_id.clone())
    }

    /// Drops terminal groups that have been terminal for at least `retention`.
    pub async fn evict_expired(&self, retention: Duration, now: DateTime<Utc>) -> Vec<GroupId> {
        let mut groups = self.groups.write().await;
        let expired: Vec<GroupId> = groups
            .values()
            .filter(|g| {
                g.finished_at
                    .map(|finished| (now - finished).to_std().unwrap_or(Duration::ZERO) >= retention)
                    .unwrap_or(false)
            })
            .map(|g| g.group_id.clone())
            .collect();

        for group_id in &expired {
            groups.remove(group_id);
            tracing::debug!("🗑️ Evicted group {}", group_id);
        }
        expired
    }

    pub async fn len(&self) -> usize {
        self.groups.read().await.len()
    }
}
