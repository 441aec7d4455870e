// src/worker/directory.rs
//! Worker directory: holds the candidate fleet, probes it concurrently and
//! keeps the process-wide active endpoint. Failover is reactive: callers run
//! `check_connection` before remote work instead of a background schedule.

use super::{WorkerApi, WorkerEndpoint};
use crate::error::{OrchestratorError, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Result of a probe round. `error` is set when no candidate answered and the
/// endpoint is only the best-effort default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSelection {
    pub endpoint: WorkerEndpoint,
    pub error: Option<String>,
}

impl WorkerSelection {
    pub fn is_reachable(&self) -> bool {
        self.error.is_none()
    }
}

pub struct WorkerDirectory {
    api: Arc<dyn WorkerApi>,
    candidates: Vec<WorkerEndpoint>,
    active: RwLock<WorkerEndpoint>,
    degraded: AtomicBool,
    probe_timeout: Duration,
}

impl WorkerDirectory {
    pub fn new(api: Arc<dyn WorkerApi>, addresses: &[String], probe_timeout: Duration) -> Result<Self> {
        let candidates: Vec<WorkerEndpoint> = addresses.iter().map(|a| WorkerEndpoint::new(a)).collect();
        let first = candidates
            .first()
            .cloned()
            .ok_or_else(|| OrchestratorError::InvalidRequest("worker directory needs at least one endpoint".to_string()))?;

        Ok(Self {
            api,
            candidates,
            active: RwLock::new(first),
            degraded: AtomicBool::new(false),
            probe_timeout,
        })
    }

    pub fn api(&self) -> Arc<dyn WorkerApi> {
        self.api.clone()
    }

    pub fn candidates(&self) -> &[WorkerEndpoint] {
        &self.candidates
    }

    /// Currently selected endpoint; may be stale by the time it is used.
    pub async fn active(&self) -> WorkerEndpoint {
        self.active.read().await.clone()
    }

    /// True after a probe round in which no candidate answered.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Probes every candidate concurrently; the first to answer wins
    /// (completion order, not list order). Falls back to the first candidate.
    pub async fn select_worker(&self) -> WorkerSelection {
        tracing::info!("🔍 Probing {} worker candidates", self.candidates.len());

        let mut probes: FuturesUnordered<_> = self
            .candidates
            .iter()
            .map(|endpoint| {
                let api = self.api.clone();
                let endpoint = endpoint.clone();
                let timeout = self.probe_timeout;
                async move {
                    let outcome = match tokio::time::timeout(timeout, api.probe(&endpoint, timeout)).await {
                        Ok(result) => result,
                        Err(_) => Err(OrchestratorError::NetworkUnavailable(format!(
                            "probe timed out after {:?}",
                            timeout
                        ))),
                    };
                    (endpoint, outcome)
                }
            })
            .collect();

        let mut failures = Vec::new();
        while let Some((endpoint, outcome)) = probes.next().await {
            match outcome {
                Ok(()) => {
                    tracing::info!("✅ Selected worker {}", endpoint);
                    *self.active.write().await = endpoint.clone();
                    self.degraded.store(false, Ordering::Relaxed);
                    return WorkerSelection { endpoint, error: None };
                }
                Err(e) => {
                    tracing::debug!("Worker {} unreachable: {}", endpoint, e);
                    failures.push(format!("{}: {}", endpoint, e));
                }
            }
        }

        let fallback = self.candidates[0].clone();
        tracing::warn!("⚠️ No worker answered the probe, defaulting to {}", fallback);
        *self.active.write().await = fallback.clone();
        self.degraded.store(true, Ordering::Relaxed);
        WorkerSelection {
            endpoint: fallback,
            error: Some(format!("no worker reachable ({})", failures.join("; "))),
        }
    }

    /// Re-checks the active endpoint and fails over when it stopped answering.
    pub async fn check_connection(&self) -> WorkerSelection {
        let current = self.active().await;
        match tokio::time::timeout(self.probe_timeout, self.api.probe(&current, self.probe_timeout)).await {
            Ok(Ok(())) => {
                self.degraded.store(false, Ordering::Relaxed);
                WorkerSelection { endpoint: current, error: None }
            }
            _ => {
                tracing::info!("Connection to {} failed, attempting to switch worker...", current);
                self.select_worker().await
            }
        }
    }
}
