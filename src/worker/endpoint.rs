// src/worker/endpoint.rs
use serde::{Deserialize, Serialize};
use std::fmt;

/// A worker node address, always stored as `http://host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerEndpoint(String);

impl WorkerEndpoint {
    /// Normalizes `host:port`, `http://host:port/` or `https://host:port` to `http://host:port`.
    /// The worker fleet only speaks plain HTTP.
    pub fn new(address: &str) -> Self {
        let trimmed = address.trim();
        let without_scheme = trimmed
            .strip_prefix("https://")
            .or_else(|| trimmed.strip_prefix("http://"))
            .unwrap_or(trimmed);
        WorkerEndpoint(format!("http://{}", without_scheme.trim_end_matches('/')))
    }

    pub fn base_url(&self) -> &str {
        &self.0
    }

    /// `host:port` without scheme
    pub fn host(&self) -> &str {
        self.0.trim_start_matches("http://")
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.0, path.trim_start_matches('/'))
    }
}

impl fmt::Display for WorkerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.host())
    }
}
