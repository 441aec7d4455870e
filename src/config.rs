// src/config.rs
//! Environment-driven settings. Call `dotenvy::dotenv()` before `Settings::from_env()`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Worker fleet used when `WORKER_ENDPOINTS` is not set
pub const DEFAULT_WORKERS: &[&str] = &[
    "192.168.0.209:7860",
    "192.168.0.210:7860",
    "192.168.50.210:7860",
];

#[derive(Debug, Clone)]
pub struct Settings {
    pub worker_endpoints: Vec<String>,
    pub probe_timeout: Duration,
    pub poll_interval: Duration,
    pub group_timeout: Duration,
    pub max_concurrent_monitors: usize,
    pub group_retention: Duration,
    pub retention_sweep_interval: Duration,
    pub template_dir: PathBuf,
    pub work_dir: PathBuf,
    pub storage_base_url: Option<String>,
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
    pub segment_seconds: f64,
    /// Audio window length for avatar jobs
    pub avatar_segment_seconds: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            worker_endpoints: DEFAULT_WORKERS.iter().map(|s| s.to_string()).collect(),
            probe_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(15),
            group_timeout: Duration::from_secs(6 * 60 * 60),
            max_concurrent_monitors: 32,
            group_retention: Duration::from_secs(24 * 60 * 60),
            retention_sweep_interval: Duration::from_secs(600),
            template_dir: PathBuf::from("templates"),
            work_dir: PathBuf::from("tmp"),
            storage_base_url: None,
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
            segment_seconds: 5.0,
            avatar_segment_seconds: 10.0,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup so tests don't touch the process env.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Settings::default();

        let mut worker_endpoints = match lookup("WORKER_ENDPOINTS") {
            Some(raw) => parse_list(&raw),
            None => defaults.worker_endpoints.clone(),
        };
        if let Some(pinned) = lookup("WORKER_ENDPOINT").filter(|s| !s.trim().is_empty()) {
            let pinned = pinned.trim().to_string();
            worker_endpoints.retain(|e| e != &pinned);
            worker_endpoints.insert(0, pinned);
        }
        if worker_endpoints.is_empty() {
            tracing::warn!("WORKER_ENDPOINTS is empty, falling back to default worker list");
            worker_endpoints = defaults.worker_endpoints.clone();
        }

        Self {
            worker_endpoints,
            probe_timeout: secs(&lookup, "PROBE_TIMEOUT_SECS", defaults.probe_timeout),
            poll_interval: secs(&lookup, "POLL_INTERVAL_SECS", defaults.poll_interval),
            group_timeout: secs(&lookup, "GROUP_TIMEOUT_SECS", defaults.group_timeout),
            max_concurrent_monitors: parsed(&lookup, "MAX_CONCURRENT_MONITORS", defaults.max_concurrent_monitors).max(1),
            group_retention: secs(&lookup, "GROUP_RETENTION_SECS", defaults.group_retention),
            retention_sweep_interval: secs(&lookup, "RETENTION_SWEEP_SECS", defaults.retention_sweep_interval),
            template_dir: lookup("TEMPLATE_DIR").map(PathBuf::from).unwrap_or(defaults.template_dir),
            work_dir: lookup("WORK_DIR").map(PathBuf::from).unwrap_or(defaults.work_dir),
            storage_base_url: lookup("STORAGE_BASE_URL")
                .map(|s| s.trim().trim_end_matches('/').to_string())
                .filter(|s| !s.is_empty()),
            ffmpeg_bin: lookup("FFMPEG_BIN").unwrap_or(defaults.ffmpeg_bin),
            ffprobe_bin: lookup("FFPROBE_BIN").unwrap_or(defaults.ffprobe_bin),
            segment_seconds: parsed(&lookup, "SEGMENT_SECONDS", defaults.segment_seconds),
            avatar_segment_seconds: parsed(&lookup, "AVATAR_SEGMENT_SECONDS", defaults.avatar_segment_seconds),
        }
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn parsed<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + std::fmt::Debug,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("Invalid value '{}' for {}, using default {:?}", raw, key, default);
                default
            }
        },
        None => default,
    }
}

fn secs<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    Duration::from_secs(parsed(lookup, key, default.as_secs()))
}
