// src/media.rs
// Transcoding collaborator: wraps the ffmpeg / ffprobe executables.

use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaInfo {
    pub duration_seconds: f64,
    pub width: u32,
    pub height: u32,
    pub has_audio: bool,
}

/// How an audio track is fitted to a video before muxing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFit {
    /// Audio shorter than the video: loop it
    Loop,
    /// Audio longer than the video (or equal): cut at the video's end
    Trim,
}

impl AudioFit {
    pub fn for_durations(video_seconds: f64, audio_seconds: f64) -> Self {
        if audio_seconds + 0.05 < video_seconds {
            AudioFit::Loop
        } else {
            AudioFit::Trim
        }
    }
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaInfo>;
    async fn cut(&self, input: &Path, output: &Path, start: f64, end: f64) -> Result<()>;
    /// Longest side limited to `max_side`, frame rate forced to `fps`.
    async fn resize(&self, input: &Path, output: &Path, max_side: u32, fps: u32) -> Result<()>;
    async fn extract_frame(&self, input: &Path, output: &Path, at_seconds: f64) -> Result<()>;
    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<()>;
    /// Muxes `audio` under `video`, fitted to `video_seconds`.
    async fn merge_audio(&self, video: &Path, audio: &Path, output: &Path, fit: AudioFit, video_seconds: f64) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg: String,
    ffprobe: String,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
        tracing::debug!("Executing {} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| OrchestratorError::Transcode(format!("Failed to execute {}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.lines().rev().take(5).collect::<Vec<_>>().into_iter().rev().collect::<Vec<_>>().join("\n");
            return Err(OrchestratorError::Transcode(format!("{} exited with {}: {}", program, output.status, tail)));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn ffmpeg(&self, args: Vec<String>) -> Result<()> {
        let mut full = vec!["-y".to_string(), "-hide_banner".to_string(), "-loglevel".to_string(), "error".to_string()];
        full.extend(args);
        self.run(&self.ffmpeg, &full).await.map(|_| ())
    }
}

fn arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn secs(value: f64) -> String {
    format!("{:.3}", value.max(0.0))
}

pub(crate) fn parse_probe(raw: &str) -> Result<MediaInfo> {
    let json: Value = serde_json::from_str(raw)?;
    let mut info = MediaInfo {
        duration_seconds: json["format"]["duration"]
            .as_str()
            .and_then(|d| d.parse::<f64>().ok())
            .unwrap_or(0.0),
        ..Default::default()
    };

    if let Some(streams) = json["streams"].as_array() {
        for stream in streams {
            match stream["codec_type"].as_str() {
                Some("video") => {
                    info.width = stream["width"].as_u64().unwrap_or(0) as u32;
                    info.height = stream["height"].as_u64().unwrap_or(0) as u32;
                }
                Some("audio") => info.has_audio = true,
                _ => {}
            }
        }
    }
    Ok(info)
}

/// concat-demuxer list line; single quotes escaped the way the demuxer expects
pub(crate) fn concat_line(path: &Path) -> String {
    format!("file '{}'\n", path.to_string_lossy().replace('\'', "'\\''"))
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn probe(&self, path: &Path) -> Result<MediaInfo> {
        let args: Vec<String> = ["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"]
            .iter()
            .map(|s| s.to_string())
            .chain(std::iter::once(arg(path)))
            .collect();
        let raw = self.run(&self.ffprobe, &args).await?;
        parse_probe(&raw)
    }

    async fn cut(&self, input: &Path, output: &Path, start: f64, end: f64) -> Result<()> {
        let duration = secs(end - start);
        let copy = vec![
            "-ss".into(), secs(start),
            "-i".into(), arg(input),
            "-t".into(), duration.clone(),
            "-c".into(), "copy".into(),
            arg(output),
        ];
        if let Err(e) = self.ffmpeg(copy).await {
            tracing::warn!("Stream copy cut failed ({}), re-encoding...", e);
            let reencode = vec![
                "-ss".into(), secs(start),
                "-i".into(), arg(input),
                "-t".into(), duration,
                "-c:v".into(), "libx264".into(),
                "-c:a".into(), "aac".into(),
                arg(output),
            ];
            self.ffmpeg(reencode).await?;
        }
        Ok(())
    }

    async fn resize(&self, input: &Path, output: &Path, max_side: u32, fps: u32) -> Result<()> {
        let scale = format!(
            "scale='if(gt(iw,ih),{m},-2)':'if(gt(iw,ih),-2,{m})'",
            m = max_side
        );
        self.ffmpeg(vec![
            "-i".into(), arg(input),
            "-vf".into(), scale,
            "-c:v".into(), "libx264".into(),
            "-pix_fmt".into(), "yuv420p".into(),
            "-r".into(), fps.to_string(),
            "-c:a".into(), "copy".into(),
            arg(output),
        ])
        .await
    }

    async fn extract_frame(&self, input: &Path, output: &Path, at_seconds: f64) -> Result<()> {
        self.ffmpeg(vec![
            "-ss".into(), secs(at_seconds),
            "-i".into(), arg(input),
            "-vframes".into(), "1".into(),
            arg(output),
        ])
        .await
    }

    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<()> {
        if inputs.is_empty() {
            return Err(OrchestratorError::Transcode("No video paths provided".to_string()));
        }

        let parent = output.parent().unwrap_or_else(|| Path::new("."));
        let list_file = parent.join(format!("concat_list_{}.txt", uuid::Uuid::new_v4()));
        let mut listing = String::new();
        for input in inputs {
            let absolute = std::path::absolute(input).unwrap_or_else(|_| input.clone());
            listing.push_str(&concat_line(&absolute));
        }
        tokio::fs::write(&list_file, listing).await?;

        let result = self
            .ffmpeg(vec![
                "-f".into(), "concat".into(),
                "-safe".into(), "0".into(),
                "-i".into(), arg(&list_file),
                "-c".into(), "copy".into(),
                arg(output),
            ])
            .await;

        if let Err(e) = tokio::fs::remove_file(&list_file).await {
            tracing::debug!("Failed to remove concat list {}: {}", list_file.display(), e);
        }
        result
    }

    async fn merge_audio(&self, video: &Path, audio: &Path, output: &Path, fit: AudioFit, video_seconds: f64) -> Result<()> {
        let mut args: Vec<String> = vec!["-i".into(), arg(video)];
        if fit == AudioFit::Loop {
            args.extend(["-stream_loop".to_string(), "-1".to_string()]);
        }
        args.extend([
            "-i".into(), arg(audio),
            "-map".into(), "0:v".into(),
            "-map".into(), "1:a".into(),
            "-c:v".into(), "copy".into(),
            "-c:a".into(), "aac".into(),
            "-t".into(), secs(video_seconds),
            "-shortest".into(),
            arg(output),
        ]);
        self.ffmpeg(args).await
    }
}
