//! External frame extraction tool
//!
//! [`FfmpegTool`] drives the `ffmpeg` binary. Every child is spawned with
//! `kill_on_drop`, so cancelling the owning future (stage timeout) kills the
//! decoder instead of leaving it running.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Output file pattern, relative to the strategy directory
pub const FRAME_PATTERN: &str = "frame_%04d.jpg";

/// ffmpeg stderr phrases meaning "ran fine, nothing qualified"
const EMPTY_OUTPUT_MARKERS: &[&str] = &[
    "Output file is empty",
    "nothing was encoded",
    "does not contain any stream",
];

#[derive(Debug, Error)]
pub enum FrameToolError {
    #[error("Failed to execute {tool}: {reason}")]
    Spawn { tool: String, reason: String },

    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A filter-graph extraction writing numbered frames into `output_dir`
#[derive(Debug, Clone, PartialEq)]
pub struct FilterSpec {
    pub input: PathBuf,
    /// Video filter chain, without the trailing timestamp probe
    pub filter: String,
    pub output_dir: PathBuf,
    pub jpeg_quality: u32,
}

/// A single-frame seek
#[derive(Debug, Clone, PartialEq)]
pub struct SeekSpec {
    pub input: PathBuf,
    pub timestamp_secs: f64,
    pub scale_width: u32,
    pub output: PathBuf,
    pub jpeg_quality: u32,
}

/// Downscaled grayscale sampling used for luma analysis
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LumaSampling {
    pub interval_secs: f64,
    pub width: u32,
    pub height: u32,
}

/// A frame file written by the tool
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFrame {
    pub path: PathBuf,
    /// Presentation time, when the tool reported one
    pub timestamp_secs: Option<f64>,
}

/// Mean absolute luma change from the previous sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LumaSample {
    pub timestamp_secs: f64,
    pub delta: f64,
}

/// Capability used by extraction strategies
#[async_trait]
pub trait FrameTool: Send + Sync {
    /// Run a filter graph; an empty result is not an error
    async fn run_filter(&self, spec: &FilterSpec) -> Result<Vec<ExtractedFrame>, FrameToolError>;

    /// Write one frame at a timestamp; `Ok(false)` when nothing was decoded there
    async fn extract_at(&self, spec: &SeekSpec) -> Result<bool, FrameToolError>;

    /// Per-sample luma deltas, starting with the second sample
    async fn luma_deltas(
        &self,
        input: &Path,
        sampling: &LumaSampling,
    ) -> Result<Vec<LumaSample>, FrameToolError>;
}

/// `ffmpeg` subprocess implementation
#[derive(Debug, Clone)]
pub struct FfmpegTool {
    binary: PathBuf,
}

impl FfmpegTool {
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-hide_banner", "-nostdin"])
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn tool_name(&self) -> String {
        self.binary.display().to_string()
    }

    async fn output(&self, mut cmd: Command) -> Result<std::process::Output, FrameToolError> {
        cmd.output().await.map_err(|e| FrameToolError::Spawn {
            tool: self.tool_name(),
            reason: e.to_string(),
        })
    }
}

impl Default for FfmpegTool {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

#[async_trait]
impl FrameTool for FfmpegTool {
    async fn run_filter(&self, spec: &FilterSpec) -> Result<Vec<ExtractedFrame>, FrameToolError> {
        tokio::fs::create_dir_all(&spec.output_dir).await?;

        let mut cmd = self.command();
        cmd.arg("-y")
            .arg("-i")
            .arg(&spec.input)
            .arg("-an")
            .arg("-vf")
            .arg(format!("{},showinfo", spec.filter))
            .args(["-fps_mode", "vfr", "-f", "image2", "-vcodec", "mjpeg"])
            .arg("-q:v")
            .arg(spec.jpeg_quality.to_string())
            .args(["-pix_fmt", "yuvj420p", "-threads", "2"])
            .arg(spec.output_dir.join(FRAME_PATTERN));

        debug!("Running ffmpeg filter {:?} on {}", spec.filter, spec.input.display());
        let output = self.output(cmd).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);

        let paths = list_frames(&spec.output_dir).await?;
        if !output.status.success() {
            if paths.is_empty() && reports_empty_output(&stderr) {
                debug!("ffmpeg produced no qualifying frames for {:?}", spec.filter);
                return Ok(Vec::new());
            }
            return Err(FrameToolError::Failed {
                tool: self.tool_name(),
                status: output.status.to_string(),
                stderr: stderr_tail(&stderr),
            });
        }

        let timestamps = parse_showinfo_times(&stderr);
        if timestamps.len() != paths.len() {
            warn!(
                "ffmpeg reported {} timestamps for {} frames",
                timestamps.len(),
                paths.len()
            );
        }

        Ok(paths
            .into_iter()
            .enumerate()
            .map(|(i, path)| ExtractedFrame {
                path,
                timestamp_secs: timestamps.get(i).copied(),
            })
            .collect())
    }

    async fn extract_at(&self, spec: &SeekSpec) -> Result<bool, FrameToolError> {
        if let Some(parent) = spec.output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut cmd = self.command();
        cmd.arg("-y")
            .arg("-ss")
            .arg(format!("{:.3}", spec.timestamp_secs))
            .arg("-i")
            .arg(&spec.input)
            .args(["-an", "-frames:v", "1"])
            .arg("-vf")
            .arg(format!("scale={}:-1", spec.scale_width))
            .args(["-f", "image2", "-vcodec", "mjpeg"])
            .arg("-q:v")
            .arg(spec.jpeg_quality.to_string())
            .args(["-pix_fmt", "yuvj420p"])
            .arg(&spec.output);

        let output = self.output(cmd).await?;
        let written = tokio::fs::try_exists(&spec.output).await.unwrap_or(false);
        if !output.status.success() && !written {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if reports_empty_output(&stderr) {
                return Ok(false);
            }
            return Err(FrameToolError::Failed {
                tool: self.tool_name(),
                status: output.status.to_string(),
                stderr: stderr_tail(&stderr),
            });
        }
        Ok(written)
    }

    async fn luma_deltas(
        &self,
        input: &Path,
        sampling: &LumaSampling,
    ) -> Result<Vec<LumaSample>, FrameToolError> {
        let rate = 1.0 / sampling.interval_secs;
        let mut cmd = self.command();
        cmd.arg("-i")
            .arg(input)
            .arg("-an")
            .arg("-vf")
            .arg(format!(
                "fps={rate},scale={}:{},format=gray",
                sampling.width, sampling.height
            ))
            .args(["-f", "rawvideo", "-pix_fmt", "gray", "-"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = self.output(cmd).await?;
        if !output.status.success() && output.stdout.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if reports_empty_output(&stderr) {
                return Ok(Vec::new());
            }
            return Err(FrameToolError::Failed {
                tool: self.tool_name(),
                status: output.status.to_string(),
                stderr: stderr_tail(&stderr),
            });
        }

        let frame_len = (sampling.width * sampling.height) as usize;
        Ok(luma_deltas_from_raw(
            &output.stdout,
            frame_len,
            sampling.interval_secs,
        ))
    }
}

/// Mean absolute difference between consecutive gray frames in a raw buffer
#[must_use]
pub fn luma_deltas_from_raw(raw: &[u8], frame_len: usize, interval_secs: f64) -> Vec<LumaSample> {
    if frame_len == 0 {
        return Vec::new();
    }
    let frames: Vec<&[u8]> = raw.chunks_exact(frame_len).collect();
    frames
        .windows(2)
        .enumerate()
        .map(|(i, pair)| {
            let total: u64 = pair[0]
                .iter()
                .zip(pair[1])
                .map(|(a, b)| u64::from(a.abs_diff(*b)))
                .sum();
            LumaSample {
                timestamp_secs: (i + 1) as f64 * interval_secs,
                delta: total as f64 / frame_len as f64,
            }
        })
        .collect()
}

/// `pts_time` values from showinfo lines, in output order
#[must_use]
pub fn parse_showinfo_times(stderr: &str) -> Vec<f64> {
    stderr
        .lines()
        .filter(|line| line.contains("showinfo") && line.contains("pts_time:"))
        .filter_map(|line| {
            let start = line.find("pts_time:")? + "pts_time:".len();
            line[start..]
                .split_whitespace()
                .next()?
                .parse::<f64>()
                .ok()
        })
        .collect()
}

fn reports_empty_output(stderr: &str) -> bool {
    EMPTY_OUTPUT_MARKERS.iter().any(|m| stderr.contains(m))
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().rev().take(5).collect();
    lines.into_iter().rev().collect::<Vec<_>>().join(" | ")
}

/// `frame_*.jpg` files in `dir`, sorted by name
pub async fn list_frames(dir: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut frames = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("frame_") && name.ends_with(".jpg") {
            frames.push(entry.path());
        }
    }
    frames.sort();
    Ok(frames)
}

/// Output path for the `index`-th (1-based) frame
#[must_use]
pub fn frame_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("frame_{index:04}.jpg"))
}
