//! Data model shared by every pipeline stage

use crate::error::ErrorInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Supported image extensions, lowercase without the leading dot
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];

/// Supported video extensions, lowercase without the leading dot
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm"];

/// Media kind of a batch; every job in a batch shares it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Images,
    Videos,
}

impl MediaKind {
    /// Directory name under the round directory
    #[must_use]
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Images => "images",
            Self::Videos => "videos",
        }
    }

    #[must_use]
    pub fn supported_extensions(&self) -> &'static [&'static str] {
        match self {
            Self::Images => IMAGE_EXTENSIONS,
            Self::Videos => VIDEO_EXTENSIONS,
        }
    }

    /// Case-insensitive, accepts an optional leading dot
    #[must_use]
    pub fn supports_extension(&self, ext: &str) -> bool {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        self.supported_extensions().contains(&ext.as_str())
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// A validated job; identity never changes after intake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub url: String,
}

/// A validated batch of jobs sharing one round identifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub round_id: String,
    pub kind: MediaKind,
    pub jobs: Vec<Job>,
}

/// A downloaded media file owned by its job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaAsset {
    pub path: PathBuf,
    pub byte_size: u64,
    /// Lowercase, without the leading dot
    pub extension: String,
    pub kind: MediaKind,
    /// Last path segment of the source URL, as the uploader named it
    pub original_filename: String,
}

impl MediaAsset {
    /// Size in mebibytes rounded to two decimals
    #[must_use]
    pub fn size_mb(&self) -> f64 {
        round2(self.byte_size as f64 / (1024.0 * 1024.0))
    }

    /// File name of the stored copy
    #[must_use]
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Header-level image information
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
}

/// Container and primary video stream information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub codec: Option<String>,
    pub container: Option<String>,
    pub size_bytes: u64,
}

/// Frame extraction strategy tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameStrategy {
    Scene,
    Uniform,
    LumaSpike,
}

impl FrameStrategy {
    /// All strategies in priority order
    pub const ALL: [FrameStrategy; 3] = [Self::Scene, Self::Uniform, Self::LumaSpike];

    /// Lower value wins when two frames share a content hash
    #[must_use]
    pub fn priority(&self) -> u8 {
        match self {
            Self::Scene => 0,
            Self::Uniform => 1,
            Self::LumaSpike => 2,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Scene => "scene",
            Self::Uniform => "uniform",
            Self::LumaSpike => "luma_spike",
        }
    }
}

impl fmt::Display for FrameStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A frame written by one extraction strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateFrame {
    pub job_id: String,
    pub strategy: FrameStrategy,
    pub timestamp_secs: f64,
    pub path: PathBuf,
    /// Content hash, filled in lazily by the deduplicator
    pub hash: Option<String>,
}

/// A frame that survived deduplication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalFrame {
    pub job_id: String,
    pub strategy: FrameStrategy,
    pub timestamp_secs: f64,
    pub path: PathBuf,
    pub hash: String,
}

impl From<CanonicalFrame> for CandidateFrame {
    fn from(frame: CanonicalFrame) -> Self {
        Self {
            job_id: frame.job_id,
            strategy: frame.strategy,
            timestamp_secs: frame.timestamp_secs,
            path: frame.path,
            hash: Some(frame.hash),
        }
    }
}

/// What a scan unit was derived from
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ScanUnitKind {
    Image,
    Frame {
        strategy: FrameStrategy,
        timestamp_secs: f64,
    },
}

/// Atomic classifier input, tagged with its owning job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanUnit {
    pub job_id: String,
    pub path: PathBuf,
    /// Path relative to the workspace root, used in reports
    pub relative_path: String,
    pub kind: ScanUnitKind,
}

impl ScanUnit {
    #[must_use]
    pub fn image(job_id: impl Into<String>, path: PathBuf, relative_path: String) -> Self {
        Self {
            job_id: job_id.into(),
            path,
            relative_path,
            kind: ScanUnitKind::Image,
        }
    }

    #[must_use]
    pub fn frame(frame: &CanonicalFrame, relative_path: String) -> Self {
        Self {
            job_id: frame.job_id.clone(),
            path: frame.path.clone(),
            relative_path,
            kind: ScanUnitKind::Frame {
                strategy: frame.strategy,
                timestamp_secs: frame.timestamp_secs,
            },
        }
    }

    #[must_use]
    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Classification outcome for one scan unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub job_id: String,
    pub filename: String,
    pub relative_path: String,
    pub is_nsfw: bool,
    pub nsfw_score: f32,
    pub probs: BTreeMap<String, f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<FrameStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_secs: Option<f64>,
}

impl ScanResult {
    /// A scored result for `unit`
    #[must_use]
    pub fn scored(
        unit: &ScanUnit,
        nsfw_score: f32,
        probs: BTreeMap<String, f32>,
        threshold: f32,
    ) -> Self {
        let mut result = Self::blank(unit);
        result.nsfw_score = nsfw_score.clamp(0.0, 1.0);
        result.is_nsfw = result.nsfw_score >= threshold;
        result.probs = probs;
        result
    }

    /// An errored result for `unit`; carries no score
    #[must_use]
    pub fn failed(unit: &ScanUnit, error: impl Into<String>) -> Self {
        let mut result = Self::blank(unit);
        result.error = Some(error.into());
        result
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    fn blank(unit: &ScanUnit) -> Self {
        let (strategy, timestamp_secs) = match unit.kind {
            ScanUnitKind::Image => (None, None),
            ScanUnitKind::Frame {
                strategy,
                timestamp_secs,
            } => (Some(strategy), Some(timestamp_secs)),
        };
        Self {
            job_id: unit.job_id.clone(),
            filename: unit.filename(),
            relative_path: unit.relative_path.clone(),
            is_nsfw: false,
            nsfw_score: 0.0,
            probs: BTreeMap::new(),
            error: None,
            strategy,
            timestamp_secs,
        }
    }
}

/// Job-level moderation verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Safe,
    Nsfw,
    /// No unit could be scored
    Unknown,
}

/// Result of an image job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageJobResult {
    pub filename: String,
    pub relative_path: String,
    pub verdict: Verdict,
    /// `None` when the verdict is unknown
    pub is_nsfw: Option<bool>,
    pub nsfw_score: Option<f32>,
    pub full_probs: BTreeMap<String, f32>,
    pub width: u32,
    pub height: u32,
    pub size_mb: f64,
    pub frame_count: usize,
    pub engine_version: String,
    pub scan: ScanResult,
}

/// Result of a video job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoJobResult {
    pub filename: String,
    pub verdict: Verdict,
    /// `None` when the verdict is unknown
    pub is_nsfw: Option<bool>,
    pub max_score: Option<f32>,
    pub avg_score: Option<f32>,
    /// Class probabilities of the highest-scoring frame
    pub full_probs: BTreeMap<String, f32>,
    pub frame_count: usize,
    pub scored_frame_count: usize,
    pub width: u32,
    pub height: u32,
    pub duration: f64,
    pub fps: f64,
    pub size_mb: f64,
    pub engine_version: String,
    pub frames: Vec<ScanResult>,
}

/// Aggregated result of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "media_type", rename_all = "lowercase")]
pub enum JobResult {
    Image(ImageJobResult),
    Video(VideoJobResult),
}

impl JobResult {
    #[must_use]
    pub fn verdict(&self) -> Verdict {
        match self {
            Self::Image(result) => result.verdict,
            Self::Video(result) => result.verdict,
        }
    }

    /// Number of units that went to the classifier
    #[must_use]
    pub fn frame_count(&self) -> usize {
        match self {
            Self::Image(result) => result.frame_count,
            Self::Video(result) => result.frame_count,
        }
    }
}

/// Terminal status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Done,
    Failed,
}

/// One entry of the batch response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub elapsed_secs: f64,
}

impl JobOutcome {
    #[must_use]
    pub fn done(job_id: impl Into<String>, result: JobResult, elapsed_secs: f64) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Done,
            result: Some(result),
            error: None,
            elapsed_secs: round2(elapsed_secs),
        }
    }

    #[must_use]
    pub fn failed(job_id: impl Into<String>, error: ErrorInfo, elapsed_secs: f64) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Failed,
            result: None,
            error: Some(error),
            elapsed_secs: round2(elapsed_secs),
        }
    }
}

/// Batch response covering every submitted job exactly once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub round_id: String,
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub engine_version: String,
    pub total_frames: usize,
    pub elapsed_secs: f64,
    pub results: BTreeMap<String, JobOutcome>,
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_support() {
        assert!(MediaKind::Images.supports_extension(".JPG"));
        assert!(MediaKind::Images.supports_extension("webp"));
        assert!(!MediaKind::Images.supports_extension("mp4"));
        assert!(MediaKind::Videos.supports_extension("mkv"));
        assert!(!MediaKind::Videos.supports_extension("gif"));
    }

    #[test]
    fn test_strategy_priority_order() {
        let mut strategies = vec![
            FrameStrategy::LumaSpike,
            FrameStrategy::Scene,
            FrameStrategy::Uniform,
        ];
        strategies.sort_by_key(FrameStrategy::priority);
        assert_eq!(strategies, FrameStrategy::ALL.to_vec());
        assert_eq!(
            serde_json::to_value(FrameStrategy::LumaSpike).unwrap(),
            "luma_spike"
        );
    }

    #[test]
    fn test_size_mb_rounding() {
        let asset = MediaAsset {
            path: PathBuf::from("/tmp/a.jpg"),
            byte_size: 2 * 1024 * 1024 + 5_000,
            extension: "jpg".into(),
            kind: MediaKind::Images,
            original_filename: "a.jpg".into(),
        };
        assert_eq!(asset.size_mb(), 2.0);
        assert_eq!(asset.file_name(), "a.jpg");
    }

    #[test]
    fn test_scored_result_applies_threshold() {
        let unit = ScanUnit::image("job-1", PathBuf::from("/w/r/images/job-1.png"), "r/images/job-1.png".into());
        let result = ScanResult::scored(&unit, 0.5, BTreeMap::new(), 0.5);
        assert!(result.is_nsfw);
        assert_eq!(result.filename, "job-1.png");

        let result = ScanResult::scored(&unit, 0.49, BTreeMap::new(), 0.5);
        assert!(!result.is_nsfw);
    }

    #[test]
    fn test_failed_frame_result_keeps_origin() {
        let frame = CanonicalFrame {
            job_id: "v1".into(),
            strategy: FrameStrategy::Uniform,
            timestamp_secs: 3.0,
            path: PathBuf::from("/w/r/videos/v1/frames/uniform/frame_0003.jpg"),
            hash: "abc".into(),
        };
        let unit = ScanUnit::frame(&frame, "r/videos/v1/frames/uniform/frame_0003.jpg".into());
        let result = ScanResult::failed(&unit, "classifier unavailable");
        assert!(result.is_error());
        assert_eq!(result.strategy, Some(FrameStrategy::Uniform));
        assert_eq!(result.timestamp_secs, Some(3.0));

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["error"], "classifier unavailable");
    }
}
