//! Media probing and policy gates
//!
//! Videos are inspected and checked against duration and size limits before
//! any extraction work is spent on them. Images only need their header read.

pub mod ffprobe;

use async_trait::async_trait;
use media_scan_common::{
    ImageMetadata, LimitsConfig, MediaAsset, MediaKind, PipelineError, VideoMetadata,
};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use ffprobe::{parse_ffprobe_json, parse_frame_rate, FfprobeInspector};

/// Errors raised while probing media
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Inspection tool failed: {0}")]
    Tool(String),

    #[error("Unreadable media: {0}")]
    Unreadable(String),

    #[error("Failed to parse probe output: {0}")]
    Parse(String),

    #[error("No video stream found")]
    NoVideoStream,

    #[error("Missing or invalid duration")]
    InvalidDuration,

    #[error("Duration exceeds limit: {duration:.1}s (max: {max:.0}s)")]
    DurationTooLong { duration: f64, max: f64 },

    #[error("File too large: {size} bytes (max: {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Image decoding failed: {0}")]
    Image(String),

    #[error("Expected {expected} asset, got {actual}")]
    WrongKind {
        expected: MediaKind,
        actual: MediaKind,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProbeError> for PipelineError {
    fn from(err: ProbeError) -> Self {
        match err {
            ProbeError::DurationTooLong { .. } | ProbeError::FileTooLarge { .. } => {
                PipelineError::PolicyViolation(err.to_string())
            }
            ProbeError::Unreadable(_)
            | ProbeError::Parse(_)
            | ProbeError::NoVideoStream
            | ProbeError::InvalidDuration
            | ProbeError::Image(_) => PipelineError::UnsupportedFormat(err.to_string()),
            ProbeError::Tool(_) | ProbeError::WrongKind { .. } | ProbeError::Io(_) => {
                PipelineError::Internal(err.to_string())
            }
        }
    }
}

impl From<image::ImageError> for ProbeError {
    fn from(err: image::ImageError) -> Self {
        ProbeError::Image(err.to_string())
    }
}

/// Extracts container and stream information from a video file
#[async_trait]
pub trait MediaInspector: Send + Sync {
    async fn inspect(&self, path: &Path) -> Result<VideoMetadata, ProbeError>;
}

/// Size and duration limits applied after download
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediaPolicy {
    pub max_image_bytes: u64,
    pub max_video_bytes: u64,
    pub max_video_duration_secs: f64,
}

impl From<&LimitsConfig> for MediaPolicy {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            max_image_bytes: limits.max_image_bytes,
            max_video_bytes: limits.max_video_bytes,
            max_video_duration_secs: limits.max_video_duration_secs,
        }
    }
}

impl Default for MediaPolicy {
    fn default() -> Self {
        Self::from(&LimitsConfig::default())
    }
}

impl MediaPolicy {
    #[must_use]
    pub fn max_bytes(&self, kind: MediaKind) -> u64 {
        match kind {
            MediaKind::Images => self.max_image_bytes,
            MediaKind::Videos => self.max_video_bytes,
        }
    }

    /// Byte ceiling for the asset's kind
    pub fn enforce_size(&self, asset: &MediaAsset) -> Result<(), ProbeError> {
        let max = self.max_bytes(asset.kind);
        if asset.byte_size > max {
            return Err(ProbeError::FileTooLarge {
                size: asset.byte_size,
                max,
            });
        }
        Ok(())
    }

    /// Full video gate: size, then duration
    pub fn enforce(&self, asset: &MediaAsset, metadata: &VideoMetadata) -> Result<(), ProbeError> {
        self.enforce_size(asset)?;
        if metadata.duration_secs > self.max_video_duration_secs {
            return Err(ProbeError::DurationTooLong {
                duration: metadata.duration_secs,
                max: self.max_video_duration_secs,
            });
        }
        Ok(())
    }
}

/// Probes downloaded videos and applies the media policy
#[derive(Clone)]
pub struct Prober {
    inspector: Arc<dyn MediaInspector>,
    policy: MediaPolicy,
}

impl Prober {
    #[must_use]
    pub fn new(inspector: Arc<dyn MediaInspector>, policy: MediaPolicy) -> Self {
        Self { inspector, policy }
    }

    #[must_use]
    pub fn policy(&self) -> &MediaPolicy {
        &self.policy
    }

    /// Inspect a video and reject it if it is out of policy
    ///
    /// The on-disk size is re-read rather than trusting the download count, so
    /// a file that grew or was misreported still hits the size gate.
    pub async fn probe(&self, asset: &MediaAsset) -> Result<VideoMetadata, ProbeError> {
        if asset.kind != MediaKind::Videos {
            return Err(ProbeError::WrongKind {
                expected: MediaKind::Videos,
                actual: asset.kind,
            });
        }

        let on_disk = tokio::fs::metadata(&asset.path).await?.len();
        let checked = MediaAsset {
            byte_size: on_disk.max(asset.byte_size),
            ..asset.clone()
        };
        // Cheap gate first: no subprocess for files already over the limit
        self.policy.enforce_size(&checked)?;

        let mut metadata = self.inspector.inspect(&asset.path).await?;
        if metadata.size_bytes == 0 {
            metadata.size_bytes = checked.byte_size;
        }

        if let Err(e) = self.policy.enforce(&checked, &metadata) {
            warn!("Rejecting {}: {}", asset.path.display(), e);
            return Err(e);
        }

        info!(
            "Probed {}: {:.2}s {}x{} @ {:.2} fps",
            asset.path.display(),
            metadata.duration_secs,
            metadata.width,
            metadata.height,
            metadata.fps
        );
        Ok(metadata)
    }
}

/// Header-only image dimensions
pub async fn image_metadata(asset: &MediaAsset) -> Result<ImageMetadata, ProbeError> {
    let path = asset.path.clone();
    let (width, height) = tokio::task::spawn_blocking(move || image::image_dimensions(&path))
        .await
        .map_err(|e| ProbeError::Tool(format!("image inspection task failed: {e}")))??;

    debug!("Image {} is {}x{}", asset.path.display(), width, height);
    Ok(ImageMetadata { width, height })
}
