//! Reduces per-unit scan results into job verdicts
//!
//! An image job passes its single [`ScanResult`] through alongside the asset's
//! header metadata. A video job is reduced over its frames: the maximum score
//! decides the verdict, the mean is reported alongside it, and the full frame
//! list is kept for audit. When no unit could be scored the verdict is
//! [`Verdict::Unknown`], never safe.

use media_scan_common::{
    ImageJobResult, ImageMetadata, JobResult, MediaAsset, ScanResult, Verdict, VideoJobResult,
    VideoMetadata,
};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Everything needed to aggregate one job
#[derive(Debug, Clone)]
pub enum AggregationInput {
    Image {
        asset: MediaAsset,
        metadata: ImageMetadata,
        scan: ScanResult,
    },
    Video {
        asset: MediaAsset,
        metadata: VideoMetadata,
        frames: Vec<ScanResult>,
    },
}

#[derive(Debug, Clone)]
pub struct Aggregator {
    threshold: f32,
    engine_version: String,
}

impl Aggregator {
    #[must_use]
    pub fn new(threshold: f32, engine_version: impl Into<String>) -> Self {
        Self {
            threshold,
            engine_version: engine_version.into(),
        }
    }

    #[must_use]
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    #[must_use]
    pub fn engine_version(&self) -> &str {
        &self.engine_version
    }

    pub fn aggregate(&self, input: AggregationInput) -> JobResult {
        match input {
            AggregationInput::Image {
                asset,
                metadata,
                scan,
            } => JobResult::Image(self.aggregate_image(&asset, metadata, scan)),
            AggregationInput::Video {
                asset,
                metadata,
                frames,
            } => JobResult::Video(self.aggregate_video(&asset, &metadata, frames)),
        }
    }

    /// Pass the single scan result through with the image's metadata
    #[must_use]
    pub fn aggregate_image(
        &self,
        asset: &MediaAsset,
        metadata: ImageMetadata,
        scan: ScanResult,
    ) -> ImageJobResult {
        let (verdict, is_nsfw, nsfw_score) = if let Some(error) = &scan.error {
            warn!("Image {} could not be scored: {}", scan.job_id, error);
            (Verdict::Unknown, None, None)
        } else {
            let is_nsfw = scan.nsfw_score >= self.threshold;
            (verdict_for(is_nsfw), Some(is_nsfw), Some(scan.nsfw_score))
        };

        ImageJobResult {
            filename: scan.filename.clone(),
            relative_path: scan.relative_path.clone(),
            verdict,
            is_nsfw,
            nsfw_score,
            full_probs: scan.probs.clone(),
            width: metadata.width,
            height: metadata.height,
            size_mb: asset.size_mb(),
            frame_count: 1,
            engine_version: self.engine_version.clone(),
            scan,
        }
    }

    /// Reduce frame results to max/mean scores and a verdict
    #[must_use]
    pub fn aggregate_video(
        &self,
        asset: &MediaAsset,
        metadata: &VideoMetadata,
        frames: Vec<ScanResult>,
    ) -> VideoJobResult {
        let scored: Vec<&ScanResult> = frames.iter().filter(|frame| !frame.is_error()).collect();

        let top = scored
            .iter()
            .copied()
            .max_by(|a, b| a.nsfw_score.total_cmp(&b.nsfw_score));

        let (verdict, is_nsfw, max_score, avg_score, full_probs) = match top {
            Some(top) => {
                let max_score = top.nsfw_score;
                let sum: f64 = scored.iter().map(|frame| f64::from(frame.nsfw_score)).sum();
                // Mean of clamped scores can still drift past the max by rounding
                let avg_score = ((sum / scored.len() as f64) as f32).min(max_score);
                let is_nsfw = max_score >= self.threshold;
                (
                    verdict_for(is_nsfw),
                    Some(is_nsfw),
                    Some(max_score),
                    Some(avg_score),
                    top.probs.clone(),
                )
            }
            None => {
                warn!(
                    "Video {} has no scored frames out of {}",
                    asset.original_filename,
                    frames.len()
                );
                (Verdict::Unknown, None, None, None, BTreeMap::new())
            }
        };

        debug!(
            "Aggregated {} frames ({} scored) for {}: {:?}",
            frames.len(),
            scored.len(),
            asset.original_filename,
            verdict
        );

        VideoJobResult {
            filename: asset.original_filename.clone(),
            verdict,
            is_nsfw,
            max_score,
            avg_score,
            full_probs,
            frame_count: frames.len(),
            scored_frame_count: scored.len(),
            width: metadata.width,
            height: metadata.height,
            duration: round2(metadata.duration_secs),
            fps: round2(metadata.fps),
            size_mb: asset.size_mb(),
            engine_version: self.engine_version.clone(),
            frames,
        }
    }
}

fn verdict_for(is_nsfw: bool) -> Verdict {
    if is_nsfw {
        Verdict::Nsfw
    } else {
        Verdict::Safe
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
