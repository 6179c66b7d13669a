//! Named extraction strategies
//!
//! Each strategy writes into its own directory and returns frames tagged with
//! its [`FrameStrategy`]. A strategy that finds nothing returns an empty list.

use crate::tool::{frame_path, FilterSpec, FrameTool, FrameToolError, LumaSample, LumaSampling, SeekSpec};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use media_scan_common::{
    CandidateFrame, ExtractionConfig, FrameStrategy, LumaStrategyConfig, SceneStrategyConfig,
    UniformStrategyConfig, VideoMetadata,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Inputs shared by every strategy of one job
#[derive(Debug, Clone)]
pub struct StrategyInput<'a> {
    pub job_id: &'a str,
    pub source: &'a Path,
    pub metadata: &'a VideoMetadata,
    pub output_dir: PathBuf,
}

/// One way of picking frames out of a video
#[async_trait]
pub trait ExtractionStrategy: Send + Sync {
    fn kind(&self) -> FrameStrategy;

    async fn extract(
        &self,
        tool: &dyn FrameTool,
        input: &StrategyInput<'_>,
    ) -> Result<Vec<CandidateFrame>, FrameToolError>;
}

/// Frames at perceptual scene changes, every n-th decoded frame eligible
#[derive(Debug, Clone)]
pub struct SceneChangeStrategy {
    pub threshold: f64,
    pub frame_stride: u32,
    pub max_frames: usize,
    pub jpeg_quality: u32,
}

impl SceneChangeStrategy {
    #[must_use]
    pub fn from_config(config: &SceneStrategyConfig, extraction: &ExtractionConfig) -> Self {
        Self {
            threshold: config.threshold,
            frame_stride: config.frame_stride.max(1),
            max_frames: extraction.max_frames_per_strategy,
            jpeg_quality: extraction.jpeg_quality,
        }
    }

    /// ffmpeg select expression
    #[must_use]
    pub fn filter(&self) -> String {
        format!(
            "select='gt(scene,{})*not(mod(n\\,{}))'",
            self.threshold, self.frame_stride
        )
    }
}

#[async_trait]
impl ExtractionStrategy for SceneChangeStrategy {
    fn kind(&self) -> FrameStrategy {
        FrameStrategy::Scene
    }

    async fn extract(
        &self,
        tool: &dyn FrameTool,
        input: &StrategyInput<'_>,
    ) -> Result<Vec<CandidateFrame>, FrameToolError> {
        let spec = FilterSpec {
            input: input.source.to_path_buf(),
            filter: self.filter(),
            output_dir: input.output_dir.clone(),
            jpeg_quality: self.jpeg_quality,
        };
        let frames = tool.run_filter(&spec).await?;
        let frames = frames
            .into_iter()
            .map(|f| (f.path, f.timestamp_secs.unwrap_or(0.0)))
            .collect();
        finish(self.kind(), input.job_id, frames, self.max_frames).await
    }
}

/// Fixed low-rate sampling for baseline coverage
#[derive(Debug, Clone)]
pub struct UniformRateStrategy {
    pub fps: f64,
    pub scale_width: u32,
    pub max_frames: usize,
    pub jpeg_quality: u32,
}

impl UniformRateStrategy {
    #[must_use]
    pub fn from_config(config: &UniformStrategyConfig, extraction: &ExtractionConfig) -> Self {
        Self {
            fps: config.fps,
            scale_width: config.scale_width,
            max_frames: config.max_frames.min(extraction.max_frames_per_strategy),
            jpeg_quality: extraction.jpeg_quality,
        }
    }

    #[must_use]
    pub fn filter(&self) -> String {
        format!("fps={},scale={}:-1", self.fps, self.scale_width)
    }
}

#[async_trait]
impl ExtractionStrategy for UniformRateStrategy {
    fn kind(&self) -> FrameStrategy {
        FrameStrategy::Uniform
    }

    async fn extract(
        &self,
        tool: &dyn FrameTool,
        input: &StrategyInput<'_>,
    ) -> Result<Vec<CandidateFrame>, FrameToolError> {
        let spec = FilterSpec {
            input: input.source.to_path_buf(),
            filter: self.filter(),
            output_dir: input.output_dir.clone(),
            jpeg_quality: self.jpeg_quality,
        };
        let frames = tool.run_filter(&spec).await?;
        let frames = frames
            .into_iter()
            .enumerate()
            .map(|(i, f)| {
                let fallback = i as f64 / self.fps;
                (f.path, f.timestamp_secs.unwrap_or(fallback))
            })
            .collect();
        finish(self.kind(), input.job_id, frames, self.max_frames).await
    }
}

/// Single-frame seeks at abrupt average-brightness changes
#[derive(Debug, Clone)]
pub struct LumaSpikeStrategy {
    pub diff_threshold: f64,
    pub sampling: LumaSampling,
    pub suppression_window_secs: f64,
    pub max_frames: usize,
    pub concurrency: usize,
    pub scale_width: u32,
    pub jpeg_quality: u32,
}

impl LumaSpikeStrategy {
    #[must_use]
    pub fn from_config(config: &LumaStrategyConfig, extraction: &ExtractionConfig) -> Self {
        Self {
            diff_threshold: config.diff_threshold,
            sampling: LumaSampling {
                interval_secs: config.sample_interval_secs,
                width: config.analysis_width,
                height: config.analysis_height,
            },
            suppression_window_secs: config.suppression_window_secs,
            max_frames: config.max_frames.min(extraction.max_frames_per_strategy),
            concurrency: config.concurrency.max(1),
            scale_width: config.scale_width,
            jpeg_quality: extraction.jpeg_quality,
        }
    }
}

/// Timestamps where the luma delta exceeds `threshold`
///
/// A spike within `suppression_window_secs` of the previous accepted spike is
/// dropped. Timestamps are rounded to hundredths of a second.
#[must_use]
pub fn select_spikes(
    samples: &[LumaSample],
    threshold: f64,
    suppression_window_secs: f64,
) -> Vec<f64> {
    let mut spikes = Vec::new();
    let mut last_spike = f64::NEG_INFINITY;
    for sample in samples {
        if sample.delta > threshold && sample.timestamp_secs - last_spike >= suppression_window_secs
        {
            spikes.push((sample.timestamp_secs * 100.0).round() / 100.0);
            last_spike = sample.timestamp_secs;
        }
    }
    spikes
}

#[async_trait]
impl ExtractionStrategy for LumaSpikeStrategy {
    fn kind(&self) -> FrameStrategy {
        FrameStrategy::LumaSpike
    }

    async fn extract(
        &self,
        tool: &dyn FrameTool,
        input: &StrategyInput<'_>,
    ) -> Result<Vec<CandidateFrame>, FrameToolError> {
        let samples = tool.luma_deltas(input.source, &self.sampling).await?;
        let mut spikes = select_spikes(&samples, self.diff_threshold, self.suppression_window_secs);
        info!(
            "Job {}: {} luma spikes in {} samples",
            input.job_id,
            spikes.len(),
            samples.len()
        );
        spikes.truncate(self.max_frames);
        if spikes.is_empty() {
            return Ok(Vec::new());
        }

        tokio::fs::create_dir_all(&input.output_dir).await?;

        let seeks = spikes.into_iter().enumerate().map(|(i, timestamp_secs)| SeekSpec {
            input: input.source.to_path_buf(),
            timestamp_secs,
            scale_width: self.scale_width,
            output: frame_path(&input.output_dir, i + 1),
            jpeg_quality: self.jpeg_quality,
        });

        let mut written: Vec<(PathBuf, f64)> = stream::iter(seeks)
            .map(|spec| async move {
                match tool.extract_at(&spec).await {
                    Ok(true) => Some((spec.output, spec.timestamp_secs)),
                    Ok(false) => {
                        debug!("No frame decoded at {:.2}s", spec.timestamp_secs);
                        None
                    }
                    Err(e) => {
                        warn!(
                            "Failed to extract spike frame at {:.2}s: {}",
                            spec.timestamp_secs, e
                        );
                        None
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|frame| async move { frame })
            .collect()
            .await;
        written.sort_by(|a, b| a.0.cmp(&b.0));

        finish(self.kind(), input.job_id, written, self.max_frames).await
    }
}

/// Tag frames, enforce the cap and delete anything beyond it
async fn finish(
    strategy: FrameStrategy,
    job_id: &str,
    mut frames: Vec<(PathBuf, f64)>,
    cap: usize,
) -> Result<Vec<CandidateFrame>, FrameToolError> {
    if frames.len() > cap {
        debug!(
            "Job {}: {} produced {} frames, keeping {}",
            job_id,
            strategy,
            frames.len(),
            cap
        );
        for (path, _) in frames.drain(cap..) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(frames
        .into_iter()
        .map(|(path, timestamp_secs)| CandidateFrame {
            job_id: job_id.to_string(),
            strategy,
            timestamp_secs,
            path,
            hash: None,
        })
        .collect())
}

/// Strategies enabled by `config`, in priority order
#[must_use]
pub fn strategies_from_config(
    config: &ExtractionConfig,
) -> Vec<std::sync::Arc<dyn ExtractionStrategy>> {
    let mut strategies: Vec<std::sync::Arc<dyn ExtractionStrategy>> = Vec::new();
    if config.scene.enabled {
        strategies.push(std::sync::Arc::new(SceneChangeStrategy::from_config(
            &config.scene,
            config,
        )));
    }
    if config.uniform.enabled {
        strategies.push(std::sync::Arc::new(UniformRateStrategy::from_config(
            &config.uniform,
            config,
        )));
    }
    if config.luma.enabled {
        strategies.push(std::sync::Arc::new(LumaSpikeStrategy::from_config(
            &config.luma,
            config,
        )));
    }
    strategies
}
