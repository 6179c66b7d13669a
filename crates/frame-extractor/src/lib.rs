//! Multi-strategy frame extraction
//!
//! Strategies run concurrently against the same immutable source file and write
//! to disjoint directories under the job's `frames/` directory. Their outputs
//! are unioned in strategy priority order before deduplication.

pub mod strategy;
pub mod tool;

use futures::future::join_all;
use media_scan_common::{
    CandidateFrame, ExtractionConfig, FrameStrategy, MediaAsset, PipelineError, VideoMetadata,
};
use media_scan_workspace::JobContext;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub use strategy::{
    select_spikes, strategies_from_config, ExtractionStrategy, LumaSpikeStrategy,
    SceneChangeStrategy, StrategyInput, UniformRateStrategy,
};
pub use tool::{
    list_frames, ExtractedFrame, FfmpegTool, FilterSpec, FrameTool, FrameToolError, LumaSample,
    LumaSampling, SeekSpec, FRAME_PATTERN,
};

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("no strategy produced a frame ({0})")]
    NoFrames(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ExtractionError> for PipelineError {
    fn from(err: ExtractionError) -> Self {
        match err {
            ExtractionError::NoFrames(detail) => PipelineError::NoFramesExtracted(detail),
            ExtractionError::Io(e) => PipelineError::Internal(format!("IO error: {e}")),
        }
    }
}

/// Runs a set of strategies over one video
#[derive(Clone)]
pub struct FrameExtractor {
    tool: Arc<dyn FrameTool>,
    strategies: Vec<Arc<dyn ExtractionStrategy>>,
}

impl FrameExtractor {
    #[must_use]
    pub fn new(tool: Arc<dyn FrameTool>, strategies: Vec<Arc<dyn ExtractionStrategy>>) -> Self {
        Self { tool, strategies }
    }

    /// Extractor with every strategy `config` enables
    #[must_use]
    pub fn from_config(tool: Arc<dyn FrameTool>, config: &ExtractionConfig) -> Self {
        Self::new(tool, strategies_from_config(config))
    }

    #[must_use]
    pub fn strategies(&self) -> Vec<FrameStrategy> {
        self.strategies.iter().map(|s| s.kind()).collect()
    }

    /// Candidate frames from every strategy, scene first, each by timestamp
    ///
    /// A strategy that fails is logged and contributes nothing. Only an empty
    /// union fails the job.
    pub async fn extract(
        &self,
        ctx: &JobContext,
        asset: &MediaAsset,
        metadata: &VideoMetadata,
    ) -> Result<Vec<CandidateFrame>, ExtractionError> {
        tokio::fs::create_dir_all(ctx.frames_dir()).await?;

        let runs = self.strategies.iter().map(|strategy| {
            let input = StrategyInput {
                job_id: &ctx.job_id,
                source: &asset.path,
                metadata,
                output_dir: ctx.strategy_dir(strategy.kind()),
            };
            let tool = self.tool.as_ref();
            async move {
                let result = strategy.extract(tool, &input).await;
                (strategy.kind(), result)
            }
        });
        let results = join_all(runs).await;

        let mut frames: Vec<CandidateFrame> = Vec::new();
        let mut failures: Vec<String> = Vec::new();
        for (kind, result) in results {
            match result {
                Ok(mut found) => {
                    info!("Job {}: {} strategy produced {} frames", ctx.job_id, kind, found.len());
                    frames.append(&mut found);
                }
                Err(e) => {
                    warn!("Job {}: {} strategy failed: {}", ctx.job_id, kind, e);
                    failures.push(format!("{kind}: {e}"));
                }
            }
        }

        if frames.is_empty() {
            let detail = if failures.is_empty() {
                format!("{} strategies found no qualifying frames", self.strategies.len())
            } else {
                failures.join("; ")
            };
            return Err(ExtractionError::NoFrames(detail));
        }

        frames.sort_by(|a, b| {
            a.strategy
                .priority()
                .cmp(&b.strategy.priority())
                .then(a.timestamp_secs.total_cmp(&b.timestamp_secs))
        });
        Ok(frames)
    }
}
