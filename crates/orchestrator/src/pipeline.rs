//! Batch and job execution

use crate::marker::CompletionMarker;
use crate::state::{JobState, JobTracker};
use futures::stream::{FuturesUnordered, StreamExt};
use media_scan_aggregator::Aggregator;
use media_scan_common::{
    Batch, BatchRequest, BatchResponse, Job, JobOutcome, JobResult, MediaAsset, MediaKind,
    PipelineConfig, PipelineError, Result, ScanResult, ScanUnit, Stage,
};
use media_scan_dedup::Deduplicator;
use media_scan_dispatcher::{Classifier, DispatcherSettings, HttpClassifier, ScanDispatcher};
use media_scan_fetcher::{FetchTarget, Fetcher};
use media_scan_frames::{FfmpegTool, FrameExtractor, FrameTool};
use media_scan_ingestion::{image_metadata, FfprobeInspector, MediaInspector, MediaPolicy, Prober};
use media_scan_workspace::{JobContext, Workspace};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Assembles a [`Pipeline`], defaulting every external capability from config
pub struct PipelineBuilder {
    config: PipelineConfig,
    inspector: Option<Arc<dyn MediaInspector>>,
    frame_tool: Option<Arc<dyn FrameTool>>,
    classifier: Option<Arc<dyn Classifier>>,
}

impl PipelineBuilder {
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            inspector: None,
            frame_tool: None,
            classifier: None,
        }
    }

    #[must_use]
    pub fn inspector(mut self, inspector: Arc<dyn MediaInspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    #[must_use]
    pub fn frame_tool(mut self, tool: Arc<dyn FrameTool>) -> Self {
        self.frame_tool = Some(tool);
        self
    }

    #[must_use]
    pub fn classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| PipelineError::Internal(format!("Invalid configuration: {e}")))?;

        let classifier: Arc<dyn Classifier> = match self.classifier {
            Some(classifier) => classifier,
            None => {
                let endpoint = config.classifier.endpoint.clone().ok_or_else(|| {
                    PipelineError::Internal("no classifier endpoint configured".to_string())
                })?;
                let client = HttpClassifier::new(endpoint, config.classifier.request_timeout())
                    .map_err(|e| PipelineError::Internal(e.to_string()))?;
                Arc::new(client)
            }
        };
        let inspector: Arc<dyn MediaInspector> = match self.inspector {
            Some(inspector) => inspector,
            None => Arc::new(FfprobeInspector::new(config.tools.ffprobe.clone())),
        };
        let frame_tool: Arc<dyn FrameTool> = match self.frame_tool {
            Some(tool) => tool,
            None => Arc::new(FfmpegTool::new(config.tools.ffmpeg.clone())),
        };

        let fetcher = Fetcher::new(&config.fetch)
            .map_err(|e| PipelineError::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Pipeline {
            fetcher,
            prober: Prober::new(inspector, MediaPolicy::from(&config.limits)),
            extractor: FrameExtractor::from_config(frame_tool, &config.extraction),
            deduplicator: Deduplicator::new(),
            classifier,
            aggregator: Aggregator::new(config.policy_threshold, config.engine_version.clone()),
            config,
        })
    }
}

/// Runs batches of media jobs end to end
pub struct Pipeline {
    config: PipelineConfig,
    fetcher: Fetcher,
    prober: Prober,
    extractor: FrameExtractor,
    deduplicator: Deduplicator,
    classifier: Arc<dyn Classifier>,
    aggregator: Aggregator,
}

impl Pipeline {
    #[must_use]
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Validate and run a batch request
    ///
    /// Only intake validation or workspace allocation can fail the call; every
    /// job-level failure is reported inside the response.
    pub async fn run_batch(&self, request: BatchRequest) -> Result<BatchResponse> {
        let batch = Batch::from_request(request, &self.config.limits)?;
        self.run(batch).await
    }

    /// Like [`Pipeline::run_batch`] for an untyped JSON request
    pub async fn run_json(&self, request: serde_json::Value) -> Result<BatchResponse> {
        let batch = Batch::from_json(request, &self.config.limits)?;
        self.run(batch).await
    }

    /// Run an already validated batch
    pub async fn run(&self, batch: Batch) -> Result<BatchResponse> {
        let started = Instant::now();
        info!(
            "Starting round {} with {} {} jobs",
            batch.round_id,
            batch.jobs.len(),
            batch.kind
        );

        let workspace = Workspace::allocate(&self.config.workspace_root, &batch.round_id).await?;
        let dispatcher = ScanDispatcher::spawn(
            Arc::clone(&self.classifier),
            DispatcherSettings::from_config(&self.config.dispatcher, self.config.policy_threshold),
        );
        let permits = Semaphore::new(self.config.job_parallelism.max(1));

        let results = self
            .run_jobs(&batch, &workspace, &dispatcher, &permits, started)
            .await;

        // Every job has resolved or was dropped at the deadline; nothing still
        // queued or in flight has a submitter left
        dispatcher.cancel();
        dispatcher.shutdown().await;
        if let Err(e) = workspace.release().await {
            error!("Failed to release round {}: {}", batch.round_id, e);
        }

        let total_frames: usize = results
            .values()
            .filter_map(|outcome| outcome.result.as_ref())
            .map(JobResult::frame_count)
            .sum();
        let elapsed = started.elapsed().as_secs_f64();
        let failed = results.values().filter(|o| o.error.is_some()).count();
        info!(
            "Round {} finished in {:.2}s: {} jobs, {} failed, {} frames scanned",
            batch.round_id,
            elapsed,
            results.len(),
            failed,
            total_frames
        );

        Ok(BatchResponse {
            round_id: batch.round_id,
            kind: batch.kind,
            engine_version: self.config.engine_version.clone(),
            total_frames,
            elapsed_secs: (elapsed * 100.0).round() / 100.0,
            results,
        })
    }

    /// Run every job under the batch deadline; unfinished jobs time out
    async fn run_jobs(
        &self,
        batch: &Batch,
        workspace: &Workspace,
        dispatcher: &ScanDispatcher,
        permits: &Semaphore,
        started: Instant,
    ) -> BTreeMap<String, JobOutcome> {
        let deadline = self.config.timeouts.batch();
        let mut results = BTreeMap::new();

        let mut running: FuturesUnordered<_> = batch
            .jobs
            .iter()
            .map(|job| self.run_job(workspace, dispatcher, permits, job, batch.kind))
            .collect();

        let expiry = tokio::time::sleep(deadline);
        tokio::pin!(expiry);
        loop {
            tokio::select! {
                next = running.next() => match next {
                    Some(outcome) => {
                        results.insert(outcome.job_id.clone(), outcome);
                    }
                    None => break,
                },
                () = &mut expiry => {
                    warn!(
                        "Round {} hit its {}s deadline with {} jobs unfinished",
                        batch.round_id,
                        deadline.as_secs(),
                        running.len()
                    );
                    break;
                }
            }
        }
        // Dropping the remaining futures kills their subprocesses and transfers
        drop(running);

        let elapsed = started.elapsed().as_secs_f64();
        for job in &batch.jobs {
            results.entry(job.job_id.clone()).or_insert_with(|| {
                let error = PipelineError::Timeout {
                    stage: Stage::Batch,
                    secs: deadline.as_secs(),
                };
                JobOutcome::failed(job.job_id.clone(), error.to_info(), elapsed)
            });
        }
        results
    }

    async fn run_job(
        &self,
        workspace: &Workspace,
        dispatcher: &ScanDispatcher,
        permits: &Semaphore,
        job: &Job,
        kind: MediaKind,
    ) -> JobOutcome {
        let ctx = workspace.job_context(&job.job_id, kind);
        let mut tracker = JobTracker::new(workspace.round_id(), &job.job_id);

        let permit = permits.acquire().await;
        let started = Instant::now();
        let result = match permit {
            Ok(_permit) => match kind {
                MediaKind::Images => self.process_image(&ctx, job, dispatcher, &mut tracker).await,
                MediaKind::Videos => self.process_video(&ctx, job, dispatcher, &mut tracker).await,
            },
            Err(e) => Err(PipelineError::Internal(format!("job scheduler closed: {e}"))),
        };
        let result = result.and_then(|result| {
            tracker.advance(JobState::Done)?;
            Ok(result)
        });

        let elapsed = started.elapsed().as_secs_f64();
        let outcome = match result {
            Ok(result) => JobOutcome::done(job.job_id.clone(), result, elapsed),
            Err(e) => {
                if let Err(transition) = tracker.fail(&e) {
                    warn!("Job {}: {}", job.job_id, transition);
                }
                JobOutcome::failed(job.job_id.clone(), e.to_info(), elapsed)
            }
        };

        if let Some(path) = ctx.done_marker() {
            let marker = CompletionMarker::from_outcome(workspace.round_id(), &outcome);
            if let Err(e) = marker.write(&path).await {
                warn!("Job {}: failed to write {}: {}", job.job_id, path.display(), e);
            }
        }
        if let Err(e) = ctx.cleanup().await {
            warn!("Job {}: cleanup failed: {}", job.job_id, e);
        }
        outcome
    }

    async fn process_image(
        &self,
        ctx: &JobContext,
        job: &Job,
        dispatcher: &ScanDispatcher,
        tracker: &mut JobTracker,
    ) -> Result<JobResult> {
        tracker.advance(JobState::Downloading)?;
        let asset = self.download(ctx, job).await?;
        let metadata = with_timeout(Stage::Probe, self.config.timeouts.probe(), async {
            image_metadata(&asset).await.map_err(PipelineError::from)
        })
        .await?;

        tracker.advance(JobState::Scanning)?;
        let unit = ScanUnit::image(&job.job_id, asset.path.clone(), ctx.relative_to_root(&asset.path));
        let scan = self
            .scan(dispatcher, vec![unit])
            .await?
            .pop()
            .ok_or_else(|| PipelineError::Internal("scan dispatcher returned no result".into()))?;

        tracker.advance(JobState::Aggregating)?;
        Ok(JobResult::Image(
            self.aggregator.aggregate_image(&asset, metadata, scan),
        ))
    }

    async fn process_video(
        &self,
        ctx: &JobContext,
        job: &Job,
        dispatcher: &ScanDispatcher,
        tracker: &mut JobTracker,
    ) -> Result<JobResult> {
        tracker.advance(JobState::Downloading)?;
        let asset = self.download(ctx, job).await?;

        tracker.advance(JobState::Probing)?;
        let metadata = with_timeout(Stage::Probe, self.config.timeouts.probe(), async {
            self.prober.probe(&asset).await.map_err(PipelineError::from)
        })
        .await?;

        tracker.advance(JobState::Extracting)?;
        let candidates = with_timeout(
            Stage::Extraction,
            self.config.timeouts.extraction(),
            async {
                self.extractor
                    .extract(ctx, &asset, &metadata)
                    .await
                    .map_err(PipelineError::from)
            },
        )
        .await?;

        tracker.advance(JobState::Deduplicating)?;
        let candidate_count = candidates.len();
        let dedup = self.deduplicator.dedupe(candidates).await?;
        info!(
            "Job {}: kept {} of {} frames ({} duplicates, {} unreadable)",
            job.job_id,
            dedup.canonical.len(),
            candidate_count,
            dedup.duplicates,
            dedup.unreadable
        );
        if dedup.canonical.is_empty() {
            return Err(PipelineError::NoFramesExtracted(format!(
                "none of {candidate_count} extracted frames were readable"
            )));
        }

        tracker.advance(JobState::Scanning)?;
        let units = dedup
            .canonical
            .iter()
            .map(|frame| ScanUnit::frame(frame, ctx.relative_to_root(&frame.path)))
            .collect();
        let frames = self.scan(dispatcher, units).await?;

        tracker.advance(JobState::Aggregating)?;
        Ok(JobResult::Video(
            self.aggregator.aggregate_video(&asset, &metadata, frames),
        ))
    }

    async fn download(&self, ctx: &JobContext, job: &Job) -> Result<MediaAsset> {
        let target = FetchTarget::from(ctx);
        let max_bytes = self.prober.policy().max_bytes(ctx.kind);
        with_timeout(Stage::Download, self.config.timeouts.download(), async {
            self.fetcher
                .fetch(&job.url, &target, max_bytes)
                .await
                .map_err(PipelineError::from)
        })
        .await
    }

    async fn scan(&self, dispatcher: &ScanDispatcher, units: Vec<ScanUnit>) -> Result<Vec<ScanResult>> {
        with_timeout(Stage::Scan, self.config.timeouts.scan(), async {
            Ok(dispatcher.submit(units).await)
        })
        .await
    }
}

/// Bound a stage by `limit`; on expiry the stage future is dropped
async fn with_timeout<T, F>(stage: Stage, limit: Duration, stage_future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, stage_future).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::Timeout {
            stage,
            secs: limit.as_secs(),
        }),
    }
}
