//! Batch media moderation pipeline
//!
//! Re-exports the pipeline entry points. The building blocks live in the
//! `media-scan-*` crates under `crates/`.

pub use media_scan_common::{
    BatchRequest, BatchResponse, ErrorKind, JobOutcome, JobResult, JobSpec, JobStatus, MediaKind,
    PipelineConfig, PipelineError, Verdict,
};
pub use media_scan_orchestrator::{handle_event, JobState, Pipeline, PipelineBuilder};
