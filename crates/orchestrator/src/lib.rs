//! Media scan pipeline controller
//!
//! Drives each job of a batch through its stages:
//!
//! - images: download, header inspection, scan, aggregate
//! - videos: download, probe, frame extraction, deduplication, scan, aggregate
//!
//! Jobs run concurrently up to `job_parallelism` and share one scan
//! dispatcher. Every stage has its own timeout and the whole batch has a
//! deadline. The batch response always covers every submitted job, and the
//! round's workspace is released whatever the outcome.

pub mod marker;
pub mod pipeline;
pub mod state;

pub use marker::CompletionMarker;
pub use pipeline::{Pipeline, PipelineBuilder};
pub use state::{JobState, JobTracker, TransitionError};

use serde_json::{json, Value};
use tracing::warn;

/// Serverless-style entry point
///
/// Returns `{"status": "success", "results": <response>}`, or
/// `{"status": "error", "message": ...}` when the request itself is rejected.
pub async fn handle_event(pipeline: &Pipeline, event: Value) -> Value {
    match pipeline.run_json(event).await {
        Ok(response) => json!({
            "status": "success",
            "results": response,
        }),
        Err(e) => {
            warn!("Rejected batch request: {}", e);
            json!({
                "status": "error",
                "message": e.to_string(),
            })
        }
    }
}
