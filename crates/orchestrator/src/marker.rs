//! `done.json` completion markers for video jobs

use chrono::{DateTime, Utc};
use media_scan_common::{ErrorInfo, JobOutcome, JobResult, JobStatus};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// What a finished video job leaves behind until the round is released
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMarker {
    pub job_id: String,
    pub round_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub frame_count: usize,
    pub elapsed_secs: f64,
    pub finished_at: DateTime<Utc>,
}

impl CompletionMarker {
    #[must_use]
    pub fn from_outcome(round_id: &str, outcome: &JobOutcome) -> Self {
        Self {
            job_id: outcome.job_id.clone(),
            round_id: round_id.to_string(),
            status: outcome.status,
            result: outcome.result.clone(),
            error: outcome.error.clone(),
            frame_count: outcome.result.as_ref().map_or(0, JobResult::frame_count),
            elapsed_secs: outcome.elapsed_secs,
            finished_at: Utc::now(),
        }
    }

    /// Write the marker, creating the job directory if the job never got that far
    pub async fn write(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, body).await?;
        debug!("Wrote completion marker {}", path.display());
        Ok(())
    }

    pub async fn read(path: &Path) -> std::io::Result<Self> {
        let body = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&body)?)
    }
}
