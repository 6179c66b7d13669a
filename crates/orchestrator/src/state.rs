//! Per-job state machine

use media_scan_common::{ErrorInfo, PipelineError};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{info, warn};

/// Lifecycle state of one job
///
/// States only move forward. Image jobs skip the video-only stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Downloading,
    Probing,
    Extracting,
    Deduplicating,
    Scanning,
    Aggregating,
    Done,
    Failed { reason: ErrorInfo },
}

impl JobState {
    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Downloading => 1,
            Self::Probing => 2,
            Self::Extracting => 3,
            Self::Deduplicating => 4,
            Self::Scanning => 5,
            Self::Aggregating => 6,
            Self::Done | Self::Failed { .. } => 7,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed { .. })
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Probing => "probing",
            Self::Extracting => "extracting",
            Self::Deduplicating => "deduplicating",
            Self::Scanning => "scanning",
            Self::Aggregating => "aggregating",
            Self::Done => "done",
            Self::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("illegal job transition {from} -> {to}")]
pub struct TransitionError {
    pub from: &'static str,
    pub to: &'static str,
}

impl From<TransitionError> for PipelineError {
    fn from(err: TransitionError) -> Self {
        PipelineError::Internal(err.to_string())
    }
}

/// Tracks one job's state and logs every transition
#[derive(Debug)]
pub struct JobTracker {
    round_id: String,
    job_id: String,
    state: JobState,
    history: Vec<&'static str>,
}

impl JobTracker {
    #[must_use]
    pub fn new(round_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            round_id: round_id.into(),
            job_id: job_id.into(),
            state: JobState::Pending,
            history: vec![JobState::Pending.name()],
        }
    }

    #[must_use]
    pub fn state(&self) -> &JobState {
        &self.state
    }

    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Names of every state visited, in order
    #[must_use]
    pub fn history(&self) -> &[&'static str] {
        &self.history
    }

    /// Move to a later non-failed state
    pub fn advance(&mut self, next: JobState) -> Result<(), TransitionError> {
        let is_failure = matches!(next, JobState::Failed { .. });
        if is_failure || self.state.is_terminal() || next.rank() <= self.state.rank() {
            return Err(TransitionError {
                from: self.state.name(),
                to: next.name(),
            });
        }
        self.set(next);
        Ok(())
    }

    /// Move to `Failed`; only valid from a non-terminal state
    pub fn fail(&mut self, error: &PipelineError) -> Result<(), TransitionError> {
        if self.state.is_terminal() {
            return Err(TransitionError {
                from: self.state.name(),
                to: "failed",
            });
        }
        warn!(
            "Round {} job {} failed while {}: {}",
            self.round_id, self.job_id, self.state, error
        );
        self.set(JobState::Failed {
            reason: error.to_info(),
        });
        Ok(())
    }

    fn set(&mut self, next: JobState) {
        info!(
            "Round {} job {}: {} -> {}",
            self.round_id, self.job_id, self.state, next
        );
        self.history.push(next.name());
        self.state = next;
    }
}
