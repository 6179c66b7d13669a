//! Pipeline error taxonomy
//!
//! Every component error converts into [`PipelineError`], whose [`ErrorKind`]
//! is what ends up in the batch response.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Serializable discriminant of a [`PipelineError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DownloadError,
    UnsupportedFormatError,
    PolicyViolationError,
    NoFramesExtractedError,
    ScanError,
    TimeoutError,
    InternalError,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DownloadError => "download_error",
            Self::UnsupportedFormatError => "unsupported_format_error",
            Self::PolicyViolationError => "policy_violation_error",
            Self::NoFramesExtractedError => "no_frames_extracted_error",
            Self::ScanError => "scan_error",
            Self::TimeoutError => "timeout_error",
            Self::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage names, used for timeout reporting and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    Probe,
    Extraction,
    Deduplication,
    Scan,
    Batch,
}

impl Stage {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Probe => "probe",
            Self::Extraction => "extraction",
            Self::Deduplication => "deduplication",
            Self::Scan => "scan",
            Self::Batch => "batch",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors surfaced at job or batch level
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    #[error("Download failed: {0}")]
    Download(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("No frames extracted: {0}")]
    NoFramesExtracted(String),

    #[error("Scan failed: {0}")]
    Scan(String),

    #[error("{stage} stage timed out after {secs}s")]
    Timeout { stage: Stage, secs: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Download(_) => ErrorKind::DownloadError,
            Self::UnsupportedFormat(_) => ErrorKind::UnsupportedFormatError,
            Self::PolicyViolation(_) => ErrorKind::PolicyViolationError,
            Self::NoFramesExtracted(_) => ErrorKind::NoFramesExtractedError,
            Self::Scan(_) => ErrorKind::ScanError,
            Self::Timeout { .. } => ErrorKind::TimeoutError,
            Self::Internal(_) => ErrorKind::InternalError,
        }
    }

    /// Convert into the wire representation carried by failed jobs
    #[must_use]
    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Internal(format!("IO error: {err}"))
    }
}

/// Error as reported in a batch response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
