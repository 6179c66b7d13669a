//! Batch request intake
//!
//! The wire request is parsed and validated once; everything downstream works
//! with the typed [`Batch`]. Any violation rejects the whole request before a
//! single byte is fetched.

use crate::config::LimitsConfig;
use crate::error::{PipelineError, Result};
use crate::types::{Batch, Job, MediaKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

/// Wire shape of a batch request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub jobs: Vec<JobSpec>,
}

/// Wire shape of one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub url: String,
}

impl Batch {
    /// Validate a request and assign a fresh round identifier
    pub fn from_request(request: BatchRequest, limits: &LimitsConfig) -> Result<Self> {
        Self::with_round_id(request, limits, Uuid::new_v4().to_string())
    }

    /// Validate a request under a caller-chosen round identifier
    pub fn with_round_id(
        request: BatchRequest,
        limits: &LimitsConfig,
        round_id: String,
    ) -> Result<Self> {
        if !is_path_safe(&round_id) {
            return Err(invalid(format!("round id {round_id:?} is not path-safe")));
        }

        let max_jobs = match request.kind {
            MediaKind::Images => limits.max_image_jobs,
            MediaKind::Videos => limits.max_video_jobs,
        };
        if request.jobs.is_empty() {
            return Err(invalid("request contains no jobs".to_string()));
        }
        if request.jobs.len() > max_jobs {
            return Err(invalid(format!(
                "{} {} jobs exceeds the limit of {}",
                request.jobs.len(),
                request.kind,
                max_jobs
            )));
        }

        let mut seen = HashSet::with_capacity(request.jobs.len());
        let mut jobs = Vec::with_capacity(request.jobs.len());
        for (index, spec) in request.jobs.into_iter().enumerate() {
            let job_id = spec.job_id.trim().to_string();
            let url = spec.url.trim().to_string();

            if job_id.is_empty() {
                return Err(invalid(format!("job #{index} has an empty job_id")));
            }
            if !is_path_safe(&job_id) {
                return Err(invalid(format!("job_id {job_id:?} is not path-safe")));
            }
            if !seen.insert(job_id.clone()) {
                return Err(invalid(format!("duplicate job_id {job_id:?}")));
            }
            if !is_fetchable_url(&url) {
                return Err(invalid(format!("job {job_id:?} has an invalid url {url:?}")));
            }
            jobs.push(Job { job_id, url });
        }

        debug!(
            "Accepted batch {} with {} {} jobs",
            round_id,
            jobs.len(),
            request.kind
        );

        Ok(Self {
            round_id,
            kind: request.kind,
            jobs,
        })
    }

    /// Parse and validate a raw JSON request
    pub fn from_json(value: serde_json::Value, limits: &LimitsConfig) -> Result<Self> {
        let request: BatchRequest = serde_json::from_value(value)
            .map_err(|e| invalid(format!("malformed request: {e}")))?;
        Self::from_request(request, limits)
    }
}

fn invalid(message: String) -> PipelineError {
    PipelineError::Internal(format!("Invalid request: {message}"))
}

/// A single path component that cannot escape its parent directory
fn is_path_safe(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id.len() <= 128
        && !id
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_control())
}

fn is_fetchable_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    let rest = if let Some(rest) = lower.strip_prefix("https://") {
        rest
    } else if let Some(rest) = lower.strip_prefix("http://") {
        rest
    } else {
        return false;
    };
    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    !host.is_empty() && !url.chars().any(char::is_whitespace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn limits() -> LimitsConfig {
        LimitsConfig::default()
    }

    fn video_jobs(count: usize) -> Vec<serde_json::Value> {
        (0..count)
            .map(|i| json!({"job_id": format!("v{i}"), "url": format!("https://cdn.example.com/{i}.mp4")}))
            .collect()
    }

    #[test]
    fn test_valid_request() {
        let batch = Batch::from_json(
            json!({"type": "images", "jobs": [
                {"job_id": "a", "url": "https://example.com/a.jpg"},
                {"job_id": "b", "url": "http://example.com/b.png"}
            ]}),
            &limits(),
        )
        .unwrap();
        assert_eq!(batch.kind, MediaKind::Images);
        assert_eq!(batch.jobs.len(), 2);
        assert_eq!(batch.jobs[1].job_id, "b");
        assert!(Uuid::parse_str(&batch.round_id).is_ok());
    }

    #[test]
    fn test_video_job_limit() {
        let ok = Batch::from_json(json!({"type": "videos", "jobs": video_jobs(10)}), &limits());
        assert!(ok.is_ok());

        let err = Batch::from_json(json!({"type": "videos", "jobs": video_jobs(11)}), &limits())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalError);
    }

    #[test]
    fn test_empty_jobs_rejected() {
        let err = Batch::from_json(json!({"type": "images", "jobs": []}), &limits()).unwrap_err();
        assert!(err.to_string().contains("no jobs"));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = Batch::from_json(
            json!({"type": "audio", "jobs": [{"job_id": "a", "url": "https://x/a.mp3"}]}),
            &limits(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalError);
    }

    #[test]
    fn test_duplicate_job_id_rejected() {
        let err = Batch::from_json(
            json!({"type": "images", "jobs": [
                {"job_id": "a", "url": "https://example.com/1.jpg"},
                {"job_id": "a", "url": "https://example.com/2.jpg"}
            ]}),
            &limits(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_path_traversal_rejected() {
        for bad in ["..", "a/b", "a\\b", ""] {
            let result = Batch::from_json(
                json!({"type": "images", "jobs": [{"job_id": bad, "url": "https://example.com/1.jpg"}]}),
                &limits(),
            );
            assert!(result.is_err(), "job_id {bad:?} should be rejected");
        }
    }

    #[test]
    fn test_url_scheme_checked() {
        for bad in ["ftp://example.com/a.jpg", "file:///etc/passwd", "https://", "not a url"] {
            let result = Batch::from_json(
                json!({"type": "images", "jobs": [{"job_id": "a", "url": bad}]}),
                &limits(),
            );
            assert!(result.is_err(), "url {bad:?} should be rejected");
        }
    }

    #[test]
    fn test_missing_url_rejected() {
        let result = Batch::from_json(
            json!({"type": "images", "jobs": [{"job_id": "a"}]}),
            &limits(),
        );
        assert!(result.is_err());
    }
}
