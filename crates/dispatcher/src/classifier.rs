//! Classification capability and its HTTP client

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Label whose probability is the NSFW score when none is given explicitly
pub const NSFW_LABEL: &str = "nsfw";

/// Per-image outcome returned by a classifier
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    Scored {
        nsfw_score: f32,
        probs: BTreeMap<String, f32>,
    },
    /// The classifier rejected this one input (e.g. undecodable image)
    Failed(String),
}

/// Whole-call classifier failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClassifierError {
    /// Worth retrying: timeouts, overload, resource exhaustion
    #[error("transient classifier failure: {0}")]
    Transient(String),

    #[error("classifier failure: {0}")]
    Fatal(String),
}

impl ClassifierError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Accepts a bounded batch of encoded images and scores each one
///
/// Implementations must return exactly one outcome per input, in input order.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, images: Vec<Bytes>) -> Result<Vec<UnitOutcome>, ClassifierError>;
}

#[derive(Debug, Serialize)]
struct ClassifyRequest {
    images: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    results: Vec<ClassifyItem>,
}

#[derive(Debug, Deserialize)]
struct ClassifyItem {
    #[serde(default)]
    nsfw_score: Option<f32>,
    #[serde(default)]
    probs: BTreeMap<String, f32>,
    #[serde(default)]
    error: Option<String>,
}

impl From<ClassifyItem> for UnitOutcome {
    fn from(item: ClassifyItem) -> Self {
        if let Some(error) = item.error {
            return UnitOutcome::Failed(error);
        }
        let nsfw_score = item
            .nsfw_score
            .or_else(|| item.probs.get(NSFW_LABEL).copied())
            .unwrap_or(0.0);
        UnitOutcome::Scored {
            nsfw_score,
            probs: item.probs,
        }
    }
}

/// Remote classifier speaking JSON over HTTP
///
/// Request: `{"images": [<base64>, ...]}`.
/// Response: `{"results": [{"nsfw_score": f, "probs": {label: f}} | {"error": "..."}]}`.
#[derive(Debug, Clone)]
pub struct HttpClassifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpClassifier {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ClassifierError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClassifierError::Fatal(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, images: Vec<Bytes>) -> Result<Vec<UnitOutcome>, ClassifierError> {
        let count = images.len();
        let body = ClassifyRequest {
            images: images.iter().map(|img| BASE64.encode(img)).collect(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    ClassifierError::Transient(e.to_string())
                } else {
                    ClassifierError::Fatal(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(ClassifierError::Transient(format!(
                "classifier returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(ClassifierError::Fatal(format!(
                "classifier returned {status}"
            )));
        }

        let parsed: ClassifyResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ClassifierError::Transient(e.to_string())
            } else {
                ClassifierError::Fatal(format!("Failed to parse classifier response: {e}"))
            }
        })?;

        debug!("Classifier scored {} of {} images", parsed.results.len(), count);
        Ok(parsed.results.into_iter().map(UnitOutcome::from).collect())
    }
}
