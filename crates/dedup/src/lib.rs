//! Content-addressed frame deduplication
//!
//! Frames are visited in strategy priority order (scene, uniform, luma spike),
//! then by timestamp. The first frame seen with a given blake3 hash is kept and
//! every later duplicate is deleted from disk. Hashes are scoped per job.

use futures::stream::{self, StreamExt};
use media_scan_common::{CandidateFrame, CanonicalFrame, PipelineError};
use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

const HASH_CONCURRENCY: usize = 8;
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("Hashing task failed: {0}")]
    Task(String),

    #[error("Failed to remove duplicate {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<DedupError> for PipelineError {
    fn from(err: DedupError) -> Self {
        PipelineError::Internal(err.to_string())
    }
}

/// Result of one deduplication pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupOutcome {
    pub canonical: Vec<CanonicalFrame>,
    /// Exact duplicates removed
    pub duplicates: usize,
    /// Frames dropped because they could not be read
    pub unreadable: usize,
}

impl DedupOutcome {
    #[must_use]
    pub fn discarded(&self) -> usize {
        self.duplicates + self.unreadable
    }
}

/// blake3 hex digest of a file's contents
pub async fn content_hash(path: &Path) -> std::io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file(&path))
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?
}

fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Collapses exact-duplicate frames
#[derive(Debug, Clone)]
pub struct Deduplicator {
    delete_discarded: bool,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self {
            delete_discarded: true,
        }
    }
}

impl Deduplicator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep discarded files on disk (inspection and tests)
    #[must_use]
    pub fn keep_discarded(mut self) -> Self {
        self.delete_discarded = false;
        self
    }

    /// Collapse `candidates` into canonical frames
    ///
    /// Idempotent: feeding the canonical output back in returns the same set.
    /// Existing hashes are trusted and not recomputed.
    pub async fn dedupe(&self, mut candidates: Vec<CandidateFrame>) -> Result<DedupOutcome, DedupError> {
        candidates.sort_by(|a, b| {
            a.strategy
                .priority()
                .cmp(&b.strategy.priority())
                .then(a.timestamp_secs.total_cmp(&b.timestamp_secs))
                .then_with(|| a.path.cmp(&b.path))
        });

        let hashed: Vec<(CandidateFrame, std::io::Result<String>)> = stream::iter(candidates)
            .map(|frame| async move {
                let hash = match &frame.hash {
                    Some(hash) => Ok(hash.clone()),
                    None => content_hash(&frame.path).await,
                };
                (frame, hash)
            })
            .buffered(HASH_CONCURRENCY)
            .collect()
            .await;

        let mut seen: HashSet<(String, String)> = HashSet::with_capacity(hashed.len());
        let mut outcome = DedupOutcome::default();
        for (frame, hash) in hashed {
            let hash = match hash {
                Ok(hash) => hash,
                Err(e) => {
                    warn!("Dropping unreadable frame {}: {}", frame.path.display(), e);
                    outcome.unreadable += 1;
                    self.discard(&frame.path).await?;
                    continue;
                }
            };

            if seen.insert((frame.job_id.clone(), hash.clone())) {
                outcome.canonical.push(CanonicalFrame {
                    job_id: frame.job_id,
                    strategy: frame.strategy,
                    timestamp_secs: frame.timestamp_secs,
                    path: frame.path,
                    hash,
                });
            } else {
                debug!(
                    "Duplicate {} frame at {:.2}s ({})",
                    frame.strategy, frame.timestamp_secs, hash
                );
                outcome.duplicates += 1;
                self.discard(&frame.path).await?;
            }
        }

        info!(
            "Dedup kept {} frames, discarded {} duplicates and {} unreadable",
            outcome.canonical.len(),
            outcome.duplicates,
            outcome.unreadable
        );
        Ok(outcome)
    }

    async fn discard(&self, path: &Path) -> Result<(), DedupError> {
        if !self.delete_discarded {
            return Ok(());
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(DedupError::Remove {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}
