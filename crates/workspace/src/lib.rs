//! Per-batch scoped workspace
//!
//! Layout under the configured root:
//!
//! ```text
//! {root}/{round_id}/images/{job_id}.{ext}
//! {root}/{round_id}/videos/{job_id}/source.{ext}
//! {root}/{round_id}/videos/{job_id}/frames/{strategy}/frame_%04d.jpg
//! {root}/{round_id}/videos/{job_id}/done.json
//! ```
//!
//! Every path is derived from `(round_id, job_id)`; nothing reads an ambient
//! directory. The round directory is removed by [`Workspace::release`], or by
//! `Drop` if the owner never released it.

use media_scan_common::{FrameStrategy, MediaKind, PipelineError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Name of the per-job completion marker
pub const DONE_MARKER: &str = "done.json";

/// Stem of a downloaded video inside its job directory
const VIDEO_ASSET_STEM: &str = "source";

/// Suffix of in-progress downloads
pub const PARTIAL_SUFFIX: &str = "part";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Round directory already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("Workspace IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<WorkspaceError> for PipelineError {
    fn from(err: WorkspaceError) -> Self {
        PipelineError::Internal(err.to_string())
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> WorkspaceError + '_ {
    move |source| WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Directory tree owned by one batch
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    round_id: String,
    base_path: PathBuf,
    released: AtomicBool,
}

impl Workspace {
    /// Create `{root}/{round_id}`; fails if it already exists
    pub async fn allocate(root: &Path, round_id: &str) -> Result<Self, WorkspaceError> {
        tokio::fs::create_dir_all(root).await.map_err(io_err(root))?;

        let base_path = root.join(round_id);
        match tokio::fs::create_dir(&base_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(WorkspaceError::AlreadyExists(base_path));
            }
            Err(e) => return Err(io_err(&base_path)(e)),
        }

        info!("Allocated workspace {}", base_path.display());
        Ok(Self {
            root: root.to_path_buf(),
            round_id: round_id.to_string(),
            base_path,
            released: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    #[must_use]
    pub fn round_id(&self) -> &str {
        &self.round_id
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path context for one job of this batch
    #[must_use]
    pub fn job_context(&self, job_id: &str, kind: MediaKind) -> JobContext {
        JobContext {
            root: self.root.clone(),
            round_id: self.round_id.clone(),
            job_id: job_id.to_string(),
            kind,
            base_path: self.base_path.clone(),
        }
    }

    /// Remove the whole round directory; safe to call more than once
    ///
    /// A failed removal leaves the workspace unreleased, so `Drop` tries again.
    pub async fn release(&self) -> Result<(), WorkspaceError> {
        match tokio::fs::remove_dir_all(&self.base_path).await {
            Ok(()) => info!("Released workspace {}", self.base_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Workspace {} already removed", self.base_path.display());
            }
            Err(e) => return Err(io_err(&self.base_path)(e)),
        }
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released.load(Ordering::SeqCst) {
            return;
        }
        warn!(
            "Workspace {} dropped without release, removing",
            self.base_path.display()
        );
        if let Err(e) = std::fs::remove_dir_all(&self.base_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", self.base_path.display(), e);
            }
        }
    }
}

/// Paths of one job, threaded through every stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub root: PathBuf,
    pub round_id: String,
    pub job_id: String,
    pub kind: MediaKind,
    pub base_path: PathBuf,
}

impl JobContext {
    /// Directory the downloaded asset lands in
    #[must_use]
    pub fn asset_dir(&self) -> PathBuf {
        match self.kind {
            MediaKind::Images => self.base_path.join(MediaKind::Images.dir_name()),
            MediaKind::Videos => self.job_dir(),
        }
    }

    /// File stem of the downloaded asset (extension decided by the fetcher)
    #[must_use]
    pub fn asset_stem(&self) -> &str {
        match self.kind {
            MediaKind::Images => &self.job_id,
            MediaKind::Videos => VIDEO_ASSET_STEM,
        }
    }

    /// Final asset path for a given extension
    #[must_use]
    pub fn asset_path(&self, extension: &str) -> PathBuf {
        self.asset_dir()
            .join(format!("{}.{}", self.asset_stem(), extension))
    }

    /// Where the asset streams to before it is complete
    #[must_use]
    pub fn partial_path(&self) -> PathBuf {
        self.asset_dir()
            .join(format!("{}.{}", self.asset_stem(), PARTIAL_SUFFIX))
    }

    /// Per-job directory (video jobs only own one)
    #[must_use]
    pub fn job_dir(&self) -> PathBuf {
        self.base_path
            .join(MediaKind::Videos.dir_name())
            .join(&self.job_id)
    }

    #[must_use]
    pub fn frames_dir(&self) -> PathBuf {
        self.job_dir().join("frames")
    }

    /// Output directory of one extraction strategy
    #[must_use]
    pub fn strategy_dir(&self, strategy: FrameStrategy) -> PathBuf {
        self.frames_dir().join(strategy.name())
    }

    /// Completion marker path; images have none
    #[must_use]
    pub fn done_marker(&self) -> Option<PathBuf> {
        match self.kind {
            MediaKind::Images => None,
            MediaKind::Videos => Some(self.job_dir().join(DONE_MARKER)),
        }
    }

    /// `path` relative to the workspace root, with forward slashes
    #[must_use]
    pub fn relative_to_root(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Remove the job's media and frames
    ///
    /// The completion marker survives until the batch workspace is released.
    pub async fn cleanup(&self) -> Result<(), WorkspaceError> {
        match self.kind {
            MediaKind::Images => self.cleanup_image().await,
            MediaKind::Videos => self.cleanup_video().await,
        }
    }

    async fn cleanup_image(&self) -> Result<(), WorkspaceError> {
        let dir = self.asset_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_err(&dir)(e)),
        };

        let prefix = format!("{}.", self.job_id);
        while let Some(entry) = entries.next_entry().await.map_err(io_err(&dir))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(suffix) = name.strip_prefix(&prefix) else {
                continue;
            };
            if suffix == PARTIAL_SUFFIX || self.kind.supports_extension(suffix) {
                remove_file(&entry.path()).await?;
            }
        }
        Ok(())
    }

    async fn cleanup_video(&self) -> Result<(), WorkspaceError> {
        let dir = self.job_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_err(&dir)(e)),
        };

        while let Some(entry) = entries.next_entry().await.map_err(io_err(&dir))? {
            if entry.file_name() == DONE_MARKER {
                continue;
            }
            let path = entry.path();
            let file_type = entry.file_type().await.map_err(io_err(&path))?;
            if file_type.is_dir() {
                match tokio::fs::remove_dir_all(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(io_err(&path)(e)),
                }
            } else {
                remove_file(&path).await?;
            }
        }
        debug!("Cleaned up job {} in round {}", self.job_id, self.round_id);
        Ok(())
    }
}

async fn remove_file(path: &Path) -> Result<(), WorkspaceError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(path)(e)),
    }
}
