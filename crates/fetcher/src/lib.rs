//! Size-bounded media downloads
//!
//! The body streams into `{stem}.part` and is renamed to `{stem}.{ext}` only
//! once it is complete, within the byte ceiling, and its signature matches the
//! batch's media kind. On any failure the partial file is removed.

pub mod sniff;

use futures::StreamExt;
use media_scan_common::{FetchConfig, MediaAsset, MediaKind, PipelineError};
use media_scan_workspace::JobContext;
use reqwest::Client as HttpClient;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub use sniff::{
    extension_from_content_type, extension_from_url, filename_from_url, sniff_signature,
    Signature, SNIFF_LEN,
};

/// Fetch errors
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP request failed with status: {0}")]
    Status(u16),

    #[error("Resource exceeds size limit: {received} bytes received (max: {max})")]
    TooLarge { received: u64, max: u64 },

    #[error("Declared Content-Length {declared} exceeds size limit of {max} bytes")]
    DeclaredTooLarge { declared: u64, max: u64 },

    #[error("No data received for {0:?}")]
    Stalled(Duration),

    #[error("Empty response body")]
    EmptyBody,

    #[error("Unsupported format: {0}")]
    Unsupported(String),

    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<FetchError> for PipelineError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Unsupported(message) => PipelineError::UnsupportedFormat(message),
            FetchError::Io { .. } => PipelineError::Internal(err.to_string()),
            other => PipelineError::Download(other.to_string()),
        }
    }
}

/// Where a download lands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTarget {
    pub dir: PathBuf,
    pub stem: String,
    pub kind: MediaKind,
}

impl FetchTarget {
    #[must_use]
    pub fn partial_path(&self) -> PathBuf {
        self.dir.join(format!(
            "{}.{}",
            self.stem,
            media_scan_workspace::PARTIAL_SUFFIX
        ))
    }

    #[must_use]
    pub fn final_path(&self, extension: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", self.stem, extension))
    }
}

impl From<&JobContext> for FetchTarget {
    fn from(ctx: &JobContext) -> Self {
        Self {
            dir: ctx.asset_dir(),
            stem: ctx.asset_stem().to_string(),
            kind: ctx.kind,
        }
    }
}

/// HTTP fetcher shared by all jobs of a batch
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: HttpClient,
    read_timeout: Duration,
}

impl Fetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let client = HttpClient::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            read_timeout: Duration::from_secs(config.read_timeout_secs),
        })
    }

    /// Download `url` into `target`, never writing more than `max_bytes`
    pub async fn fetch(
        &self,
        url: &str,
        target: &FetchTarget,
        max_bytes: u64,
    ) -> Result<MediaAsset, FetchError> {
        let partial = target.partial_path();
        let result = self.fetch_inner(url, target, &partial, max_bytes).await;
        if result.is_err() {
            remove_partial(&partial).await;
        }
        result
    }

    async fn fetch_inner(
        &self,
        url: &str,
        target: &FetchTarget,
        partial: &Path,
        max_bytes: u64,
    ) -> Result<MediaAsset, FetchError> {
        debug!("Fetching {} ({} max {} bytes)", url, target.kind, max_bytes);

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        if let Some(declared) = response.content_length() {
            if declared > max_bytes {
                return Err(FetchError::DeclaredTooLarge {
                    declared,
                    max: max_bytes,
                });
            }
        }

        let content_type_ext = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|ct| ct.to_str().ok())
            .and_then(extension_from_content_type);

        tokio::fs::create_dir_all(&target.dir)
            .await
            .map_err(|source| FetchError::Io {
                path: target.dir.clone(),
                source,
            })?;
        let mut file = File::create(partial).await.map_err(|source| FetchError::Io {
            path: partial.to_path_buf(),
            source,
        })?;

        let mut head: Vec<u8> = Vec::with_capacity(SNIFF_LEN);
        let mut received: u64 = 0;
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::time::timeout(self.read_timeout, stream.next())
                .await
                .map_err(|_| FetchError::Stalled(self.read_timeout))?;
            let Some(chunk) = next else { break };
            let chunk = chunk?;

            received += chunk.len() as u64;
            if received > max_bytes {
                warn!(
                    "Aborting download of {}: {} bytes exceeds limit of {}",
                    url, received, max_bytes
                );
                return Err(FetchError::TooLarge {
                    received,
                    max: max_bytes,
                });
            }

            if head.len() < SNIFF_LEN {
                let take = (SNIFF_LEN - head.len()).min(chunk.len());
                head.extend_from_slice(&chunk[..take]);
            }

            file.write_all(&chunk)
                .await
                .map_err(|source| FetchError::Io {
                    path: partial.to_path_buf(),
                    source,
                })?;
        }
        file.flush().await.map_err(|source| FetchError::Io {
            path: partial.to_path_buf(),
            source,
        })?;
        drop(file);

        if received == 0 {
            return Err(FetchError::EmptyBody);
        }

        let extension = resolve_extension(url, content_type_ext, &head, target.kind)?;
        let final_path = target.final_path(&extension);
        tokio::fs::rename(partial, &final_path)
            .await
            .map_err(|source| FetchError::Io {
                path: final_path.clone(),
                source,
            })?;

        info!(
            "Downloaded {} bytes from {} to {}",
            received,
            url,
            final_path.display()
        );

        Ok(MediaAsset {
            original_filename: filename_from_url(url)
                .unwrap_or_else(|| format!("{}.{}", target.stem, extension)),
            path: final_path,
            byte_size: received,
            extension,
            kind: target.kind,
        })
    }
}

/// Pick the stored extension and check the signature agrees with `kind`
///
/// Declared extensions come from the URL, then the `Content-Type`; the sniffed
/// signature is the fallback. A signature of the other media kind is rejected
/// whatever was declared.
pub fn resolve_extension(
    url: &str,
    content_type_ext: Option<&str>,
    head: &[u8],
    kind: MediaKind,
) -> Result<String, FetchError> {
    let sniffed = sniff_signature(head);
    if let Some(signature) = sniffed {
        if signature.kind != kind {
            return Err(FetchError::Unsupported(format!(
                "content looks like {} ({}) but batch expects {}",
                signature.kind, signature.extension, kind
            )));
        }
    }

    let declared = extension_from_url(url)
        .filter(|ext| kind.supports_extension(ext))
        .or_else(|| {
            content_type_ext
                .filter(|ext| kind.supports_extension(ext))
                .map(str::to_string)
        });

    match (declared, sniffed) {
        (Some(ext), _) => Ok(ext),
        (None, Some(signature)) => Ok(signature.extension.to_string()),
        (None, None) => Err(FetchError::Unsupported(format!(
            "no supported {} extension or signature for {}",
            kind, url
        ))),
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial download {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}
