//! `media-scan probe`

use super::load_config;
use anyhow::{Context as _, Result};
use clap::Args;
use media_scan_common::{MediaAsset, MediaKind};
use media_scan_ingestion::{FfprobeInspector, MediaInspector, MediaPolicy};
use serde_json::json;
use std::path::PathBuf;

#[derive(Args)]
pub struct ProbeCommand {
    /// Local video file
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// YAML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

impl ProbeCommand {
    pub async fn execute(self) -> Result<()> {
        let config = load_config(self.config.as_deref())?;
        let byte_size = tokio::fs::metadata(&self.input)
            .await
            .with_context(|| format!("Cannot read {}", self.input.display()))?
            .len();

        let inspector = FfprobeInspector::new(config.tools.ffprobe.clone());
        let metadata = inspector
            .inspect(&self.input)
            .await
            .with_context(|| format!("Failed to probe {}", self.input.display()))?;

        let file_name = self
            .input
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let asset = MediaAsset {
            path: self.input.clone(),
            byte_size,
            extension: self
                .input
                .extension()
                .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default(),
            kind: MediaKind::Videos,
            original_filename: file_name,
        };

        let policy = MediaPolicy::from(&config.limits);
        let decision = match policy.enforce(&asset, &metadata) {
            Ok(()) => json!({ "allowed": true }),
            Err(e) => json!({ "allowed": false, "reason": e.to_string() }),
        };

        let report = json!({
            "file": self.input.display().to_string(),
            "size_mb": asset.size_mb(),
            "metadata": metadata,
            "policy": decision,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    }
}
