pub mod probe;
pub mod run;

use anyhow::{Context as _, Result};
use media_scan_common::PipelineConfig;
use std::path::Path;

/// Defaults, then the optional YAML file, then `MEDIA_SCAN_*` variables
pub fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => PipelineConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    config
        .apply_env()
        .context("Invalid MEDIA_SCAN_* environment override")?;
    Ok(config)
}
