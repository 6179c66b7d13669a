//! `media-scan run`

use super::load_config;
use anyhow::{Context as _, Result};
use clap::Args;
use media_scan_orchestrator::{handle_event, Pipeline};
use std::path::PathBuf;
use tokio::io::AsyncReadExt;
use tracing::info;

#[derive(Args)]
pub struct RunCommand {
    /// Batch request JSON (`{"type": ..., "jobs": [...]}`), or `-` for stdin
    #[arg(short, long, value_name = "FILE")]
    request: String,

    /// YAML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory under which each round gets its workspace
    #[arg(long, value_name = "DIR")]
    workspace_root: Option<PathBuf>,

    /// Classification endpoint
    #[arg(long, value_name = "URL")]
    classifier_url: Option<String>,

    /// Maximum number of jobs processed concurrently
    #[arg(long, value_name = "N")]
    job_parallelism: Option<usize>,
}

impl RunCommand {
    pub async fn execute(self) -> Result<()> {
        let mut config = load_config(self.config.as_deref())?;
        if let Some(root) = self.workspace_root {
            config.workspace_root = root;
        }
        if let Some(url) = self.classifier_url {
            config.classifier.endpoint = Some(url);
        }
        if let Some(n) = self.job_parallelism {
            config.job_parallelism = n;
        }

        let body = if self.request == "-" {
            let mut body = String::new();
            tokio::io::stdin()
                .read_to_string(&mut body)
                .await
                .context("Failed to read request from stdin")?;
            body
        } else {
            tokio::fs::read_to_string(&self.request)
                .await
                .with_context(|| format!("Failed to read request {}", self.request))?
        };
        let event: serde_json::Value =
            serde_json::from_str(&body).context("Request is not valid JSON")?;

        info!("Workspace root: {}", config.workspace_root.display());
        let pipeline = Pipeline::builder(config)
            .build()
            .context("Failed to build pipeline")?;

        let envelope = handle_event(&pipeline, event).await;
        println!("{}", serde_json::to_string_pretty(&envelope)?);

        if envelope["status"] != "success" {
            anyhow::bail!("batch request was rejected");
        }
        Ok(())
    }
}
