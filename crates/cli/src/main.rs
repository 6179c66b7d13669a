//! media-scan - batch media moderation from the command line

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

use commands::probe::ProbeCommand;
use commands::run::RunCommand;

#[derive(Parser)]
#[command(
    name = "media-scan",
    version,
    about = "Download, sample and classify batches of images or videos",
    after_help = "EXAMPLES:\n  \
                  # Run a batch request from a file\n  \
                  media-scan run --request batch.json --classifier-url http://localhost:9000/classify\n\n  \
                  # Read the request from stdin with a YAML config\n  \
                  cat batch.json | media-scan run --request - --config media-scan.yaml\n\n  \
                  # Inspect a local video against the media policy\n  \
                  media-scan probe clip.mp4"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a batch request and print the response envelope
    Run(RunCommand),

    /// Probe a local video and report the policy decision
    Probe(ProbeCommand),
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "media_scan=debug"
    } else {
        "media_scan=info"
    };
    // Logs go to stderr; stdout carries the JSON result
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run(cmd) => cmd.execute().await,
        Commands::Probe(cmd) => cmd.execute().await,
    }
}
