mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::Args;

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("segdl=info"));
    // stderr, so log lines interleave with the progress bars instead of the list output
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .ok();
}

fn main() -> Result<()> {
    let mut args = Args::parse();
    init_tracing();

    // Resolve the download directory up front so the state file lands next to it
    if args.download_dir.is_relative() {
        if let Ok(cwd) = std::env::current_dir() {
            args.download_dir = cwd.join(&args.download_dir);
        }
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        if args.list {
            crate::commands::list_downloads(&args).await
        } else {
            crate::commands::run_downloads(args).await
        }
    })
}
