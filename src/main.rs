//! CLI entry point for the harvester tool.

use std::io::{self, IsTerminal};

use anyhow::Result;
use clap::Parser;
use harvester_core::Harvester;
use tracing::{debug, info};

mod cli;
mod output;
mod progress;

use cli::Args;
use progress::TerminalProgress;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let outdir = args.outdir.clone();
    let use_spinner = !args.quiet && io::stderr().is_terminal();
    let config = args.into_config();
    let target = config.target_affiliation.clone();

    info!(
        servers = ?config.servers.servers(),
        start = %config.start_date,
        end = %config.end_date,
        concurrency = config.concurrency,
        "Harvester starting"
    );

    let harvester = Harvester::new(config)?;
    let progress = TerminalProgress::new(use_spinner);
    let result = harvester.run(&progress).await;
    progress.finish();
    let harvest = result?;

    let written = output::write_output(&outdir, &harvest, target.as_deref())?;

    let total: usize = harvest.per_server.iter().map(|set| set.records.len()).sum();
    info!(records = total, files = written.len(), "Harvest complete");

    Ok(())
}
