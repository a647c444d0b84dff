//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use clap::Parser;

use harvester_core::config::{DEFAULT_API_BASE_URL, DEFAULT_CONCURRENCY};
use harvester_core::{DEFAULT_MAX_RETRIES, HarvestConfig, ServerSelection};

/// Harvest preprint metadata from the bioRxiv/medRxiv API.
///
/// Fetches every record posted in a date window, optionally keeps only those
/// whose corresponding author belongs to a given institution, and writes
/// deduplicated JSON Lines files. Interrupted runs resume when the same
/// `--temp-outdir` is passed again.
#[derive(Parser, Debug)]
#[command(name = "harvester")]
#[command(author, version, about)]
pub struct Args {
    /// Server to harvest: biorxiv, medrxiv or both
    #[arg(short, long, default_value = "both")]
    pub server: ServerSelection,

    /// First posting date (YYYY-MM-DD)
    #[arg(long, default_value = "2013-01-01")]
    pub start: NaiveDate,

    /// Last posting date (YYYY-MM-DD), defaults to today
    #[arg(long)]
    pub end: Option<NaiveDate>,

    /// Keep only records whose corresponding institution matches exactly
    /// (case and surrounding whitespace ignored)
    #[arg(short, long)]
    pub target: Option<String>,

    /// Seconds to sleep between polling cycles of the fetch workers
    #[arg(short, long, default_value = "0.2", value_parser = parse_pause)]
    pub pause: Duration,

    /// Maximum pages fetched in parallel (1-100)
    #[arg(short = 'c', long, default_value_t = DEFAULT_CONCURRENCY as u8, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: u8,

    /// Attempts per page before the run fails
    #[arg(short = 'r', long, default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Directory for per-page checkpoints; kept across runs for resume.
    /// A temporary directory is used (and removed on success) when omitted
    #[arg(long)]
    pub temp_outdir: Option<PathBuf>,

    /// Directory for the output files
    #[arg(short, long, default_value = ".")]
    pub outdir: PathBuf,

    /// API root
    #[arg(long, default_value = DEFAULT_API_BASE_URL)]
    pub base_url: String,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Maps the arguments onto a harvest configuration.
    #[must_use]
    pub fn into_config(self) -> HarvestConfig {
        let defaults = HarvestConfig::default();
        HarvestConfig {
            servers: self.server,
            start_date: self.start,
            end_date: self.end.unwrap_or(defaults.end_date),
            target_affiliation: self.target,
            pause: self.pause,
            concurrency: usize::from(self.concurrency),
            max_retries: self.max_retries,
            checkpoint_location: self.temp_outdir,
            api_base_url: self.base_url,
            ..defaults
        }
    }
}

fn parse_pause(value: &str) -> Result<Duration, String> {
    let seconds: f64 = value
        .parse()
        .map_err(|_| format!("'{value}' is not a number of seconds"))?;
    Duration::try_from_secs_f64(seconds).map_err(|_| format!("pause must be a non-negative number of seconds, got '{value}'"))
}
