//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::Parser;

use channel_dl::catalog::DEFAULT_CATALOG_FILE;
use channel_dl::config::{ConfigError, FilterCriteria, RunConfig, parse_date_bound};
use channel_dl::{DEFAULT_CONCURRENCY, DEFAULT_MAX_ATTEMPTS};

/// Mirror a channel's captioned videos into a folder tree.
///
/// Each video lands under the folders named by its caption lines
/// (`=` marks depth) and is recorded in a JSON catalog so it is not
/// downloaded twice.
#[derive(Parser, Debug)]
#[command(name = "channel-dl")]
#[command(author, version, about)]
pub struct Args {
    /// Message source: path or http(s) URL of a JSON manifest
    #[arg(short = 's', long)]
    pub source: String,

    /// Destination root for folders and the catalog
    #[arg(short = 'o', long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Catalog file name inside the destination root
    #[arg(long, default_value = DEFAULT_CATALOG_FILE)]
    pub catalog_name: String,

    /// Accept every document, not only videos
    #[arg(long)]
    pub all_documents: bool,

    /// Minimum document size in bytes (0 to disable)
    #[arg(long, default_value_t = 0)]
    pub min_size: u64,

    /// Maximum document size in bytes (0 to disable)
    #[arg(long, default_value_t = 0)]
    pub max_size: u64,

    /// Only messages on or after this date (RFC 3339 or YYYY-MM-DD)
    #[arg(long, value_parser = parse_since)]
    pub since: Option<DateTime<Utc>>,

    /// Only messages on or before this date (RFC 3339 or YYYY-MM-DD, whole day)
    #[arg(long, value_parser = parse_until)]
    pub until: Option<DateTime<Utc>>,

    /// Skip forwarded messages
    #[arg(long)]
    pub skip_forwards: bool,

    /// Skip replies
    #[arg(long)]
    pub skip_replies: bool,

    /// Maximum downloads to schedule this run (0 for no limit)
    #[arg(long, default_value_t = 0)]
    pub limit: usize,

    /// Download even if the catalog already holds the same name and size
    #[arg(long)]
    pub no_dedup: bool,

    /// Maximum concurrent downloads (1-100)
    #[arg(short = 'c', long, default_value_t = DEFAULT_CONCURRENCY as u8, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: u8,

    /// Attempts per item, including the first (1-20)
    #[arg(short = 'r', long, default_value_t = DEFAULT_MAX_ATTEMPTS as u8, value_parser = clap::value_parser!(u8).range(1..=20))]
    pub max_attempts: u8,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Builds the run configuration from the parsed flags.
    pub fn to_run_config(&self) -> RunConfig {
        let mut config = RunConfig::new(self.source.clone(), self.output_dir.clone());
        config.catalog_name.clone_from(&self.catalog_name);
        config.filter = FilterCriteria {
            video_only: !self.all_documents,
            min_size: self.min_size,
            max_size: self.max_size,
            since: self.since,
            until: self.until,
            skip_forwards: self.skip_forwards,
            skip_replies: self.skip_replies,
        };
        config.limit = self.limit;
        config.dedup = !self.no_dedup;
        config.concurrency = usize::from(self.concurrency);
        config.max_attempts = u32::from(self.max_attempts);
        config
    }
}

fn parse_since(value: &str) -> Result<DateTime<Utc>, ConfigError> {
    parse_date_bound(value, false)
}

fn parse_until(value: &str) -> Result<DateTime<Utc>, ConfigError> {
    parse_date_bound(value, true)
}
