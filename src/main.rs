//! CLI entry point for the channel downloader.

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use channel_dl::{
    CandidateFilter, Catalog, DownloadEngine, ManifestSource, MediaSource, RetryPolicy, RunSummary,
};
use clap::Parser;
use futures_util::StreamExt;
use tracing::{debug, error, info, warn};

mod cli;

use cli::Args;

/// Exit code when at least one item failed.
const EXIT_PARTIAL_FAILURE: u8 = 2;

/// Exit code after Ctrl-C (128 + SIGINT).
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> Result<ExitCode> {
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

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    let config = args.to_run_config();
    config.validate()?;

    tokio::fs::create_dir_all(&config.output_dir)
        .await
        .with_context(|| {
            format!(
                "cannot create destination root {}",
                config.output_dir.display()
            )
        })?;

    let source: Arc<dyn MediaSource> = Arc::new(
        ManifestSource::open(&config.source)
            .await
            .context("cannot connect to message source")?,
    );
    info!(source = source.identity(), "message source opened");

    let catalog = Arc::new(Catalog::load(&config.catalog_path()).await);

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping after current chunks");
                interrupted.store(true, Ordering::SeqCst);
            }
        });
    }

    let engine = DownloadEngine::new(
        config.concurrency,
        RetryPolicy::with_max_attempts(config.max_attempts),
    )?
    .with_dedup(config.dedup)
    .with_limit(config.limit);

    let candidate_filter = CandidateFilter::new(config.filter.clone());
    let messages = source
        .messages()
        .await
        .context("cannot read messages from source")?;
    let candidates = messages
        .filter_map(|message| {
            let candidate_filter = &candidate_filter;
            async move {
                match message {
                    Ok(message) => match candidate_filter.evaluate(&message) {
                        Ok(candidate) => Some(candidate),
                        Err(rejection) => {
                            debug!(message_id = message.id, %rejection, "message skipped");
                            None
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "failed to read message, skipping");
                        None
                    }
                }
            }
        })
        .boxed();

    let summary = engine
        .run(
            candidates,
            Arc::clone(&source),
            Arc::clone(&catalog),
            &config.output_dir,
            Arc::clone(&interrupted),
        )
        .await?;

    report(&summary, &catalog);

    if summary.was_interrupted() {
        return Ok(ExitCode::from(EXIT_INTERRUPTED));
    }
    if summary.stats().failed() > 0 {
        return Ok(ExitCode::from(EXIT_PARTIAL_FAILURE));
    }
    Ok(ExitCode::SUCCESS)
}

fn report(summary: &RunSummary, catalog: &Catalog) {
    let stats = summary.stats();

    if summary.was_interrupted() {
        warn!(
            committed = stats.completed(),
            unfinished = stats.interrupted(),
            "run interrupted, partial files kept for the next run"
        );
    }
    if stats.catalog_errors() > 0 {
        error!(
            count = stats.catalog_errors(),
            catalog = %catalog.path().display(),
            "some downloads could not be recorded in the catalog"
        );
    }

    info!(
        committed = stats.completed(),
        attempted = stats.attempted(),
        failed = stats.failed(),
        retried = stats.retried(),
        skipped_duplicates = stats.skipped_duplicates(),
        catalog = %catalog.path().display(),
        "download complete"
    );
}
