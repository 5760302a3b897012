//! Download orchestration: bounded concurrency, resumable transfers, retries.
//!
//! The [`DownloadEngine`] consumes filtered candidates in enumeration order,
//! resolves each one to its destination, skips what the catalog already holds,
//! and runs one task per remaining candidate. A task owns its partial file,
//! retries failed attempts according to the [`RetryPolicy`], and commits a
//! [`DownloadRecord`](crate::catalog::DownloadRecord) once the file is in place.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//!
//! use channel_dl::catalog::Catalog;
//! use channel_dl::download::{DownloadEngine, RetryPolicy};
//! use channel_dl::filter::MediaCandidate;
//! use channel_dl::source::{ManifestSource, MediaSource};
//! use futures_util::stream;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let source: Arc<dyn MediaSource> = Arc::new(ManifestSource::open("manifest.json").await?);
//! let catalog = Arc::new(Catalog::load(Path::new("./videos/metadados.json")).await);
//! let candidates: Vec<MediaCandidate> = Vec::new();
//!
//! let engine = DownloadEngine::new(3, RetryPolicy::default())?;
//! let summary = engine
//!     .run(
//!         stream::iter(candidates),
//!         source,
//!         catalog,
//!         Path::new("./videos"),
//!         Arc::new(AtomicBool::new(false)),
//!     )
//!     .await?;
//! println!("{} of {} committed", summary.stats().completed(), summary.stats().attempted());
//! # Ok(())
//! # }
//! ```

mod constants;
mod engine;
mod error;
mod retry;
mod transfer;

use std::sync::atomic::{AtomicBool, Ordering};

pub use constants::DEFAULT_MAX_ATTEMPTS;
pub use engine::{DEFAULT_CONCURRENCY, DownloadEngine, DownloadStats, EngineError, RunSummary};
pub use error::DownloadError;
pub use retry::{FailureType, RetryDecision, RetryPolicy, classify_error};

/// Resolves once `flag` is raised, checking it every poll interval.
pub(crate) async fn wait_for_interrupt(flag: &AtomicBool) {
    while !flag.load(Ordering::SeqCst) {
        tokio::time::sleep(constants::INTERRUPT_POLL_INTERVAL).await;
    }
}
