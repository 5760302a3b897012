//! Download engine for concurrent, resumable downloads with retry support.
//!
//! Candidates are admitted in the order the source enumerates them, each one
//! only after a semaphore permit is free, so at most `concurrency` items are
//! transferring at any time. Completion order is unordered.

mod persistence;
mod task;

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures_util::{Stream, StreamExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument, warn};

use super::retry::RetryPolicy;
use super::wait_for_interrupt;
use crate::catalog::Catalog;
use crate::filter::MediaCandidate;
use crate::layout::{DestinationPath, resolve};
use crate::source::MediaSource;

use task::{ItemContext, ItemOutcome};

/// Minimum allowed concurrency value.
const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
const MAX_CONCURRENCY: usize = 100;

/// Default concurrency if not specified.
pub const DEFAULT_CONCURRENCY: usize = 3;

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Error type for download engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Invalid concurrency value provided.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
    },

    /// Semaphore was closed unexpectedly.
    #[error("semaphore closed unexpectedly")]
    SemaphoreClosed,
}

/// Counters for one run.
///
/// Shared between the admission loop and the download tasks through an
/// `Arc`, so every counter is atomic.
#[derive(Debug, Default)]
pub struct DownloadStats {
    completed: AtomicUsize,
    failed: AtomicUsize,
    retried: AtomicUsize,
    interrupted: AtomicUsize,
    skipped_duplicates: AtomicUsize,
    catalog_errors: AtomicUsize,
}

impl DownloadStats {
    /// Creates a new stats tracker with zero counts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Items whose file reached its final path.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Items that exhausted the attempt budget (or could not be placed).
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Retry attempts scheduled across all items.
    #[must_use]
    pub fn retried(&self) -> usize {
        self.retried.load(Ordering::SeqCst)
    }

    /// Items stopped by an interrupt, partial files kept.
    #[must_use]
    pub fn interrupted(&self) -> usize {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Candidates skipped because the catalog already holds them.
    #[must_use]
    pub fn skipped_duplicates(&self) -> usize {
        self.skipped_duplicates.load(Ordering::SeqCst)
    }

    /// Downloads kept on disk whose catalog record could not be persisted.
    #[must_use]
    pub fn catalog_errors(&self) -> usize {
        self.catalog_errors.load(Ordering::SeqCst)
    }

    /// Items scheduled for download (completed + failed + interrupted).
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.completed() + self.failed() + self.interrupted()
    }

    fn increment_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_retried(&self) {
        self.retried.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_interrupted(&self) {
        self.interrupted.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_skipped_duplicates(&self) {
        self.skipped_duplicates.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_catalog_errors(&self) {
        self.catalog_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn snapshot(&self) -> Self {
        Self {
            completed: AtomicUsize::new(self.completed()),
            failed: AtomicUsize::new(self.failed()),
            retried: AtomicUsize::new(self.retried()),
            interrupted: AtomicUsize::new(self.interrupted()),
            skipped_duplicates: AtomicUsize::new(self.skipped_duplicates()),
            catalog_errors: AtomicUsize::new(self.catalog_errors()),
        }
    }
}

/// Result of [`DownloadEngine::run`].
#[derive(Debug)]
pub struct RunSummary {
    stats: DownloadStats,
    written: BTreeSet<DestinationPath>,
    interrupted: bool,
}

impl RunSummary {
    /// Final counters.
    #[must_use]
    pub fn stats(&self) -> &DownloadStats {
        &self.stats
    }

    /// Destinations written during this run.
    #[must_use]
    pub fn written(&self) -> &BTreeSet<DestinationPath> {
        &self.written
    }

    /// Whether the run stopped because of an interrupt.
    #[must_use]
    pub fn was_interrupted(&self) -> bool {
        self.interrupted
    }

    /// True when nothing failed and the run was not interrupted.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        !self.interrupted && self.stats.failed() == 0
    }
}

/// Download engine for concurrent file downloads with retry support.
///
/// # Concurrency Model
///
/// - Each candidate runs in its own Tokio task
/// - A semaphore permit is held only while an attempt is transferring; it is
///   released before the retry backoff and before the catalog commit
/// - The first permit is taken by the admission loop, which keeps admission in
///   enumeration order
///
/// # Retry Behavior
///
/// Every failure consumes one attempt. Rate-limited attempts wait the
/// requested time plus a margin; timeouts and other errors wait a fixed
/// interval. An item that exhausts its budget is reported and the run goes on.
#[derive(Debug)]
pub struct DownloadEngine {
    /// Semaphore for concurrency control.
    semaphore: Arc<Semaphore>,
    /// Configured concurrency limit.
    concurrency: usize,
    /// Retry policy for failed downloads.
    retry_policy: RetryPolicy,
    /// Skip candidates already in the catalog.
    dedup: bool,
    /// Maximum items to schedule (0 = unlimited).
    limit: usize,
}

impl DownloadEngine {
    /// Creates a new download engine.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConcurrency`] if the value is outside
    /// the valid range (1-100).
    ///
    /// # Example
    ///
    /// ```
    /// use channel_dl::download::{DownloadEngine, RetryPolicy};
    ///
    /// let engine = DownloadEngine::new(3, RetryPolicy::default()).unwrap();
    /// assert_eq!(engine.concurrency(), 3);
    /// ```
    #[instrument(level = "debug", skip(retry_policy))]
    pub fn new(concurrency: usize, retry_policy: RetryPolicy) -> Result<Self, EngineError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&concurrency) {
            return Err(EngineError::InvalidConcurrency { value: concurrency });
        }

        debug!(
            concurrency,
            max_attempts = retry_policy.max_attempts(),
            "creating download engine"
        );

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            retry_policy,
            dedup: true,
            limit: 0,
        })
    }

    /// Enables or disables catalog deduplication (enabled by default).
    #[must_use]
    pub fn with_dedup(mut self, dedup: bool) -> Self {
        self.dedup = dedup;
        self
    }

    /// Stops admitting candidates after `limit` have been scheduled (0 = no limit).
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Returns the configured concurrency limit.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Returns the configured retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Downloads every admitted candidate and waits for all of them.
    ///
    /// Per-item failures never abort the run; they are counted in the
    /// returned stats. Raising `interrupted` stops admission at once and lets
    /// in-flight items stop after their current chunk.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::SemaphoreClosed`] if the semaphore is closed.
    #[instrument(skip(self, candidates, source, catalog, interrupted), fields(root = %root.display(), source = source.identity()))]
    pub async fn run<S>(
        &self,
        candidates: S,
        source: Arc<dyn MediaSource>,
        catalog: Arc<Catalog>,
        root: &Path,
        interrupted: Arc<AtomicBool>,
    ) -> Result<RunSummary, EngineError>
    where
        S: Stream<Item = MediaCandidate> + Unpin,
    {
        let stats = Arc::new(DownloadStats::new());
        let context = ItemContext {
            source,
            catalog: Arc::clone(&catalog),
            semaphore: Arc::clone(&self.semaphore),
            policy: self.retry_policy.clone(),
            stats: Arc::clone(&stats),
            interrupted: Arc::clone(&interrupted),
        };
        let mut candidates = candidates;
        let mut claimed: HashSet<DestinationPath> = HashSet::new();
        let mut handles = Vec::new();
        let mut scheduled = 0usize;

        info!(concurrency = self.concurrency, dedup = self.dedup, limit = self.limit, "starting downloads");

        loop {
            if interrupted.load(Ordering::SeqCst) {
                info!(scheduled, "interrupt received, no new downloads admitted");
                break;
            }
            if self.limit > 0 && scheduled >= self.limit {
                info!(limit = self.limit, "item limit reached");
                break;
            }

            let next = tokio::select! {
                biased;
                () = wait_for_interrupt(&interrupted) => continue,
                next = candidates.next() => next,
            };
            let Some(candidate) = next else {
                break;
            };

            let destination = match resolve(root, &candidate.caption, &candidate.identifier) {
                Ok(destination) => destination,
                Err(error) => {
                    warn!(message_id = candidate.message_id, error = %error, "cannot prepare destination");
                    stats.increment_failed();
                    scheduled += 1;
                    continue;
                }
            };

            if self.dedup && catalog.exists(destination.file_name(), candidate.size()) {
                info!(
                    message_id = candidate.message_id,
                    file = destination.file_name(),
                    size_mib = format!("{:.2}", size_mib(candidate.size())),
                    "already downloaded, skipping"
                );
                stats.increment_skipped_duplicates();
                continue;
            }
            if !claimed.insert(destination.clone()) {
                warn!(
                    message_id = candidate.message_id,
                    path = %destination.relative_path().display(),
                    "destination already claimed by another message in this run, skipping"
                );
                stats.increment_skipped_duplicates();
                continue;
            }

            let Some(permit) = self.admit(&interrupted).await? else {
                continue;
            };
            scheduled += 1;

            debug!(
                message_id = candidate.message_id,
                identifier = %candidate.identifier,
                path = %destination.relative_path().display(),
                "admitted"
            );

            let context = context.clone();
            let final_path = destination.under(root);
            handles.push(tokio::spawn(async move {
                task::process_item(&context, &candidate, destination, &final_path, permit).await
            }));
        }

        debug!(task_count = handles.len(), "waiting for downloads to complete");

        let mut written = BTreeSet::new();
        for handle in handles {
            match handle.await {
                Ok(ItemOutcome::Written(destination)) => {
                    written.insert(destination);
                }
                Ok(ItemOutcome::Failed | ItemOutcome::Interrupted) => {}
                Err(e) => {
                    warn!(error = %e, "download task panicked");
                    stats.increment_failed();
                }
            }
        }

        let was_interrupted = interrupted.load(Ordering::SeqCst);
        let stats = stats.snapshot();
        info!(
            completed = stats.completed(),
            failed = stats.failed(),
            retried = stats.retried(),
            skipped = stats.skipped_duplicates(),
            interrupted = was_interrupted,
            "downloads finished"
        );

        Ok(RunSummary {
            stats,
            written,
            interrupted: was_interrupted,
        })
    }

    /// Waits for a free slot; `None` if the interrupt fires first.
    async fn admit(&self, interrupted: &AtomicBool) -> Result<Option<OwnedSemaphorePermit>, EngineError> {
        tokio::select! {
            biased;
            () = wait_for_interrupt(interrupted) => Ok(None),
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map(Some).map_err(|_| EngineError::SemaphoreClosed)
            }
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn size_mib(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MIB
}
