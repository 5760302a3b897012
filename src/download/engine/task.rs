use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument, warn};

use super::DownloadStats;
use super::persistence::commit_download;
use crate::catalog::Catalog;
use crate::download::retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
use crate::download::transfer::transfer;
use crate::download::{DownloadError, wait_for_interrupt};
use crate::filter::MediaCandidate;
use crate::integrity::digest_file;
use crate::layout::DestinationPath;
use crate::source::MediaSource;

/// Everything a download task shares with the engine.
#[derive(Clone)]
pub(super) struct ItemContext {
    pub source: Arc<dyn MediaSource>,
    pub catalog: Arc<Catalog>,
    pub semaphore: Arc<Semaphore>,
    pub policy: RetryPolicy,
    pub stats: Arc<DownloadStats>,
    pub interrupted: Arc<AtomicBool>,
}

pub(super) enum ItemOutcome {
    Written(DestinationPath),
    Failed,
    Interrupted,
}

/// Runs attempts for one candidate until it is written, fails for good, or is interrupted.
///
/// `first_permit` was acquired by the admission loop; later attempts take a
/// fresh permit so no slot is held during backoff.
#[instrument(
    skip_all,
    fields(message_id = candidate.message_id, identifier = %candidate.identifier, path = %final_path.display())
)]
pub(super) async fn process_item(
    context: &ItemContext,
    candidate: &MediaCandidate,
    destination: DestinationPath,
    final_path: &Path,
    first_permit: OwnedSemaphorePermit,
) -> ItemOutcome {
    let stats = &context.stats;
    let max_attempts = context.policy.max_attempts();
    let mut permit = Some(first_permit);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let active = match permit.take() {
            Some(permit) => permit,
            None => match acquire(context).await {
                Some(permit) => permit,
                None => {
                    stats.increment_interrupted();
                    return ItemOutcome::Interrupted;
                }
            },
        };

        info!(attempt, max_attempts, "download attempt");
        let result = transfer(
            context.source.as_ref(),
            &candidate.document,
            final_path,
            &context.interrupted,
        )
        .await;
        drop(active);

        let result = match result {
            Ok(transferred) => digest_file(final_path)
                .await
                .map(|sha1| (transferred, sha1))
                .map_err(|e| DownloadError::io(final_path, e)),
            Err(error) => Err(error),
        };

        let error = match result {
            Ok((transferred, sha1)) => {
                debug!(
                    resumed_from = transferred.resumed_from,
                    bytes = transferred.bytes_received,
                    already_present = transferred.already_present,
                    "transfer verified"
                );
                stats.increment_completed();
                commit_download(&context.catalog, candidate, final_path, sha1, stats).await;
                info!(attempts = attempt, "download committed");
                return ItemOutcome::Written(destination);
            }
            Err(error) => error,
        };

        let failure_type = classify_error(&error);
        match context.policy.should_retry(failure_type, attempt) {
            RetryDecision::Retry {
                delay,
                attempt: next_attempt,
            } => {
                warn!(
                    attempt = next_attempt,
                    max_attempts,
                    failure = ?failure_type,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "retrying download"
                );
                stats.increment_retried();
                if !backoff(delay, &context.interrupted).await {
                    stats.increment_interrupted();
                    return ItemOutcome::Interrupted;
                }
            }
            RetryDecision::DoNotRetry { reason } => {
                if failure_type == FailureType::Interrupted {
                    info!(error = %error, "download interrupted, partial file kept");
                    stats.increment_interrupted();
                    return ItemOutcome::Interrupted;
                }
                warn!(attempts = attempt, %reason, error = %error, "download failed after all attempts");
                stats.increment_failed();
                return ItemOutcome::Failed;
            }
        }
    }
}

/// Takes a slot for a retry; `None` if interrupted first.
async fn acquire(context: &ItemContext) -> Option<OwnedSemaphorePermit> {
    tokio::select! {
        biased;
        () = wait_for_interrupt(&context.interrupted) => None,
        permit = Arc::clone(&context.semaphore).acquire_owned() => permit.ok(),
    }
}

/// Sleeps for `delay`; returns false if the interrupt fired during the wait.
async fn backoff(delay: Duration, interrupted: &AtomicBool) -> bool {
    tokio::select! {
        biased;
        () = wait_for_interrupt(interrupted) => false,
        () = tokio::time::sleep(delay) => true,
    }
}
