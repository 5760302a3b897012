//! A single download attempt.
//!
//! Bytes are appended to `<final>.part`; only a fully received file is renamed
//! to its final name, so an interrupted or crashed attempt leaves nothing but a
//! resumable partial file behind.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use futures_util::StreamExt;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use super::{DownloadError, wait_for_interrupt};
use crate::layout::partial_path;
use crate::source::{ChunkStream, DocumentRef, MediaSource};

/// What an attempt did to put the file at its final path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TransferResult {
    /// Offset the read started from.
    pub resumed_from: u64,
    /// Bytes received from the source during this attempt.
    pub bytes_received: u64,
    /// The final file was already complete; nothing was read.
    pub already_present: bool,
}

/// Downloads `document` to `final_path`, resuming any partial file.
///
/// # Errors
///
/// Returns [`DownloadError::Interrupted`] when `interrupted` is raised between
/// chunks, and any source, IO or size error otherwise. The partial file is
/// kept on every error except [`DownloadError::Oversized`].
#[instrument(skip(source, document, interrupted), fields(path = %final_path.display(), size = document.size))]
pub(crate) async fn transfer(
    source: &dyn MediaSource,
    document: &DocumentRef,
    final_path: &Path,
    interrupted: &AtomicBool,
) -> Result<TransferResult, DownloadError> {
    let expected = document.size;

    if file_len(final_path).await? == Some(expected) {
        debug!("final file already complete");
        return Ok(TransferResult {
            resumed_from: expected,
            bytes_received: 0,
            already_present: true,
        });
    }

    let part = partial_path(final_path);
    let offset = resume_offset(&part, expected).await?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&part)
        .await
        .map_err(|e| DownloadError::io(&part, e))?;

    let mut total = offset;
    if offset < expected {
        debug!(offset, "requesting read");
        let mut chunks = source.read_from(document, offset).await?;
        let received =
            append_chunks(&mut chunks, &mut file, &part, offset, expected, interrupted).await;
        if let Err(error @ DownloadError::Oversized { .. }) = received {
            warn!(expected, "source sent more than declared, discarding partial file");
            drop(file);
            remove_partial(&part).await?;
            return Err(error);
        }
        // Whatever reached the file stays valid for the next attempt.
        file.flush().await.map_err(|e| DownloadError::io(&part, e))?;
        total = received?;
    }

    file.sync_all()
        .await
        .map_err(|e| DownloadError::io(&part, e))?;
    drop(file);

    if total < expected {
        return Err(DownloadError::incomplete(part, expected, total));
    }

    tokio::fs::rename(&part, final_path)
        .await
        .map_err(|e| DownloadError::io(final_path, e))?;

    Ok(TransferResult {
        resumed_from: offset,
        bytes_received: total - offset,
        already_present: false,
    })
}

/// Size of an existing partial file, or 0. A partial file larger than the
/// declared size is corrupt and is removed.
async fn resume_offset(part: &Path, expected: u64) -> Result<u64, DownloadError> {
    match file_len(part).await? {
        Some(len) if len > expected => {
            warn!(
                path = %part.display(),
                partial_bytes = len,
                expected,
                "corrupt partial file discarded, restarting from zero"
            );
            remove_partial(part).await?;
            Ok(0)
        }
        Some(len) => {
            if len > 0 {
                debug!(offset = len, "resuming partial file");
            }
            Ok(len)
        }
        None => Ok(0),
    }
}

/// Appends chunks until the stream ends; returns the new file length.
///
/// The interrupt is only observed while waiting for the next chunk, so a
/// chunk that was received is always written in full. A chunk that would
/// grow the file past `expected` is not written and ends the read with
/// [`DownloadError::Oversized`].
async fn append_chunks(
    chunks: &mut ChunkStream<'_>,
    file: &mut File,
    part: &Path,
    offset: u64,
    expected: u64,
    interrupted: &AtomicBool,
) -> Result<u64, DownloadError> {
    let mut written = offset;
    loop {
        let next = tokio::select! {
            biased;
            () = wait_for_interrupt(interrupted) => {
                debug!(bytes = written, "interrupted between chunks");
                return Err(DownloadError::interrupted(part, written));
            }
            next = chunks.next() => next,
        };

        let Some(chunk) = next else {
            return Ok(written);
        };
        let chunk = chunk?;
        let after = written + chunk.len() as u64;
        if after > expected {
            return Err(DownloadError::oversized(part, expected, after));
        }

        file.write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(part, e))?;
        written = after;
    }
}

async fn file_len(path: &Path) -> Result<Option<u64>, DownloadError> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(Some(metadata.len())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(DownloadError::io(path, e)),
    }
}

async fn remove_partial(part: &Path) -> Result<(), DownloadError> {
    match tokio::fs::remove_file(part).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DownloadError::io(PathBuf::from(part), e)),
    }
}
