//! Error types for the download module.

use std::path::PathBuf;

use thiserror::Error;

use crate::source::SourceError;

/// Errors that end a single download attempt.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The source failed to open or continue the read.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Local file system error (partial file, rename, digest read).
    #[error("IO error at {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The read ended before the declared size was reached.
    #[error("incomplete download {path}: expected {expected_bytes} bytes, got {actual_bytes}")]
    Incomplete {
        /// Partial file being written.
        path: PathBuf,
        /// Declared size.
        expected_bytes: u64,
        /// Bytes on disk.
        actual_bytes: u64,
    },

    /// The source delivered more bytes than declared; the partial file was discarded.
    #[error("oversized download {path}: expected {expected_bytes} bytes, got {actual_bytes}")]
    Oversized {
        /// Partial file that was discarded.
        path: PathBuf,
        /// Declared size.
        expected_bytes: u64,
        /// Bytes received.
        actual_bytes: u64,
    },

    /// The run was interrupted; the partial file is intact and resumable.
    #[error("download of {path} interrupted at {bytes} bytes")]
    Interrupted {
        /// Partial file left behind.
        path: PathBuf,
        /// Bytes on disk when the attempt stopped.
        bytes: u64,
    },
}

impl DownloadError {
    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an incomplete-download error.
    pub fn incomplete(path: impl Into<PathBuf>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::Incomplete {
            path: path.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    /// Creates an oversized-download error.
    pub fn oversized(path: impl Into<PathBuf>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::Oversized {
            path: path.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    /// Creates an interruption error.
    pub fn interrupted(path: impl Into<PathBuf>, bytes: u64) -> Self {
        Self::Interrupted {
            path: path.into(),
            bytes,
        }
    }
}
