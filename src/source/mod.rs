//! Message source abstraction.
//!
//! A [`MediaSource`] enumerates channel messages in order and serves chunked,
//! offset-resumable reads of the documents attached to them. Authentication,
//! transport and flood control live behind this trait; the download engine
//! only sees ordered messages and byte chunks.
//!
//! [`ManifestSource`] is the bundled implementation: messages come from a JSON
//! manifest and documents are fetched over HTTP with `Range` requests.

mod manifest;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use thiserror::Error;

pub use manifest::{DEFAULT_RATE_LIMIT_WAIT, ManifestSource, parse_retry_after};

/// Ordered stream of messages.
pub type MessageStream<'a> = BoxStream<'a, Result<SourceMessage, SourceError>>;

/// Stream of document bytes starting at the requested offset.
pub type ChunkStream<'a> = BoxStream<'a, Result<Bytes, SourceError>>;

/// Errors raised by a message source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source asked us to back off for `wait`.
    #[error("rate limited by source, retry in {}s", wait.as_secs())]
    RateLimited {
        /// How long the source asked us to wait.
        wait: Duration,
    },

    /// A request or chunk read timed out.
    #[error("timeout reading {locator}")]
    Timeout {
        /// Document or resource being read.
        locator: String,
    },

    /// The source answered with an unexpected HTTP status.
    #[error("HTTP {status} reading {locator}")]
    HttpStatus {
        /// Document or resource being read.
        locator: String,
        /// Status code returned.
        status: u16,
    },

    /// Transport-level failure (DNS, connection reset, TLS, body decode).
    #[error("network error reading {locator}: {source}")]
    Network {
        /// Document or resource being read.
        locator: String,
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// A resumed read was answered from byte zero instead of the requested offset.
    #[error("source ignored range request at offset {offset} for {locator}")]
    RangeIgnored {
        /// Document being read.
        locator: String,
        /// Offset that was requested.
        offset: u64,
    },

    /// The message listing could not be obtained or parsed.
    #[error("cannot open message source {identity}: {reason}")]
    Unavailable {
        /// Source identity as configured.
        identity: String,
        /// What went wrong.
        reason: String,
    },

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl SourceError {
    /// Creates a source-unavailable error.
    pub fn unavailable(identity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            identity: identity.into(),
            reason: reason.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(locator: impl Into<String>) -> Self {
        Self::Timeout {
            locator: locator.into(),
        }
    }

    /// Maps a client error, separating timeouts from other transport failures.
    pub fn from_reqwest(locator: impl Into<String>, source: reqwest::Error) -> Self {
        let locator = locator.into();
        if source.is_timeout() {
            Self::Timeout { locator }
        } else {
            Self::Network { locator, source }
        }
    }
}

/// Attached document as described by the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    /// Opaque handle the source uses to serve reads (a URL for [`ManifestSource`]).
    pub locator: String,
    /// Declared size in bytes.
    pub size: u64,
    /// Whether the source flags the document as video.
    pub is_video: bool,
    /// MIME type, when the source reports one.
    pub mime_type: Option<String>,
}

/// One message as enumerated by the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMessage {
    /// Numeric message id.
    pub id: i64,
    /// Message timestamp.
    pub date: DateTime<Utc>,
    /// Free-text caption.
    pub text: Option<String>,
    /// Attached document, if any.
    pub document: Option<DocumentRef>,
    /// Whether the message was forwarded from elsewhere.
    pub forwarded: bool,
    /// Message this one replies to.
    pub reply_to: Option<i64>,
}

/// A channel-like source of messages carrying downloadable documents.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Human-readable identity used in logs.
    fn identity(&self) -> &str;

    /// Enumerates messages oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Unavailable`] when the listing cannot be opened.
    async fn messages(&self) -> Result<MessageStream<'_>, SourceError>;

    /// Opens a chunked read of `document` starting at byte `offset`.
    ///
    /// # Errors
    ///
    /// Any [`SourceError`]; [`SourceError::RateLimited`] carries the wait the
    /// source requested.
    async fn read_from(
        &self,
        document: &DocumentRef,
        offset: u64,
    ) -> Result<ChunkStream<'_>, SourceError>;
}
