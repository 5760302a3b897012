//! Turns source messages into download candidates.
//!
//! Checks run in a fixed order and stop at the first rejection: attached
//! document, date range, forward/reply flags, identifier tag, video flag,
//! size bounds.

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::config::FilterCriteria;
use crate::source::{DocumentRef, SourceMessage};

#[allow(clippy::expect_used)]
static IDENTIFIER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#F\d{4}").expect("identifier regex is valid"));

/// A message that passed every filter and can be scheduled for download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaCandidate {
    /// Source message id.
    pub message_id: i64,
    /// Identifier embedded in the file name (first token of the caption).
    pub identifier: String,
    /// Caption text.
    pub caption: String,
    /// Message timestamp.
    pub date: DateTime<Utc>,
    /// Whether the message was forwarded.
    pub forwarded: bool,
    /// Whether the message is a reply.
    pub reply: bool,
    /// Document to fetch.
    pub document: DocumentRef,
}

impl MediaCandidate {
    /// Declared size of the document in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.document.size
    }

    /// Whether the document is flagged as video.
    #[must_use]
    pub fn is_video(&self) -> bool {
        self.document.is_video
    }
}

/// Why a message was not turned into a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// No attached document.
    NoDocument,
    /// Before `since`.
    TooOld,
    /// After `until`.
    TooNew,
    /// Forwarded and forwards are skipped.
    Forwarded,
    /// A reply and replies are skipped.
    Reply,
    /// Caption lacks the `#Fdddd` identifier tag.
    NoIdentifier,
    /// Not a video and only videos are accepted.
    NotVideo,
    /// Below the minimum size.
    TooSmall,
    /// Above the maximum size.
    TooLarge,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NoDocument => "no document",
            Self::TooOld => "before date range",
            Self::TooNew => "after date range",
            Self::Forwarded => "forwarded",
            Self::Reply => "reply",
            Self::NoIdentifier => "no identifier tag",
            Self::NotVideo => "not a video",
            Self::TooSmall => "below minimum size",
            Self::TooLarge => "above maximum size",
        };
        f.write_str(text)
    }
}

/// Applies [`FilterCriteria`] to source messages.
#[derive(Debug, Clone)]
pub struct CandidateFilter {
    criteria: FilterCriteria,
}

impl CandidateFilter {
    /// Creates a filter for `criteria`.
    #[must_use]
    pub fn new(criteria: FilterCriteria) -> Self {
        Self { criteria }
    }

    /// Returns the candidate for `message`, or the first reason it was rejected.
    ///
    /// # Errors
    ///
    /// Returns the [`Rejection`] that excluded the message.
    pub fn evaluate(&self, message: &SourceMessage) -> Result<MediaCandidate, Rejection> {
        let criteria = &self.criteria;
        let document = message.document.as_ref().ok_or(Rejection::NoDocument)?;

        if criteria.since.is_some_and(|since| message.date < since) {
            return Err(Rejection::TooOld);
        }
        if criteria.until.is_some_and(|until| message.date > until) {
            return Err(Rejection::TooNew);
        }
        if criteria.skip_forwards && message.forwarded {
            return Err(Rejection::Forwarded);
        }
        if criteria.skip_replies && message.reply_to.is_some() {
            return Err(Rejection::Reply);
        }

        let caption = message.text.as_deref().unwrap_or_default();
        if !IDENTIFIER_PATTERN.is_match(caption) {
            return Err(Rejection::NoIdentifier);
        }
        if criteria.video_only && !document.is_video {
            return Err(Rejection::NotVideo);
        }
        if criteria.min_size > 0 && document.size < criteria.min_size {
            return Err(Rejection::TooSmall);
        }
        if criteria.max_size > 0 && document.size > criteria.max_size {
            return Err(Rejection::TooLarge);
        }

        let identifier = caption
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();

        Ok(MediaCandidate {
            message_id: message.id,
            identifier,
            caption: caption.to_string(),
            date: message.date,
            forwarded: message.forwarded,
            reply: message.reply_to.is_some(),
            document: document.clone(),
        })
    }
}
