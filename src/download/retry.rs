//! Retry policy for failed download attempts.
//!
//! Every failure is classified into a [`FailureType`]; the [`RetryPolicy`]
//! then decides whether another attempt is allowed and how long to wait:
//!
//! | failure | wait before next attempt |
//! |---|---|
//! | [`FailureType::RateLimited`] | the wait the source asked for + a fixed margin |
//! | [`FailureType::Timeout`] | fixed timeout backoff |
//! | [`FailureType::Transient`] | fixed transient backoff |
//! | [`FailureType::Interrupted`] | never retried |
//!
//! Every attempt, rate-limited ones included, counts toward the budget.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use channel_dl::download::{FailureType, RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::default();
//! let wait = Duration::from_secs(30);
//! match policy.should_retry(FailureType::RateLimited { wait }, 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         assert_eq!(delay, Duration::from_secs(31));
//!         assert_eq!(attempt, 2);
//!     }
//!     RetryDecision::DoNotRetry { reason } => panic!("{reason}"),
//! }
//! ```

use std::time::Duration;

use tracing::{debug, instrument};

use super::DownloadError;
use super::constants::{
    DEFAULT_MAX_ATTEMPTS, RATE_LIMIT_MARGIN, TIMEOUT_BACKOFF, TRANSIENT_BACKOFF,
};
use crate::source::SourceError;

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// The source signalled flow control and asked us to wait.
    RateLimited {
        /// Wait requested by the source.
        wait: Duration,
    },

    /// A request or read timed out.
    Timeout,

    /// Any other error; may succeed on a later attempt.
    Transient,

    /// The run is shutting down.
    Interrupted,
}

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Give up on this item.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Attempt budget and per-failure backoff.
///
/// # Default Values
///
/// - `max_attempts`: 6
/// - `rate_limit_margin`: 1 second
/// - `timeout_delay`: 10 seconds
/// - `transient_delay`: 5 seconds
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,

    /// Added to the wait requested by a rate-limited source.
    rate_limit_margin: Duration,

    /// Wait after a timeout.
    timeout_delay: Duration,

    /// Wait after any other transient error.
    transient_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            rate_limit_margin: RATE_LIMIT_MARGIN,
            timeout_delay: TIMEOUT_BACKOFF,
            transient_delay: TRANSIENT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with custom settings.
    ///
    /// `max_attempts` is clamped to at least 1.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        rate_limit_margin: Duration,
        timeout_delay: Duration,
        transient_delay: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            rate_limit_margin,
            timeout_delay,
            transient_delay,
        }
    }

    /// Creates a policy with a custom attempt budget and default backoff.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Returns the attempt budget.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides whether attempt number `attempt` (1-indexed) may be followed by another.
    #[instrument(level = "debug", skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        let delay = match failure_type {
            FailureType::Interrupted => {
                return RetryDecision::DoNotRetry {
                    reason: "run interrupted".to_string(),
                };
            }
            FailureType::RateLimited { wait } => wait + self.rate_limit_margin,
            FailureType::Timeout => self.timeout_delay,
            FailureType::Transient => self.transient_delay,
        };

        if attempt >= self.max_attempts {
            debug!(attempt, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }
}

/// Classifies an attempt error for the retry decision.
#[must_use]
pub fn classify_error(error: &DownloadError) -> FailureType {
    match error {
        DownloadError::Source(SourceError::RateLimited { wait }) => {
            FailureType::RateLimited { wait: *wait }
        }
        DownloadError::Source(SourceError::Timeout { .. }) => FailureType::Timeout,
        DownloadError::Io { source, .. } if source.kind() == std::io::ErrorKind::TimedOut => {
            FailureType::Timeout
        }
        DownloadError::Interrupted { .. } => FailureType::Interrupted,
        DownloadError::Source(_)
        | DownloadError::Io { .. }
        | DownloadError::Incomplete { .. }
        | DownloadError::Oversized { .. } => FailureType::Transient,
    }
}
