//! Constants for the download module (attempt budget, backoff intervals).

use std::time::Duration;

/// Default attempt budget per item, including the first attempt.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 6;

/// Margin added on top of the wait a rate-limited source asks for.
pub const RATE_LIMIT_MARGIN: Duration = Duration::from_secs(1);

/// Pause before retrying after a timeout.
pub const TIMEOUT_BACKOFF: Duration = Duration::from_secs(10);

/// Pause before retrying after any other transient error.
pub const TRANSIENT_BACKOFF: Duration = Duration::from_secs(5);

/// How often waiting code re-checks the interrupt flag.
pub const INTERRUPT_POLL_INTERVAL: Duration = Duration::from_millis(50);
