//! Run configuration: what to download, where, and how aggressively.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use thiserror::Error;

use crate::catalog::DEFAULT_CATALOG_FILE;
use crate::download::{DEFAULT_CONCURRENCY, DEFAULT_MAX_ATTEMPTS};

/// Upper bound accepted for the attempt budget.
pub const MAX_ATTEMPTS_LIMIT: u32 = 20;

/// Configuration errors. All of them abort the run before any download starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No source identity was given.
    #[error("source identity cannot be empty")]
    EmptySource,

    /// Minimum size filter is above the maximum.
    #[error("minimum size {min} exceeds maximum size {max}")]
    SizeRange {
        /// Configured minimum in bytes.
        min: u64,
        /// Configured maximum in bytes.
        max: u64,
    },

    /// Start of the date range is after its end.
    #[error("date range start {since} is after end {until}")]
    DateRange {
        /// Inclusive start.
        since: DateTime<Utc>,
        /// Inclusive end.
        until: DateTime<Utc>,
    },

    /// A date bound could not be parsed.
    #[error("invalid date '{value}': expected RFC 3339 or YYYY-MM-DD")]
    InvalidDate {
        /// The rejected input.
        value: String,
    },

    /// Attempt budget outside `1..=MAX_ATTEMPTS_LIMIT`.
    #[error("invalid attempt budget {value}: must be between 1 and {MAX_ATTEMPTS_LIMIT}")]
    InvalidAttempts {
        /// The rejected value.
        value: u32,
    },

    /// Catalog file name is empty or contains a path separator.
    #[error("invalid catalog file name '{value}'")]
    InvalidCatalogName {
        /// The rejected value.
        value: String,
    },
}

/// Message-level filters applied before a message becomes a download candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterCriteria {
    /// Only accept documents flagged as video.
    pub video_only: bool,
    /// Minimum declared size in bytes (0 disables).
    pub min_size: u64,
    /// Maximum declared size in bytes (0 disables).
    pub max_size: u64,
    /// Inclusive lower date bound.
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper date bound.
    pub until: Option<DateTime<Utc>>,
    /// Skip forwarded messages.
    pub skip_forwards: bool,
    /// Skip replies.
    pub skip_replies: bool,
}

impl Default for FilterCriteria {
    fn default() -> Self {
        Self {
            video_only: true,
            min_size: 0,
            max_size: 0,
            since: None,
            until: None,
            skip_forwards: false,
            skip_replies: false,
        }
    }
}

/// Complete configuration for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Source identity (manifest path or URL).
    pub source: String,
    /// Destination root for the folder hierarchy and the catalog.
    pub output_dir: PathBuf,
    /// File name of the catalog inside `output_dir`.
    pub catalog_name: String,
    /// Candidate filters.
    pub filter: FilterCriteria,
    /// Maximum number of downloads scheduled this run (0 = unlimited).
    pub limit: usize,
    /// Skip candidates already present in the catalog.
    pub dedup: bool,
    /// Maximum concurrent downloads.
    pub concurrency: usize,
    /// Attempts per item, including the first.
    pub max_attempts: u32,
}

impl RunConfig {
    /// Creates a configuration with defaults for everything but source and root.
    #[must_use]
    pub fn new(source: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            output_dir: output_dir.into(),
            catalog_name: DEFAULT_CATALOG_FILE.to_string(),
            filter: FilterCriteria::default(),
            limit: 0,
            dedup: true,
            concurrency: DEFAULT_CONCURRENCY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Path of the catalog file.
    #[must_use]
    pub fn catalog_path(&self) -> PathBuf {
        self.output_dir.join(&self.catalog_name)
    }

    /// Checks option consistency. Concurrency bounds are enforced by the engine.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.trim().is_empty() {
            return Err(ConfigError::EmptySource);
        }
        let filter = &self.filter;
        if filter.min_size > 0 && filter.max_size > 0 && filter.min_size > filter.max_size {
            return Err(ConfigError::SizeRange {
                min: filter.min_size,
                max: filter.max_size,
            });
        }
        if let (Some(since), Some(until)) = (filter.since, filter.until) {
            if since > until {
                return Err(ConfigError::DateRange { since, until });
            }
        }
        if !(1..=MAX_ATTEMPTS_LIMIT).contains(&self.max_attempts) {
            return Err(ConfigError::InvalidAttempts {
                value: self.max_attempts,
            });
        }
        let name = self.catalog_name.trim();
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(ConfigError::InvalidCatalogName {
                value: self.catalog_name.clone(),
            });
        }
        Ok(())
    }
}

/// Parses a date bound given as RFC 3339 or a bare `YYYY-MM-DD` date.
///
/// A bare date maps to the start of that day (UTC), or to its last second
/// when `end_of_day` is set, so `--until 2024-05-02` includes the whole day.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidDate`] for anything else.
pub fn parse_date_bound(value: &str, end_of_day: bool) -> Result<DateTime<Utc>, ConfigError> {
    let trimmed = value.trim();
    if let Ok(datetime) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(datetime.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").map_err(|_| {
        ConfigError::InvalidDate {
            value: value.to_string(),
        }
    })?;
    let time = if end_of_day {
        NaiveTime::from_hms_opt(23, 59, 59)
    } else {
        NaiveTime::from_hms_opt(0, 0, 0)
    }
    .unwrap_or_default();
    Ok(date.and_time(time).and_utc())
}
