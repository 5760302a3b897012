//! Channel Media Downloader Library
//!
//! Mirrors the video documents of a channel-like message source into a local
//! folder tree derived from each message caption, and keeps a JSON catalog of
//! everything downloaded so later runs skip it.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`source`] - Message source trait and the HTTP manifest implementation
//! - [`filter`] - Message filters producing download candidates
//! - [`layout`] - Caption to folder hierarchy and file name
//! - [`catalog`] - Persistent catalog of committed downloads
//! - [`integrity`] - Content digest of committed files
//! - [`download`] - Concurrent, resumable download engine with retries
//! - [`config`] - Validated run configuration

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod catalog;
pub mod config;
pub mod download;
pub mod filter;
pub mod integrity;
pub mod layout;
pub mod source;

// Re-export commonly used types
pub use catalog::{Catalog, CatalogError, DownloadRecord};
pub use config::{ConfigError, FilterCriteria, RunConfig};
pub use download::{
    DEFAULT_CONCURRENCY, DEFAULT_MAX_ATTEMPTS, DownloadEngine, DownloadError, DownloadStats,
    EngineError, FailureType, RetryDecision, RetryPolicy, RunSummary, classify_error,
};
pub use filter::{CandidateFilter, MediaCandidate, Rejection};
pub use layout::{DestinationPath, resolve};
pub use source::{DocumentRef, ManifestSource, MediaSource, SourceError, SourceMessage};
