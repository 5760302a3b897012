//! Durable catalog of committed downloads.
//!
//! The catalog is a single pretty-printed JSON array rewritten in full after
//! every commit. The in-memory copy is a write-through cache; the file on disk
//! is the source of truth for the next run.
//!
//! Duplicate detection keys on `(file name, declared size)`. Two different
//! files sharing both are treated as the same item; the stored SHA-1 is an
//! audit fingerprint and is never compared.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Default catalog file name, created in the destination root.
pub const DEFAULT_CATALOG_FILE: &str = "metadados.json";

/// Suffix for the temporary file written before the atomic rename.
const TEMP_SUFFIX: &str = ".tmp";

/// Suffix under which an unreadable catalog is preserved before starting fresh.
const CORRUPT_SUFFIX: &str = ".corrupt";

/// Errors raised while persisting the catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The in-memory catalog could not be serialized.
    #[error("failed to serialize catalog: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The catalog file could not be written or replaced.
    #[error("failed to write catalog {path}: {source}")]
    Write {
        /// Path being written.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl CatalogError {
    fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }
}

/// One committed download.
///
/// Field names on disk are kept stable so catalogs from earlier runs keep
/// deduplicating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRecord {
    /// Source message id.
    #[serde(rename = "id_mensagem", default)]
    pub message_id: i64,
    /// Message timestamp (UTC).
    #[serde(rename = "data")]
    pub date: DateTime<Utc>,
    /// Final file name; half of the dedup key.
    #[serde(rename = "nome_original", default)]
    pub file_name: String,
    /// Declared size in bytes; the other half of the dedup key.
    #[serde(rename = "tamanho", default)]
    pub size: u64,
    /// Whether the source flagged the document as video.
    #[serde(rename = "eh_video", default)]
    pub is_video: bool,
    /// Caption text as received.
    #[serde(rename = "legenda", default)]
    pub caption: Option<String>,
    /// Hex SHA-1 of the committed file.
    #[serde(rename = "sha1", default)]
    pub sha1: String,
    /// Final local path.
    #[serde(rename = "caminho", default)]
    pub path: String,
}

impl DownloadRecord {
    fn dedup_key(&self) -> Option<(String, u64)> {
        (!self.file_name.is_empty()).then(|| (self.file_name.clone(), self.size))
    }
}

/// Catalog of committed downloads backed by a JSON file.
///
/// `commit` is safe to call from concurrent tasks: every serialize-and-write
/// runs under one mutex, so writes never interleave.
#[derive(Debug)]
pub struct Catalog {
    path: PathBuf,
    /// Dedup index, built once when the catalog is loaded.
    index: HashSet<(String, u64)>,
    records: Mutex<Vec<DownloadRecord>>,
}

impl Catalog {
    /// Creates an empty catalog that will persist to `path`.
    #[must_use]
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            index: HashSet::new(),
            records: Mutex::new(Vec::new()),
        }
    }

    /// Loads the catalog at `path`.
    ///
    /// Never fails: a missing file yields an empty catalog, and an unreadable
    /// or malformed file is logged, preserved next to the original with a
    /// `.corrupt` suffix, and replaced by an empty catalog.
    #[instrument(fields(path = %path.display()))]
    pub async fn load(path: &Path) -> Self {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!("no catalog yet, starting empty");
                return Self::empty(path);
            }
            Err(error) => {
                warn!(error = %error, "failed to read catalog, starting empty");
                return Self::empty(path);
            }
        };

        let records: Vec<DownloadRecord> = match serde_json::from_slice(&bytes) {
            Ok(records) => records,
            Err(error) => {
                warn!(error = %error, "malformed catalog, starting empty");
                preserve_corrupt(path).await;
                return Self::empty(path);
            }
        };

        let index: HashSet<(String, u64)> =
            records.iter().filter_map(DownloadRecord::dedup_key).collect();
        info!(records = records.len(), indexed = index.len(), "catalog loaded");

        Self {
            path: path.to_path_buf(),
            index,
            records: Mutex::new(records),
        }
    }

    /// Location of the persisted catalog.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if a record with this `(file name, size)` existed at load time.
    #[must_use]
    pub fn exists(&self, file_name: &str, size: u64) -> bool {
        self.index.contains(&(file_name.to_string(), size))
    }

    /// Number of records currently held.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Returns true when no record is held.
    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// Snapshot of all records in commit order.
    pub async fn records(&self) -> Vec<DownloadRecord> {
        self.records.lock().await.clone()
    }

    /// Appends `record` and rewrites the catalog file before returning.
    ///
    /// On failure the record is dropped from memory as well, so memory keeps
    /// mirroring disk. The downloaded file is left in place by the caller.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] if serialization or the file write fails.
    #[instrument(skip(self, record), fields(file = %record.file_name, size = record.size))]
    pub async fn commit(&self, record: DownloadRecord) -> Result<(), CatalogError> {
        let mut records = self.records.lock().await;
        records.push(record);

        if let Err(error) = self.persist(&records).await {
            records.pop();
            return Err(error);
        }

        debug!(records = records.len(), "catalog persisted");
        Ok(())
    }

    /// Writes `records` to a temporary sibling, syncs it, then renames it over
    /// the catalog.
    async fn persist(&self, records: &[DownloadRecord]) -> Result<(), CatalogError> {
        let json = serde_json::to_vec_pretty(records)?;
        let temp = sibling_with_suffix(&self.path, TEMP_SUFFIX);

        let mut file = File::create(&temp)
            .await
            .map_err(|e| CatalogError::write(&temp, e))?;
        file.write_all(&json)
            .await
            .map_err(|e| CatalogError::write(&temp, e))?;
        // The rename must never publish a file whose data is not on disk yet.
        file.sync_all()
            .await
            .map_err(|e| CatalogError::write(&temp, e))?;
        drop(file);

        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| CatalogError::write(&self.path, e))?;
        Ok(())
    }
}

async fn preserve_corrupt(path: &Path) {
    let backup = sibling_with_suffix(path, CORRUPT_SUFFIX);
    match tokio::fs::copy(path, &backup).await {
        Ok(_) => warn!(backup = %backup.display(), "previous catalog preserved"),
        Err(error) => warn!(error = %error, "failed to preserve malformed catalog"),
    }
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}
