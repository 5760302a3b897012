use std::path::Path;

use tracing::warn;

use super::DownloadStats;
use crate::catalog::{Catalog, DownloadRecord};
use crate::filter::MediaCandidate;

/// Records a verified download in the catalog.
///
/// A failed commit keeps the file on disk; the item is cataloged again when
/// a later run reprocesses it.
pub(super) async fn commit_download(
    catalog: &Catalog,
    candidate: &MediaCandidate,
    final_path: &Path,
    sha1: String,
    stats: &DownloadStats,
) {
    let record = build_record(candidate, final_path, sha1);
    if let Err(error) = catalog.commit(record).await {
        warn!(
            message_id = candidate.message_id,
            catalog = %catalog.path().display(),
            path = %final_path.display(),
            error = %error,
            "failed to persist catalog record, file kept"
        );
        stats.increment_catalog_errors();
    }
}

fn build_record(candidate: &MediaCandidate, final_path: &Path, sha1: String) -> DownloadRecord {
    let file_name = final_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    DownloadRecord {
        message_id: candidate.message_id,
        date: candidate.date,
        file_name,
        size: candidate.size(),
        is_video: candidate.is_video(),
        caption: Some(candidate.caption.clone()),
        sha1,
        path: final_path.to_string_lossy().into_owned(),
    }
}
