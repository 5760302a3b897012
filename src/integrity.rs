//! Content fingerprinting for committed downloads.
//!
//! The digest is stored in the catalog for later auditing only. Duplicate
//! detection keys on `(file name, size)`, never on this value.

use std::path::Path;

use sha1::{Digest, Sha1};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument};

/// Block size used when streaming a file through the hasher.
pub const DIGEST_BLOCK_SIZE: usize = 8 * 1024;

/// Computes the lowercase hex SHA-1 digest of the file at `path`.
///
/// The file is read in [`DIGEST_BLOCK_SIZE`] blocks, so memory use does not
/// depend on file size.
///
/// # Errors
///
/// Returns the IO error raised while opening or reading the file.
#[instrument(level = "debug", fields(path = %path.display()))]
pub async fn digest_file(path: &Path) -> Result<String, std::io::Error> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha1::new();
    let mut block = vec![0u8; DIGEST_BLOCK_SIZE];
    let mut total: u64 = 0;

    loop {
        let read = file.read(&mut block).await?;
        if read == 0 {
            break;
        }
        hasher.update(&block[..read]);
        total += read as u64;
    }

    let digest = format!("{:x}", hasher.finalize());
    debug!(bytes = total, %digest, "computed digest");
    Ok(digest)
}
