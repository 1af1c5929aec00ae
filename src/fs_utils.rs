//! File helpers: streaming checksums and atomic writes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::constants::{CHECKSUM_ALGORITHM, PARTIAL_SUFFIX};

const READ_BUF_SIZE: usize = 64 * 1024;

/// Incremental SHA-256 producing an algorithm-tagged hex checksum.
#[derive(Debug, Clone, Default)]
pub struct ChecksumWriter {
    hasher: Sha256,
    len: u64,
}

impl ChecksumWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.len += chunk.len() as u64;
    }

    /// Bytes hashed so far.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Finish hashing, returning `(digest_hex, checksum)`.
    #[must_use]
    pub fn finish(self) -> (String, String) {
        let digest = hex::encode(self.hasher.finalize());
        let tagged = tag_checksum(&digest);
        (digest, tagged)
    }
}

/// Prefix a hex digest with the checksum algorithm tag.
#[must_use]
pub fn tag_checksum(digest_hex: &str) -> String {
    format!("{CHECKSUM_ALGORITHM}:{digest_hex}")
}

/// Checksum of an in-memory buffer.
#[must_use]
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut writer = ChecksumWriter::new();
    writer.update(data);
    writer.finish().1
}

/// Checksum of a file on disk, read in chunks.
///
/// Returns `Ok(None)` if the file does not exist.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub async fn checksum_file(path: &Path) -> Result<Option<(String, u64)>> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(anyhow::Error::new(e))
                .with_context(|| format!("Failed to open {}", path.display()))
        }
    };

    let mut writer = ChecksumWriter::new();
    let mut buf = vec![0_u8; READ_BUF_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        writer.update(&buf[..n]);
    }

    let len = writer.len();
    Ok(Some((writer.finish().1, len)))
}

/// Path of the in-progress sibling used while streaming a download.
#[must_use]
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    path.with_file_name(name)
}

/// Write `data` next to `path` then rename it into place, returning the checksum.
///
/// # Errors
///
/// Returns an error if the temporary file cannot be written or renamed.
pub async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<String> {
    let temp = partial_path(path);
    let result = async {
        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp, path).await
    }
    .await;

    if let Err(e) = result {
        remove_if_exists(&temp).await;
        return Err(e);
    }
    Ok(checksum_bytes(data))
}

/// Best-effort removal of a file that may not exist.
pub async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!(path = %path.display(), error = %e, "Failed to remove file"),
    }
}
