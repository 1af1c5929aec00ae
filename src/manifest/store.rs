use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::models::{
    EntryKey, EntryStatus, Manifest, ManifestEntry, ManifestFile, ManifestStats,
};
use crate::fs_utils::checksum_file;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write manifest {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize manifest: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to hash {path}: {message}")]
    Hash { path: String, message: String },
    #[error("no manifest entry for {0}")]
    UnknownEntry(EntryKey),
}

/// Result of checking an item against the manifest and the file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Stored entry whose checksum matches the file on disk.
    Satisfied,
    NoEntry,
    /// Entry exists but has not been stored successfully.
    NotStored(EntryStatus),
    /// Entry claims the file is stored but it is absent.
    FileMissing,
    /// Entry claims the file is stored but its contents changed.
    Mismatch { expected: String, actual: String },
}

/// Shared handle to the durable manifest.
///
/// Every mutation takes the internal lock, applies the change, and persists
/// through a temp-file-then-rename write before releasing it, so concurrent
/// workers never observe or produce a torn manifest.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    path: PathBuf,
    flush_every: usize,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    manifest: Manifest,
    unsaved: usize,
}

impl ManifestStore {
    /// Load the manifest at `path`, or start an empty one.
    ///
    /// An unparsable manifest is renamed aside (`<name>.corrupt-N`) and an
    /// empty manifest is used instead. Entries left in `downloading` by an
    /// interrupted run are reset to `pending`.
    ///
    /// # Errors
    ///
    /// Returns an error only for I/O failures other than a missing file.
    pub async fn load(
        path: impl Into<PathBuf>,
        source: &str,
        flush_every: usize,
    ) -> Result<Self, ManifestError> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| write_error(parent, e))?;
        }

        let manifest = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<ManifestFile>(&bytes) {
                Ok(file) => {
                    let mut manifest = Manifest::from_file(file);
                    if manifest.source != source {
                        warn!(
                            manifest_source = %manifest.source,
                            configured_source = %source,
                            "Manifest belongs to a different source"
                        );
                    }
                    let reset = reset_interrupted(&mut manifest);
                    if reset > 0 {
                        info!(count = reset, "Reset interrupted downloads to pending");
                    }
                    info!(
                        path = %path.display(),
                        entries = manifest.entries.len(),
                        "Manifest loaded"
                    );
                    manifest
                }
                Err(e) => {
                    let quarantined = quarantine(&path).await?;
                    warn!(
                        path = %path.display(),
                        quarantined = %quarantined.display(),
                        error = %e,
                        "Manifest is corrupt; moved aside and starting fresh"
                    );
                    Manifest::new(source)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No manifest yet; starting empty");
                Manifest::new(source)
            }
            Err(e) => {
                return Err(ManifestError::Read {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        };

        Ok(Self {
            inner: Arc::new(Inner {
                path,
                flush_every: flush_every.max(1),
                state: Mutex::new(State {
                    manifest,
                    unsaved: 0,
                }),
            }),
        })
    }

    /// Path of the manifest file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Persist the manifest atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be serialized or written.
    pub async fn save(&self) -> Result<(), ManifestError> {
        let mut state = self.inner.state.lock().await;
        self.persist(&mut state).await
    }

    /// Insert or replace an entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the change cannot be persisted.
    pub async fn add_or_update(&self, entry: ManifestEntry) -> Result<(), ManifestError> {
        let mut state = self.inner.state.lock().await;
        debug!(key = %entry.key(), status = %entry.status, "Manifest update");
        state.manifest.entries.insert(entry.key(), entry);
        self.after_mutation(&mut state).await
    }

    /// Fetch a copy of an entry.
    pub async fn get(&self, post_id: &str, filename: &str) -> Option<ManifestEntry> {
        let state = self.inner.state.lock().await;
        state
            .manifest
            .entries
            .get(&EntryKey::new(post_id, filename))
            .cloned()
    }

    /// Update the status of an existing entry, appending `notes`.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::UnknownEntry`] if no such entry exists, or an
    /// I/O error if the change cannot be persisted.
    pub async fn mark_status(
        &self,
        post_id: &str,
        filename: &str,
        status: EntryStatus,
        notes: &str,
    ) -> Result<(), ManifestError> {
        let key = EntryKey::new(post_id, filename);
        let mut state = self.inner.state.lock().await;
        let Some(entry) = state.manifest.entries.get_mut(&key) else {
            return Err(ManifestError::UnknownEntry(key));
        };
        entry.status = status;
        entry.push_note(notes);
        debug!(key = %key, status = %status, "Manifest status change");
        self.after_mutation(&mut state).await
    }

    /// Compare the manifest entry against the file at `local_path`.
    ///
    /// The file is hashed without holding the manifest lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub async fn verify(
        &self,
        post_id: &str,
        filename: &str,
        local_path: &Path,
    ) -> Result<Verification, ManifestError> {
        let Some(entry) = self.get(post_id, filename).await else {
            return Ok(Verification::NoEntry);
        };
        if !entry.status.is_stored() {
            return Ok(Verification::NotStored(entry.status));
        }
        let Some(expected) = entry.checksum else {
            return Ok(Verification::NotStored(entry.status));
        };

        let actual = checksum_file(local_path)
            .await
            .map_err(|e| ManifestError::Hash {
                path: local_path.display().to_string(),
                message: format!("{e:#}"),
            })?;

        Ok(match actual {
            None => Verification::FileMissing,
            Some((actual, _)) if actual == expected => Verification::Satisfied,
            Some((actual, _)) => Verification::Mismatch { expected, actual },
        })
    }

    /// True if the item was stored earlier and the file on disk still matches.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub async fn is_already_satisfied(
        &self,
        post_id: &str,
        filename: &str,
        local_path: &Path,
    ) -> Result<bool, ManifestError> {
        Ok(self.verify(post_id, filename, local_path).await? == Verification::Satisfied)
    }

    /// Counts by status, byte total, and distinct-checksum count.
    pub async fn stats(&self) -> ManifestStats {
        let state = self.inner.state.lock().await;
        let mut stats = ManifestStats {
            total_entries: state.manifest.entries.len(),
            ..ManifestStats::default()
        };
        let mut checksums = std::collections::HashSet::new();

        for entry in state.manifest.entries.values() {
            *stats.by_status.entry(entry.status).or_insert(0) += 1;
            if entry.status.is_stored() {
                stats.total_bytes += entry.byte_size.unwrap_or(0);
                if let Some(checksum) = &entry.checksum {
                    checksums.insert(checksum.clone());
                }
            }
        }
        stats.distinct_checksums = checksums.len();
        stats
    }

    /// All entries in key order.
    pub async fn entries(&self) -> Vec<ManifestEntry> {
        let state = self.inner.state.lock().await;
        state.manifest.entries.values().cloned().collect()
    }

    async fn after_mutation(&self, state: &mut State) -> Result<(), ManifestError> {
        state.unsaved += 1;
        if state.unsaved >= self.inner.flush_every {
            self.persist(state).await?;
        }
        Ok(())
    }

    async fn persist(&self, state: &mut State) -> Result<(), ManifestError> {
        state.manifest.updated_at = Utc::now();
        let bytes = serde_json::to_vec_pretty(&state.manifest.to_file())?;
        let staged = stage(&self.inner.path, &bytes).await?;
        commit(&staged, &self.inner.path).await?;
        state.unsaved = 0;
        debug!(
            path = %self.inner.path.display(),
            entries = state.manifest.entries.len(),
            "Manifest saved"
        );
        Ok(())
    }
}

fn write_error(path: &Path, source: std::io::Error) -> ManifestError {
    ManifestError::Write {
        path: path.display().to_string(),
        source,
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write the full manifest to its staging file and flush it to disk.
async fn stage(path: &Path, bytes: &[u8]) -> Result<PathBuf, ManifestError> {
    let temp = staging_path(path);
    let mut file = tokio::fs::File::create(&temp)
        .await
        .map_err(|e| write_error(&temp, e))?;
    file.write_all(bytes).await.map_err(|e| write_error(&temp, e))?;
    file.sync_all().await.map_err(|e| write_error(&temp, e))?;
    Ok(temp)
}

/// Atomically replace the manifest with the staged copy.
async fn commit(staged: &Path, path: &Path) -> Result<(), ManifestError> {
    tokio::fs::rename(staged, path)
        .await
        .map_err(|e| write_error(path, e))
}

/// Move a corrupt manifest out of the way, returning its new path.
async fn quarantine(path: &Path) -> Result<PathBuf, ManifestError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut n = 1_u32;
    loop {
        let candidate = path.with_file_name(format!("{file_name}.corrupt-{n}"));
        let exists = tokio::fs::try_exists(&candidate)
            .await
            .map_err(|e| write_error(&candidate, e))?;
        if !exists {
            tokio::fs::rename(path, &candidate)
                .await
                .map_err(|e| write_error(path, e))?;
            return Ok(candidate);
        }
        n += 1;
    }
}

fn reset_interrupted(manifest: &mut Manifest) -> usize {
    let mut count = 0;
    for entry in manifest.entries.values_mut() {
        if entry.status == EntryStatus::Downloading {
            entry.status = EntryStatus::Pending;
            entry.push_note("interrupted during download");
            count += 1;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tempfile::TempDir;

    use super::*;
    use crate::fs_utils::checksum_bytes;
    use crate::manifest::models::RetrievedFrom;
    use crate::media::MediaType;

    fn entry(post: &str, file: &str, status: EntryStatus) -> ManifestEntry {
        ManifestEntry {
            post_id: post.to_string(),
            post_url: format!("https://blog.example.com/post/{post}"),
            timestamp: Utc::now(),
            media_type: MediaType::Image,
            filename: file.to_string(),
            byte_size: None,
            checksum: None,
            original_url: format!("https://cdn.example.com/{file}"),
            alternate_urls: vec![],
            missing_on_primary: false,
            retrieved_from: None,
            archive_snapshot_url: None,
            archive_snapshot_timestamp: None,
            status,
            notes: String::new(),
        }
    }

    async fn open(dir: &TempDir) -> ManifestStore {
        ManifestStore::load(dir.path().join("manifest.json"), "blog", 1)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_load_missing_starts_empty() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        assert!(store.entries().await.is_empty());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_roundtrip_through_disk() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        store
            .add_or_update(entry("1", "1_a.jpg", EntryStatus::Pending))
            .await
            .unwrap();
        store
            .mark_status("1", "1_a.jpg", EntryStatus::Missing, "not in archive")
            .await
            .unwrap();

        let reloaded = open(&dir).await;
        let e = reloaded.get("1", "1_a.jpg").await.unwrap();
        assert_eq!(e.status, EntryStatus::Missing);
        assert_eq!(e.notes, "not in archive");
    }

    #[tokio::test]
    async fn test_mark_status_unknown_entry() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let err = store
            .mark_status("nope", "nope.jpg", EntryStatus::Failed, "")
            .await
            .unwrap_err();
        assert!(matches!(err, ManifestError::UnknownEntry(_)));
    }

    #[tokio::test]
    async fn test_corrupt_manifest_is_quarantined() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();
        tokio::fs::write(dir.path().join("manifest.json.corrupt-1"), b"older")
            .await
            .unwrap();

        let store = open(&dir).await;
        assert!(store.entries().await.is_empty());
        assert!(!path.exists());

        let quarantined = dir.path().join("manifest.json.corrupt-2");
        assert_eq!(tokio::fs::read(&quarantined).await.unwrap(), b"{ not json");
        assert_eq!(
            tokio::fs::read(dir.path().join("manifest.json.corrupt-1"))
                .await
                .unwrap(),
            b"older"
        );
    }

    #[tokio::test]
    async fn test_interrupted_entries_reset_to_pending() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        store
            .add_or_update(entry("1", "1_a.jpg", EntryStatus::Downloading))
            .await
            .unwrap();

        let reloaded = open(&dir).await;
        let e = reloaded.get("1", "1_a.jpg").await.unwrap();
        assert_eq!(e.status, EntryStatus::Pending);
        assert!(e.notes.contains("interrupted"));
    }

    #[tokio::test]
    async fn test_kill_between_stage_and_commit_keeps_prior_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.json");
        let store = open(&dir).await;
        store
            .add_or_update(entry("1", "1_a.jpg", EntryStatus::Pending))
            .await
            .unwrap();

        // Stage a newer manifest but never commit it, as if the process died
        // between the write and the rename.
        let mut newer = Manifest::new("blog");
        let e = entry("2", "2_b.jpg", EntryStatus::Pending);
        newer.entries.insert(e.key(), e);
        let bytes = serde_json::to_vec_pretty(&newer.to_file()).unwrap();
        let staged = stage(&path, &bytes[..bytes.len() / 2]).await.unwrap();
        assert!(staged.exists());

        let reloaded = open(&dir).await;
        let entries = reloaded.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].post_id, "1");
    }

    #[tokio::test]
    async fn test_flush_cadence_defers_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.json");
        let store = ManifestStore::load(&path, "blog", 3).await.unwrap();

        store
            .add_or_update(entry("1", "a", EntryStatus::Pending))
            .await
            .unwrap();
        store
            .add_or_update(entry("1", "b", EntryStatus::Pending))
            .await
            .unwrap();
        assert!(!path.exists());

        store
            .add_or_update(entry("1", "c", EntryStatus::Pending))
            .await
            .unwrap();
        assert!(path.exists());

        store
            .add_or_update(entry("1", "d", EntryStatus::Pending))
            .await
            .unwrap();
        store.save().await.unwrap();
        assert_eq!(open(&dir).await.entries().await.len(), 4);
    }

    #[tokio::test]
    async fn test_verify_checks_file_contents() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let file = dir.path().join("1_a.jpg");
        tokio::fs::write(&file, b"image bytes").await.unwrap();

        let mut e = entry("1", "1_a.jpg", EntryStatus::Downloaded);
        e.checksum = Some(checksum_bytes(b"image bytes"));
        e.byte_size = Some(11);
        e.retrieved_from = Some(RetrievedFrom::Primary);
        store.add_or_update(e).await.unwrap();

        assert!(store.is_already_satisfied("1", "1_a.jpg", &file).await.unwrap());

        tokio::fs::write(&file, b"tampered").await.unwrap();
        let verification = store.verify("1", "1_a.jpg", &file).await.unwrap();
        assert!(matches!(verification, Verification::Mismatch { .. }));
        assert!(!store.is_already_satisfied("1", "1_a.jpg", &file).await.unwrap());

        tokio::fs::remove_file(&file).await.unwrap();
        assert_eq!(
            store.verify("1", "1_a.jpg", &file).await.unwrap(),
            Verification::FileMissing
        );
        assert_eq!(
            store.verify("2", "2_b.jpg", &file).await.unwrap(),
            Verification::NoEntry
        );
    }

    #[tokio::test]
    async fn test_missing_entry_is_not_satisfied() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        store
            .add_or_update(entry("1", "1_a.jpg", EntryStatus::Missing))
            .await
            .unwrap();
        assert_eq!(
            store
                .verify("1", "1_a.jpg", &dir.path().join("1_a.jpg"))
                .await
                .unwrap(),
            Verification::NotStored(EntryStatus::Missing)
        );
    }

    #[tokio::test]
    async fn test_stats() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;

        let mut a = entry("1", "a", EntryStatus::Downloaded);
        a.byte_size = Some(100);
        a.checksum = Some("sha256:aa".to_string());
        let mut b = entry("1", "b", EntryStatus::Archived);
        b.byte_size = Some(50);
        b.checksum = Some("sha256:aa".to_string());
        let c = entry("2", "c", EntryStatus::Missing);

        for e in [a, b, c] {
            store.add_or_update(e).await.unwrap();
        }

        let stats = store.stats().await;
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.total_bytes, 150);
        assert_eq!(stats.distinct_checksums, 1);
        assert_eq!(stats.duplicate_entries(), 1);
        assert_eq!(stats.count(EntryStatus::Downloaded), 1);
        assert_eq!(stats.count(EntryStatus::Missing), 1);
        assert_eq!(stats.count(EntryStatus::Failed), 0);
    }

    #[tokio::test]
    async fn test_concurrent_updates_do_not_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;

        let mut handles = Vec::new();
        for worker in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    let file = format!("{worker}_{i}.jpg");
                    store
                        .add_or_update(entry(&worker.to_string(), &file, EntryStatus::Pending))
                        .await
                        .unwrap();
                    store
                        .mark_status(&worker.to_string(), &file, EntryStatus::Downloaded, "")
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let reloaded = open(&dir).await;
        let entries = reloaded.entries().await;
        assert_eq!(entries.len(), 80);
        assert!(entries.iter().all(|e| e.status == EntryStatus::Downloaded));
    }
}
