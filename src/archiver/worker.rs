use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::fetch::HttpFetcher;
use super::queue::MediaQueue;
use super::stats::StatsCollector;
use crate::error::FetchError;
use crate::events::{ArchiveEvent, EventBus};
use crate::fs_utils::checksum_file;
use crate::manifest::{EntryStatus, ManifestEntry, ManifestStore, RetrievedFrom, Verification};
use crate::media::MediaItem;
use crate::recovery::{RecoveryEngine, RecoveryResult, RecoveryStatus};

/// Stage an item is in, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemState {
    CheckManifest,
    FetchPrimary,
    AttemptRecovery,
}

/// Terminal outcome of one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Already stored; nothing fetched.
    Skipped,
    Downloaded { bytes: u64 },
    /// Stored from an archived copy.
    Archived { bytes: u64 },
    Missing,
    Failed(String),
}

impl ItemOutcome {
    #[must_use]
    pub fn status(&self) -> EntryStatus {
        match self {
            Self::Skipped => EntryStatus::Skipped,
            Self::Downloaded { .. } => EntryStatus::Downloaded,
            Self::Archived { .. } => EntryStatus::Archived,
            Self::Missing => EntryStatus::Missing,
            Self::Failed(_) => EntryStatus::Failed,
        }
    }

    #[must_use]
    pub fn byte_size(&self) -> Option<u64> {
        match self {
            Self::Downloaded { bytes } | Self::Archived { bytes } => Some(*bytes),
            _ => None,
        }
    }
}

/// Processes media items one at a time.
///
/// Cheap to clone; every clone shares the fetcher, manifest, recovery
/// engine, and run counters.
#[derive(Clone)]
pub struct DownloadWorker {
    fetcher: HttpFetcher,
    manifest: ManifestStore,
    recovery: Option<Arc<RecoveryEngine>>,
    output_dir: PathBuf,
    resume: bool,
    events: EventBus,
    stats: Arc<StatsCollector>,
}

impl DownloadWorker {
    #[must_use]
    pub fn new(
        fetcher: HttpFetcher,
        manifest: ManifestStore,
        recovery: Option<Arc<RecoveryEngine>>,
        output_dir: PathBuf,
        resume: bool,
        events: EventBus,
        stats: Arc<StatsCollector>,
    ) -> Self {
        Self {
            fetcher,
            manifest,
            recovery,
            output_dir,
            resume,
            events,
            stats,
        }
    }

    /// Pull items until the queue shuts this worker down or `cancel` fires.
    ///
    /// An item already in progress when `cancel` fires is finished first.
    pub async fn run(self, id: usize, queue: MediaQueue, cancel: CancellationToken) {
        debug!(worker = id, "Worker started");
        loop {
            let item = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                item = queue.dequeue() => item,
            };
            let Some(item) = item else {
                break;
            };

            self.events.emit(ArchiveEvent::ItemStarted {
                worker: id,
                post_id: item.post_id.clone(),
                filename: item.filename().to_string(),
            });

            let outcome = self.process(&item).await;
            self.stats.record(&outcome);
            self.events.emit(ArchiveEvent::ItemResolved {
                worker: id,
                post_id: item.post_id.clone(),
                filename: item.filename().to_string(),
                status: outcome.status(),
                byte_size: outcome.byte_size(),
            });
            queue.mark_complete();
        }
        debug!(worker = id, "Worker stopped");
    }

    /// Drive one item to a terminal outcome.
    ///
    /// Never fails: errors and panics are contained here, logged, recorded
    /// in the run's error list, and the item is marked failed.
    pub async fn process(&self, item: &MediaItem) -> ItemOutcome {
        let result = AssertUnwindSafe(self.process_inner(item))
            .catch_unwind()
            .await;

        let message = match result {
            Ok(Ok(outcome)) => return outcome,
            Ok(Err(e)) => format!("{e:#}"),
            Err(panic) => format!("worker panicked: {}", panic_message(panic.as_ref())),
        };

        error!(
            post_id = %item.post_id,
            filename = %item.filename(),
            "Item failed: {message}"
        );
        self.report_error(item, format!("{}/{}: {message}", item.post_id, item.filename()));
        self.mark_failed(item, &message).await;
        ItemOutcome::Failed(message)
    }

    async fn process_inner(&self, item: &MediaItem) -> Result<ItemOutcome> {
        let dest = item.local_path(&self.output_dir);
        let mut notes = Vec::new();

        transition(item, ItemState::CheckManifest);
        if self.resume {
            if let Some(outcome) = self.check_manifest(item, &dest, &mut notes).await? {
                return Ok(outcome);
            }
        }

        // Notes describe the latest attempt only.
        let mut entry = ManifestEntry::pending(item);
        for note in &notes {
            entry.push_note(note);
        }
        entry.status = EntryStatus::Downloading;
        self.manifest
            .add_or_update(entry.clone())
            .await
            .context("Failed to record download start")?;

        transition(item, ItemState::FetchPrimary);
        let mut failures = Vec::new();
        for url in &item.urls {
            match self.fetcher.download(url, item.media_type, &dest).await {
                Ok(downloaded) => {
                    entry.status = EntryStatus::Downloaded;
                    entry.retrieved_from = Some(RetrievedFrom::Primary);
                    entry.byte_size = Some(downloaded.byte_size);
                    entry.checksum = Some(downloaded.checksum);
                    entry.original_url = url.clone();
                    entry.alternate_urls =
                        item.urls.iter().filter(|u| *u != url).cloned().collect();
                    self.manifest
                        .add_or_update(entry)
                        .await
                        .context("Failed to record download")?;

                    info!(
                        post_id = %item.post_id,
                        filename = %item.filename(),
                        bytes = downloaded.byte_size,
                        attempts = downloaded.attempts,
                        "Downloaded"
                    );
                    return Ok(ItemOutcome::Downloaded {
                        bytes: downloaded.byte_size,
                    });
                }
                Err(err) => {
                    if matches!(err.error(), FetchError::Io { .. }) {
                        return Err(anyhow::Error::new(err.into_inner()))
                            .with_context(|| format!("Failed to store {}", dest.display()));
                    }
                    warn!(
                        post_id = %item.post_id,
                        url = %url,
                        attempts = err.attempts(),
                        exhausted = err.is_exhausted(),
                        "Primary fetch failed: {err}"
                    );
                    failures.push(format!("{url}: {err}"));
                }
            }
        }

        // Every candidate failed terminally or ran out of retries.
        entry.missing_on_primary = true;
        entry.push_note(&format!("primary failed: {}", failures.join("; ")));

        let recovery = match &self.recovery {
            Some(engine) => {
                transition(item, ItemState::AttemptRecovery);
                engine.recover(item, &dest).await
            }
            None => RecoveryResult::skipped("recovery disabled"),
        };
        entry.push_note(&recovery.summary());

        if recovery.is_success() {
            let bytes = recovery.byte_size.unwrap_or(0);
            entry.status = EntryStatus::Archived;
            entry.retrieved_from = Some(RetrievedFrom::Archive);
            entry.byte_size = recovery.byte_size;
            entry.checksum = recovery.checksum;
            entry.archive_snapshot_url = recovery.snapshot_url;
            entry.archive_snapshot_timestamp = recovery.snapshot_timestamp;
            self.manifest
                .add_or_update(entry)
                .await
                .context("Failed to record recovery")?;
            info!(
                post_id = %item.post_id,
                filename = %item.filename(),
                bytes,
                "Recovered from archive"
            );
            return Ok(ItemOutcome::Archived { bytes });
        }

        if recovery.status == RecoveryStatus::Error {
            self.report_error(
                item,
                format!("{}/{}: {}", item.post_id, item.filename(), recovery.summary()),
            );
        }
        entry.status = EntryStatus::Missing;
        self.manifest
            .add_or_update(entry)
            .await
            .context("Failed to record missing item")?;
        warn!(
            post_id = %item.post_id,
            filename = %item.filename(),
            "Missing: {}",
            recovery.summary()
        );
        Ok(ItemOutcome::Missing)
    }

    /// Resume checks. Returns an outcome when the item needs no fetch.
    async fn check_manifest(
        &self,
        item: &MediaItem,
        dest: &Path,
        notes: &mut Vec<String>,
    ) -> Result<Option<ItemOutcome>> {
        let verification = self
            .manifest
            .verify(&item.post_id, item.filename(), dest)
            .await
            .context("Failed to verify manifest entry")?;

        match verification {
            Verification::Satisfied => {
                debug!(post_id = %item.post_id, filename = %item.filename(), "Already stored; skipping");
                Ok(Some(ItemOutcome::Skipped))
            }
            Verification::Mismatch { expected, actual } => {
                let message = format!(
                    "checksum mismatch for {}/{}: manifest has {expected}, file has {actual}",
                    item.post_id,
                    item.filename()
                );
                warn!(post_id = %item.post_id, filename = %item.filename(), "{message}; refetching");
                self.report_error(item, message.clone());
                notes.push(message);
                Ok(None)
            }
            Verification::FileMissing => {
                debug!(post_id = %item.post_id, filename = %item.filename(), "Stored file is gone; refetching");
                notes.push("stored file was missing; refetched".to_string());
                Ok(None)
            }
            Verification::NoEntry | Verification::NotStored(EntryStatus::Pending) => {
                self.adopt_existing(item, dest).await
            }
            Verification::NotStored(_) => Ok(None),
        }
    }

    /// Record a complete file already at `dest` that the manifest does not know.
    async fn adopt_existing(&self, item: &MediaItem, dest: &Path) -> Result<Option<ItemOutcome>> {
        let Some((checksum, len)) = checksum_file(dest).await? else {
            return Ok(None);
        };
        let digest = checksum.split_once(':').map_or(checksum.as_str(), |(_, hex)| hex);
        if let Err(reason) = self
            .fetcher
            .placeholder_policy()
            .inspect(item.media_type, None, len, digest)
        {
            debug!(path = %dest.display(), reason = %reason, "Not adopting existing file");
            return Ok(None);
        }

        let mut entry = ManifestEntry::pending(item);
        entry.status = EntryStatus::Downloaded;
        entry.retrieved_from = Some(RetrievedFrom::Cached);
        entry.byte_size = Some(len);
        entry.checksum = Some(checksum);
        entry.push_note("adopted existing file");
        self.manifest
            .add_or_update(entry)
            .await
            .context("Failed to record adopted file")?;

        info!(post_id = %item.post_id, filename = %item.filename(), bytes = len, "Adopted existing file");
        Ok(Some(ItemOutcome::Skipped))
    }

    async fn mark_failed(&self, item: &MediaItem, message: &str) {
        let mut entry = self
            .manifest
            .get(&item.post_id, item.filename())
            .await
            .unwrap_or_else(|| ManifestEntry::pending(item));
        entry.status = EntryStatus::Failed;
        entry.checksum = None;
        entry.byte_size = None;
        entry.push_note(message);
        if let Err(e) = self.manifest.add_or_update(entry).await {
            error!(post_id = %item.post_id, "Failed to mark item failed: {e:#}");
        }
    }

    fn report_error(&self, item: &MediaItem, message: String) {
        self.stats.error(message.clone());
        self.events.emit(ArchiveEvent::Error {
            post_id: Some(item.post_id.clone()),
            message,
        });
    }
}

fn transition(item: &MediaItem, state: ItemState) {
    debug!(post_id = %item.post_id, filename = %item.filename(), state = ?state, "Item state");
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use chrono::Utc;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::archiver::placeholder::PlaceholderPolicy;
    use crate::archiver::rate_limiter::TokenBucket;
    use crate::archiver::retry::RetryPolicy;
    use crate::fs_utils::checksum_bytes;
    use crate::media::MediaType;

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(
            reqwest::Client::new(),
            Arc::new(TokenBucket::new(1000.0, 100)),
            RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5), Duration::ZERO),
            PlaceholderPolicy::new(8, HashSet::new()),
        )
    }

    async fn worker(dir: &TempDir) -> (DownloadWorker, Arc<StatsCollector>) {
        let manifest = ManifestStore::load(dir.path().join("manifest.json"), "test", 1)
            .await
            .unwrap();
        let stats = Arc::new(StatsCollector::default());
        let worker = DownloadWorker::new(
            fetcher(),
            manifest,
            None,
            dir.path().to_path_buf(),
            true,
            EventBus::default(),
            Arc::clone(&stats),
        );
        (worker, stats)
    }

    fn item(urls: Vec<String>) -> MediaItem {
        MediaItem::new(
            "42",
            urls,
            MediaType::Image,
            "https://blog.example.com/post/42",
            Utc::now(),
        )
        .unwrap()
    }

    fn body() -> Vec<u8> {
        vec![0x89; 512]
    }

    #[tokio::test]
    async fn test_download_then_skip() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.png"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body(), "image/png"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let (worker, _) = worker(&dir).await;
        let item = item(vec![format!("{}/a.png", server.uri())]);

        assert_eq!(worker.process(&item).await, ItemOutcome::Downloaded { bytes: 512 });
        let entry = worker.manifest.get("42", item.filename()).await.unwrap();
        assert_eq!(entry.status, EntryStatus::Downloaded);
        assert_eq!(entry.retrieved_from, Some(RetrievedFrom::Primary));
        assert_eq!(entry.checksum, Some(checksum_bytes(&body())));

        // Second pass is satisfied from the manifest; the mock expects one hit.
        assert_eq!(worker.process(&item).await, ItemOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_falls_back_to_alternate_candidate() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/big.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/small.png"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body(), "image/png"))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let (worker, _) = worker(&dir).await;
        let big = format!("{}/big.png", server.uri());
        let small = format!("{}/small.png", server.uri());
        let item = item(vec![big.clone(), small.clone()]);

        assert!(matches!(worker.process(&item).await, ItemOutcome::Downloaded { .. }));
        let entry = worker.manifest.get("42", item.filename()).await.unwrap();
        assert_eq!(entry.original_url, small);
        assert_eq!(entry.alternate_urls, vec![big]);
    }

    #[tokio::test]
    async fn test_not_found_without_recovery_is_missing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let (worker, _) = worker(&dir).await;
        let item = item(vec![format!("{}/gone.jpg", server.uri())]);

        assert_eq!(worker.process(&item).await, ItemOutcome::Missing);
        let entry = worker.manifest.get("42", item.filename()).await.unwrap();
        assert_eq!(entry.status, EntryStatus::Missing);
        assert!(entry.missing_on_primary);
        assert!(entry.notes.contains("recovery disabled"));
        assert!(entry.checksum.is_none());
    }

    #[tokio::test]
    async fn test_rerun_of_missing_item_does_not_grow_notes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let (worker, _) = worker(&dir).await;
        let item = item(vec![format!("{}/gone.jpg", server.uri())]);

        assert_eq!(worker.process(&item).await, ItemOutcome::Missing);
        let first = worker.manifest.get("42", item.filename()).await.unwrap().notes;
        for _ in 0..3 {
            assert_eq!(worker.process(&item).await, ItemOutcome::Missing);
        }
        let latest = worker.manifest.get("42", item.filename()).await.unwrap().notes;

        assert_eq!(latest, first);
        assert_eq!(latest.matches("primary failed").count(), 1);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_refetches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.png"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body(), "image/png"))
            .expect(2)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let (worker, stats) = worker(&dir).await;
        let item = item(vec![format!("{}/a.png", server.uri())]);

        worker.process(&item).await;
        tokio::fs::write(item.local_path(dir.path()), b"tampered contents")
            .await
            .unwrap();

        assert!(matches!(worker.process(&item).await, ItemOutcome::Downloaded { .. }));
        let errors = stats.snapshot(Duration::ZERO, false).errors;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("checksum mismatch"));
        let entry = worker.manifest.get("42", item.filename()).await.unwrap();
        assert!(entry.notes.contains("checksum mismatch"));
        assert_eq!(
            std::fs::read(item.local_path(dir.path())).unwrap(),
            body()
        );
    }

    #[tokio::test]
    async fn test_adopts_existing_file() {
        let dir = TempDir::new().unwrap();
        let (worker, _) = worker(&dir).await;
        // Unroutable: adoption must not touch the network.
        let item = item(vec!["http://127.0.0.1:9/a.png".to_string()]);
        tokio::fs::write(item.local_path(dir.path()), body()).await.unwrap();

        assert_eq!(worker.process(&item).await, ItemOutcome::Skipped);
        let entry = worker.manifest.get("42", item.filename()).await.unwrap();
        assert_eq!(entry.status, EntryStatus::Downloaded);
        assert_eq!(entry.retrieved_from, Some(RetrievedFrom::Cached));
        assert_eq!(entry.checksum, Some(checksum_bytes(&body())));
    }

    #[tokio::test]
    async fn test_local_storage_failure_marks_failed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body(), "image/png"))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let manifest = ManifestStore::load(dir.path().join("manifest.json"), "test", 1)
            .await
            .unwrap();
        let stats = Arc::new(StatsCollector::default());
        let worker = DownloadWorker::new(
            fetcher(),
            manifest,
            None,
            dir.path().join("does-not-exist"),
            true,
            EventBus::default(),
            Arc::clone(&stats),
        );
        let item = item(vec![format!("{}/a.png", server.uri())]);

        let outcome = worker.process(&item).await;
        assert!(matches!(outcome, ItemOutcome::Failed(_)), "{outcome:?}");
        let entry = worker.manifest.get("42", item.filename()).await.unwrap();
        assert_eq!(entry.status, EntryStatus::Failed);
        assert_eq!(stats.snapshot(Duration::ZERO, false).errors.len(), 1);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
