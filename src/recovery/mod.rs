//! Recovery of assets the primary host no longer serves.
//!
//! Two strategies run in order and the first usable copy wins:
//!
//! 1. Direct lookup: captures of the failing URL itself, largest first.
//! 2. Referring page: an archived rendering of the post page, mined for media
//!    URLs that match the target.
//!
//! [`RecoveryEngine::recover`] never returns an error; every outcome is a
//! [`RecoveryResult`] with a definite status.

mod index;
mod matching;
mod page;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

pub use index::{rank_by_recency, rank_by_size, ArchiveIndex, Snapshot};
pub use matching::{base_filename, best_match, classify_match, MatchKind};
pub use page::{extract_media_urls, unwrap_archived_url};

use crate::archiver::placeholder::PlaceholderPolicy;
use crate::cache::ResponseCache;
use crate::config::Config;
use crate::error::{ErrorClass, FetchError};
use crate::fs_utils::{write_atomic, ChecksumWriter};
use crate::media::{MediaItem, MediaType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStatus {
    Success,
    NotFound,
    /// The archive could not be consulted (transport or local failure).
    Error,
    /// Recovery was not attempted.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    DirectUrl,
    ReferringPage,
}

impl RecoveryStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DirectUrl => "direct-url",
            Self::ReferringPage => "referring-page",
        }
    }
}

/// Outcome of one recovery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryResult {
    pub status: RecoveryStatus,
    pub snapshot_url: Option<String>,
    pub snapshot_timestamp: Option<String>,
    pub byte_size: Option<u64>,
    pub local_path: Option<PathBuf>,
    /// Algorithm-tagged checksum of the stored copy.
    pub checksum: Option<String>,
    pub strategy: Option<RecoveryStrategy>,
    pub match_kind: Option<MatchKind>,
    pub error: Option<String>,
}

impl RecoveryResult {
    fn with_status(status: RecoveryStatus) -> Self {
        Self {
            status,
            snapshot_url: None,
            snapshot_timestamp: None,
            byte_size: None,
            local_path: None,
            checksum: None,
            strategy: None,
            match_kind: None,
            error: None,
        }
    }

    /// Result for an item recovery was not attempted for.
    #[must_use]
    pub fn skipped(reason: &str) -> Self {
        Self {
            error: Some(reason.to_string()),
            ..Self::with_status(RecoveryStatus::Skipped)
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RecoveryStatus::Success
    }

    /// Short description suitable for manifest notes.
    #[must_use]
    pub fn summary(&self) -> String {
        match self.status {
            RecoveryStatus::Success => {
                let strategy = self.strategy.map_or("unknown", RecoveryStrategy::as_str);
                match self.match_kind {
                    Some(kind) => format!("recovered via {strategy} ({} match)", kind.as_str()),
                    None => format!("recovered via {strategy}"),
                }
            }
            RecoveryStatus::NotFound => "no archived copy found".to_string(),
            RecoveryStatus::Error => format!(
                "recovery error: {}",
                self.error.as_deref().unwrap_or("unknown")
            ),
            RecoveryStatus::Skipped => format!(
                "recovery skipped: {}",
                self.error.as_deref().unwrap_or("not attempted")
            ),
        }
    }
}

/// Finds and stores archived substitutes for missing assets.
pub struct RecoveryEngine {
    index: Arc<dyn ArchiveIndex>,
    placeholder: PlaceholderPolicy,
    max_snapshots: usize,
    snapshots: ResponseCache<Arc<Vec<Snapshot>>>,
    pages: ResponseCache<Arc<Vec<String>>>,
}

impl RecoveryEngine {
    #[must_use]
    pub fn new(
        index: Arc<dyn ArchiveIndex>,
        placeholder: PlaceholderPolicy,
        max_snapshots: usize,
        cache_capacity: usize,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            index,
            placeholder,
            max_snapshots: max_snapshots.max(1),
            snapshots: ResponseCache::new(cache_capacity, cache_ttl),
            pages: ResponseCache::new(cache_capacity, cache_ttl),
        }
    }

    #[must_use]
    pub fn from_config(config: &Config, index: Arc<dyn ArchiveIndex>) -> Self {
        Self::new(
            index,
            PlaceholderPolicy::from_config(config),
            config.max_snapshots_per_lookup,
            config.cache_capacity,
            config.cache_ttl,
        )
    }

    /// Try to store an archived copy of `item` at `dest`.
    #[instrument(skip_all, fields(post_id = %item.post_id, filename = %item.filename()))]
    pub async fn recover(&self, item: &MediaItem, dest: &Path) -> RecoveryResult {
        let mut errors = Vec::new();

        for url in &item.urls {
            if let Some(result) = self.try_direct(item.media_type, url, dest, &mut errors).await {
                return result;
            }
        }

        if let Some(result) = self.try_referring_page(item, dest, &mut errors).await {
            return result;
        }

        if errors.is_empty() {
            info!("No archived copy found");
            RecoveryResult::with_status(RecoveryStatus::NotFound)
        } else {
            let error = errors.join("; ");
            warn!(error = %error, "Recovery failed");
            RecoveryResult {
                error: Some(error),
                ..RecoveryResult::with_status(RecoveryStatus::Error)
            }
        }
    }

    async fn try_direct(
        &self,
        media_type: MediaType,
        url: &str,
        dest: &Path,
        errors: &mut Vec<String>,
    ) -> Option<RecoveryResult> {
        let snapshots = match self.snapshots_for(url).await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                note_error(errors, &e);
                return None;
            }
        };
        if snapshots.is_empty() {
            debug!(url = %url, "No captures of URL");
            return None;
        }

        let mut ranked = snapshots.as_ref().clone();
        rank_by_size(&mut ranked);

        for snapshot in ranked.iter().take(self.max_snapshots) {
            let Some(bytes) = self
                .fetch_usable(media_type, &snapshot.url, snapshot.mime_type.as_deref(), errors)
                .await
            else {
                continue;
            };
            return Some(
                self.store(
                    dest,
                    &bytes,
                    RecoveryStrategy::DirectUrl,
                    snapshot.url.clone(),
                    snapshot.timestamp.clone(),
                    None,
                )
                .await,
            );
        }
        None
    }

    async fn try_referring_page(
        &self,
        item: &MediaItem,
        dest: &Path,
        errors: &mut Vec<String>,
    ) -> Option<RecoveryResult> {
        if item.post_url.is_empty() {
            return None;
        }

        let pages = match self.snapshots_for(&item.post_url).await {
            Ok(pages) => pages,
            Err(e) => {
                note_error(errors, &e);
                return None;
            }
        };
        let mut ranked = pages.as_ref().clone();
        rank_by_recency(&mut ranked);

        for page in ranked.iter().take(self.max_snapshots) {
            let urls = match self.page_media(page).await {
                Ok(urls) => urls,
                Err(e) => {
                    note_error(errors, &e);
                    continue;
                }
            };

            for target in &item.urls {
                let Some((candidate, kind)) = best_match(target, urls.iter()) else {
                    continue;
                };
                debug!(
                    target = %target,
                    candidate = %candidate,
                    kind = kind.as_str(),
                    page = %page.url,
                    "Matched media on archived page"
                );

                let snapshot_url = self.index.snapshot_url(&page.timestamp, candidate);
                let Some(bytes) = self
                    .fetch_usable(item.media_type, &snapshot_url, None, errors)
                    .await
                else {
                    continue;
                };
                return Some(
                    self.store(
                        dest,
                        &bytes,
                        RecoveryStrategy::ReferringPage,
                        snapshot_url,
                        page.timestamp.clone(),
                        Some(kind),
                    )
                    .await,
                );
            }
        }
        None
    }

    async fn snapshots_for(&self, url: &str) -> Result<Arc<Vec<Snapshot>>, FetchError> {
        if let Some(cached) = self.snapshots.get(url) {
            return Ok(cached);
        }
        let snapshots = Arc::new(self.index.query_snapshots(url).await?);
        self.snapshots.insert(url, Arc::clone(&snapshots));
        Ok(snapshots)
    }

    /// Media URLs on an archived page, fetched once per page capture.
    async fn page_media(&self, page: &Snapshot) -> Result<Arc<Vec<String>>, FetchError> {
        if let Some(cached) = self.pages.get(&page.url) {
            return Ok(cached);
        }
        let body = self.index.fetch_snapshot(&page.url).await?;
        let html = String::from_utf8_lossy(&body);
        let urls = Arc::new(extract_media_urls(&html, &page.original));
        debug!(page = %page.url, count = urls.len(), "Extracted media URLs from archived page");
        self.pages.insert(page.url.clone(), Arc::clone(&urls));
        Ok(urls)
    }

    /// Fetch a capture and reject it if it looks like a placeholder.
    async fn fetch_usable(
        &self,
        media_type: MediaType,
        snapshot_url: &str,
        recorded_mime: Option<&str>,
        errors: &mut Vec<String>,
    ) -> Option<Vec<u8>> {
        let bytes = match self.index.fetch_snapshot(snapshot_url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                note_error(errors, &e);
                return None;
            }
        };

        let mut hasher = ChecksumWriter::new();
        hasher.update(&bytes);
        let len = hasher.len();
        let (digest, _) = hasher.finish();
        let content_type = sniff_content_type(&bytes).or(recorded_mime);

        match self.placeholder.inspect(media_type, content_type, len, &digest) {
            Ok(()) => Some(bytes),
            Err(reason) => {
                debug!(snapshot = %snapshot_url, reason = %reason, "Skipping placeholder capture");
                None
            }
        }
    }

    async fn store(
        &self,
        dest: &Path,
        bytes: &[u8],
        strategy: RecoveryStrategy,
        snapshot_url: String,
        snapshot_timestamp: String,
        match_kind: Option<MatchKind>,
    ) -> RecoveryResult {
        match write_atomic(dest, bytes).await {
            Ok(checksum) => {
                info!(
                    snapshot = %snapshot_url,
                    strategy = strategy.as_str(),
                    bytes = bytes.len(),
                    "Recovered archived copy"
                );
                RecoveryResult {
                    snapshot_url: Some(snapshot_url),
                    snapshot_timestamp: Some(snapshot_timestamp),
                    byte_size: Some(bytes.len() as u64),
                    local_path: Some(dest.to_path_buf()),
                    checksum: Some(checksum),
                    strategy: Some(strategy),
                    match_kind,
                    ..RecoveryResult::with_status(RecoveryStatus::Success)
                }
            }
            Err(e) => {
                warn!(path = %dest.display(), error = %e, "Failed to store archived copy");
                RecoveryResult {
                    snapshot_url: Some(snapshot_url),
                    snapshot_timestamp: Some(snapshot_timestamp),
                    strategy: Some(strategy),
                    error: Some(format!("failed to write {}: {e}", dest.display())),
                    ..RecoveryResult::with_status(RecoveryStatus::Error)
                }
            }
        }
    }
}

/// Terminal lookups (e.g. a 404 capture) mean "not here", not "broken".
fn note_error(errors: &mut Vec<String>, error: &FetchError) {
    if error.class() == ErrorClass::Terminal {
        debug!(error = %error, "Archive lookup miss");
    } else {
        errors.push(error.to_string());
    }
}

/// Archive bodies often lack a trustworthy content type; recognise HTML.
fn sniff_content_type(bytes: &[u8]) -> Option<&'static str> {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace())?;
    let head: Vec<u8> = bytes[start..]
        .iter()
        .take(15)
        .map(u8::to_ascii_lowercase)
        .collect();
    (head.starts_with(b"<!doctype html") || head.starts_with(b"<html")).then_some("text/html")
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use tempfile::TempDir;

    use super::*;
    use crate::fs_utils::checksum_bytes;

    const ARCHIVE: &str = "https://archive.test";

    #[derive(Default)]
    struct FakeIndex {
        snapshots: HashMap<String, Vec<Snapshot>>,
        bodies: HashMap<String, Vec<u8>>,
        broken: bool,
        queries: AtomicUsize,
        fetches: Mutex<Vec<String>>,
    }

    impl FakeIndex {
        fn capture(&mut self, ts: &str, original: &str, size: Option<u64>, body: &[u8]) {
            let url = raw_url(ts, original);
            self.snapshots
                .entry(original.to_string())
                .or_default()
                .push(Snapshot {
                    timestamp: ts.to_string(),
                    url: url.clone(),
                    original: original.to_string(),
                    byte_size: size,
                    mime_type: None,
                });
            self.bodies.insert(url, body.to_vec());
        }

        fn fetch_count(&self, url: &str) -> usize {
            self.fetches
                .lock()
                .unwrap()
                .iter()
                .filter(|u| u.as_str() == url)
                .count()
        }
    }

    fn raw_url(ts: &str, original: &str) -> String {
        format!("{ARCHIVE}/web/{ts}id_/{original}")
    }

    #[async_trait]
    impl ArchiveIndex for FakeIndex {
        async fn query_snapshots(&self, url: &str) -> Result<Vec<Snapshot>, FetchError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if self.broken {
                return Err(FetchError::Transport {
                    url: url.to_string(),
                    message: "connection reset".to_string(),
                });
            }
            Ok(self.snapshots.get(url).cloned().unwrap_or_default())
        }

        async fn fetch_snapshot(&self, snapshot_url: &str) -> Result<Vec<u8>, FetchError> {
            self.fetches.lock().unwrap().push(snapshot_url.to_string());
            self.bodies
                .get(snapshot_url)
                .cloned()
                .ok_or_else(|| FetchError::from_status(snapshot_url, 404, None))
        }

        fn snapshot_url(&self, timestamp: &str, original: &str) -> String {
            raw_url(timestamp, original)
        }
    }

    fn engine(index: Arc<FakeIndex>) -> RecoveryEngine {
        RecoveryEngine::new(
            index,
            PlaceholderPolicy::new(8, HashSet::new()),
            3,
            16,
            Duration::from_secs(60),
        )
    }

    fn item(post: &str, url: &str) -> MediaItem {
        MediaItem::new(
            post,
            vec![url.to_string()],
            MediaType::Image,
            format!("https://blog.example.com/post/{post}"),
            Utc::now(),
        )
        .unwrap()
    }

    fn image(tag: u8, len: usize) -> Vec<u8> {
        let mut body = vec![0xFF, 0xD8, 0xFF, tag];
        body.resize(len, tag);
        body
    }

    #[tokio::test]
    async fn test_direct_lookup_prefers_largest_capture() {
        let target = "https://cdn.example.com/abc/photo_1280.jpg";
        let small = image(1, 100);
        let large = image(2, 5000);
        let mut index = FakeIndex::default();
        index.capture("20200101000000", target, Some(100), &small);
        index.capture("20150101000000", target, Some(5000), &large);
        let index = Arc::new(index);

        let dir = TempDir::new().unwrap();
        let item = item("42", target);
        let dest = item.local_path(dir.path());
        let result = engine(index).recover(&item, &dest).await;

        assert_eq!(result.status, RecoveryStatus::Success);
        assert_eq!(result.strategy, Some(RecoveryStrategy::DirectUrl));
        assert_eq!(result.snapshot_timestamp.as_deref(), Some("20150101000000"));
        assert_eq!(result.byte_size, Some(5000));
        assert_eq!(result.checksum, Some(checksum_bytes(&large)));
        assert_eq!(std::fs::read(&dest).unwrap(), large);
    }

    #[tokio::test]
    async fn test_placeholder_capture_is_skipped() {
        let target = "https://cdn.example.com/abc/photo_1280.jpg";
        let good = image(3, 300);
        let mut index = FakeIndex::default();
        index.capture(
            "20210101000000",
            target,
            Some(9000),
            b"<!DOCTYPE html><html><body>Not found</body></html>",
        );
        index.capture("20190101000000", target, Some(300), &good);
        let index = Arc::new(index);

        let dir = TempDir::new().unwrap();
        let item = item("42", target);
        let dest = item.local_path(dir.path());
        let result = engine(index).recover(&item, &dest).await;

        assert!(result.is_success());
        assert_eq!(result.snapshot_timestamp.as_deref(), Some("20190101000000"));
        assert_eq!(std::fs::read(&dest).unwrap(), good);
    }

    #[tokio::test]
    async fn test_referring_page_match() {
        let target = "https://cdn.example.com/abc/photo_1280.jpg";
        let post_url = "https://blog.example.com/post/42";
        let page = r#"<html><body>
            <img src="/web/20190101000000im_/https://cdn.example.com/def/photo_500.jpg">
            <img src="https://cdn.example.com/def/unrelated_500.jpg">
        </body></html>"#;
        let recovered = image(4, 800);

        let mut index = FakeIndex::default();
        index.capture("20190101000000", post_url, None, page.as_bytes());
        index.bodies.insert(
            raw_url("20190101000000", "https://cdn.example.com/def/photo_500.jpg"),
            recovered.clone(),
        );
        let index = Arc::new(index);

        let dir = TempDir::new().unwrap();
        let item = item("42", target);
        let dest = item.local_path(dir.path());
        let result = engine(index).recover(&item, &dest).await;

        assert_eq!(result.status, RecoveryStatus::Success);
        assert_eq!(result.strategy, Some(RecoveryStrategy::ReferringPage));
        assert_eq!(result.match_kind, Some(MatchKind::SameBaseFilename));
        assert_eq!(
            result.snapshot_url.as_deref(),
            Some("https://archive.test/web/20190101000000id_/https://cdn.example.com/def/photo_500.jpg")
        );
        assert_eq!(std::fs::read(&dest).unwrap(), recovered);
        assert!(result.summary().contains("same-base-filename"));
    }

    #[tokio::test]
    async fn test_archived_page_is_fetched_once_per_post() {
        let post_url = "https://blog.example.com/post/7";
        let page = r#"<html><body>
            <img src="https://cdn.example.com/x/first_500.jpg">
            <img src="https://cdn.example.com/x/second_500.jpg">
        </body></html>"#;

        let mut index = FakeIndex::default();
        index.capture("20180101000000", post_url, None, page.as_bytes());
        for name in ["first", "second"] {
            index.bodies.insert(
                raw_url("20180101000000", &format!("https://cdn.example.com/x/{name}_500.jpg")),
                image(5, 64),
            );
        }
        let index = Arc::new(index);
        let engine = engine(Arc::clone(&index));

        let dir = TempDir::new().unwrap();
        for name in ["first", "second"] {
            let item = item("7", &format!("https://cdn.example.com/y/{name}_1280.jpg"));
            let result = engine.recover(&item, &item.local_path(dir.path())).await;
            assert!(result.is_success(), "{name}: {result:?}");
        }

        assert_eq!(index.fetch_count(&raw_url("20180101000000", post_url)), 1);
        // Two direct lookups plus one cached page-capture lookup.
        assert_eq!(index.queries.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_nothing_archived_is_not_found() {
        let index = Arc::new(FakeIndex::default());
        let dir = TempDir::new().unwrap();
        let item = item("1", "https://cdn.example.com/gone.jpg");
        let dest = item.local_path(dir.path());

        let result = engine(index).recover(&item, &dest).await;

        assert_eq!(result.status, RecoveryStatus::NotFound);
        assert_eq!(result.error, None);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_transport_failure_is_error() {
        let index = Arc::new(FakeIndex {
            broken: true,
            ..FakeIndex::default()
        });
        let dir = TempDir::new().unwrap();
        let item = item("1", "https://cdn.example.com/gone.jpg");

        let result = engine(index)
            .recover(&item, &item.local_path(dir.path()))
            .await;

        assert_eq!(result.status, RecoveryStatus::Error);
        assert!(result.error.unwrap().contains("connection reset"));
    }

    #[test]
    fn test_sniff_content_type() {
        assert_eq!(sniff_content_type(b"  <!DOCTYPE HTML><html>"), Some("text/html"));
        assert_eq!(sniff_content_type(b"<html lang=en>"), Some("text/html"));
        assert_eq!(sniff_content_type(&[0xFF, 0xD8, 0xFF]), None);
        assert_eq!(sniff_content_type(b""), None);
    }

    #[test]
    fn test_skipped_summary() {
        let result = RecoveryResult::skipped("recovery disabled");
        assert_eq!(result.status, RecoveryStatus::Skipped);
        assert_eq!(result.summary(), "recovery skipped: recovery disabled");
    }
}
