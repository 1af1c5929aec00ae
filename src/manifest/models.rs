use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::media::{MediaItem, MediaType};

/// Where a stored asset came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievedFrom {
    Primary,
    Archive,
    External,
    Cached,
}

/// Lifecycle status of a manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Downloading,
    Downloaded,
    Archived,
    Failed,
    Missing,
    Skipped,
}

impl EntryStatus {
    /// Statuses whose file on disk satisfies the item on resume.
    #[must_use]
    pub fn is_stored(self) -> bool {
        matches!(self, Self::Downloaded | Self::Archived)
    }

    /// Statuses an item will not leave within the current run.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Downloading)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Archived => "archived",
            Self::Failed => "failed",
            Self::Missing => "missing",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted provenance record of one media item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub post_id: String,
    pub post_url: String,
    pub timestamp: DateTime<Utc>,
    pub media_type: MediaType,
    pub filename: String,
    pub byte_size: Option<u64>,
    /// Algorithm-prefixed hex digest, e.g. `sha256:ab12...`.
    pub checksum: Option<String>,
    pub original_url: String,
    #[serde(default)]
    pub alternate_urls: Vec<String>,
    #[serde(default)]
    pub missing_on_primary: bool,
    pub retrieved_from: Option<RetrievedFrom>,
    pub archive_snapshot_url: Option<String>,
    pub archive_snapshot_timestamp: Option<String>,
    pub status: EntryStatus,
    #[serde(default)]
    pub notes: String,
}

impl ManifestEntry {
    /// Fresh pending entry describing `item`.
    #[must_use]
    pub fn pending(item: &MediaItem) -> Self {
        Self {
            post_id: item.post_id.clone(),
            post_url: item.post_url.clone(),
            timestamp: item.created_at,
            media_type: item.media_type,
            filename: item.filename().to_string(),
            byte_size: None,
            checksum: None,
            original_url: item.primary_url().to_string(),
            alternate_urls: item.alternate_urls().to_vec(),
            missing_on_primary: false,
            retrieved_from: None,
            archive_snapshot_url: None,
            archive_snapshot_timestamp: None,
            status: EntryStatus::Pending,
            notes: String::new(),
        }
    }

    #[must_use]
    pub fn key(&self) -> EntryKey {
        EntryKey::new(&self.post_id, &self.filename)
    }

    /// Append a note, keeping earlier ones.
    pub fn push_note(&mut self, note: &str) {
        if note.is_empty() {
            return;
        }
        if !self.notes.is_empty() {
            self.notes.push_str("; ");
        }
        self.notes.push_str(note);
    }
}

/// `(post_id, filename)` identity of a manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey {
    pub post_id: String,
    pub filename: String,
}

impl EntryKey {
    #[must_use]
    pub fn new(post_id: &str, filename: &str) -> Self {
        Self {
            post_id: post_id.to_string(),
            filename: filename.to_string(),
        }
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.post_id, self.filename)
    }
}

/// In-memory manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub entries: BTreeMap<EntryKey, ManifestEntry>,
}

impl Manifest {
    #[must_use]
    pub fn new(source: &str) -> Self {
        let now = Utc::now();
        Self {
            source: source.to_string(),
            created_at: now,
            updated_at: now,
            entries: BTreeMap::new(),
        }
    }

    /// Number of distinct posts with at least one entry.
    #[must_use]
    pub fn total_items(&self) -> usize {
        let mut last: Option<&str> = None;
        let mut count = 0;
        // BTreeMap iterates in key order, so entries of one post are adjacent.
        for key in self.entries.keys() {
            if last != Some(key.post_id.as_str()) {
                count += 1;
                last = Some(key.post_id.as_str());
            }
        }
        count
    }

    #[must_use]
    pub fn to_file(&self) -> ManifestFile {
        ManifestFile {
            source: self.source.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            total_items: self.total_items(),
            total_media: self.entries.len(),
            media: self.entries.values().cloned().collect(),
        }
    }

    #[must_use]
    pub fn from_file(file: ManifestFile) -> Self {
        let entries = file
            .media
            .into_iter()
            .map(|entry| (entry.key(), entry))
            .collect();
        Self {
            source: file.source,
            created_at: file.created_at,
            updated_at: file.updated_at,
            entries,
        }
    }
}

/// On-disk manifest layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestFile {
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total_items: usize,
    pub total_media: usize,
    pub media: Vec<ManifestEntry>,
}

/// Aggregate view over the manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestStats {
    pub by_status: BTreeMap<EntryStatus, usize>,
    pub total_entries: usize,
    pub total_bytes: u64,
    pub distinct_checksums: usize,
}

impl ManifestStats {
    #[must_use]
    pub fn count(&self, status: EntryStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    /// Entries whose bytes duplicate another entry's content.
    #[must_use]
    pub fn duplicate_entries(&self) -> usize {
        let stored = self.count(EntryStatus::Downloaded) + self.count(EntryStatus::Archived);
        stored.saturating_sub(self.distinct_checksums)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(post: &str, file: &str) -> ManifestEntry {
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
            status: EntryStatus::Pending,
            notes: String::new(),
        }
    }

    #[test]
    fn test_serialized_field_names() {
        let mut e = entry("1", "1_a.jpg");
        e.retrieved_from = Some(RetrievedFrom::Archive);
        e.status = EntryStatus::Archived;
        let json = serde_json::to_value(&e).unwrap();

        for field in [
            "postId",
            "postUrl",
            "timestamp",
            "mediaType",
            "filename",
            "byteSize",
            "checksum",
            "originalUrl",
            "alternateUrls",
            "missingOnPrimary",
            "retrievedFrom",
            "archiveSnapshotUrl",
            "archiveSnapshotTimestamp",
            "status",
            "notes",
        ] {
            assert!(json.get(field).is_some(), "missing field {field}");
        }
        assert_eq!(json["retrievedFrom"], "archive");
        assert_eq!(json["status"], "archived");
        assert_eq!(json["mediaType"], "image");
        assert!(json["archiveSnapshotUrl"].is_null());
    }

    #[test]
    fn test_total_items_counts_posts() {
        let mut manifest = Manifest::new("blog");
        for (post, file) in [("1", "a"), ("1", "b"), ("2", "c"), ("3", "d")] {
            let e = entry(post, file);
            manifest.entries.insert(e.key(), e);
        }
        assert_eq!(manifest.total_items(), 3);

        let file = manifest.to_file();
        assert_eq!(file.total_items, 3);
        assert_eq!(file.total_media, 4);
        assert_eq!(Manifest::from_file(file), manifest);
    }

    #[test]
    fn test_push_note() {
        let mut e = entry("1", "a");
        e.push_note("first");
        e.push_note("");
        e.push_note("second");
        assert_eq!(e.notes, "first; second");
    }

    #[test]
    fn test_status_predicates() {
        assert!(EntryStatus::Downloaded.is_stored());
        assert!(EntryStatus::Archived.is_stored());
        assert!(!EntryStatus::Missing.is_stored());
        assert!(EntryStatus::Missing.is_terminal());
        assert!(!EntryStatus::Downloading.is_terminal());
    }
}
