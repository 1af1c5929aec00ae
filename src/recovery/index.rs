use std::cmp::Ordering;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::FetchError;

/// One archived capture of a URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// 14-digit capture timestamp (`YYYYMMDDhhmmss`).
    pub timestamp: String,
    /// URL that returns the raw archived bytes.
    pub url: String,
    /// URL that was captured.
    pub original: String,
    /// Recorded size, when the index reports one.
    pub byte_size: Option<u64>,
    pub mime_type: Option<String>,
}

/// Client of an archival index such as the Wayback Machine.
#[async_trait]
pub trait ArchiveIndex: Send + Sync {
    /// Captures of exactly `url`.
    async fn query_snapshots(&self, url: &str) -> Result<Vec<Snapshot>, FetchError>;

    /// Raw bytes of an archived capture.
    async fn fetch_snapshot(&self, snapshot_url: &str) -> Result<Vec<u8>, FetchError>;

    /// URL of the raw capture of `original` nearest to `timestamp`.
    fn snapshot_url(&self, timestamp: &str, original: &str) -> String;
}

/// Order snapshots best first: largest recorded size, then most recent.
///
/// Snapshots without a recorded size sort after every sized one.
pub fn rank_by_size(snapshots: &mut [Snapshot]) {
    snapshots.sort_by(|a, b| match (a.byte_size, b.byte_size) {
        (Some(x), Some(y)) if x != y => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        _ => b.timestamp.cmp(&a.timestamp),
    });
}

/// Order snapshots most recent first.
pub fn rank_by_recency(snapshots: &mut [Snapshot]) {
    snapshots.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
}
