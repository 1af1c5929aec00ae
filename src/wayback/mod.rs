//! Wayback Machine client: CDX snapshot lookups and raw capture downloads.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::archiver::fetch::HttpFetcher;
use crate::error::FetchError;
use crate::recovery::{ArchiveIndex, Snapshot};

/// Wayback Machine index client.
///
/// Shares the primary fetcher's HTTP client, token bucket, and retry policy,
/// so archive lookups count against the same global request budget.
#[derive(Debug, Clone)]
pub struct WaybackClient {
    fetcher: HttpFetcher,
    base_url: String,
    /// Maximum CDX rows requested per lookup.
    limit: usize,
}

impl WaybackClient {
    /// Create a client against `base_url` (e.g. `https://web.archive.org`).
    #[must_use]
    pub fn new(fetcher: HttpFetcher, base_url: &str, limit: usize) -> Self {
        Self {
            fetcher,
            base_url: base_url.trim_end_matches('/').to_string(),
            limit: limit.max(1),
        }
    }

    /// CDX query URL for captures of `url` that returned 200.
    #[must_use]
    pub fn cdx_url(&self, url: &str) -> String {
        format!(
            "{}/cdx/search/cdx?url={}&output=json&fl=timestamp,original,mimetype,statuscode,length&filter=statuscode:200&collapse=digest&limit=-{}",
            self.base_url,
            urlencoding::encode(url),
            self.limit
        )
    }
}

#[async_trait]
impl ArchiveIndex for WaybackClient {
    async fn query_snapshots(&self, url: &str) -> Result<Vec<Snapshot>, FetchError> {
        let cdx_url = self.cdx_url(url);
        debug!(url = %url, "Querying Wayback CDX index");

        let body = self
            .fetcher
            .get_bytes(&cdx_url)
            .await
            .map_err(crate::archiver::retry::RetryError::into_inner)?;

        let snapshots = parse_cdx(&body, |ts, original| self.snapshot_url(ts, original))
            .map_err(|reason| FetchError::Integrity {
                url: cdx_url.clone(),
                reason,
            })?;

        info!(url = %url, count = snapshots.len(), "Wayback snapshots found");
        Ok(snapshots)
    }

    async fn fetch_snapshot(&self, snapshot_url: &str) -> Result<Vec<u8>, FetchError> {
        debug!(snapshot = %snapshot_url, "Fetching Wayback capture");
        self.fetcher
            .get_bytes(snapshot_url)
            .await
            .map_err(crate::archiver::retry::RetryError::into_inner)
    }

    fn snapshot_url(&self, timestamp: &str, original: &str) -> String {
        // `id_` asks for the original bytes without the replay toolbar or
        // URL rewriting.
        format!("{}/web/{timestamp}id_/{original}", self.base_url)
    }
}

/// Parse a CDX JSON response (header row followed by data rows).
///
/// An empty body means no captures.
fn parse_cdx(
    body: &[u8],
    snapshot_url: impl Fn(&str, &str) -> String,
) -> Result<Vec<Snapshot>, String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    let rows: Vec<Vec<String>> =
        serde_json::from_slice(body).map_err(|e| format!("invalid CDX response: {e}"))?;
    let mut rows = rows.into_iter();
    let Some(header) = rows.next() else {
        return Ok(Vec::new());
    };

    let column = |name: &str| header.iter().position(|h| h == name);
    let ts_col = column("timestamp").ok_or("CDX response has no timestamp column")?;
    let original_col = column("original").ok_or("CDX response has no original column")?;
    let length_col = column("length");
    let mime_col = column("mimetype");

    let snapshots = rows
        .filter_map(|row| {
            let timestamp = row.get(ts_col)?.clone();
            let original = row.get(original_col)?.clone();
            let byte_size = length_col
                .and_then(|c| row.get(c))
                .and_then(|v| v.parse::<u64>().ok());
            let mime_type = mime_col
                .and_then(|c| row.get(c))
                .filter(|m| m.as_str() != "-")
                .cloned();
            Some(Snapshot {
                url: snapshot_url(&timestamp, &original),
                timestamp,
                original,
                byte_size,
                mime_type,
            })
        })
        .collect();

    Ok(snapshots)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url_for(ts: &str, original: &str) -> String {
        format!("https://web.archive.org/web/{ts}id_/{original}")
    }

    #[test]
    fn test_parse_cdx() {
        let body = br#"[
            ["timestamp","original","mimetype","statuscode","length"],
            ["20190101000000","https://cdn.example.com/a.jpg","image/jpeg","200","5123"],
            ["20200101000000","https://cdn.example.com/a.jpg","-","200","-"]
        ]"#;

        let snaps = parse_cdx(body, url_for).unwrap();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].timestamp, "20190101000000");
        assert_eq!(snaps[0].byte_size, Some(5123));
        assert_eq!(snaps[0].mime_type.as_deref(), Some("image/jpeg"));
        assert_eq!(
            snaps[0].url,
            "https://web.archive.org/web/20190101000000id_/https://cdn.example.com/a.jpg"
        );
        assert_eq!(snaps[1].byte_size, None);
        assert_eq!(snaps[1].mime_type, None);
    }

    #[test]
    fn test_parse_cdx_empty() {
        assert!(parse_cdx(b"", url_for).unwrap().is_empty());
        assert!(parse_cdx(b"  \n", url_for).unwrap().is_empty());
        assert!(parse_cdx(b"[]", url_for).unwrap().is_empty());
    }

    #[test]
    fn test_parse_cdx_garbage() {
        assert!(parse_cdx(b"<html>error</html>", url_for).is_err());
    }

    #[test]
    fn test_cdx_url_encodes_target() {
        let client = WaybackClient::new(
            HttpFetcher::from_config(&crate::config::Config::for_testing()).unwrap(),
            "https://web.archive.org/",
            3,
        );
        let url = client.cdx_url("https://cdn.example.com/a b.jpg");
        assert!(url.starts_with("https://web.archive.org/cdx/search/cdx?url=https%3A%2F%2Fcdn.example.com%2Fa%20b.jpg"));
        assert!(url.ends_with("&limit=-3"));
        assert_eq!(
            client.snapshot_url("20200101000000", "https://cdn.example.com/a.jpg"),
            "https://web.archive.org/web/20200101000000id_/https://cdn.example.com/a.jpg"
        );
    }
}
