//! Shared constants used across the application.

/// User agent string used for outbound HTTP requests.
///
/// Media CDNs and the Wayback Machine both serve regular browser traffic more
/// reliably than obvious bot user agents.
pub const ARCHIVAL_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Algorithm tag prefixed to every checksum stored in the manifest.
pub const CHECKSUM_ALGORITHM: &str = "sha256";

/// SHA-256 of an empty body. Always treated as a placeholder.
pub const EMPTY_BODY_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Suffix appended to in-progress downloads before they are renamed into place.
pub const PARTIAL_SUFFIX: &str = ".part";

/// Default Wayback Machine endpoint.
pub const DEFAULT_WAYBACK_BASE_URL: &str = "https://web.archive.org";
