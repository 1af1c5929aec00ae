//! Heuristics for rejecting placeholder responses.
//!
//! Hosts frequently answer requests for deleted media with `200 OK` and a
//! tiny stand-in image or an HTML error page. These checks are approximate;
//! thresholds and known hashes are tuning parameters.

use std::collections::HashSet;

use crate::config::Config;
use crate::media::MediaType;

#[derive(Debug, Clone)]
pub struct PlaceholderPolicy {
    min_bytes: u64,
    known_hashes: HashSet<String>,
}

impl PlaceholderPolicy {
    #[must_use]
    pub fn new(min_bytes: u64, known_hashes: HashSet<String>) -> Self {
        Self {
            min_bytes,
            known_hashes,
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.placeholder_min_bytes, config.placeholder_hashes.clone())
    }

    /// Check a fully received body.
    ///
    /// `digest_hex` is the bare hex SHA-256 of the body.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the body looks like a placeholder.
    pub fn inspect(
        &self,
        media_type: MediaType,
        content_type: Option<&str>,
        len: u64,
        digest_hex: &str,
    ) -> Result<(), String> {
        if self.known_hashes.contains(digest_hex) {
            return Err(format!("body matches known placeholder {digest_hex}"));
        }
        if len < self.min_bytes {
            return Err(format!(
                "body is {len} bytes, below the {} byte minimum",
                self.min_bytes
            ));
        }
        if let (Some(expected), Some(actual)) = (media_type.mime_prefix(), content_type) {
            let actual = actual.trim().to_ascii_lowercase();
            if actual.starts_with("text/html") {
                return Err(format!("expected {expected}* but received {actual}"));
            }
        }
        Ok(())
    }
}
