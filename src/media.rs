//! Canonical unit of work handed from discovery to the download workers.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::archiver::sanitize_filename;

/// Kind of media referenced by a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
    Audio,
    Other,
}

impl MediaType {
    /// Default extension used when the URL carries none.
    #[must_use]
    pub fn default_extension(self) -> &'static str {
        match self {
            Self::Image => "jpg",
            Self::Video => "mp4",
            Self::Audio => "mp3",
            Self::Other => "bin",
        }
    }

    /// Top-level MIME type this media is expected to carry.
    #[must_use]
    pub fn mime_prefix(self) -> Option<&'static str> {
        match self {
            Self::Image => Some("image/"),
            Self::Video => Some("video/"),
            Self::Audio => Some("audio/"),
            Self::Other => None,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// One media asset referenced by a post. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItem {
    pub post_id: String,
    /// Candidate source URLs, best first. Never empty.
    pub urls: Vec<String>,
    pub media_type: MediaType,
    pub post_url: String,
    pub created_at: DateTime<Utc>,
    filename: String,
}

impl MediaItem {
    /// Create an item, deriving its filename from the first candidate URL.
    ///
    /// Returns `None` when no candidate URL is given.
    #[must_use]
    pub fn new(
        post_id: impl Into<String>,
        urls: Vec<String>,
        media_type: MediaType,
        post_url: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Option<Self> {
        let post_id = post_id.into();
        let first = urls.first()?;
        let filename = media_filename(&post_id, first, media_type);
        Some(Self {
            post_id,
            urls,
            media_type,
            post_url: post_url.into(),
            created_at,
            filename,
        })
    }

    /// Filename this item is stored under. Together with the post ID this is
    /// the item's identity.
    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// The preferred source URL.
    #[must_use]
    pub fn primary_url(&self) -> &str {
        // `new` guarantees at least one URL.
        self.urls.first().map_or("", String::as_str)
    }

    /// Candidate URLs after the first.
    #[must_use]
    pub fn alternate_urls(&self) -> &[String] {
        self.urls.get(1..).unwrap_or(&[])
    }

    /// Where the item lives under `output_dir`.
    #[must_use]
    pub fn local_path(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(&self.filename)
    }

    /// Manifest key of the item.
    #[must_use]
    pub fn key(&self) -> (String, String) {
        (self.post_id.clone(), self.filename.clone())
    }
}

/// Deterministic filename for a media URL within a post.
///
/// `<post_id>_<tag>_<basename>`, where `tag` is a short hash of the post ID
/// and URL. The tag keeps two posts whose sanitised IDs and basenames run
/// together apart, as well as same-named assets on different paths of one
/// post. Without a usable basename the name is just `<post_id>_<tag>`. The
/// extension falls back to one guessed from the media type.
#[must_use]
pub fn media_filename(post_id: &str, url: &str, media_type: MediaType) -> String {
    let safe_post = sanitize_filename(post_id);
    let tag = identity_tag(post_id, url);
    let basename = url_basename(url).map(|b| sanitize_filename(&b));

    match basename {
        Some(name) if !name.trim_start_matches('.').is_empty() => {
            if has_extension(&name) {
                format!("{safe_post}_{tag}_{name}")
            } else {
                format!("{safe_post}_{tag}_{name}.{}", guess_extension(url, media_type))
            }
        }
        _ => format!("{safe_post}_{tag}.{}", guess_extension(url, media_type)),
    }
}

/// Last non-empty path segment of a URL, percent-decoded.
#[must_use]
pub fn url_basename(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let decoded = urlencoding::decode(segment).ok()?;
    Some(decoded.into_owned())
}

fn has_extension(name: &str) -> bool {
    name.rsplit_once('.')
        .is_some_and(|(stem, ext)| !stem.is_empty() && (1..=5).contains(&ext.len()))
}

fn guess_extension(url: &str, media_type: MediaType) -> String {
    mime_guess::from_path(url_basename(url).unwrap_or_default())
        .first()
        .and_then(|mime| mime_guess::get_mime_extensions(&mime))
        .and_then(|exts| exts.first())
        .map_or_else(|| media_type.default_extension().to_string(), |e| (*e).to_string())
}

const TAG_LEN: usize = 8;

fn identity_tag(post_id: &str, url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(post_id.as_bytes());
    hasher.update([0]);
    hasher.update(url.as_bytes());
    let mut tag = hex::encode(hasher.finalize());
    tag.truncate(TAG_LEN);
    tag
}
