//! Mapping upstream post records onto canonical [`MediaItem`]s.
//!
//! Posts arrive as loosely typed JSON objects tagged by `type`. Each known
//! shape has its own variant; anything else becomes
//! [`PostShape::Unsupported`] and is reported rather than dropped.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use url::Url;

use crate::media::{MediaItem, MediaType};

/// One post from the content source.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawPost")]
pub struct Post {
    pub id: String,
    pub post_url: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub shape: PostShape,
}

/// Known post shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum PostShape {
    Photo(PhotoPost),
    Video(VideoPost),
    Audio(AudioPost),
    /// Rich text whose body may embed images or players.
    Text(TextPost),
    Link(LinkPost),
    Unsupported { kind: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PhotoPost {
    pub photos: Vec<Photo>,
    #[serde(default)]
    pub caption: Option<String>,
}

/// One photo, available in one or more sizes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Photo {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub sizes: Vec<PhotoSize>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PhotoSize {
    pub url: String,
    #[serde(default)]
    pub width: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VideoPost {
    #[serde(default)]
    pub video_url: Option<String>,
    /// Third-party player markup; not downloadable here.
    #[serde(default)]
    pub embed: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AudioPost {
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TextPost {
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LinkPost {
    pub url: String,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Deserialize)]
struct RawPost {
    #[serde(alias = "postId")]
    id: Value,
    #[serde(alias = "postUrl")]
    post_url: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl TryFrom<RawPost> for Post {
    type Error = serde_json::Error;

    fn try_from(raw: RawPost) -> Result<Self, Self::Error> {
        let id = match raw.id {
            Value::String(s) => s,
            other => other.to_string(),
        };
        let fields = Value::Object(raw.fields);
        let shape = match raw.kind.as_str() {
            "photo" => PostShape::Photo(serde_json::from_value(fields)?),
            "video" => PostShape::Video(serde_json::from_value(fields)?),
            "audio" => PostShape::Audio(serde_json::from_value(fields)?),
            "text" => PostShape::Text(serde_json::from_value(fields)?),
            "link" => PostShape::Link(serde_json::from_value(fields)?),
            other => PostShape::Unsupported {
                kind: other.to_string(),
            },
        };
        Ok(Self {
            id,
            post_url: raw.post_url,
            timestamp: raw.timestamp,
            shape,
        })
    }
}

/// Result of mapping one post.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceMapping {
    Media(Vec<MediaItem>),
    Unsupported { kind: String },
}

impl Post {
    /// Canonical media items referenced by this post.
    #[must_use]
    pub fn into_media_items(self) -> SourceMapping {
        let created_at = self.timestamp.unwrap_or_else(Utc::now);
        let base = Url::parse(&self.post_url).ok();
        let mut candidates: Vec<(Vec<String>, MediaType)> = Vec::new();

        match self.shape {
            PostShape::Unsupported { kind } => return SourceMapping::Unsupported { kind },
            PostShape::Photo(photo) => {
                for p in photo.photos {
                    let urls = photo_candidates(&p);
                    if !urls.is_empty() {
                        candidates.push((urls, MediaType::Image));
                    }
                }
                candidates.extend(inline_media(photo.caption.as_deref(), base.as_ref()));
            }
            PostShape::Video(video) => {
                match video.video_url {
                    Some(url) => candidates.push((vec![url], MediaType::Video)),
                    None if video.embed.is_some() => {
                        debug!(post_id = %self.id, "Video is a third-party embed; skipping");
                    }
                    None => {}
                }
                candidates.extend(inline_media(video.caption.as_deref(), base.as_ref()));
            }
            PostShape::Audio(audio) => {
                if let Some(url) = audio.audio_url {
                    candidates.push((vec![url], MediaType::Audio));
                }
                candidates.extend(inline_media(audio.caption.as_deref(), base.as_ref()));
            }
            PostShape::Text(text) => {
                candidates.extend(inline_media(Some(&text.body), base.as_ref()));
            }
            PostShape::Link(link) => {
                if let Some(url) = link.thumbnail_url {
                    candidates.push((vec![url], MediaType::Image));
                }
                candidates.extend(inline_media(link.description.as_deref(), base.as_ref()));
            }
        }

        let items = candidates
            .into_iter()
            .filter_map(|(urls, media_type)| {
                MediaItem::new(
                    self.id.clone(),
                    urls,
                    media_type,
                    self.post_url.clone(),
                    created_at,
                )
            })
            .collect();
        SourceMapping::Media(items)
    }
}

/// Candidate URLs of a photo, largest size first, each URL once.
fn photo_candidates(photo: &Photo) -> Vec<String> {
    let mut sizes: Vec<&PhotoSize> = photo.sizes.iter().collect();
    sizes.sort_by(|a, b| b.width.unwrap_or(0).cmp(&a.width.unwrap_or(0)));

    let mut seen = HashSet::new();
    sizes
        .into_iter()
        .map(|s| s.url.clone())
        .chain(photo.url.clone())
        .filter(|u| !u.is_empty() && seen.insert(u.clone()))
        .collect()
}

/// Media embedded in an HTML fragment.
fn inline_media(html: Option<&str>, base: Option<&Url>) -> Vec<(Vec<String>, MediaType)> {
    let Some(html) = html.filter(|h| !h.trim().is_empty()) else {
        return Vec::new();
    };
    let fragment = Html::parse_fragment(html);
    let selectors = [
        ("img[src]", MediaType::Image),
        ("video[src]", MediaType::Video),
        ("video source[src]", MediaType::Video),
        ("audio[src]", MediaType::Audio),
        ("audio source[src]", MediaType::Audio),
    ];

    let mut seen = HashSet::new();
    let mut found = Vec::new();
    for (selector, media_type) in selectors {
        let Ok(selector) = Selector::parse(selector) else {
            continue;
        };
        for element in fragment.select(&selector) {
            let Some(src) = element.value().attr("src") else {
                continue;
            };
            let resolved = match (Url::parse(src), base) {
                (Ok(url), _) => url,
                (Err(url::ParseError::RelativeUrlWithoutBase), Some(base)) => {
                    match base.join(src) {
                        Ok(url) => url,
                        Err(_) => continue,
                    }
                }
                _ => continue,
            };
            if !matches!(resolved.scheme(), "http" | "https") {
                continue;
            }
            let url = resolved.to_string();
            if seen.insert(url.clone()) {
                found.push((vec![url], media_type));
            }
        }
    }
    found
}

/// Media items from many posts, with unsupported shapes tallied.
#[derive(Debug, Clone, Default)]
pub struct SourceReport {
    pub posts: usize,
    pub items: Vec<MediaItem>,
    /// Unsupported post count by `type`.
    pub unsupported: BTreeMap<String, usize>,
}

/// Map every post, logging unsupported shapes.
#[must_use]
pub fn collect_media_items(posts: Vec<Post>) -> SourceReport {
    let mut report = SourceReport {
        posts: posts.len(),
        ..SourceReport::default()
    };

    for post in posts {
        let post_id = post.id.clone();
        match post.into_media_items() {
            SourceMapping::Media(items) => report.items.extend(items),
            SourceMapping::Unsupported { kind } => {
                warn!(post_id = %post_id, kind = %kind, "Unsupported post shape");
                *report.unsupported.entry(kind).or_insert(0) += 1;
            }
        }
    }

    info!(
        posts = report.posts,
        items = report.items.len(),
        unsupported = report.unsupported.values().sum::<usize>(),
        "Mapped posts to media items"
    );
    report
}

/// Read a JSON array of posts.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not a valid post list.
pub async fn load_posts_file(path: &Path) -> Result<Vec<Post>> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read posts file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse posts file {}", path.display()))
}
