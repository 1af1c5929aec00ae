//! Matching a missing asset URL against URLs found in an archived page.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::media::url_basename;

/// Trailing size/quality suffixes on media filenames, e.g. `_1280`, `_500`,
/// `_400x600`, `_s640x960`, `_raw`.
static SIZE_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)_(?:\d{2,4}|\d+x\d+|s\d+x\d+|raw|orig|original)$").expect("valid regex")
});

/// How a candidate URL matched the target, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchKind {
    /// Same URL.
    Exact,
    /// Same path on a different host (CDN variance).
    SamePath,
    /// Same filename under a different path.
    SameFilename,
    /// Same filename once resolution suffixes are removed.
    SameBaseFilename,
}

impl MatchKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::SamePath => "same-path",
            Self::SameFilename => "same-filename",
            Self::SameBaseFilename => "same-base-filename",
        }
    }
}

/// Classify how `candidate` relates to `target`, if at all.
#[must_use]
pub fn classify_match(target: &str, candidate: &str) -> Option<MatchKind> {
    let target_url = Url::parse(target).ok()?;
    let candidate_url = Url::parse(candidate).ok()?;

    if strip_fragment(&target_url) == strip_fragment(&candidate_url) {
        return Some(MatchKind::Exact);
    }

    let target_path = target_url.path();
    if target_path.len() > 1 && target_path == candidate_url.path() {
        return Some(MatchKind::SamePath);
    }

    let target_name = url_basename(target)?;
    let candidate_name = url_basename(candidate)?;
    if target_name == candidate_name {
        return Some(MatchKind::SameFilename);
    }

    let (target_base, target_ext) = base_filename(&target_name);
    let (candidate_base, candidate_ext) = base_filename(&candidate_name);
    if !target_base.is_empty() && target_base == candidate_base && target_ext == candidate_ext {
        return Some(MatchKind::SameBaseFilename);
    }

    None
}

/// Best-matching candidate, preferring stronger match kinds and, within one
/// kind, earlier candidates.
#[must_use]
pub fn best_match<'a, I>(target: &str, candidates: I) -> Option<(&'a str, MatchKind)>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut best: Option<(&'a str, MatchKind)> = None;
    for candidate in candidates {
        if let Some(kind) = classify_match(target, candidate) {
            let better = match best {
                None => true,
                Some((_, current)) => kind < current,
            };
            if better {
                best = Some((candidate.as_str(), kind));
                if kind == MatchKind::Exact {
                    break;
                }
            }
        }
    }
    best
}

/// Split a filename into its suffix-stripped stem and normalised extension.
///
/// `tumblr_abc_1280.jpg` becomes `("tumblr_abc", "jpg")`; `.jpeg` is treated
/// as `.jpg`.
#[must_use]
pub fn base_filename(name: &str) -> (String, String) {
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, ext.to_ascii_lowercase()),
        _ => (name, String::new()),
    };
    let ext = if ext == "jpeg" { "jpg".to_string() } else { ext };
    let base = SIZE_SUFFIX.replace(stem, "").into_owned();
    (base, ext)
}

fn strip_fragment(url: &Url) -> Url {
    let mut url = url.clone();
    url.set_fragment(None);
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert_eq!(
            classify_match("https://cdn.example.com/a/photo.jpg", "https://cdn.example.com/a/photo.jpg#x"),
            Some(MatchKind::Exact)
        );
    }

    #[test]
    fn test_same_path_different_host() {
        assert_eq!(
            classify_match(
                "https://64.media.example.com/abc/photo_1280.jpg",
                "https://66.media.example.com/abc/photo_1280.jpg"
            ),
            Some(MatchKind::SamePath)
        );
    }

    #[test]
    fn test_same_filename_different_path() {
        assert_eq!(
            classify_match(
                "https://cdn.example.com/abc/photo_1280.jpg",
                "https://other.example.com/xyz/photo_1280.jpg"
            ),
            Some(MatchKind::SameFilename)
        );
    }

    #[test]
    fn test_base_filename_match() {
        assert_eq!(
            classify_match(
                "https://cdn.example.com/abc/photo_1280.jpg",
                "https://cdn.example.com/def/photo_500.jpg"
            ),
            Some(MatchKind::SameBaseFilename)
        );
        assert_eq!(
            classify_match(
                "https://cdn.example.com/abc/photo_1280.jpg",
                "https://cdn.example.com/def/photo.jpeg"
            ),
            Some(MatchKind::SameBaseFilename)
        );
    }

    #[test]
    fn test_different_base_names_do_not_match() {
        assert_eq!(
            classify_match(
                "https://cdn.example.com/abc/photoA_1280.jpg",
                "https://cdn.example.com/def/photoB_1280.jpg"
            ),
            None
        );
        assert_eq!(
            classify_match(
                "https://cdn.example.com/abc/photo_1280.jpg",
                "https://cdn.example.com/def/photo_500.png"
            ),
            None
        );
    }

    #[test]
    fn test_root_paths_do_not_match() {
        assert_eq!(
            classify_match("https://a.example.com/", "https://b.example.com/"),
            None
        );
    }

    #[test]
    fn test_base_filename() {
        assert_eq!(base_filename("photo_1280.jpg"), ("photo".to_string(), "jpg".to_string()));
        assert_eq!(base_filename("photo_500.JPEG"), ("photo".to_string(), "jpg".to_string()));
        assert_eq!(
            base_filename("tumblr_abc123_r1_400x600.gif"),
            ("tumblr_abc123_r1".to_string(), "gif".to_string())
        );
        assert_eq!(base_filename("photoA.png"), ("photoA".to_string(), "png".to_string()));
        assert_eq!(base_filename("noext"), ("noext".to_string(), String::new()));
    }

    #[test]
    fn test_best_match_prefers_stronger_kind() {
        let target = "https://cdn.example.com/abc/photo_1280.jpg";
        let candidates = vec![
            "https://cdn.example.com/zzz/photo_500.jpg".to_string(),
            "https://cdn.example.com/yyy/photo_1280.jpg".to_string(),
            "https://mirror.example.com/abc/photo_1280.jpg".to_string(),
            "https://cdn.example.com/abc/unrelated.jpg".to_string(),
        ];

        let (url, kind) = best_match(target, &candidates).unwrap();
        assert_eq!(kind, MatchKind::SamePath);
        assert_eq!(url, "https://mirror.example.com/abc/photo_1280.jpg");
    }

    #[test]
    fn test_best_match_none() {
        let candidates = vec!["https://cdn.example.com/other.jpg".to_string()];
        assert!(best_match("https://cdn.example.com/photo_1280.jpg", &candidates).is_none());
    }
}
