//! Extracting media URLs from an archived rendering of a post page.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

/// Wayback rewrites embedded URLs as `/web/<timestamp><modifier>/<original>`.
static WAYBACK_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:https?://[^/]+)?/web/\d{1,14}(?:[a-z]{2}_)?/(.+)$").expect("valid regex")
});

/// `(selector, attribute)` pairs that may reference media.
const MEDIA_ATTRIBUTES: &[(&str, &str)] = &[
    ("img[src]", "src"),
    ("img[data-src]", "data-src"),
    ("img[data-highres]", "data-highres"),
    ("img[srcset]", "srcset"),
    ("source[src]", "src"),
    ("source[srcset]", "srcset"),
    ("video[src]", "src"),
    ("video[poster]", "poster"),
    ("audio[src]", "src"),
    ("a[href]", "href"),
    ("meta[property=\"og:image\"]", "content"),
    ("meta[property=\"og:video\"]", "content"),
    ("meta[name=\"twitter:image\"]", "content"),
    ("link[rel=\"image_src\"]", "href"),
];

/// Collect candidate media URLs from archived page HTML.
///
/// Archive-rewritten URLs are unwrapped to their originals and relative URLs
/// are resolved against `page_url`. Order follows document order per
/// selector; duplicates are dropped.
#[must_use]
pub fn extract_media_urls(html: &str, page_url: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let base = Url::parse(page_url).ok();

    let mut seen = HashSet::new();
    let mut urls = Vec::new();

    for (selector, attribute) in MEDIA_ATTRIBUTES {
        let Ok(selector) = Selector::parse(selector) else {
            continue;
        };
        for element in document.select(&selector) {
            let Some(value) = element.value().attr(attribute) else {
                continue;
            };

            let raw_values: Vec<&str> = if attribute.ends_with("srcset") {
                parse_srcset(value)
            } else {
                vec![value]
            };

            for raw in raw_values {
                if let Some(url) = resolve(raw, base.as_ref()) {
                    if seen.insert(url.clone()) {
                        urls.push(url);
                    }
                }
            }
        }
    }

    urls
}

/// URLs listed in a `srcset` attribute, without their width descriptors.
fn parse_srcset(value: &str) -> Vec<&str> {
    value
        .split(',')
        .filter_map(|part| part.split_whitespace().next())
        .collect()
}

/// Turn an attribute value into an absolute original URL.
fn resolve(raw: &str, base: Option<&Url>) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty()
        || raw.starts_with('#')
        || raw.starts_with("javascript:")
        || raw.starts_with("mailto:")
        || raw.starts_with("data:")
    {
        return None;
    }

    let unwrapped = unwrap_archived_url(raw);
    let candidate = if unwrapped.starts_with("//") {
        format!("https:{unwrapped}")
    } else {
        unwrapped
    };

    let absolute = match Url::parse(&candidate) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => base?.join(&candidate).ok()?,
        Err(_) => return None,
    };

    matches!(absolute.scheme(), "http" | "https").then(|| absolute.to_string())
}

/// Strip an archive rewrite prefix, returning the original URL.
///
/// Values without a prefix are returned unchanged.
#[must_use]
pub fn unwrap_archived_url(raw: &str) -> String {
    let mut current = raw.to_string();
    // Rewritten URLs can nest when a capture embedded another capture.
    while let Some(inner) = WAYBACK_PREFIX
        .captures(&current)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
    {
        current = if inner.starts_with("http:/") && !inner.starts_with("http://") {
            inner.replacen("http:/", "http://", 1)
        } else if inner.starts_with("https:/") && !inner.starts_with("https://") {
            inner.replacen("https:/", "https://", 1)
        } else {
            inner
        };
    }
    current
}
