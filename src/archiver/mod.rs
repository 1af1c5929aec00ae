//! The download path: rate limiting, retries, fetching, the work queue,
//! workers, and the orchestrator that runs them.

pub mod fetch;
pub mod orchestrator;
pub mod placeholder;
pub mod queue;
pub mod rate_limiter;
pub mod retry;
pub mod stats;
pub mod worker;

pub use fetch::{Downloaded, HttpFetcher};
pub use orchestrator::Orchestrator;
pub use placeholder::PlaceholderPolicy;
pub use queue::{MediaQueue, QueueMessage};
pub use rate_limiter::TokenBucket;
pub use retry::{RetryError, RetryPolicy};
pub use stats::{RunStats, StatsCollector};
pub use worker::{DownloadWorker, ItemOutcome};

/// Sanitize a filename to be URL-safe and filesystem-safe.
///
/// This function:
/// - Replaces spaces with underscores
/// - Removes or replaces problematic characters (#, ?, &, quotes, etc.)
/// - Preserves file extension
/// - Limits length to avoid filesystem issues
/// - Ensures the result is safe for use in URLs
///
/// # Examples
///
/// ```
/// # use feed_media_archiver::archiver::sanitize_filename;
/// assert_eq!(sanitize_filename("My Video #1.mp4"), "My_Video_1.mp4");
/// assert_eq!(sanitize_filename("Test & Demo?.webm"), "Test_Demo.webm");
/// ```
pub fn sanitize_filename(filename: &str) -> String {
    // Split filename into name and extension
    let (name, ext) = if let Some(dot_pos) = filename.rfind('.') {
        let (n, e) = filename.split_at(dot_pos);
        (n, e) // ext includes the dot
    } else {
        (filename, "")
    };

    // Sanitize the name part
    let sanitized_name: String = name
        .chars()
        .map(|c| match c {
            // Replace spaces with underscores
            ' ' => '_',
            // Remove problematic URL characters
            '#' | '?' | '&' | '%' | '"' | '\'' | '<' | '>' | '|' | '*' | ':' | '\\' | '/' => '_',
            // Keep parentheses, brackets, hyphens, underscores, dots, and alphanumerics
            '(' | ')' | '[' | ']' | '-' | '_' | '.' => c,
            // Keep alphanumerics
            c if c.is_alphanumeric() => c,
            // Replace everything else with underscore
            _ => '_',
        })
        .collect();

    // Remove consecutive underscores and trim underscores from edges
    let sanitized_name = sanitized_name
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_");

    // Limit name length (leaving room for extension), cutting on a char
    // boundary since non-ASCII alphanumerics are kept.
    const MAX_NAME_LENGTH: usize = 200;
    let end = (0..=MAX_NAME_LENGTH.min(sanitized_name.len()))
        .rev()
        .find(|&i| sanitized_name.is_char_boundary(i))
        .unwrap_or(0);
    let truncated_name = &sanitized_name[..end];

    // Recombine with extension
    format!("{truncated_name}{ext}")
}
