//! Network error taxonomy shared by the primary fetch path and the archival
//! index client.

use std::time::Duration;

use thiserror::Error;

/// How a failed request should be treated by the retry strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts, server errors, rate limiting, truncated bodies.
    Retryable,
    /// Not found, forbidden, gone, placeholder content. Never retried.
    Terminal,
    /// Local failures (disk, invalid input). Not a network outcome at all.
    Local,
}

/// Failure of a single outbound request.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("server error {status} from {url}")]
    Server { url: String, status: u16 },

    #[error("rate limited (429) by {url}")]
    RateLimited {
        url: String,
        retry_after: Option<Duration>,
    },

    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },

    #[error("HTTP {status} for {url}")]
    Content { url: String, status: u16 },

    #[error("integrity check failed for {url}: {reason}")]
    Integrity { url: String, reason: String },

    #[error("placeholder response from {url}: {reason}")]
    Placeholder { url: String, reason: String },

    #[error("invalid URL {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("I/O error while storing {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    /// Build an error from a non-success HTTP status.
    #[must_use]
    pub fn from_status(url: &str, status: u16, retry_after: Option<Duration>) -> Self {
        let url = url.to_string();
        match status {
            429 => Self::RateLimited { url, retry_after },
            408 | 425 | 500..=599 => Self::Server { url, status },
            _ => Self::Content { url, status },
        }
    }

    /// Convert a reqwest transport error.
    #[must_use]
    pub fn from_reqwest(url: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout {
                url: url.to_string(),
            };
        }
        if let Some(status) = err.status() {
            return Self::from_status(url, status.as_u16(), None);
        }
        Self::Transport {
            url: url.to_string(),
            message: err.to_string(),
        }
    }

    /// Classify the error for retry purposes.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout { .. }
            | Self::Server { .. }
            | Self::RateLimited { .. }
            | Self::Transport { .. }
            | Self::Integrity { .. } => ErrorClass::Retryable,
            Self::Content { .. } | Self::Placeholder { .. } => ErrorClass::Terminal,
            Self::InvalidUrl { .. } | Self::Io { .. } => ErrorClass::Local,
        }
    }

    /// Server-requested delay before the next attempt, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// True for local failures that say nothing about the remote asset.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.class() == ErrorClass::Local
    }

    /// HTTP status carried by the error, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Server { status, .. } | Self::Content { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }
}
