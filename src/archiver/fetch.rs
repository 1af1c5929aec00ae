//! Rate-limited, retried HTTP fetching.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, Response};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use url::Url;

use super::placeholder::PlaceholderPolicy;
use super::rate_limiter::TokenBucket;
use super::retry::{RetryError, RetryPolicy};
use crate::config::Config;
use crate::constants::ARCHIVAL_USER_AGENT;
use crate::error::FetchError;
use crate::fs_utils::{partial_path, remove_if_exists, ChecksumWriter};
use crate::media::MediaType;

/// A body streamed to its final location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downloaded {
    /// URL that served the body.
    pub url: String,
    pub byte_size: u64,
    /// Algorithm-tagged checksum.
    pub checksum: String,
    pub content_type: Option<String>,
    pub attempts: u32,
}

/// Build the process-wide HTTP client. Every fetch shares its connection pool.
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialised.
pub fn build_http_client(config: &Config) -> Result<Client> {
    Client::builder()
        .timeout(config.request_timeout)
        .connect_timeout(Duration::from_secs(15))
        .user_agent(ARCHIVAL_USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .context("Failed to create HTTP client")
}

/// HTTP fetcher guarded by the shared token bucket and retry policy.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    limiter: Arc<TokenBucket>,
    retry: RetryPolicy,
    placeholder: Arc<PlaceholderPolicy>,
}

impl HttpFetcher {
    #[must_use]
    pub fn new(
        client: Client,
        limiter: Arc<TokenBucket>,
        retry: RetryPolicy,
        placeholder: PlaceholderPolicy,
    ) -> Self {
        Self {
            client,
            limiter,
            retry,
            placeholder: Arc::new(placeholder),
        }
    }

    /// Fetcher built from configuration with its own limiter.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            build_http_client(config)?,
            Arc::new(TokenBucket::new(config.requests_per_second, config.rate_burst)),
            RetryPolicy::from_config(config),
            PlaceholderPolicy::from_config(config),
        ))
    }

    #[must_use]
    pub fn limiter(&self) -> &Arc<TokenBucket> {
        &self.limiter
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    #[must_use]
    pub fn placeholder_policy(&self) -> &PlaceholderPolicy {
        &self.placeholder
    }

    /// Stream `url` into `dest`, hashing as bytes arrive.
    ///
    /// The body lands in a `.part` sibling and is renamed into place only
    /// after length and placeholder checks pass.
    ///
    /// # Errors
    ///
    /// Returns a [`RetryError`] carrying the final [`FetchError`].
    #[instrument(skip(self, dest), fields(dest = %dest.display()))]
    pub async fn download(
        &self,
        url: &str,
        media_type: MediaType,
        dest: &Path,
    ) -> Result<Downloaded, RetryError<FetchError>> {
        validate_url(url).map_err(|error| RetryError::Terminal { error, attempts: 0 })?;

        self.retry
            .execute(|attempt| async move {
                let mut downloaded = self.download_once(url, media_type, dest).await?;
                downloaded.attempts = attempt;
                Ok(downloaded)
            })
            .await
    }

    /// Fetch a full body into memory.
    ///
    /// # Errors
    ///
    /// Returns a [`RetryError`] carrying the final [`FetchError`].
    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, RetryError<FetchError>> {
        validate_url(url).map_err(|error| RetryError::Terminal { error, attempts: 0 })?;

        self.retry
            .execute(|_| async move {
                let response = self.send(url).await?;
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| FetchError::from_reqwest(url, &e))?;
                Ok(bytes.to_vec())
            })
            .await
    }

    async fn send(&self, url: &str) -> Result<Response, FetchError> {
        self.limiter.acquire(1).await;
        debug!(url = %url, "GET");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, &e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        Err(FetchError::from_status(url, status.as_u16(), retry_after))
    }

    async fn download_once(
        &self,
        url: &str,
        media_type: MediaType,
        dest: &Path,
    ) -> Result<Downloaded, FetchError> {
        let response = self.send(url).await?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let expected_len = response.content_length();

        let partial = partial_path(dest);
        let streamed = stream_to_file(response, url, &partial).await;
        let writer = match streamed {
            Ok(writer) => writer,
            Err(e) => {
                remove_if_exists(&partial).await;
                return Err(e);
            }
        };

        let byte_size = writer.len();
        if let Some(expected) = expected_len {
            if expected != byte_size {
                remove_if_exists(&partial).await;
                return Err(FetchError::Integrity {
                    url: url.to_string(),
                    reason: format!("expected {expected} bytes, received {byte_size}"),
                });
            }
        }

        let (digest, checksum) = writer.finish();
        if let Err(reason) =
            self.placeholder
                .inspect(media_type, content_type.as_deref(), byte_size, &digest)
        {
            remove_if_exists(&partial).await;
            return Err(FetchError::Placeholder {
                url: url.to_string(),
                reason,
            });
        }

        tokio::fs::rename(&partial, dest)
            .await
            .map_err(|e| FetchError::Io {
                path: dest.display().to_string(),
                source: e,
            })?;

        debug!(url = %url, bytes = byte_size, checksum = %checksum, "Download stored");
        Ok(Downloaded {
            url: url.to_string(),
            byte_size,
            checksum,
            content_type,
            attempts: 1,
        })
    }
}

async fn stream_to_file(
    response: Response,
    url: &str,
    path: &Path,
) -> Result<ChecksumWriter, FetchError> {
    let io_err = |e: std::io::Error| FetchError::Io {
        path: path.display().to_string(),
        source: e,
    };

    let mut file = tokio::fs::File::create(path).await.map_err(io_err)?;
    let mut writer = ChecksumWriter::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| FetchError::from_reqwest(url, &e))?;
        file.write_all(&chunk).await.map_err(io_err)?;
        writer.update(&chunk);
    }

    file.flush().await.map_err(io_err)?;
    file.sync_all().await.map_err(io_err)?;
    Ok(writer)
}

fn validate_url(url: &str) -> Result<(), FetchError> {
    let parsed = Url::parse(url).map_err(|e| FetchError::InvalidUrl {
        url: url.to_string(),
        message: e.to_string(),
    })?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(FetchError::InvalidUrl {
            url: url.to_string(),
            message: format!("unsupported scheme {}", parsed.scheme()),
        });
    }
    Ok(())
}

/// Parse a `Retry-After` header given as delta-seconds or an HTTP date.
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.with_timezone(&Utc) - Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}
