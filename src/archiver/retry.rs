//! Exponential backoff with jitter around fallible network operations.
//!
//! Errors are classified by [`Classify`]: retryable failures (timeouts, 5xx,
//! 429) are retried with `min(base * 2^(attempt-1) + jitter, max_backoff)`
//! between attempts, terminal failures (404/403/410, placeholders) propagate
//! immediately. A server-supplied `Retry-After` replaces the computed delay.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{ErrorClass, FetchError};

/// Error types that the retry strategy knows how to classify.
pub trait Classify {
    /// Whether the failure is worth retrying.
    fn class(&self) -> ErrorClass;

    /// Server-requested delay that overrides the computed backoff.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Classify for FetchError {
    fn class(&self) -> ErrorClass {
        FetchError::class(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        FetchError::retry_after(self)
    }
}

/// Why [`RetryPolicy::execute`] gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The operation failed with a non-retryable error.
    Terminal { error: E, attempts: u32 },
    /// Every allowed attempt failed with a retryable error.
    Exhausted { last: E, attempts: u32 },
}

impl<E> RetryError<E> {
    /// The underlying error of the final attempt.
    pub fn error(&self) -> &E {
        match self {
            Self::Terminal { error, .. } => error,
            Self::Exhausted { last, .. } => last,
        }
    }

    /// Consume and return the underlying error.
    pub fn into_inner(self) -> E {
        match self {
            Self::Terminal { error, .. } => error,
            Self::Exhausted { last, .. } => last,
        }
    }

    /// Number of attempts made.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Terminal { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    /// True when retries ran out rather than hitting a terminal error.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminal { error, attempts } => {
                write!(f, "{error} (terminal after {attempts} attempt(s))")
            }
            Self::Exhausted { last, attempts } => {
                write!(f, "{last} (gave up after {attempts} attempts)")
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts including the first one.
    max_attempts: u32,
    base: Duration,
    max_backoff: Duration,
    max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(32),
            max_jitter: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32, base: Duration, max_backoff: Duration, max_jitter: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            max_backoff,
            max_jitter,
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.max_retry_attempts,
            config.retry_base,
            config.retry_max_backoff,
            config.retry_jitter,
        )
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the attempt following `attempt` (1-indexed), without jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1_u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Delay before the attempt following `attempt`, including random jitter.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let raw = self.base.checked_mul(1_u32 << exponent).unwrap_or(self.max_backoff);
        raw.saturating_add(self.jitter()).min(self.max_backoff)
    }

    fn jitter(&self) -> Duration {
        let max_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    /// Run `operation` until it succeeds, fails terminally, or attempts run out.
    ///
    /// The closure receives the 1-indexed attempt number.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::Terminal`] for non-retryable failures and
    /// [`RetryError::Exhausted`] when the last allowed attempt failed.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        E: Classify + fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if error.class() != ErrorClass::Retryable {
                        debug!(attempt, error = %error, "Non-retryable failure");
                        return Err(RetryError::Terminal {
                            error,
                            attempts: attempt,
                        });
                    }
                    if attempt >= self.max_attempts {
                        warn!(attempt, error = %error, "Retry attempts exhausted");
                        return Err(RetryError::Exhausted {
                            last: error,
                            attempts: attempt,
                        });
                    }

                    let delay = error
                        .retry_after()
                        .map_or_else(|| self.backoff(attempt), |d| d.min(self.max_backoff));
                    debug!(
                        attempt,
                        next_attempt = attempt + 1,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "Retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
