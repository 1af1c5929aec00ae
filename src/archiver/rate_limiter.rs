//! Global token-bucket rate limiting for outbound requests.

use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::trace;

/// Token bucket shared by every worker and by the archival index client.
///
/// Tokens refill continuously at `rate` per second up to `capacity`. Waiters
/// are served in arrival order because the state lock is a fair mutex held
/// across the refill wait.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, rate: f64, capacity: f64) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }
}

impl TokenBucket {
    /// Create a full bucket.
    ///
    /// # Arguments
    ///
    /// * `rate` - Tokens added per second (must be positive)
    /// * `capacity` - Burst size, the most tokens the bucket can hold
    #[must_use]
    pub fn new(rate: f64, capacity: u32) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            rate: if rate.is_finite() && rate > 0.0 {
                rate
            } else {
                1.0
            },
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until `n` tokens are available and debit them.
    ///
    /// Requests larger than the capacity are clamped to the capacity so they
    /// can still complete.
    pub async fn acquire(&self, n: u32) {
        let wanted = f64::from(n).min(self.capacity);
        let mut state = self.state.lock().await;
        state.refill(self.rate, self.capacity);

        if state.tokens < wanted {
            let deficit = wanted - state.tokens;
            let wait = Duration::from_secs_f64(deficit / self.rate);
            trace!(wait_ms = wait.as_millis(), "Rate limiter waiting for tokens");
            sleep(wait).await;
            state.refill(self.rate, self.capacity);
        }

        // Float rounding can leave us a hair short after the computed wait.
        state.tokens = (state.tokens - wanted).max(0.0);
    }

    /// Configured refill rate in tokens per second.
    #[must_use]
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Configured burst capacity.
    #[must_use]
    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}
