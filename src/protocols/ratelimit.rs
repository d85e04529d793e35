use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::TemplarError;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket shared by every request of the engine.
///
/// Allows `capacity` requests per `window`, refilled continuously. A
/// capacity of zero disables limiting.
pub struct RateLimiter {
    capacity: u32,
    window: Duration,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity,
            window,
            bucket: Mutex::new(Bucket { tokens: capacity as f64, last_refill: Instant::now() }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, Duration::from_secs(1))
    }

    pub fn is_unlimited(&self) -> bool {
        self.capacity == 0 || self.window.is_zero()
    }

    /// Wait for a permit, or fail with `Cancelled` once `cancel` fires.
    pub async fn take(&self, cancel: &CancellationToken) -> Result<(), TemplarError> {
        if cancel.is_cancelled() {
            return Err(TemplarError::Cancelled("rate limiter wait aborted".into()));
        }
        if self.is_unlimited() {
            return Ok(());
        }
        let per_second = self.capacity as f64 / self.window.as_secs_f64();

        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * per_second).min(self.capacity as f64);
                bucket.last_refill = now;
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / per_second)
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(TemplarError::Cancelled("rate limiter wait aborted".into()));
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
