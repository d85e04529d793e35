use std::future::Future;
use std::time::Duration;

use super::types::TemplarError;
use tracing::{debug, warn};

/// Backoff policy for calls to remote collaborators (interaction server
/// registration and deregistration). Per-request scanning never retries;
/// failures there feed the host error cache instead.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubled for every further retry.
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// A single attempt, no sleeping.
    pub fn none() -> Self {
        Self { max_retries: 0, ..Self::default() }
    }

    /// Delay before retry number `attempt` (0-indexed): exponential, with up
    /// to 25% random jitter, capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(2u32.saturating_pow(attempt));
        let jitter = exp.mul_f64(rand::random::<f64>() * 0.25);
        exp.saturating_add(jitter).min(self.max_delay)
    }
}

/// Run `factory` until it succeeds, fails with an unrecoverable error, or
/// the retries are used up. The last error is returned.
pub async fn with_retry<F, Fut, T>(
    operation: &str,
    config: &RetryConfig,
    mut factory: F,
) -> Result<T, TemplarError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TemplarError>>,
{
    let mut attempt = 0;
    loop {
        let error = match factory().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let classification = error.classify();
        if !classification.recoverable {
            warn!(operation, error_type = classification.error_type, error = %error, "Unrecoverable error");
            return Err(error);
        }
        if attempt >= config.max_retries {
            warn!(operation, attempts = attempt + 1, error = %error, "Giving up");
            return Err(error);
        }

        let delay = config.delay(attempt);
        debug!(
            operation,
            attempt = attempt + 1,
            error_type = classification.error_type,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let config = RetryConfig {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        let first = config.delay(0);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        let second = config.delay(1);
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(250));
        assert_eq!(config.delay(4), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_recoverable_error_is_retried_until_success() {
        let attempts = AtomicU32::new(0);
        let result = with_retry("register", &fast(), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(TemplarError::Network("connection reset".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unrecoverable_error_fails_immediately() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = with_retry("register", &fast(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(TemplarError::Config("bad server url".into())) }
        })
        .await;
        assert!(matches!(result, Err(TemplarError::Config(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_returns_last_error() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = with_retry("register", &RetryConfig::none(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(TemplarError::Timeout("no answer".into())) }
        })
        .await;
        assert!(matches!(result, Err(TemplarError::Timeout(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
