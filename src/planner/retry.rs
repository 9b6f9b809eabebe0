//! Retry with exponential backoff, jitter and cancellation.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::ProviderError;

/// Backoff settings for transient provider errors.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per operation, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap on the exponential delay.
    pub max_delay: Duration,
    /// Random fraction (0.0 - 1.0) added on top of each delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }
}

/// Why a retried operation gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    /// A non-transient error; not retried.
    Permanent {
        /// The error.
        error: ProviderError,
        /// Attempts made.
        attempts: u32,
    },
    /// Transient errors until the attempt cap.
    Exhausted {
        /// The last error.
        error: ProviderError,
        /// Attempts made.
        attempts: u32,
    },
    /// The run was cancelled while waiting to retry.
    Cancelled {
        /// The error that triggered the wait.
        error: ProviderError,
        /// Attempts made.
        attempts: u32,
    },
}

impl RetryError {
    /// The last provider error.
    #[must_use]
    pub const fn error(&self) -> &ProviderError {
        match self {
            Self::Permanent { error, .. } | Self::Exhausted { error, .. } | Self::Cancelled { error, .. } => error,
        }
    }

    /// Attempts made before giving up.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Permanent { attempts, .. } | Self::Exhausted { attempts, .. } | Self::Cancelled { attempts, .. } => {
                *attempts
            }
        }
    }

    /// Converts into the last provider error.
    #[must_use]
    pub fn into_error(self) -> ProviderError {
        match self {
            Self::Permanent { error, .. } | Self::Exhausted { error, .. } | Self::Cancelled { error, .. } => error,
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits, for tests and dry runs.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `retry` (1-based), jitter excluded.
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails permanently, exhausts the
    /// attempt cap, or `cancel` fires during a backoff wait.
    ///
    /// Returns the value and the number of attempts it took.
    ///
    /// # Errors
    ///
    /// Returns a [`RetryError`] describing why it gave up.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, resource: &str, mut op: F) -> Result<(T, u32), RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let error = match op(attempts).await {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(resource, attempts, "Operation succeeded after retry");
                    }
                    return Ok((value, attempts));
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                warn!(resource, attempts, error = %error, "Permanent provider error");
                return Err(RetryError::Permanent { error, attempts });
            }
            if attempts >= self.max_attempts {
                warn!(resource, attempts, error = %error, "Retries exhausted");
                return Err(RetryError::Exhausted { error, attempts });
            }

            let delay = jittered_delay(self.backoff(attempts), self.jitter);
            debug!(
                resource,
                attempt = attempts,
                delay_ms = delay.as_millis(),
                error = %error,
                "Transient provider error, retrying"
            );

            // Wait with cancellation support
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => {
                    debug!(resource, attempts, "Cancelled during backoff");
                    return Err(RetryError::Cancelled { error, attempts });
                }
            }
        }
    }
}

/// Add jitter to a duration to prevent thundering herd.
fn jittered_delay(base: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || base.is_zero() {
        return base;
    }
    let jitter = rand::thread_rng().gen_range(0.0..jitter_factor);
    Duration::from_secs_f64(base.as_secs_f64() * (1.0 + jitter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            jitter: 0.0,
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            jitter: 0.25,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let base = Duration::from_millis(100);
        for _ in 0..50 {
            let delay = jittered_delay(base, 0.25);
            assert!(delay >= base);
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let counter = Arc::new(AtomicU32::new(0));
        let seen = counter.clone();

        let result = fast(5)
            .run(&CancellationToken::new(), "subnet(a)", |_| {
                let c = seen.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ProviderError::rate_limited("throttled"))
                    } else {
                        Ok("subnet-1")
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(("subnet-1", 3)));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let result: Result<((), u32), _> = fast(5)
            .run(&CancellationToken::new(), "subnet(a)", |_| async {
                Err(ProviderError::invalid("bad cidr"))
            })
            .await;

        assert!(matches!(result, Err(RetryError::Permanent { attempts: 1, .. })));
    }

    #[tokio::test]
    async fn test_attempt_cap() {
        let result: Result<((), u32), _> = fast(3)
            .run(&CancellationToken::new(), "subnet(a)", |_| async {
                Err(ProviderError::rate_limited("throttled"))
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { .. }));
        assert_eq!(err.attempts(), 3);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
        };

        let trigger = cancel.clone();
        let result: Result<((), u32), _> = policy
            .run(&cancel, "subnet(a)", move |_| {
                trigger.cancel();
                async { Err(ProviderError::rate_limited("throttled")) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1, .. })));
    }
}
