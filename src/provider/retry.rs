//! Bounded retry with exponential backoff for provider calls.

use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ProviderError;

use super::ProviderResult;

/// Retry and timeout settings for a single provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Timeout applied to each attempt.
    pub operation_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Returns the delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Runs `call` until it succeeds, fails permanently, or retries run out.
///
/// Each attempt is bounded by the policy's operation timeout; an elapsed
/// timeout counts as a transient failure. Returns the final error together
/// with the number of attempts made.
///
/// # Errors
///
/// Returns the last error when the call does not succeed.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut call: F,
) -> Result<(T, u32), (ProviderError, u32)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome = match tokio::time::timeout(policy.operation_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                operation: what.to_string(),
                timeout_ms: u64::try_from(policy.operation_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        };

        match outcome {
            Ok(value) => return Ok((value, attempt)),
            Err(e) if e.is_retryable() && attempt <= policy.max_retries => {
                let delay = policy.delay_for(attempt);
                warn!("{what} failed (attempt {attempt}): {e}; retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                debug!("{what} giving up after {attempt} attempts: {e}");
                return Err((e, attempt));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            operation_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            operation_timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = call_with_retry(&fast_policy(3), "create", || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::transient("throttled"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result, Ok((7, 3)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<((), u32), _> = call_with_retry(&fast_policy(3), "create", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::permanent("bad input")) }
        })
        .await;

        assert_eq!(result, Err((ProviderError::permanent("bad input"), 1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let result: Result<((), u32), _> =
            call_with_retry(&fast_policy(2), "update", || async {
                Err(ProviderError::transient("still throttled"))
            })
            .await;

        let (err, attempts) = result.expect_err("retries exhausted");
        assert!(err.is_retryable());
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let policy = RetryPolicy {
            operation_timeout: Duration::from_millis(10),
            ..fast_policy(0)
        };
        let result: Result<((), u32), _> = call_with_retry(&policy, "delete", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        let (err, _) = result.expect_err("timed out");
        assert!(matches!(err, ProviderError::Timeout { .. }));
    }
}
