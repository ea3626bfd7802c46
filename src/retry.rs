use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Exponential-backoff retry policy for external API calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt, so `max_retries + 1` calls in total.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Self::default()
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        // Up to 10% jitter so parallel reruns don't hammer the API in lockstep.
        let jitter = rand::thread_rng().gen_range(0.0..=0.1);
        exp.mul_f64(1.0 + jitter)
    }
}

/// Runs `op` until it succeeds or the policy is exhausted. `is_retryable`
/// decides whether a failure is worth another attempt; `retry_after` lets a
/// rate-limited error dictate its own wait. The last error is returned rather
/// than panicking, so callers can fall back instead of propagating.
pub async fn retry<T, E, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    is_retryable: impl Fn(&E) -> bool,
    retry_after: impl Fn(&E) -> Option<Duration>,
    mut op: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut last_err: Option<E> = None;

    for attempt in 0..=policy.max_retries {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_retryable(&err) {
                    return Err(err);
                }

                if attempt < policy.max_retries {
                    let delay = retry_after(&err).unwrap_or_else(|| policy.delay_for_attempt(attempt));
                    warn!(
                        "attempt {}/{} failed for {}: {}. retrying in {:.1}s",
                        attempt + 1,
                        policy.max_retries + 1,
                        label,
                        err,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    error!(
                        "all {} attempts failed for {}: {}",
                        policy.max_retries + 1,
                        label,
                        err
                    );
                }
                last_err = Some(err);
            }
        }
    }

    // The loop always records an error before falling through.
    Err(last_err.expect("retry loop exited without an error"))
}

/// Convenience wrapper for `ApiError` callers: retryability and rate-limit
/// waits come from the error itself.
pub async fn retry_api<T, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    op: F,
) -> Result<T, crate::error::ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, crate::error::ApiError>>,
{
    retry(
        policy,
        label,
        crate::error::ApiError::is_retryable,
        crate::error::ApiError::retry_after,
        op,
    )
    .await
}
