/// Exponential backoff with a hard cap and optional jitter
///
/// One backoff rule serves two consumers: the in-process [`with_retry`]
/// helper for small bounded retries (e.g. the embedder client), and the
/// engine's delay queue, which calls [`backoff_for_attempt`] to compute
/// when a republished message becomes eligible.
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay for the first retry
    pub base: Duration,
    /// Hard cap on any single delay
    pub cap: Duration,
    /// Apply ±30% random jitter to each delay
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(60),
            jitter: false,
        }
    }
}

impl BackoffPolicy {
    /// Delay before attempt `n` (1-based): `min(base * 2^(n-1), cap)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_for_attempt(self, attempt)
    }
}

/// Delay before attempt `n` (1-based): `min(base * 2^(n-1), cap)`,
/// jittered when the policy asks for it. Attempt 0 is treated as 1.
pub fn backoff_for_attempt(policy: &BackoffPolicy, attempt: u32) -> Duration {
    let exponent = attempt.max(1) - 1;
    let factor = 2u64.checked_pow(exponent).unwrap_or(u64::MAX);
    let raw_ms = (policy.base.as_millis() as u64)
        .checked_mul(factor)
        .unwrap_or(u64::MAX);
    let capped = Duration::from_millis(raw_ms.min(policy.cap.as_millis() as u64));

    if policy.jitter {
        let mut rng = rand::thread_rng();
        let jitter_factor: f64 = rng.gen_range(0.7..1.3);
        Duration::from_millis((capped.as_millis() as f64 * jitter_factor) as u64)
    } else {
        capped
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("max retries ({retries}) exceeded: {last}")]
    MaxRetriesExceeded { retries: u32, last: E },
}

/// Execute a fallible future with bounded in-process retries.
///
/// Runs `f` up to `max_retries + 1` times, sleeping the policy's backoff
/// between attempts. Intended for small internal bounds (the embedder's
/// transient-error retry); the pipeline-level retry subsystem republishes
/// instead of looping here.
pub async fn with_retry<F, Fut, T, E>(
    policy: &BackoffPolicy,
    max_retries: u32,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempt += 1;
                if attempt > max_retries {
                    warn!(retries = max_retries, error = %e, "max retries reached");
                    return Err(RetryError::MaxRetriesExceeded {
                        retries: max_retries,
                        last: e,
                    });
                }

                let delay = backoff_for_attempt(policy, attempt);
                warn!(attempt, max_retries, ?delay, error = %e, "retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy_ms(base: u64, cap: u64) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(base),
            cap: Duration::from_millis(cap),
            jitter: false,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(60),
            jitter: false,
        };

        assert_eq!(backoff_for_attempt(&policy, 1), Duration::from_secs(2));
        assert_eq!(backoff_for_attempt(&policy, 2), Duration::from_secs(4));
        assert_eq!(backoff_for_attempt(&policy, 3), Duration::from_secs(8));
        assert_eq!(backoff_for_attempt(&policy, 6), Duration::from_secs(60));
        assert_eq!(backoff_for_attempt(&policy, 32), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_attempt_zero_treated_as_one() {
        let policy = policy_ms(100, 1000);
        assert_eq!(backoff_for_attempt(&policy, 0), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_near_nominal() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(1000),
            cap: Duration::from_secs(60),
            jitter: true,
        };

        for _ in 0..50 {
            let delay = backoff_for_attempt(&policy, 1).as_millis() as u64;
            assert!((700..=1300).contains(&delay), "jittered delay {delay}ms");
        }
    }

    #[tokio::test]
    async fn test_retry_success_on_first_attempt() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&policy_ms(10, 100), 3, move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&policy_ms(10, 100), 3, move || {
            let count = counter_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                if count < 2 {
                    Err("temporary error")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_bound_is_hard() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&policy_ms(10, 100), 2, move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            async { Err::<i32, _>("persistent error") }
        })
        .await;

        assert!(matches!(
            result,
            Err(RetryError::MaxRetriesExceeded { retries: 2, .. })
        ));
        // Initial attempt + 2 retries
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
