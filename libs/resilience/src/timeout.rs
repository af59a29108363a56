/// Deadline enforcement for external calls
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::timeout;

#[derive(Debug, thiserror::Error)]
pub enum TimeoutError {
    #[error("operation timed out after {0:?}")]
    Elapsed(Duration),
}

/// Run a future with a hard time limit.
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    timeout(duration, future)
        .await
        .map_err(|_| TimeoutError::Elapsed(duration))
}

/// Run a future until an absolute deadline. A deadline already in the past
/// yields an immediate timeout without polling the future.
pub async fn with_deadline<F, T>(deadline: Instant, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    let now = Instant::now();
    let Some(remaining) = deadline.checked_duration_since(now) else {
        return Err(TimeoutError::Elapsed(Duration::ZERO));
    };
    with_timeout(remaining, future).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_success() {
        let result = with_timeout(Duration::from_secs(1), async { 42 }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_timeout_elapsed() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            42
        })
        .await;

        assert!(matches!(result, Err(TimeoutError::Elapsed(_))));
    }

    #[tokio::test]
    async fn test_past_deadline_fails_immediately() {
        let deadline = Instant::now() - Duration::from_secs(1);
        let result = with_deadline(deadline, async { 42 }).await;
        assert!(matches!(result, Err(TimeoutError::Elapsed(_))));
    }

    #[tokio::test]
    async fn test_future_deadline_allows_completion() {
        let deadline = Instant::now() + Duration::from_secs(5);
        let result = with_deadline(deadline, async { 42 }).await;
        assert_eq!(result.unwrap(), 42);
    }
}
