use crate::errors::{ResilienceError, ResilienceResult};
use std::future::Future;
use std::time::Duration;

/// Races `future` against a timer.
///
/// On expiry the future is dropped, which cancels it at its next suspension
/// point. Work it already handed to other tasks keeps running.
pub async fn with_timeout<F, T>(operation: &str, limit: Duration, future: F) -> ResilienceResult<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(limit, future).await.map_err(|_| {
        tracing::debug!(
            operation = operation,
            limit_ms = limit.as_millis() as u64,
            "Operation timed out"
        );
        ResilienceError::Timeout {
            operation: operation.to_string(),
            after: limit,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        let result = with_timeout("insights", Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            42
        })
        .await;

        match result {
            Err(ResilienceError::Timeout { operation, after }) => {
                assert_eq!(operation, "insights");
                assert_eq!(after, Duration::from_millis(50));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_completes_in_time() {
        let result = with_timeout("insights", Duration::from_secs(5), async { 42 }).await;
        assert_eq!(result.unwrap(), 42);
    }
}
