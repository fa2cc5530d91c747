use crate::errors::{BoxError, ResilienceError, ResilienceResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for rate limiting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Requests admitted per window
    pub max_requests: usize,
    /// Length of the sliding window
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window: Duration::from_secs(60),
        }
    }
}

/// Sliding-window rate limiter for outbound inference calls.
///
/// Admission timestamps older than the window are pruned on every call.
/// Rejected calls are not recorded and do not run.
pub struct RateLimiter {
    config: RateLimitConfig,
    window: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create a new rate limiter with the given configuration
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            window: Mutex::new(VecDeque::with_capacity(config.max_requests)),
            config,
        }
    }

    /// Limit the window enforces.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Runs `operation` if the window has room, otherwise rejects with
    /// [`ResilienceError::RateLimited`] carrying the wait time.
    pub async fn execute<T, E, F, Fut>(&self, operation: F, name: &str) -> ResilienceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.acquire(name)?;
        operation().await.map_err(ResilienceError::operation)
    }

    /// Records one request if allowed; returns the wait time otherwise.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut window = self.window.lock();
        prune(&mut window, now, self.config.window);

        if window.len() >= self.config.max_requests {
            let wait = window
                .front()
                .map(|oldest| {
                    self.config
                        .window
                        .saturating_sub(now.saturating_duration_since(*oldest))
                })
                .unwrap_or(self.config.window);
            return Err(wait);
        }

        window.push_back(now);
        Ok(())
    }

    /// Like [`try_acquire`](Self::try_acquire), with the rejection as a crate error.
    pub fn acquire(&self, name: &str) -> ResilienceResult<()> {
        self.try_acquire().map_err(|retry_after| {
            tracing::warn!(
                operation = name,
                retry_after_ms = retry_after.as_millis() as u64,
                max_requests = self.config.max_requests,
                "Rate limit exceeded"
            );
            ResilienceError::RateLimited {
                operation: name.to_string(),
                retry_after,
            }
        })
    }

    /// Requests still admissible in the current window.
    pub fn remaining(&self) -> usize {
        let mut window = self.window.lock();
        prune(&mut window, Instant::now(), self.config.window);
        self.config.max_requests.saturating_sub(window.len())
    }

    /// Empties the window.
    pub fn reset(&self) {
        self.window.lock().clear();
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant, length: Duration) {
    while let Some(oldest) = window.front() {
        if now.saturating_duration_since(*oldest) >= length {
            window.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::OperationFailure;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn limiter(max_requests: usize, window: Duration) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_requests,
            window,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_over_limit_with_wait_hint() {
        let limiter = limiter(2, Duration::from_secs(60));
        assert!(limiter.try_acquire().is_ok());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(limiter.try_acquire().is_ok());

        let wait = limiter.try_acquire().unwrap_err();
        assert_eq!(wait, Duration::from_secs(50));
        assert_eq!(limiter.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter = limiter(1, Duration::from_secs(1));
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.remaining(), 1);
        assert!(limiter.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn test_rejected_call_does_not_run() {
        let limiter = limiter(1, Duration::from_secs(60));
        let calls = AtomicU32::new(0);
        let op = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, OperationFailure>(())
        };

        limiter.execute(op, "insights").await.unwrap();
        let rejected = limiter.execute(op, "insights").await;

        match rejected {
            Err(ResilienceError::RateLimited { operation, retry_after }) => {
                assert_eq!(operation, "insights");
                assert!(retry_after <= Duration::from_secs(60));
            }
            other => panic!("expected rate limit, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_operation_error_is_wrapped() {
        let limiter = limiter(5, Duration::from_secs(60));
        let result = limiter
            .execute(|| async { Err::<(), _>(OperationFailure::new("boom")) }, "insights")
            .await;
        assert!(matches!(result, Err(ResilienceError::Operation { .. })));
        assert_eq!(limiter.remaining(), 4);
    }

    #[test]
    fn test_zero_capacity_always_rejects() {
        let limiter = limiter(0, Duration::from_secs(1));
        assert_eq!(limiter.try_acquire(), Err(Duration::from_secs(1)));
        limiter.reset();
        assert_eq!(limiter.remaining(), 0);
    }
}
