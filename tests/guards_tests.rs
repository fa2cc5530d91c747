//! Integration tests for the circuit breaker registry and the rate limiter.

use integrations_resilience::{
    CircuitBreakerConfig, CircuitBreakerHook, CircuitBreakerRegistry, CircuitState,
    OperationFailure, RateLimitConfig, RateLimiter, ResilienceError,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

#[derive(Default)]
struct TransitionLog {
    transitions: Mutex<Vec<(String, CircuitState, CircuitState)>>,
}

impl CircuitBreakerHook for TransitionLog {
    fn on_state_change(&self, operation: &str, old: CircuitState, new: CircuitState) {
        self.transitions
            .lock()
            .push((operation.to_string(), old, new));
    }
}

fn failing() -> impl std::future::Future<Output = Result<(), OperationFailure>> {
    async { Err(OperationFailure::new("upstream").with_status(503)) }
}

#[tokio::test(start_paused = true)]
async fn test_circuit_opens_rejects_and_recovers() {
    // Arrange
    let log = Arc::new(TransitionLog::default());
    let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
        failure_threshold: 3,
        recovery_timeout: Duration::from_secs(30),
    })
    .with_hook(log.clone());
    let calls = Arc::new(AtomicU32::new(0));

    // Act - three consecutive failures open the circuit
    for _ in 0..3 {
        let result = registry.execute("llm_call", failing).await;
        assert!(matches!(result, Err(ResilienceError::Operation { .. })));
    }
    assert_eq!(registry.state("llm_call"), CircuitState::Open);

    // The fourth call is rejected without running
    let calls_clone = calls.clone();
    let rejected = registry
        .execute("llm_call", move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, OperationFailure>(()) }
        })
        .await;
    match rejected {
        Err(ResilienceError::CircuitOpen { operation, retry_after }) => {
            assert_eq!(operation, "llm_call");
            assert!(retry_after <= Duration::from_secs(30));
        }
        other => panic!("expected open circuit, got {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // Still open right at the timeout, half-open just after it
    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(registry.state("llm_call"), CircuitState::Open);
    tokio::time::advance(Duration::from_millis(1)).await;
    assert_eq!(registry.state("llm_call"), CircuitState::HalfOpen);

    // A successful trial closes it
    let calls_clone = calls.clone();
    let value = registry
        .execute("llm_call", move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, OperationFailure>("recovered") }
        })
        .await;

    // Assert
    assert_eq!(assert_ok!(value), "recovered");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(registry.state("llm_call"), CircuitState::Closed);
    assert_eq!(
        *log.transitions.lock(),
        vec![
            ("llm_call".to_string(), CircuitState::Closed, CircuitState::Open),
            ("llm_call".to_string(), CircuitState::Open, CircuitState::HalfOpen),
            ("llm_call".to_string(), CircuitState::HalfOpen, CircuitState::Closed),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_circuits_are_independent_per_operation() {
    let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
        failure_threshold: 1,
        recovery_timeout: Duration::from_secs(30),
    });

    assert_err!(registry.execute("summaries", failing).await);

    assert_eq!(registry.state("summaries"), CircuitState::Open);
    assert_eq!(registry.state("embeddings"), CircuitState::Closed);
    assert_ok!(
        registry
            .execute("embeddings", || async { Ok::<_, OperationFailure>(1) })
            .await
    );
}

#[tokio::test(start_paused = true)]
async fn test_rate_limiter_sixth_call_waits_for_window() {
    // Arrange
    let limiter = RateLimiter::new(RateLimitConfig {
        max_requests: 5,
        window: Duration::from_secs(60),
    });

    // Act - five calls spread over the first ten seconds
    for _ in 0..5 {
        assert_ok!(
            limiter
                .execute(|| async { Ok::<_, OperationFailure>(()) }, "llm_call")
                .await
        );
        tokio::time::advance(Duration::from_secs(2)).await;
    }
    let rejected = limiter
        .execute(|| async { Ok::<_, OperationFailure>(()) }, "llm_call")
        .await;

    // Assert - the oldest call leaves the window 50 seconds from now
    match rejected {
        Err(ResilienceError::RateLimited { operation, retry_after }) => {
            assert_eq!(operation, "llm_call");
            assert_eq!(retry_after, Duration::from_secs(50));
        }
        other => panic!("expected rate limit, got {:?}", other),
    }

    tokio::time::advance(Duration::from_secs(50)).await;
    assert_eq!(limiter.remaining(), 1);
    assert_ok!(limiter.acquire("llm_call"));
}

#[test]
fn test_rate_limiter_outside_async_context() {
    let limiter = RateLimiter::new(RateLimitConfig {
        max_requests: 1,
        window: Duration::from_secs(60),
    });

    let first = tokio_test::block_on(
        limiter.execute(|| async { Ok::<_, OperationFailure>("ok") }, "llm_call"),
    );
    let second = tokio_test::block_on(
        limiter.execute(|| async { Ok::<_, OperationFailure>("ok") }, "llm_call"),
    );

    assert_eq!(assert_ok!(first), "ok");
    let err = assert_err!(second);
    assert!(err.is_retryable());
    assert!(err.retry_after().is_some());
}
