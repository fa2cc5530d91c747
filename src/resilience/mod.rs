//! Retry, fallback, circuit breaking, rate limiting and degradation tracking.

mod batch;
mod circuit_breaker;
mod degradation;
mod rate_limiter;
mod recovery;
mod retry;
mod timeout;

pub use batch::{BatchFailure, BatchOptions, BatchResult};
pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerHook, CircuitBreakerRegistry, CircuitPermit,
    CircuitSnapshot, CircuitState,
};
pub use degradation::DegradationRegistry;
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use recovery::{FallbackPolicy, RecoveryExecutor, RecoveryResult};
pub use retry::{BackoffCalculator, RetryContext, RetryDecision, RetryHook, RetryPolicy};
pub use timeout::with_timeout;
