//! # Resilience layer for LLM inference calls
//!
//! Wraps calls to model endpoints with failure classification, bounded
//! retries with backoff, fallbacks, circuit breaking, rate limiting, a
//! response cache and in-memory performance, quality and cost metrics.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use integrations_resilience::{
//!     ErrorContext, FallbackPolicy, OperationFailure, ResilienceConfig, ResilienceService,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = ResilienceService::new(ResilienceConfig::from_env()?)?;
//!     let _sweepers = service.start_background_tasks();
//!
//!     let result = service
//!         .execute_guarded(
//!             "insights",
//!             || async { Ok::<_, OperationFailure>("summary".to_string()) },
//!             ErrorContext::new(),
//!             FallbackPolicy::value("no insights available".to_string()),
//!         )
//!         .await;
//!
//!     println!("{:?} after {} attempts", result.result(), result.attempts_used);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - `errors` - Error type, failure taxonomy and the classifier
//! - `resilience` - Backoff, recovery executor, circuit breaker, rate limiter, degradation
//! - `cache` - TTL/LRU response cache and cache keys
//! - `observability` - Logging setup and the metrics collector
//! - `config` - Configuration types, builder and environment loading
//! - `service` - The service object tying the components together

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod config;
pub mod errors;
pub mod observability;
pub mod resilience;
pub mod service;

pub use cache::{CacheEntry, CacheKeyBuilder, CacheStats, CacheStore, RequestFingerprint};
pub use config::{
    CacheConfig, CostLimits, MetricsConfig, PerformanceThresholds, ResilienceConfig,
    ResilienceConfigBuilder, StormConfig,
};
pub use errors::{
    BoxError, CategorizedError, ErrorCategory, ErrorClassifier, ErrorContext, ErrorHint,
    ErrorStatistics, OperationFailure, RecoveryStrategy, ResilienceError, ResilienceResult,
    Severity, SharedError,
};
pub use observability::{
    AggregatedMetrics, AlertKind, CostMetric, HealthReport, LogFormat, LogLevel, LoggingConfig,
    MetricAlert, MetricsCollector, PerformanceMetric, QualityMetric, Timeframe,
};
pub use resilience::{
    with_timeout, BackoffCalculator, BatchFailure, BatchOptions, BatchResult,
    CircuitBreakerConfig, CircuitBreakerHook, CircuitBreakerRegistry, CircuitPermit,
    CircuitSnapshot, CircuitState, DegradationRegistry, FallbackPolicy, RateLimitConfig,
    RateLimiter, RecoveryExecutor, RecoveryResult, RetryContext, RetryDecision, RetryHook,
    RetryPolicy,
};
pub use service::{BackgroundTasks, ResilienceService, ServiceHealth};
