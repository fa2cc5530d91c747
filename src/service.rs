//! The service object that owns every resilience component.

use crate::cache::{CacheStats, CacheStore};
use crate::config::ResilienceConfig;
use crate::errors::{BoxError, ErrorClassifier, ErrorContext, ResilienceResult};
use crate::observability::{HealthReport, MetricsCollector, PerformanceMetric, Timeframe};
use crate::resilience::{
    CircuitBreakerRegistry, CircuitPermit, CircuitState, DegradationRegistry, FallbackPolicy,
    RateLimiter, RecoveryExecutor, RecoveryResult,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Resilience layer for inference calls, constructed once at startup.
///
/// Holds one instance of each component; clone the `Arc` handles to share
/// them with code that needs direct access.
pub struct ResilienceService {
    config: ResilienceConfig,
    classifier: Arc<ErrorClassifier>,
    degradation: Arc<DegradationRegistry>,
    metrics: Arc<MetricsCollector>,
    cache: Arc<CacheStore<serde_json::Value>>,
    circuits: CircuitBreakerRegistry,
    rate_limiter: RateLimiter,
    executor: RecoveryExecutor,
}

impl ResilienceService {
    /// Builds all components from a validated configuration.
    pub fn new(config: ResilienceConfig) -> ResilienceResult<Self> {
        config.validate()?;

        let classifier = Arc::new(ErrorClassifier::new(config.error_history));
        let degradation = Arc::new(DegradationRegistry::new());
        let metrics = Arc::new(MetricsCollector::new(
            config.metrics.clone(),
            config.performance.clone(),
            config.cost_limits.clone(),
        ));
        let cache = Arc::new(
            CacheStore::new(config.cache.clone()).with_weigher(|value: &serde_json::Value| {
                value.to_string().len()
            }),
        );
        let executor = RecoveryExecutor::new(config.retry.clone())
            .with_classifier(Arc::clone(&classifier))
            .with_degradation(Arc::clone(&degradation))
            .with_metrics(Arc::clone(&metrics))
            .with_storm_config(config.storm.clone());

        tracing::info!(
            max_retries = config.retry.max_retries,
            circuit_threshold = config.circuit_breaker.failure_threshold,
            rate_limit = config.rate_limit.max_requests,
            cache_size = config.cache.max_size,
            "Resilience service initialised"
        );

        Ok(Self {
            circuits: CircuitBreakerRegistry::new(config.circuit_breaker.clone()),
            rate_limiter: RateLimiter::new(config.rate_limit.clone()),
            config,
            classifier,
            degradation,
            metrics,
            cache,
            executor,
        })
    }

    /// Reads the configuration from the environment.
    pub fn from_env() -> ResilienceResult<Self> {
        Self::new(ResilienceConfig::from_env()?)
    }

    /// The validated configuration.
    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Shared classifier and its error history.
    pub fn classifier(&self) -> &Arc<ErrorClassifier> {
        &self.classifier
    }

    /// Shared degradation registry.
    pub fn degradation(&self) -> &Arc<DegradationRegistry> {
        &self.degradation
    }

    /// Shared metrics collector; the executor records every attempt here.
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Response cache used by [`execute_cached`](Self::execute_cached).
    pub fn cache(&self) -> &Arc<CacheStore<serde_json::Value>> {
        &self.cache
    }

    /// Circuits keyed by operation name.
    pub fn circuits(&self) -> &CircuitBreakerRegistry {
        &self.circuits
    }

    /// Limiter shared by every guarded operation.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Executor wired to the shared classifier, registry and metrics.
    pub fn executor(&self) -> &RecoveryExecutor {
        &self.executor
    }

    /// Runs `operation` behind the rate limiter and the named circuit, with
    /// the executor's retry and fallback handling around both.
    ///
    /// Every attempt passes both guards, the circuit first, so a call the
    /// circuit rejects spends no rate slot. A rate-limit rejection is retried
    /// after the window frees up; an open circuit goes straight to the
    /// fallback.
    pub async fn execute_guarded<T, E, F, Fut>(
        &self,
        name: &str,
        mut operation: F,
        context: ErrorContext,
        fallback: FallbackPolicy<T>,
    ) -> RecoveryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let rate_limiter = &self.rate_limiter;
        let circuits = &self.circuits;

        self.executor
            .execute_with_recovery(
                move || {
                    let admitted = circuits
                        .try_acquire(name)
                        .and_then(|permit| rate_limiter.acquire(name).map(|()| permit))
                        .map(|permit| (permit, operation()));
                    guarded_attempt(admitted)
                },
                name,
                context,
                fallback,
            )
            .await
    }

    /// Like [`execute_guarded`](Self::execute_guarded), serving and filling the cache.
    ///
    /// Only primary successes are stored; fallback values never are.
    pub async fn execute_cached<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        name: &str,
        operation: F,
        context: ErrorContext,
        fallback: FallbackPolicy<T>,
    ) -> RecoveryResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        if let Some(cached) = self.cache.get(key) {
            match serde_json::from_value::<T>(cached) {
                Ok(value) => {
                    self.metrics.record_performance(
                        PerformanceMetric::success(name, Duration::ZERO).with_cache_hit(true),
                    );
                    return RecoveryResult {
                        outcome: Ok(value),
                        attempts_used: 0,
                        recovery_strategy: None,
                        degraded_mode: false,
                        skipped: false,
                        fallback_used: false,
                    };
                }
                Err(err) => {
                    tracing::warn!(key = key, error = %err, "Dropping undecodable cache entry");
                    self.cache.delete(key);
                }
            }
        }

        let result = self.execute_guarded(name, operation, context, fallback).await;
        if let (Ok(value), false) = (&result.outcome, result.fallback_used) {
            match serde_json::to_value(value) {
                Ok(json) => self.cache.set(key, json, ttl),
                Err(err) => tracing::warn!(key = key, error = %err, "Result not cacheable"),
            }
        }
        result
    }

    /// Starts the cache and metrics sweepers.
    pub fn start_background_tasks(&self) -> BackgroundTasks {
        BackgroundTasks {
            handles: vec![self.cache.spawn_sweeper(), self.metrics.spawn_sweeper()],
        }
    }

    /// Combined view of metrics, circuits, degradation and cache.
    pub fn health(&self, timeframe: Timeframe) -> ServiceHealth {
        let report = self.metrics.health(timeframe);
        let open_circuits: Vec<String> = self
            .circuits
            .operations()
            .into_iter()
            .filter(|name| self.circuits.state(name) == CircuitState::Open)
            .collect();
        let degraded_features = self.degradation.degraded_features();

        ServiceHealth {
            healthy: report.healthy && open_circuits.is_empty() && degraded_features.is_empty(),
            report,
            open_circuits,
            degraded_features,
            cache: self.cache.stats(),
        }
    }
}

async fn guarded_attempt<T, E, Fut>(
    admitted: ResilienceResult<(CircuitPermit<'_>, Fut)>,
) -> Result<T, BoxError>
where
    Fut: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
{
    let (permit, attempt) = admitted?;
    match attempt.await {
        Ok(value) => {
            permit.success();
            Ok(value)
        }
        Err(err) => {
            permit.failure();
            Err(err.into())
        }
    }
}

/// Snapshot returned by [`ResilienceService::health`].
#[derive(Debug, Clone)]
pub struct ServiceHealth {
    /// Metrics healthy, no open circuit and nothing degraded
    pub healthy: bool,
    /// Metrics health for the requested window
    pub report: HealthReport,
    /// Operations whose circuit is open
    pub open_circuits: Vec<String>,
    /// Features serving fallback results
    pub degraded_features: Vec<String>,
    /// Cache counters
    pub cache: CacheStats,
}

/// Handles of the periodic sweep tasks. Dropping it stops them.
#[derive(Debug)]
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Number of running tasks.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// True when no task was started.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stops all tasks and waits for them to wind down.
    pub async fn shutdown(mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}
