//! The recovery executor: classification, bounded retries, fallback and
//! degradation around a caller-supplied operation.

use crate::config::StormConfig;
use crate::errors::{
    BoxError, CategorizedError, ErrorClassifier, ErrorContext, RecoveryStrategy, SharedError,
};
use crate::observability::{MetricsCollector, PerformanceMetric};
use crate::resilience::degradation::DegradationRegistry;
use crate::resilience::retry::{RetryContext, RetryDecision, RetryHook, RetryPolicy};
use crate::resilience::timeout::with_timeout;
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

enum FallbackKind<T> {
    None,
    Value(T),
    Function(Box<dyn FnOnce() -> BoxFuture<'static, Result<T, BoxError>> + Send>),
}

/// What to serve when the primary operation cannot succeed.
pub struct FallbackPolicy<T> {
    kind: FallbackKind<T>,
    enable_degraded_mode: bool,
    feature: Option<String>,
}

impl<T> Default for FallbackPolicy<T> {
    fn default() -> Self {
        Self::none()
    }
}

impl<T> FallbackPolicy<T> {
    /// No fallback; failures surface as they are.
    pub fn none() -> Self {
        Self {
            kind: FallbackKind::None,
            enable_degraded_mode: false,
            feature: None,
        }
    }

    /// Serve a fixed value.
    pub fn value(value: T) -> Self {
        Self {
            kind: FallbackKind::Value(value),
            ..Self::none()
        }
    }

    /// Run an alternative operation. Its failure becomes the final error.
    pub fn function<F, Fut, E>(fallback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
        T: Send + 'static,
    {
        Self {
            kind: FallbackKind::Function(Box::new(move || {
                async move { fallback().await.map_err(Into::into) }.boxed()
            })),
            ..Self::none()
        }
    }

    /// Report a successful fallback as degraded and mark the feature.
    pub fn with_degraded_mode(mut self, enabled: bool) -> Self {
        self.enable_degraded_mode = enabled;
        self
    }

    /// Feature name used in the degradation registry; defaults to the operation name.
    pub fn for_feature(mut self, feature: impl Into<String>) -> Self {
        self.feature = Some(feature.into());
        self
    }

    /// True unless this is [`FallbackPolicy::none`].
    pub fn is_configured(&self) -> bool {
        !matches!(self.kind, FallbackKind::None)
    }
}

/// Outcome of [`RecoveryExecutor::execute_with_recovery`].
#[derive(Debug, Clone)]
pub struct RecoveryResult<T> {
    /// The value, or the final classified failure with its original cause
    pub outcome: Result<T, CategorizedError>,
    /// Primary attempts made, never more than `max_retries + 1`
    pub attempts_used: u32,
    /// Strategy that produced the outcome; `None` for a first-try success
    pub recovery_strategy: Option<RecoveryStrategy>,
    /// The feature was marked degraded while producing this outcome
    pub degraded_mode: bool,
    /// The failure is non-fatal to a surrounding batch
    pub skipped: bool,
    /// The value came from the fallback, not the operation
    pub fallback_used: bool,
}

impl<T> RecoveryResult<T> {
    /// True when the outcome is a value, fallback values included.
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// The value, if the outcome is a success.
    pub fn result(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    /// The final failure, if any.
    pub fn error(&self) -> Option<&CategorizedError> {
        self.outcome.as_ref().err()
    }

    /// Drops the bookkeeping and keeps the outcome.
    pub fn into_result(self) -> Result<T, CategorizedError> {
        self.outcome
    }
}

/// Runs operations with classification, retries and fallback.
///
/// One executor is shared by all call sites; the classifier history and the
/// degradation registry it holds are per instance.
pub struct RecoveryExecutor {
    policy: RetryPolicy,
    storm: StormConfig,
    classifier: Arc<ErrorClassifier>,
    degradation: Arc<DegradationRegistry>,
    metrics: Option<Arc<MetricsCollector>>,
    retry_hook: Option<Arc<dyn RetryHook>>,
}

impl Default for RecoveryExecutor {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl RecoveryExecutor {
    /// Creates an executor with its own classifier and degradation registry.
    ///
    /// Use the `with_*` methods to share those with other components.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            storm: StormConfig::default(),
            classifier: Arc::new(ErrorClassifier::default()),
            degradation: Arc::new(DegradationRegistry::new()),
            metrics: None,
            retry_hook: None,
        }
    }

    /// Shares a classifier, and with it the error history used for storm checks.
    pub fn with_classifier(mut self, classifier: Arc<ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Shares a degradation registry.
    pub fn with_degradation(mut self, registry: Arc<DegradationRegistry>) -> Self {
        self.degradation = registry;
        self
    }

    /// Every attempt is recorded as a [`PerformanceMetric`].
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Sets when retries are suppressed during an error storm.
    pub fn with_storm_config(mut self, storm: StormConfig) -> Self {
        self.storm = storm;
        self
    }

    /// Add a hook for custom retry behavior
    pub fn with_retry_hook(mut self, hook: Arc<dyn RetryHook>) -> Self {
        self.retry_hook = Some(hook);
        self
    }

    /// Default retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Classifier every failure goes through.
    pub fn classifier(&self) -> &Arc<ErrorClassifier> {
        &self.classifier
    }

    /// Registry fallbacks mark degraded features in.
    pub fn degradation(&self) -> &Arc<DegradationRegistry> {
        &self.degradation
    }

    /// Runs `operation` under the executor's default policy.
    pub async fn execute_with_recovery<T, E, F, Fut>(
        &self,
        operation: F,
        name: &str,
        context: ErrorContext,
        fallback: FallbackPolicy<T>,
    ) -> RecoveryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let policy = self.policy.clone();
        self.execute_with_policy(operation, name, context, fallback, &policy)
            .await
    }

    /// Runs `operation` under a per-call policy.
    pub async fn execute_with_policy<T, E, F, Fut>(
        &self,
        mut operation: F,
        name: &str,
        context: ErrorContext,
        fallback: FallbackPolicy<T>,
        policy: &RetryPolicy,
    ) -> RecoveryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let backoff = policy.backoff();
        let max_attempts = policy.max_attempts();
        let feature = fallback
            .feature
            .clone()
            .unwrap_or_else(|| name.to_string());
        let request_type = context
            .labels
            .get("request_type")
            .cloned()
            .unwrap_or_else(|| name.to_string());

        let mut attempt = 0;
        let error = loop {
            attempt += 1;
            let started = Instant::now();
            let outcome = run_attempt(operation(), name, policy.attempt_timeout).await;
            let elapsed = started.elapsed();

            let cause = match outcome {
                Ok(value) => {
                    self.record(
                        PerformanceMetric::success(name, elapsed)
                            .with_request_type(request_type.as_str())
                            .with_attempt(attempt),
                    );
                    self.degradation.disable(&feature);
                    return RecoveryResult {
                        outcome: Ok(value),
                        attempts_used: attempt,
                        recovery_strategy: (attempt > 1).then_some(RecoveryStrategy::Retry),
                        degraded_mode: false,
                        skipped: false,
                        fallback_used: false,
                    };
                }
                Err(cause) => cause,
            };

            let error = self.classifier.classify_shared(
                cause,
                context.for_attempt(name, attempt, max_attempts),
            );
            self.record(
                PerformanceMetric::failure(name, elapsed, error.category)
                    .with_request_type(request_type.as_str())
                    .with_attempt(attempt),
            );

            let allowed = policy
                .max_retries
                .min(error.max_retries.unwrap_or(policy.max_retries))
                .saturating_add(1);
            if attempt >= allowed || !self.should_retry(&error, policy) {
                break error;
            }

            let mut delay = backoff.delay(attempt);
            if let Some(retry_after) = error.retry_after {
                delay = delay.max(retry_after);
            }

            if let Some(hook) = &self.retry_hook {
                let decision = hook
                    .on_retry(RetryContext {
                        attempt,
                        error: error.clone(),
                        delay,
                        operation: name.to_string(),
                    })
                    .await;
                match decision {
                    RetryDecision::Abort => break error,
                    RetryDecision::Retry(custom) => delay = custom,
                    RetryDecision::Default => {}
                }
            }

            tracing::info!(
                operation = name,
                attempt = attempt,
                max_attempts = allowed,
                delay_ms = delay.as_millis() as u64,
                category = %error.category,
                "Retrying operation"
            );
            tokio::time::sleep(delay).await;
        };

        self.handle_failure(error, attempt, name, &feature, &context, fallback)
            .await
    }

    /// Retryable, allowed by the policy, and not part of an error storm.
    fn should_retry(&self, error: &CategorizedError, policy: &RetryPolicy) -> bool {
        if !error.retryable || !policy.retryable_categories.contains(&error.category) {
            return false;
        }
        let recent = self
            .classifier
            .recent_count(error.category, self.storm.window);
        if recent > self.storm.threshold {
            tracing::warn!(
                category = %error.category,
                recent = recent,
                threshold = self.storm.threshold,
                "Error storm detected, retries suppressed"
            );
            return false;
        }
        true
    }

    async fn handle_failure<T>(
        &self,
        error: CategorizedError,
        attempts_used: u32,
        name: &str,
        feature: &str,
        context: &ErrorContext,
        fallback: FallbackPolicy<T>,
    ) -> RecoveryResult<T> {
        let strategy = error.recovery_strategy;
        let failed = |error: CategorizedError, degraded_mode: bool, skipped: bool| RecoveryResult {
            outcome: Err(error),
            attempts_used,
            recovery_strategy: Some(strategy),
            degraded_mode,
            skipped,
            fallback_used: false,
        };

        let force_degraded = match strategy {
            RecoveryStrategy::Abort => return failed(error, false, false),
            RecoveryStrategy::Skip => return failed(error, false, true),
            RecoveryStrategy::Degrade => {
                self.degradation.enable(feature);
                true
            }
            RecoveryStrategy::Fallback | RecoveryStrategy::Retry => false,
        };

        let degraded_on_success = force_degraded || fallback.enable_degraded_mode;
        let fallback_outcome = match fallback.kind {
            FallbackKind::None => return failed(error, force_degraded, false),
            FallbackKind::Value(value) => Ok(value),
            FallbackKind::Function(run) => run().await,
        };

        match fallback_outcome {
            Ok(value) => {
                if degraded_on_success {
                    self.degradation.enable(feature);
                }
                tracing::info!(
                    operation = name,
                    strategy = %strategy,
                    degraded = degraded_on_success,
                    "Served fallback result"
                );
                RecoveryResult {
                    outcome: Ok(value),
                    attempts_used,
                    recovery_strategy: Some(strategy),
                    degraded_mode: degraded_on_success,
                    skipped: false,
                    fallback_used: true,
                }
            }
            Err(cause) => {
                let fallback_error = self.classifier.classify_shared(
                    Arc::from(cause),
                    context
                        .for_attempt(name, attempts_used, attempts_used)
                        .for_fallback(),
                );
                failed(fallback_error, force_degraded, false)
            }
        }
    }

    /// Runs `primary`; on failure marks `feature` degraded and returns `fallback`.
    pub async fn degrade_gracefully<T, E, Fut>(&self, feature: &str, primary: Fut, fallback: T) -> T
    where
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        match primary.await {
            Ok(value) => {
                self.degradation.disable(feature);
                value
            }
            Err(err) => {
                self.classifier.classify(
                    err,
                    ErrorContext::new()
                        .with_operation(feature)
                        .with_strategy(RecoveryStrategy::Degrade),
                );
                self.degradation.enable(feature);
                fallback
            }
        }
    }

    fn record(&self, metric: PerformanceMetric) {
        if let Some(metrics) = &self.metrics {
            metrics.record_performance(metric);
        }
    }
}

async fn run_attempt<T, E, Fut>(
    future: Fut,
    name: &str,
    limit: Option<Duration>,
) -> Result<T, SharedError>
where
    Fut: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
{
    let shared = |err: E| -> SharedError { Arc::from(err.into()) };
    match limit {
        Some(limit) => match with_timeout(name, limit, future).await {
            Ok(result) => result.map_err(shared),
            Err(timeout) => Err(Arc::new(timeout)),
        },
        None => future.await.map_err(shared),
    }
}
