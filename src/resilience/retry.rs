use crate::errors::{CategorizedError, ErrorCategory, ResilienceError, ResilienceResult};
use async_trait::async_trait;
use rand::Rng;
use std::collections::BTreeSet;
use std::time::Duration;

/// Retry behaviour for the recovery executor.
///
/// Built once and shared; pass a different policy per call to override.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap for any single delay
    pub max_delay: Duration,
    /// Growth factor between retries, at least 1.0
    pub backoff_multiplier: f64,
    /// Randomise delays by `jitter_ratio`
    pub jitter_enabled: bool,
    /// Jitter spread as a fraction of the computed delay
    pub jitter_ratio: f64,
    /// Categories the executor may retry
    pub retryable_categories: BTreeSet<ErrorCategory>,
    /// Upper bound for a single attempt
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_enabled: true,
            jitter_ratio: 0.25,
            retryable_categories: [
                ErrorCategory::Network,
                ErrorCategory::Timeout,
                ErrorCategory::Api,
                ErrorCategory::System,
            ]
            .into_iter()
            .collect(),
            attempt_timeout: None,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Sets the retry count.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the first retry delay.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Sets the delay cap.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Sets the growth factor.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Turns jitter on or off.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.jitter_enabled = enabled;
        self
    }

    /// Replaces the retryable categories.
    pub fn with_retryable_categories(
        mut self,
        categories: impl IntoIterator<Item = ErrorCategory>,
    ) -> Self {
        self.retryable_categories = categories.into_iter().collect();
        self
    }

    /// Bounds every attempt; an elapsed attempt fails as a timeout.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Total attempts allowed, the first call included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Checks the policy for values the backoff formula cannot work with.
    pub fn validate(&self) -> ResilienceResult<()> {
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0) {
            return Err(ResilienceError::Configuration {
                message: format!(
                    "backoff_multiplier must be >= 1.0, got {}",
                    self.backoff_multiplier
                ),
            });
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(ResilienceError::Configuration {
                message: format!("jitter_ratio must be within [0, 1], got {}", self.jitter_ratio),
            });
        }
        if self.base_delay > self.max_delay {
            return Err(ResilienceError::Configuration {
                message: "base_delay must not exceed max_delay".to_string(),
            });
        }
        Ok(())
    }

    /// Delay calculator for this policy.
    pub fn backoff(&self) -> BackoffCalculator {
        BackoffCalculator::from_policy(self)
    }
}

/// Computes retry delays: retry `n` waits `min(base * multiplier^(n-1), max)`,
/// optionally spread uniformly by `±jitter_ratio`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffCalculator {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter_ratio: f64,
}

impl BackoffCalculator {
    /// A calculator without jitter.
    pub fn new(base_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            multiplier,
            jitter_ratio: 0.0,
        }
    }

    /// Spreads delays by `±ratio`, clamped to `[0, 1]`.
    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Calculator matching `policy`, jitter included when enabled.
    pub fn from_policy(policy: &RetryPolicy) -> Self {
        let calculator = Self::new(policy.base_delay, policy.max_delay, policy.backoff_multiplier);
        if policy.jitter_enabled {
            calculator.with_jitter_ratio(policy.jitter_ratio)
        } else {
            calculator
        }
    }

    /// Delay before retry `retry` (1-based), without jitter.
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Delay before retry `retry` (1-based), jitter applied.
    pub fn delay(&self, retry: u32) -> Duration {
        let nominal = self.nominal_delay(retry);
        if self.jitter_ratio == 0.0 || nominal.is_zero() {
            return nominal;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter_ratio..=self.jitter_ratio);
        let secs = nominal.as_secs_f64() * (1.0 + spread);
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Hook for custom retry behavior
#[async_trait]
pub trait RetryHook: Send + Sync {
    /// Called before each retry sleep.
    async fn on_retry(&self, context: RetryContext) -> RetryDecision;
}

/// Context information for a retry attempt
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Attempt that just failed, 1-based
    pub attempt: u32,
    /// Its classified failure
    pub error: CategorizedError,
    /// Delay the backoff computed
    pub delay: Duration,
    /// Operation name
    pub operation: String,
}

/// Decision on how to proceed with a retry
#[derive(Debug)]
pub enum RetryDecision {
    /// Use the default retry behavior
    Default,
    /// Retry with a custom delay
    Retry(Duration),
    /// Abort the retry and go straight to failure handling
    Abort,
}
