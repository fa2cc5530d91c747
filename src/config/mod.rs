//! Configuration for the resilience layer.
//!
//! Every heuristic threshold used by the executor, the cache and the metrics
//! collector lives here as a configurable default.

use crate::errors::{ErrorCategory, ResilienceError, ResilienceResult, DEFAULT_HISTORY_CAPACITY};
use crate::observability::{LogFormat, LogLevel, LoggingConfig};
use crate::resilience::{CircuitBreakerConfig, RateLimitConfig, RetryPolicy};
use std::str::FromStr;
use std::time::Duration;

/// Longest TTL a cache configuration may default to.
pub const MAX_CACHE_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Cache sizing and expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of entries
    pub max_size: usize,
    /// TTL applied when `set` is called without one
    pub default_ttl: Duration,
    /// How often expired entries are purged in the background
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Spending limits checked when cost metrics are recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct CostLimits {
    /// Monthly budget in the provider's currency
    pub monthly_budget: f64,
    /// Fraction of the budget at which month-to-date spend raises an alert
    pub alert_threshold: f64,
    /// Cap for a single analysis
    pub max_cost_per_analysis: f64,
    /// Fraction of the per-analysis cap at which a single call raises an alert
    pub per_call_warn_ratio: f64,
}

impl Default for CostLimits {
    fn default() -> Self {
        Self {
            monthly_budget: 100.0,
            alert_threshold: 0.8,
            max_cost_per_analysis: 0.50,
            per_call_warn_ratio: 0.8,
        }
    }
}

/// Performance and quality thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceThresholds {
    /// Processing time treated as the upper limit
    pub max_processing_time: Duration,
    /// Fraction of `max_processing_time` at which a slow call is reported
    pub warn_ratio: f64,
    /// Confidence below which a quality alert is raised
    pub min_confidence: f64,
    /// Error rate above which health reports an issue
    pub max_error_rate: f64,
}

impl Default for PerformanceThresholds {
    fn default() -> Self {
        Self {
            max_processing_time: Duration::from_secs(30),
            warn_ratio: 0.8,
            min_confidence: 0.5,
            max_error_rate: 0.1,
        }
    }
}

/// Retry suppression when one error category floods the history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StormConfig {
    /// Same-category errors tolerated within `window` before retries stop
    pub threshold: usize,
    /// Window the storm threshold is counted over
    pub window: Duration,
}

impl Default for StormConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            window: Duration::from_secs(60),
        }
    }
}

/// Bounds for the in-memory metric logs.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsConfig {
    /// Records kept per kind before trimming
    pub capacity: usize,
    /// Fraction of `capacity` kept after an overflow
    pub trim_ratio: f64,
    /// Records older than this are swept
    pub retention: Duration,
    /// How often expired records are swept
    pub sweep_interval: Duration,
    /// Threshold alerts kept for inspection
    pub alert_history: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            trim_ratio: 0.8,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
            alert_history: 100,
        }
    }
}

/// Complete configuration of the resilience layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ResilienceConfig {
    /// Backoff and retry policy for the executor
    pub retry: RetryPolicy,
    /// Defaults for every circuit
    pub circuit_breaker: CircuitBreakerConfig,
    /// Sliding-window rate limit
    pub rate_limit: RateLimitConfig,
    /// Response cache
    pub cache: CacheConfig,
    /// Spending limits for cost alerts
    pub cost_limits: CostLimits,
    /// Latency and quality thresholds
    pub performance: PerformanceThresholds,
    /// Error storm suppression
    pub storm: StormConfig,
    /// Metric log bounds
    pub metrics: MetricsConfig,
    /// Subscriber setup
    pub logging: LoggingConfig,
    /// Classification history capacity
    pub error_history: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            cost_limits: CostLimits::default(),
            performance: PerformanceThresholds::default(),
            storm: StormConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
            error_history: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl ResilienceConfig {
    /// Creates a new configuration builder
    pub fn builder() -> ResilienceConfigBuilder {
        ResilienceConfigBuilder::default()
    }

    /// Creates a configuration from `RESILIENCE_*` environment variables.
    ///
    /// Unset variables keep their defaults; unparsable values are errors.
    pub fn from_env() -> ResilienceResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<L>(lookup: L) -> ResilienceResult<Self>
    where
        L: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let mut config = Self::default();

        let retry = &mut config.retry;
        env.set("RESILIENCE_MAX_RETRIES", &mut retry.max_retries)?;
        env.set_millis("RESILIENCE_BASE_DELAY_MS", &mut retry.base_delay)?;
        env.set_millis("RESILIENCE_MAX_DELAY_MS", &mut retry.max_delay)?;
        env.set("RESILIENCE_BACKOFF_MULTIPLIER", &mut retry.backoff_multiplier)?;
        env.set("RESILIENCE_JITTER_ENABLED", &mut retry.jitter_enabled)?;
        env.set("RESILIENCE_JITTER_RATIO", &mut retry.jitter_ratio)?;
        if let Some(ms) = env.parse::<u64>("RESILIENCE_ATTEMPT_TIMEOUT_MS")? {
            retry.attempt_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(list) = env.get("RESILIENCE_RETRYABLE_CATEGORIES") {
            retry.retryable_categories = parse_categories(&list)?;
        }

        env.set("RESILIENCE_CIRCUIT_THRESHOLD", &mut config.circuit_breaker.failure_threshold)?;
        env.set_millis(
            "RESILIENCE_CIRCUIT_RECOVERY_MS",
            &mut config.circuit_breaker.recovery_timeout,
        )?;

        env.set("RESILIENCE_RATE_LIMIT_MAX_REQUESTS", &mut config.rate_limit.max_requests)?;
        env.set_millis("RESILIENCE_RATE_LIMIT_WINDOW_MS", &mut config.rate_limit.window)?;

        env.set("RESILIENCE_CACHE_MAX_SIZE", &mut config.cache.max_size)?;
        env.set_secs("RESILIENCE_CACHE_TTL_SECS", &mut config.cache.default_ttl)?;
        env.set_secs("RESILIENCE_CACHE_SWEEP_SECS", &mut config.cache.sweep_interval)?;

        env.set("RESILIENCE_MONTHLY_BUDGET", &mut config.cost_limits.monthly_budget)?;
        env.set("RESILIENCE_COST_ALERT_THRESHOLD", &mut config.cost_limits.alert_threshold)?;
        env.set(
            "RESILIENCE_MAX_COST_PER_ANALYSIS",
            &mut config.cost_limits.max_cost_per_analysis,
        )?;

        env.set_millis(
            "RESILIENCE_MAX_PROCESSING_TIME_MS",
            &mut config.performance.max_processing_time,
        )?;
        env.set("RESILIENCE_MIN_CONFIDENCE", &mut config.performance.min_confidence)?;
        env.set("RESILIENCE_MAX_ERROR_RATE", &mut config.performance.max_error_rate)?;

        env.set("RESILIENCE_STORM_THRESHOLD", &mut config.storm.threshold)?;
        env.set_secs("RESILIENCE_STORM_WINDOW_SECS", &mut config.storm.window)?;

        env.set("RESILIENCE_METRICS_CAPACITY", &mut config.metrics.capacity)?;
        if let Some(hours) = env.parse::<u64>("RESILIENCE_METRICS_RETENTION_HOURS")? {
            let secs = hours.checked_mul(60 * 60).ok_or_else(|| {
                config_error("RESILIENCE_METRICS_RETENTION_HOURS is too large")
            })?;
            config.metrics.retention = Duration::from_secs(secs);
        }

        env.set("RESILIENCE_ERROR_HISTORY", &mut config.error_history)?;
        env.set::<LogLevel>("RESILIENCE_LOG_LEVEL", &mut config.logging.level)?;
        env.set::<LogLevel>(
            "RESILIENCE_DEPENDENCY_LOG_LEVEL",
            &mut config.logging.dependency_level,
        )?;
        env.set::<LogFormat>("RESILIENCE_LOG_FORMAT", &mut config.logging.format)?;

        config.validate()?;
        Ok(config)
    }

    /// Rejects values the components cannot run with.
    pub fn validate(&self) -> ResilienceResult<()> {
        self.retry.validate()?;

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(config_error("circuit breaker failure_threshold must be at least 1"));
        }
        if self.rate_limit.max_requests == 0 || self.rate_limit.window.is_zero() {
            return Err(config_error("rate limit needs max_requests >= 1 and a non-zero window"));
        }
        if self.cache.max_size == 0 {
            return Err(config_error("cache max_size must be at least 1"));
        }
        if self.cache.default_ttl > MAX_CACHE_TTL {
            return Err(config_error("cache default_ttl must not exceed 365 days"));
        }
        if self.cache.sweep_interval.is_zero() || self.metrics.sweep_interval.is_zero() {
            return Err(config_error("sweep intervals must be non-zero"));
        }
        if !(self.cost_limits.alert_threshold > 0.0 && self.cost_limits.alert_threshold <= 1.0) {
            return Err(config_error("cost alert_threshold must be within (0, 1]"));
        }
        if self.cost_limits.monthly_budget < 0.0 || self.cost_limits.max_cost_per_analysis < 0.0 {
            return Err(config_error("cost limits must not be negative"));
        }
        if !is_fraction(self.cost_limits.per_call_warn_ratio)
            || !is_fraction(self.performance.warn_ratio)
        {
            return Err(config_error("per_call_warn_ratio and warn_ratio must be within (0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.performance.min_confidence)
            || !(0.0..=1.0).contains(&self.performance.max_error_rate)
        {
            return Err(config_error("min_confidence and max_error_rate must be within [0, 1]"));
        }
        if self.metrics.capacity == 0
            || !(self.metrics.trim_ratio > 0.0 && self.metrics.trim_ratio <= 1.0)
        {
            return Err(config_error("metrics capacity must be >= 1 and trim_ratio within (0, 1]"));
        }
        Ok(())
    }
}

fn is_fraction(value: f64) -> bool {
    value > 0.0 && value <= 1.0
}

fn config_error(message: &str) -> ResilienceError {
    ResilienceError::Configuration {
        message: message.to_string(),
    }
}

fn parse_categories(list: &str) -> ResilienceResult<std::collections::BTreeSet<ErrorCategory>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|name| {
            ErrorCategory::ALL
                .iter()
                .copied()
                .find(|c| c.as_str() == name || c.as_str().trim_end_matches("_error") == name)
                .ok_or_else(|| ResilienceError::Configuration {
                    message: format!("unknown error category '{}'", name),
                })
        })
        .collect()
}

struct EnvReader<L> {
    lookup: L,
}

impl<L> EnvReader<L>
where
    L: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, key: &str) -> ResilienceResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse().map(Some).map_err(|e| ResilienceError::Configuration {
                message: format!("{} has invalid value '{}': {}", key, raw, e),
            }),
        }
    }

    fn set<T>(&self, key: &str, target: &mut T) -> ResilienceResult<()>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(value) = self.parse(key)? {
            *target = value;
        }
        Ok(())
    }

    fn set_millis(&self, key: &str, target: &mut Duration) -> ResilienceResult<()> {
        if let Some(ms) = self.parse::<u64>(key)? {
            *target = Duration::from_millis(ms);
        }
        Ok(())
    }

    fn set_secs(&self, key: &str, target: &mut Duration) -> ResilienceResult<()> {
        if let Some(secs) = self.parse::<u64>(key)? {
            *target = Duration::from_secs(secs);
        }
        Ok(())
    }
}

/// Builder for ResilienceConfig
#[derive(Debug, Default)]
pub struct ResilienceConfigBuilder {
    config: ResilienceConfig,
}

impl ResilienceConfigBuilder {
    /// Sets the retry policy.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Sets the default circuit configuration.
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = config;
        self
    }

    /// Sets the rate limit.
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.config.rate_limit = config;
        self
    }

    /// Sets cache sizing and expiry.
    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.config.cache = config;
        self
    }

    /// Sets spending limits.
    pub fn cost_limits(mut self, limits: CostLimits) -> Self {
        self.config.cost_limits = limits;
        self
    }

    /// Sets performance and quality thresholds.
    pub fn performance(mut self, thresholds: PerformanceThresholds) -> Self {
        self.config.performance = thresholds;
        self
    }

    /// Sets error storm suppression.
    pub fn storm(mut self, config: StormConfig) -> Self {
        self.config.storm = config;
        self
    }

    /// Sets metric log bounds.
    pub fn metrics(mut self, config: MetricsConfig) -> Self {
        self.config.metrics = config;
        self
    }

    /// Sets logging output.
    pub fn logging(mut self, config: LoggingConfig) -> Self {
        self.config.logging = config;
        self
    }

    /// Sets the classification history capacity.
    pub fn error_history(mut self, capacity: usize) -> Self {
        self.config.error_history = capacity;
        self
    }

    /// Builds and validates the configuration
    pub fn build(self) -> ResilienceResult<ResilienceConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use test_case::test_case;

    fn from_pairs(pairs: &[(&str, &str)]) -> ResilienceResult<ResilienceConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ResilienceConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = ResilienceConfig::builder().build().unwrap();
        assert_eq!(config.cache.max_size, 1000);
        assert_eq!(config.cache.default_ttl, Duration::from_secs(3600));
        assert_eq!(config.cache.sweep_interval, Duration::from_secs(300));
        assert_eq!(config.storm.threshold, 10);
        assert_eq!(config.metrics.capacity, 10_000);
        assert_eq!(config.metrics.retention, Duration::from_secs(604_800));
        assert_eq!(config.performance.min_confidence, 0.5);
        assert_eq!(config.performance.max_error_rate, 0.1);
        assert_eq!(config.cost_limits.alert_threshold, 0.8);
        assert_eq!(config.error_history, 100);
    }

    #[test]
    fn test_from_env_empty_matches_defaults() {
        assert_eq!(from_pairs(&[]).unwrap(), ResilienceConfig::default());
    }

    #[test]
    fn test_from_env_overrides() {
        let config = from_pairs(&[
            ("RESILIENCE_MAX_RETRIES", "5"),
            ("RESILIENCE_BASE_DELAY_MS", "250"),
            ("RESILIENCE_JITTER_ENABLED", "false"),
            ("RESILIENCE_RETRYABLE_CATEGORIES", "network, timeout_error"),
            ("RESILIENCE_CIRCUIT_THRESHOLD", "3"),
            ("RESILIENCE_RATE_LIMIT_MAX_REQUESTS", "5"),
            ("RESILIENCE_RATE_LIMIT_WINDOW_MS", "60000"),
            ("RESILIENCE_CACHE_TTL_SECS", "120"),
            ("RESILIENCE_METRICS_RETENTION_HOURS", "24"),
            ("RESILIENCE_LOG_LEVEL", "debug"),
            ("RESILIENCE_LOG_FORMAT", "json"),
        ])
        .unwrap();

        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert!(!config.retry.jitter_enabled);
        assert_eq!(
            config.retry.retryable_categories.into_iter().collect::<Vec<_>>(),
            vec![ErrorCategory::Network, ErrorCategory::Timeout]
        );
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.rate_limit.max_requests, 5);
        assert_eq!(config.rate_limit.window, Duration::from_secs(60));
        assert_eq!(config.cache.default_ttl, Duration::from_secs(120));
        assert_eq!(config.metrics.retention, Duration::from_secs(86_400));
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_from_env_rejects_garbage() {
        let err = from_pairs(&[("RESILIENCE_MAX_RETRIES", "many")]).unwrap_err();
        assert!(err.to_string().contains("RESILIENCE_MAX_RETRIES"));

        assert!(from_pairs(&[("RESILIENCE_RETRYABLE_CATEGORIES", "network,cosmic")]).is_err());
        assert!(from_pairs(&[("RESILIENCE_CIRCUIT_THRESHOLD", "0")]).is_err());
    }

    #[test]
    fn test_from_env_rejects_oversized_durations() {
        let max = u64::MAX.to_string();

        let err = from_pairs(&[("RESILIENCE_CACHE_TTL_SECS", max.as_str())]).unwrap_err();
        assert!(err.to_string().contains("default_ttl"));

        let err = from_pairs(&[("RESILIENCE_METRICS_RETENTION_HOURS", max.as_str())]).unwrap_err();
        assert!(matches!(err, ResilienceError::Configuration { .. }));
        assert!(err.to_string().contains("RESILIENCE_METRICS_RETENTION_HOURS"));
    }

    #[test_case(-1.0 ; "negative")]
    #[test_case(0.0 ; "zero")]
    #[test_case(1.5 ; "above one")]
    #[test_case(f64::NAN ; "nan")]
    #[test_case(f64::INFINITY ; "infinite")]
    fn test_warn_ratios_must_be_fractions(ratio: f64) {
        let result = ResilienceConfig::builder()
            .performance(PerformanceThresholds {
                warn_ratio: ratio,
                ..Default::default()
            })
            .build();
        assert!(matches!(result, Err(ResilienceError::Configuration { .. })));

        let result = ResilienceConfig::builder()
            .cost_limits(CostLimits {
                per_call_warn_ratio: ratio,
                ..Default::default()
            })
            .build();
        assert!(matches!(result, Err(ResilienceError::Configuration { .. })));
    }

    #[test]
    fn test_builder_validates() {
        let result = ResilienceConfig::builder()
            .cache(CacheConfig {
                max_size: 0,
                ..Default::default()
            })
            .build();
        assert!(matches!(result, Err(ResilienceError::Configuration { .. })));

        let result = ResilienceConfig::builder()
            .cost_limits(CostLimits {
                alert_threshold: 1.5,
                ..Default::default()
            })
            .build();
        assert!(result.is_err());
    }
}
