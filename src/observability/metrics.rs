//! Metric records and the aggregated views derived from them.

use crate::errors::ErrorCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Timing and outcome of one inference attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetric {
    /// When the attempt finished
    pub timestamp: DateTime<Utc>,
    /// Operation name
    pub operation: String,
    /// Request kind used for breakdowns, e.g. `market_insights`
    pub request_type: String,
    /// Wall time of the attempt
    pub processing_time: Duration,
    /// Whether the attempt succeeded
    pub success: bool,
    /// True when the answer came from the cache
    pub cache_hit: bool,
    /// Category of the failure, if the attempt failed
    pub error_category: Option<ErrorCategory>,
    /// 1-based attempt number within one execution
    pub attempt: u32,
}

impl PerformanceMetric {
    /// A successful attempt, timestamped now.
    pub fn success(operation: impl Into<String>, processing_time: Duration) -> Self {
        let operation = operation.into();
        Self {
            timestamp: Utc::now(),
            request_type: operation.clone(),
            operation,
            processing_time,
            success: true,
            cache_hit: false,
            error_category: None,
            attempt: 1,
        }
    }

    /// A failed attempt, timestamped now.
    pub fn failure(
        operation: impl Into<String>,
        processing_time: Duration,
        category: ErrorCategory,
    ) -> Self {
        Self {
            success: false,
            error_category: Some(category),
            ..Self::success(operation, processing_time)
        }
    }

    /// Overrides the request type, which defaults to the operation name.
    pub fn with_request_type(mut self, request_type: impl Into<String>) -> Self {
        self.request_type = request_type.into();
        self
    }

    /// Marks the attempt as served from the cache.
    pub fn with_cache_hit(mut self, cache_hit: bool) -> Self {
        self.cache_hit = cache_hit;
        self
    }

    /// Sets the 1-based attempt number.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Backdates the record.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Quality assessment of one generated insight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetric {
    /// When the insight was assessed
    pub timestamp: DateTime<Utc>,
    /// Operation name
    pub operation: String,
    /// Request kind used for breakdowns
    pub request_type: String,
    /// Model-reported or scored confidence in `[0, 1]`
    pub confidence: f64,
    /// Whether the output passed validation
    pub validation_passed: bool,
    /// Whether the output came from a fallback
    pub fallback_used: bool,
}

impl QualityMetric {
    /// A passing, non-fallback assessment, timestamped now.
    pub fn new(operation: impl Into<String>, confidence: f64) -> Self {
        let operation = operation.into();
        Self {
            timestamp: Utc::now(),
            request_type: operation.clone(),
            operation,
            confidence,
            validation_passed: true,
            fallback_used: false,
        }
    }

    /// Overrides the request type.
    pub fn with_request_type(mut self, request_type: impl Into<String>) -> Self {
        self.request_type = request_type.into();
        self
    }

    /// Records whether the output passed validation.
    pub fn with_validation(mut self, passed: bool) -> Self {
        self.validation_passed = passed;
        self
    }

    /// Marks the output as produced by a fallback.
    pub fn with_fallback(mut self, fallback_used: bool) -> Self {
        self.fallback_used = fallback_used;
        self
    }

    /// Backdates the record.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Spend attributed to one inference call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostMetric {
    /// When the call was billed
    pub timestamp: DateTime<Utc>,
    /// Operation name
    pub operation: String,
    /// Inference provider
    pub provider: String,
    /// Model name, if known
    pub model: Option<String>,
    /// Prompt tokens
    pub input_tokens: u64,
    /// Completion tokens
    pub output_tokens: u64,
    /// Cost in the budget's currency
    pub cost: f64,
}

impl CostMetric {
    /// A cost record without token counts, timestamped now.
    pub fn new(operation: impl Into<String>, provider: impl Into<String>, cost: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            operation: operation.into(),
            provider: provider.into(),
            model: None,
            input_tokens: 0,
            output_tokens: 0,
            cost,
        }
    }

    /// Sets the model name.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets prompt and completion token counts.
    pub fn with_tokens(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        self
    }

    /// Backdates the record.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Prompt plus completion tokens.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Aggregation window ending at the requested end time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeframe {
    /// Last hour
    Hour,
    /// Last 24 hours
    Day,
    /// Last 7 days
    Week,
    /// Last 30 days
    Month,
}

impl Timeframe {
    /// Length of the window.
    pub fn duration(&self) -> chrono::Duration {
        match self {
            Timeframe::Hour => chrono::Duration::hours(1),
            Timeframe::Day => chrono::Duration::days(1),
            Timeframe::Week => chrono::Duration::weeks(1),
            Timeframe::Month => chrono::Duration::days(30),
        }
    }
}

/// Derived view over one window of metric records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedMetrics {
    /// Requested window
    pub timeframe: Timeframe,
    /// Inclusive window start
    pub start: DateTime<Utc>,
    /// Inclusive window end
    pub end: DateTime<Utc>,
    /// Performance records in the window
    pub total_requests: usize,
    /// Records with `success`
    pub successful_requests: usize,
    /// Records without `success`
    pub failed_requests: usize,
    /// Mean processing time, zero for an empty window
    pub average_processing_time: Duration,
    /// Mean confidence, 0 when no quality records fall in the window
    pub average_confidence: f64,
    /// Records served from the cache
    pub cache_hits: usize,
    /// Records not served from the cache
    pub cache_misses: usize,
    /// `cache_hits / total_requests`, 0 for an empty window
    pub cache_hit_rate: f64,
    /// `failed_requests / total_requests`, 0 for an empty window
    pub error_rate: f64,
    /// Summed cost of the window's cost records
    pub total_cost: f64,
    /// Summed prompt and completion tokens
    pub total_tokens: u64,
    /// Failed records per category
    pub errors_by_category: BTreeMap<ErrorCategory, usize>,
    /// Records per request type
    pub requests_by_type: BTreeMap<String, usize>,
    /// Cost per provider
    pub cost_by_provider: BTreeMap<String, f64>,
}

/// Which threshold a record crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Processing time above the warn fraction of the limit
    SlowProcessing,
    /// Confidence below the minimum
    LowConfidence,
    /// Month-to-date spend reached the alert fraction of the budget
    BudgetThreshold,
    /// One call above the warn fraction of the per-analysis cap
    ExpensiveCall,
}

/// A threshold crossing observed while recording a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricAlert {
    /// Threshold that was crossed
    pub kind: AlertKind,
    /// Operation the record belonged to
    pub operation: String,
    /// Observed value (milliseconds for latency)
    pub value: f64,
    /// Limit that was crossed, same unit as `value`
    pub threshold: f64,
    /// Timestamp of the triggering record
    pub timestamp: DateTime<Utc>,
}

/// Result of a health check over one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// True when `issues` is empty
    pub healthy: bool,
    /// Human-readable threshold breaches
    pub issues: Vec<String>,
    /// The aggregation the check ran on
    pub metrics: AggregatedMetrics,
}
