//! Error categories, severities and the structured context attached to failures.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Error category for classification and handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Authentication and token failures
    Token,
    /// Network connectivity issues
    Network,
    /// Timeouts, including cancellation by timeout
    Timeout,
    /// HTTP/API errors from the inference endpoint
    Api,
    /// Database failures
    Database,
    /// Input or output validation failures
    Validation,
    /// Missing or invalid configuration
    Configuration,
    /// Anything else
    System,
}

impl ErrorCategory {
    /// All categories, in classification priority order.
    pub const ALL: [ErrorCategory; 8] = [
        ErrorCategory::Token,
        ErrorCategory::Network,
        ErrorCategory::Timeout,
        ErrorCategory::Api,
        ErrorCategory::Database,
        ErrorCategory::Validation,
        ErrorCategory::Configuration,
        ErrorCategory::System,
    ];

    /// Stable identifier used in logs and metric breakdowns.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Token => "token_error",
            ErrorCategory::Network => "network_error",
            ErrorCategory::Timeout => "timeout_error",
            ErrorCategory::Api => "api_error",
            ErrorCategory::Database => "database_error",
            ErrorCategory::Validation => "validation_error",
            ErrorCategory::Configuration => "configuration_error",
            ErrorCategory::System => "system_error",
        }
    }

    /// Get a human-readable description of this category
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCategory::Token => "Authentication or token error",
            ErrorCategory::Network => "Network error",
            ErrorCategory::Timeout => "Operation timed out",
            ErrorCategory::Api => "Inference API error",
            ErrorCategory::Database => "Database error",
            ErrorCategory::Validation => "Validation error",
            ErrorCategory::Configuration => "Configuration error",
            ErrorCategory::System => "System error",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How bad a failure is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Expected, self-contained failures
    Low,
    /// Transient failures worth retrying
    Medium,
    /// Failures that degrade a feature
    High,
    /// Failures that need operator attention
    Critical,
}

impl Severity {
    /// Stable identifier used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the recovery executor does once a failure is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Try the operation again after a backoff delay
    Retry,
    /// Serve the configured fallback
    Fallback,
    /// Give up on this item without failing the surrounding batch
    Skip,
    /// Give up immediately, no fallback
    Abort,
    /// Switch the feature to degraded mode, then serve the fallback
    Degrade,
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::Fallback => "fallback",
            RecoveryStrategy::Skip => "skip",
            RecoveryStrategy::Abort => "abort",
            RecoveryStrategy::Degrade => "degrade",
        };
        f.write_str(s)
    }
}

/// Structured hint a call site can attach when it knows what went wrong.
///
/// Hints take precedence over message matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorHint {
    /// The inference API answered with an error status
    Api {
        /// HTTP status code, if one was received
        status_code: Option<u16>,
        /// Endpoint that was called
        endpoint: Option<String>,
    },
    /// The request never reached the endpoint
    Network {
        /// Host that could not be reached
        host: Option<String>,
    },
    /// The call was cancelled by a timer
    Timeout {
        /// The limit that elapsed
        after: Option<Duration>,
    },
    /// Credentials were rejected or missing
    Token,
    /// A storage operation failed
    Database {
        /// The failing storage operation
        operation: Option<String>,
    },
    /// Input or model output failed validation
    Validation {
        /// Offending field
        field: Option<String>,
    },
    /// Required configuration is missing or invalid
    Configuration {
        /// Offending configuration key
        key: Option<String>,
    },
}

impl ErrorHint {
    /// Shorthand for an API hint with a status code.
    pub fn api_status(status_code: u16) -> Self {
        ErrorHint::Api {
            status_code: Some(status_code),
            endpoint: None,
        }
    }
}

/// Context supplied by the call site and enriched by the executor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// Name of the operation being executed
    pub operation: Option<String>,
    /// 1-based attempt number
    pub attempt: u32,
    /// Total attempts allowed for this execution
    pub max_attempts: u32,
    /// True when the failure came from the fallback, not the primary
    pub fallback_attempt: bool,
    /// Structured hint about the failure
    pub hint: Option<ErrorHint>,
    /// Forces a recovery strategy regardless of the matched rule
    pub strategy_override: Option<RecoveryStrategy>,
    /// Caps the retries for this failure below the matched rule's default
    pub max_retries_override: Option<u32>,
    /// Free-form call-site labels
    pub labels: BTreeMap<String, String>,
}

impl ErrorContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the operation name.
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Attaches a structured hint.
    pub fn with_hint(mut self, hint: ErrorHint) -> Self {
        self.hint = Some(hint);
        self
    }

    /// Forces the recovery strategy.
    pub fn with_strategy(mut self, strategy: RecoveryStrategy) -> Self {
        self.strategy_override = Some(strategy);
        self
    }

    /// Overrides the retry cap for failures in this context.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries_override = Some(max_retries);
        self
    }

    /// Adds a free-form label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Copies this context for one attempt of a named operation.
    pub(crate) fn for_attempt(&self, operation: &str, attempt: u32, max_attempts: u32) -> Self {
        let mut context = self.clone();
        context.operation = Some(operation.to_string());
        context.attempt = attempt;
        context.max_attempts = max_attempts;
        context
    }

    /// Copies this context for a fallback execution.
    pub(crate) fn for_fallback(&self) -> Self {
        let mut context = self.clone();
        context.fallback_attempt = true;
        context.hint = None;
        context.strategy_override = None;
        context
    }
}
