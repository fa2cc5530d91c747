//! Error types raised by the resilience layer itself.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Boxed error accepted from wrapped operations.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Shared, immutable handle to the original cause of a failure.
pub type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

/// Result type alias for resilience operations
pub type ResilienceResult<T> = Result<T, ResilienceError>;

/// Main error type for the resilience layer.
///
/// Guards (circuit breaker, rate limiter, timeouts) reject with one of these
/// variants. The classifier recognises them structurally, so a rejected call
/// never depends on message matching to be categorised correctly.
///
/// For [`ResilienceError::Operation`], `source()` yields the wrapped error
/// itself so it can be downcast to its concrete type.
#[derive(Debug, Clone)]
pub enum ResilienceError {
    /// Configuration error (invalid thresholds, missing values)
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// The circuit for the named operation is open
    CircuitOpen {
        /// Operation name guarded by the circuit
        operation: String,
        /// Time until the circuit allows a trial call
        retry_after: Duration,
    },

    /// The sliding-window rate limit was reached
    RateLimited {
        /// Operation name that was rejected
        operation: String,
        /// Time until the oldest request leaves the window
        retry_after: Duration,
    },

    /// The operation did not complete in time
    Timeout {
        /// Operation name that timed out
        operation: String,
        /// The configured limit that elapsed
        after: Duration,
    },

    /// The wrapped operation itself failed; displays as the wrapped error
    Operation {
        /// The operation's error, untouched
        source: SharedError,
    },
}

impl fmt::Display for ResilienceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResilienceError::Configuration { message } => {
                write!(f, "Configuration error: {}", message)
            }
            ResilienceError::CircuitOpen {
                operation,
                retry_after,
            } => write!(
                f,
                "Circuit breaker is open for '{}', retry in {:?}",
                operation, retry_after
            ),
            ResilienceError::RateLimited {
                operation,
                retry_after,
            } => write!(
                f,
                "Rate limit exceeded for '{}', retry in {:?}",
                operation, retry_after
            ),
            ResilienceError::Timeout { operation, after } => {
                write!(f, "Operation '{}' timed out after {:?}", operation, after)
            }
            ResilienceError::Operation { source } => fmt::Display::fmt(source, f),
        }
    }
}

impl StdError for ResilienceError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ResilienceError::Operation { source } => Some(&**source as &(dyn StdError + 'static)),
            _ => None,
        }
    }
}

impl ResilienceError {
    /// Wraps an operation failure.
    pub fn operation(error: impl Into<BoxError>) -> Self {
        ResilienceError::Operation {
            source: Arc::from(error.into()),
        }
    }

    /// Returns true if waiting and trying again can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ResilienceError::RateLimited { .. } | ResilienceError::Timeout { .. }
        )
    }

    /// Returns the wait hint carried by guard rejections.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ResilienceError::CircuitOpen { retry_after, .. }
            | ResilienceError::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// A failure reported by domain code, optionally carrying an HTTP status.
///
/// Call sites that know the status of a failed inference request should
/// attach it here instead of formatting it into the message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct OperationFailure {
    /// Human-readable failure description
    pub message: String,
    /// HTTP status code of the failed request, if any
    pub status_code: Option<u16>,
}

impl OperationFailure {
    /// Creates a failure with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: None,
        }
    }

    /// Attaches an HTTP status code.
    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }
}

impl From<String> for OperationFailure {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for OperationFailure {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_retryable() {
        let rate_limited = ResilienceError::RateLimited {
            operation: "insights".to_string(),
            retry_after: Duration::from_secs(30),
        };
        assert!(rate_limited.is_retryable());

        let circuit_open = ResilienceError::CircuitOpen {
            operation: "insights".to_string(),
            retry_after: Duration::from_secs(5),
        };
        assert!(!circuit_open.is_retryable());

        let config = ResilienceError::Configuration {
            message: "bad".to_string(),
        };
        assert!(!config.is_retryable());
    }

    #[test]
    fn test_retry_after() {
        let rate_limited = ResilienceError::RateLimited {
            operation: "insights".to_string(),
            retry_after: Duration::from_secs(30),
        };
        assert_eq!(rate_limited.retry_after(), Some(Duration::from_secs(30)));

        let timeout = ResilienceError::Timeout {
            operation: "insights".to_string(),
            after: Duration::from_secs(1),
        };
        assert_eq!(timeout.retry_after(), None);
    }

    #[test]
    fn test_operation_wraps_source() {
        let err = ResilienceError::operation(OperationFailure::new("upstream exploded"));
        assert_eq!(err.to_string(), "upstream exploded");

        let cause = StdError::source(&err).unwrap();
        assert_eq!(
            cause.downcast_ref::<OperationFailure>(),
            Some(&OperationFailure::new("upstream exploded"))
        );
        match &err {
            ResilienceError::Operation { source } => {
                assert!(source.downcast_ref::<OperationFailure>().is_some());
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_operation_failure_with_status() {
        let failure = OperationFailure::new("Service unavailable").with_status(503);
        assert_eq!(failure.status_code, Some(503));
        assert_eq!(failure.to_string(), "Service unavailable");
    }
}
