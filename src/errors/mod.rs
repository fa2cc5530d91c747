//! Error types and failure classification.
//!
//! `error` holds the crate's own error type, `categories` the taxonomy and
//! the structured context attached to failures, `classifier` the rules that
//! map failures onto the taxonomy.

mod categories;
mod classifier;
mod error;

pub use categories::{ErrorCategory, ErrorContext, ErrorHint, RecoveryStrategy, Severity};
pub use classifier::{
    is_retryable_status, CategorizedError, ErrorClassifier, ErrorStatistics,
    DEFAULT_HISTORY_CAPACITY, NON_RETRYABLE_STATUS_CODES, RETRYABLE_STATUS_CODES,
};
pub use error::{BoxError, OperationFailure, ResilienceError, ResilienceResult, SharedError};
