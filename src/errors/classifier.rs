//! Failure classification.
//!
//! Maps an arbitrary failure plus its call-site context to a
//! [`CategorizedError`]. Structured evidence (context hints, known error
//! types in the source chain) is consulted first; lowercase substring
//! matching over the message chain is the best-effort fallback.

use crate::errors::categories::{ErrorCategory, ErrorContext, ErrorHint, RecoveryStrategy, Severity};
use crate::errors::error::{BoxError, OperationFailure, ResilienceError, SharedError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Default capacity of the classification history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Status codes worth retrying.
pub const RETRYABLE_STATUS_CODES: [u16; 5] = [429, 500, 502, 503, 504];

/// Status codes that never succeed on retry.
pub const NON_RETRYABLE_STATUS_CODES: [u16; 5] = [400, 401, 403, 404, 422];

const TOKEN_PATTERNS: &[&str] = &[
    "unauthorized",
    "unauthenticated",
    "authentication",
    "invalid token",
    "expired token",
    "token expired",
    "token has expired",
    "invalid api key",
    "invalid_api_key",
    "api key",
    "access token",
    "jwt",
    "forbidden",
];

const NETWORK_PATTERNS: &[&str] = &[
    "econnrefused",
    "connection refused",
    "econnreset",
    "connection reset",
    "connection aborted",
    "connection closed",
    "enotfound",
    "getaddrinfo",
    "dns",
    "name resolution",
    "unreachable",
    "ehostunreach",
    "enetunreach",
    "socket hang up",
    "broken pipe",
    "network",
];

const TIMEOUT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "etimedout",
    "deadline exceeded",
    "deadline has elapsed",
    "aborted due to timeout",
    "cancelled by timeout",
    "canceled by timeout",
];

const API_PATTERNS: &[(&str, Option<u16>)] = &[
    ("too many requests", Some(429)),
    ("rate limit", Some(429)),
    ("service unavailable", Some(503)),
    ("overloaded", Some(503)),
    ("bad gateway", Some(502)),
    ("internal server error", Some(500)),
    ("api error", None),
    ("status code", None),
];

const DATABASE_PATTERNS: &[&str] = &[
    "database",
    "sqlite",
    "postgres",
    "mysql",
    "sql error",
    "query failed",
    "deadlock",
    "constraint violation",
    "unique constraint",
    "connection pool",
];

const VALIDATION_PATTERNS: &[&str] = &[
    "validation",
    "invalid input",
    "invalid format",
    "invalid value",
    "schema",
    "failed to parse",
    "parse error",
    "missing field",
    "required field",
    "unexpected token",
    "deserializ",
];

const CONFIGURATION_PATTERNS: &[&str] = &[
    "configuration",
    "config",
    "environment variable",
    "env var",
    "not configured",
    "missing setting",
];

/// A classified failure.
///
/// Created once per failure. The original cause is shared, never mutated,
/// and exposed through [`std::error::Error::source`].
#[derive(Debug, Clone)]
pub struct CategorizedError {
    /// Matched category
    pub category: ErrorCategory,
    /// Matched severity
    pub severity: Severity,
    /// Message of the original cause
    pub message: String,
    /// Call-site context, enriched with attempt information
    pub context: ErrorContext,
    /// When the failure was classified
    pub timestamp: DateTime<Utc>,
    /// What the executor should do about it
    pub recovery_strategy: RecoveryStrategy,
    /// Whether retrying may succeed
    pub retryable: bool,
    /// Retry cap for this failure, if the rule or context sets one
    pub max_retries: Option<u32>,
    /// HTTP status, when one was found
    pub status_code: Option<u16>,
    /// Minimum wait requested by the failing side
    pub retry_after: Option<Duration>,
    original_cause: SharedError,
}

impl fmt::Display for CategorizedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.category, self.message)
    }
}

impl StdError for CategorizedError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.original_cause as &(dyn StdError + 'static))
    }
}

impl CategorizedError {
    /// The untouched original failure.
    pub fn original_cause(&self) -> &SharedError {
        &self.original_cause
    }

    /// True when the failure came from a fallback execution.
    pub fn is_fallback_failure(&self) -> bool {
        self.context.fallback_attempt
    }
}

/// Aggregate view over the classification history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorStatistics {
    /// Errors currently held in history
    pub total: usize,
    /// Counts per category
    pub by_category: BTreeMap<ErrorCategory, usize>,
    /// Counts per severity
    pub by_severity: BTreeMap<Severity, usize>,
    /// Timestamp of the newest error
    pub last_error_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
struct Verdict {
    category: ErrorCategory,
    severity: Severity,
    strategy: RecoveryStrategy,
    retryable: bool,
    max_retries: Option<u32>,
    status_code: Option<u16>,
    retry_after: Option<Duration>,
}

impl Verdict {
    fn for_category(category: ErrorCategory) -> Self {
        let (severity, strategy, retryable, max_retries) = match category {
            ErrorCategory::Token => (Severity::High, RecoveryStrategy::Abort, false, None),
            ErrorCategory::Network => (Severity::Medium, RecoveryStrategy::Retry, true, Some(5)),
            ErrorCategory::Timeout => (Severity::Medium, RecoveryStrategy::Retry, true, Some(3)),
            ErrorCategory::Api => return Self::for_status(None),
            ErrorCategory::Database => (Severity::High, RecoveryStrategy::Fallback, false, None),
            ErrorCategory::Validation => (Severity::Low, RecoveryStrategy::Skip, false, None),
            ErrorCategory::Configuration => {
                (Severity::Critical, RecoveryStrategy::Abort, false, None)
            }
            ErrorCategory::System => (Severity::Medium, RecoveryStrategy::Retry, true, Some(2)),
        };

        Self {
            category,
            severity,
            strategy,
            retryable,
            max_retries,
            status_code: None,
            retry_after: None,
        }
    }

    fn for_status(status_code: Option<u16>) -> Self {
        let (severity, strategy) = match status_code {
            None => (Severity::Medium, RecoveryStrategy::Fallback),
            Some(code) if code >= 500 => (Severity::High, RecoveryStrategy::Retry),
            Some(429) => (Severity::Medium, RecoveryStrategy::Retry),
            Some(404) => (Severity::Low, RecoveryStrategy::Skip),
            Some(401) | Some(403) => (Severity::High, RecoveryStrategy::Abort),
            Some(_) => (Severity::Medium, RecoveryStrategy::Fallback),
        };
        let retryable = status_code.map_or(false, is_retryable_status);

        Self {
            category: ErrorCategory::Api,
            severity,
            strategy,
            retryable,
            max_retries: if retryable { Some(3) } else { None },
            status_code,
            retry_after: None,
        }
    }

    fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// Returns true if a failed request with this status may succeed on retry.
pub fn is_retryable_status(status_code: u16) -> bool {
    RETRYABLE_STATUS_CODES.contains(&status_code)
}

/// Classifies failures and keeps a bounded history of them.
pub struct ErrorClassifier {
    history: Mutex<VecDeque<CategorizedError>>,
    capacity: usize,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl ErrorClassifier {
    /// Creates a classifier whose history holds at most `capacity` errors.
    pub fn new(capacity: usize) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Classifies a failure and appends it to the history.
    pub fn classify(&self, error: impl Into<BoxError>, context: ErrorContext) -> CategorizedError {
        self.classify_shared(Arc::from(error.into()), context)
    }

    /// Classifies an already shared failure and appends it to the history.
    pub fn classify_shared(&self, cause: SharedError, context: ErrorContext) -> CategorizedError {
        let mut verdict = structured_verdict(context.hint.as_ref(), &*cause)
            .unwrap_or_else(|| text_verdict(&message_chain(&*cause)));

        if let Some(strategy) = context.strategy_override {
            verdict.strategy = strategy;
        }
        if let Some(max_retries) = context.max_retries_override {
            verdict.max_retries = Some(max_retries);
        }

        let categorized = CategorizedError {
            category: verdict.category,
            severity: verdict.severity,
            message: cause.to_string(),
            context,
            timestamp: Utc::now(),
            recovery_strategy: verdict.strategy,
            retryable: verdict.retryable,
            max_retries: verdict.max_retries,
            status_code: verdict.status_code,
            retry_after: verdict.retry_after,
            original_cause: cause,
        };

        log_classified(&categorized);
        self.remember(categorized.clone());
        categorized
    }

    fn remember(&self, error: CategorizedError) {
        if self.capacity == 0 {
            return;
        }
        let mut history = self.history.lock();
        while history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(error);
    }

    /// Number of errors of `category` classified within `window`.
    pub fn recent_count(&self, category: ErrorCategory, window: Duration) -> usize {
        let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = Utc::now() - window;
        self.history
            .lock()
            .iter()
            .filter(|e| e.category == category && e.timestamp >= cutoff)
            .count()
    }

    /// The most recent errors, oldest first.
    pub fn recent_errors(&self, limit: usize) -> Vec<CategorizedError> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Number of errors currently held.
    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    /// Counts by category and severity over the history.
    pub fn error_statistics(&self) -> ErrorStatistics {
        let history = self.history.lock();
        let mut stats = ErrorStatistics {
            total: history.len(),
            last_error_at: history.back().map(|e| e.timestamp),
            ..Default::default()
        };
        for error in history.iter() {
            *stats.by_category.entry(error.category).or_insert(0) += 1;
            *stats.by_severity.entry(error.severity).or_insert(0) += 1;
        }
        stats
    }

    /// Drops all recorded errors.
    pub fn clear_history(&self) {
        self.history.lock().clear();
    }
}

fn log_classified(error: &CategorizedError) {
    let operation = error.context.operation.as_deref().unwrap_or("<unnamed>");
    match error.severity {
        Severity::Critical | Severity::High => tracing::warn!(
            operation = operation,
            category = %error.category,
            severity = %error.severity,
            strategy = %error.recovery_strategy,
            attempt = error.context.attempt,
            fallback = error.context.fallback_attempt,
            error = %error.message,
            "Operation failed"
        ),
        Severity::Medium | Severity::Low => tracing::debug!(
            operation = operation,
            category = %error.category,
            severity = %error.severity,
            strategy = %error.recovery_strategy,
            attempt = error.context.attempt,
            fallback = error.context.fallback_attempt,
            error = %error.message,
            "Operation failed"
        ),
    }
}

/// Walks the source chain, `root` first.
fn chain<'a>(root: &'a (dyn StdError + 'static)) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(root), |&node| node.source())
}

fn message_chain(root: &(dyn StdError + 'static)) -> String {
    let mut text = String::new();
    for node in chain(root) {
        if !text.is_empty() {
            text.push_str(": ");
        }
        text.push_str(&node.to_string().to_lowercase());
    }
    text
}

fn hint_verdict(hint: &ErrorHint) -> Verdict {
    match hint {
        ErrorHint::Api { status_code, .. } => Verdict::for_status(*status_code),
        ErrorHint::Network { .. } => Verdict::for_category(ErrorCategory::Network),
        ErrorHint::Timeout { .. } => Verdict::for_category(ErrorCategory::Timeout),
        ErrorHint::Token => Verdict::for_category(ErrorCategory::Token),
        ErrorHint::Database { .. } => Verdict::for_category(ErrorCategory::Database),
        ErrorHint::Validation { .. } => Verdict::for_category(ErrorCategory::Validation),
        ErrorHint::Configuration { .. } => Verdict::for_category(ErrorCategory::Configuration),
    }
}

fn structured_verdict(hint: Option<&ErrorHint>, cause: &(dyn StdError + 'static)) -> Option<Verdict> {
    if let Some(hint) = hint {
        return Some(hint_verdict(hint));
    }
    chain(cause).find_map(typed_verdict)
}

fn typed_verdict(node: &(dyn StdError + 'static)) -> Option<Verdict> {
    if let Some(err) = node.downcast_ref::<ResilienceError>() {
        return match err {
            ResilienceError::Timeout { .. } => Some(Verdict::for_category(ErrorCategory::Timeout)),
            ResilienceError::RateLimited { retry_after, .. } => {
                Some(Verdict::for_status(Some(429)).with_retry_after(*retry_after))
            }
            ResilienceError::CircuitOpen { retry_after, .. } => Some(Verdict {
                category: ErrorCategory::Api,
                severity: Severity::High,
                strategy: RecoveryStrategy::Fallback,
                retryable: false,
                max_retries: None,
                status_code: None,
                retry_after: Some(*retry_after),
            }),
            ResilienceError::Configuration { .. } => {
                Some(Verdict::for_category(ErrorCategory::Configuration))
            }
            ResilienceError::Operation { .. } => None,
        };
    }

    if let Some(failure) = node.downcast_ref::<OperationFailure>() {
        return failure.status_code.map(|code| Verdict::for_status(Some(code)));
    }

    if node.is::<tokio::time::error::Elapsed>() {
        return Some(Verdict::for_category(ErrorCategory::Timeout));
    }

    if let Some(err) = node.downcast_ref::<io::Error>() {
        return match err.kind() {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::BrokenPipe => Some(Verdict::for_category(ErrorCategory::Network)),
            io::ErrorKind::TimedOut => Some(Verdict::for_category(ErrorCategory::Timeout)),
            _ => None,
        };
    }

    if let Some(err) = node.downcast_ref::<reqwest::Error>() {
        if err.is_timeout() {
            return Some(Verdict::for_category(ErrorCategory::Timeout));
        }
        if err.is_connect() {
            return Some(Verdict::for_category(ErrorCategory::Network));
        }
        if let Some(status) = err.status() {
            return Some(Verdict::for_status(Some(status.as_u16())));
        }
    }

    None
}

fn matches_any(text: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| text.contains(p))
}

fn text_verdict(text: &str) -> Verdict {
    if matches_any(text, TOKEN_PATTERNS) {
        return Verdict::for_category(ErrorCategory::Token);
    }
    if matches_any(text, NETWORK_PATTERNS) {
        return Verdict::for_category(ErrorCategory::Network);
    }
    if matches_any(text, TIMEOUT_PATTERNS) {
        return Verdict::for_category(ErrorCategory::Timeout);
    }
    if let Some(status) = extract_status_code(text) {
        return Verdict::for_status(Some(status));
    }
    if let Some((_, status)) = API_PATTERNS.iter().find(|(p, _)| text.contains(p)) {
        return Verdict::for_status(*status);
    }
    if matches_any(text, DATABASE_PATTERNS) {
        return Verdict::for_category(ErrorCategory::Database);
    }
    if matches_any(text, VALIDATION_PATTERNS) {
        return Verdict::for_category(ErrorCategory::Validation);
    }
    if matches_any(text, CONFIGURATION_PATTERNS) {
        return Verdict::for_category(ErrorCategory::Configuration);
    }
    Verdict::for_category(ErrorCategory::System)
}

/// Finds an HTTP status in lowercase text. Only two shapes count:
/// `status[ code][:] NNN` and a status line such as `http/1.1 502`.
fn extract_status_code(text: &str) -> Option<u16> {
    let after_status = text.match_indices("status").filter_map(|(idx, marker)| {
        let rest = text[idx + marker.len()..].trim_start();
        let rest = rest.strip_prefix("code").unwrap_or(rest);
        leading_status(rest.trim_start_matches(|c: char| c == ':' || c.is_whitespace()))
    });
    let after_version = text.match_indices("http/").filter_map(|(idx, marker)| {
        let rest = text[idx + marker.len()..]
            .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.');
        let code = rest.trim_start();
        if code.len() == rest.len() {
            return None;
        }
        leading_status(code)
    });

    after_status.chain(after_version).next()
}

/// Parses exactly three leading digits in the 100..600 range.
fn leading_status(text: &str) -> Option<u16> {
    let end = text.find(|c: char| !c.is_ascii_digit()).unwrap_or(text.len());
    if end != 3 {
        return None;
    }
    text[..end].parse().ok().filter(|code| (100..600).contains(code))
}
