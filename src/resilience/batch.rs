use crate::errors::{BoxError, CategorizedError, ErrorContext};
use crate::resilience::recovery::{FallbackPolicy, RecoveryExecutor};
use std::future::Future;

/// Early-stop rules for [`RecoveryExecutor::execute_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOptions {
    /// Stop once this many items have failed
    pub max_failures: usize,
    /// Keep going after a failure
    pub continue_on_failure: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_failures: usize::MAX,
            continue_on_failure: true,
        }
    }
}

/// One failed or skipped item.
#[derive(Debug, Clone)]
pub struct BatchFailure {
    /// Position of the item in the input
    pub index: usize,
    /// Final classified error
    pub error: CategorizedError,
}

/// Outcome of a sequential batch.
#[derive(Debug, Clone)]
pub struct BatchResult<T> {
    /// Successful items as (index, value), in input order
    pub results: Vec<(usize, T)>,
    /// Items that failed after recovery, in input order
    pub failures: Vec<BatchFailure>,
    /// Items whose failure was classified as skippable
    pub skipped: Vec<BatchFailure>,
    /// Same as `results.len()`
    pub success_count: usize,
    /// Same as `failures.len()`
    pub failure_count: usize,
    /// True when the batch stopped before the last item
    pub stopped_early: bool,
}

impl<T> BatchResult<T> {
    fn new() -> Self {
        Self {
            results: Vec::new(),
            failures: Vec::new(),
            skipped: Vec::new(),
            success_count: 0,
            failure_count: 0,
            stopped_early: false,
        }
    }
}

impl RecoveryExecutor {
    /// Runs `operation` over `items` one at a time.
    ///
    /// Each item gets the full retry and fallback treatment. Skipped items are
    /// reported but never stop the batch.
    pub async fn execute_batch<I, T, E, F, Fut>(
        &self,
        items: &[I],
        name: &str,
        mut operation: F,
        fallback: Option<T>,
        options: &BatchOptions,
    ) -> BatchResult<T>
    where
        F: FnMut(&I) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
        T: Clone,
    {
        let mut batch = BatchResult::new();

        for (index, item) in items.iter().enumerate() {
            let policy = match &fallback {
                Some(value) => FallbackPolicy::value(value.clone()),
                None => FallbackPolicy::none(),
            };
            let context = ErrorContext::new().with_label("batch_index", index.to_string());
            let result = self
                .execute_with_recovery(|| operation(item), name, context, policy)
                .await;

            let skipped = result.skipped;
            match result.into_result() {
                Ok(value) => {
                    batch.success_count += 1;
                    batch.results.push((index, value));
                }
                Err(error) if skipped => {
                    batch.skipped.push(BatchFailure { index, error });
                }
                Err(error) => {
                    batch.failure_count += 1;
                    batch.failures.push(BatchFailure { index, error });

                    let last = index + 1 == items.len();
                    if !last
                        && (!options.continue_on_failure
                            || batch.failure_count >= options.max_failures)
                    {
                        tracing::warn!(
                            operation = name,
                            failures = batch.failure_count,
                            remaining = items.len() - index - 1,
                            "Stopping batch early"
                        );
                        batch.stopped_early = true;
                        break;
                    }
                }
            }
        }

        tracing::debug!(
            operation = name,
            succeeded = batch.success_count,
            failed = batch.failure_count,
            skipped = batch.skipped.len(),
            "Batch finished"
        );
        batch
    }
}
