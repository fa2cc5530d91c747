//! Per-operation circuit breakers.
//!
//! ```text
//! Closed   -> Open      failure_count >= threshold (consecutive failures)
//! Open     -> HalfOpen  now - last_failure > recovery_timeout
//! HalfOpen -> Closed    trial call succeeds
//! HalfOpen -> Open      trial call fails
//! ```

use crate::errors::{BoxError, ResilienceError, ResilienceResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time after the last failure before a trial call is allowed
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Circuit breaker state
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are blocked
    Open,
    /// Circuit is half-open, one trial request is allowed
    HalfOpen,
}

/// Point-in-time view of one circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSnapshot {
    /// State after applying any due Open to HalfOpen move
    pub state: CircuitState,
    /// Consecutive failures counted so far
    pub failure_count: u32,
    /// Time since the most recent failure, if any
    pub last_failure_age: Option<Duration>,
    /// Failures that open the circuit
    pub threshold: u32,
    /// Cooldown before a trial call
    pub recovery_timeout: Duration,
}

/// Hook for circuit breaker state changes
pub trait CircuitBreakerHook: Send + Sync {
    /// Called after the named circuit moves from `old_state` to `new_state`.
    fn on_state_change(&self, operation: &str, old_state: CircuitState, new_state: CircuitState);
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Success,
    Failure,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    threshold: u32,
    recovery_timeout: Duration,
    trial_in_flight: bool,
}

impl Circuit {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            threshold: config.failure_threshold.max(1),
            recovery_timeout: config.recovery_timeout,
            trial_in_flight: false,
        }
    }

    fn since_last_failure(&self, now: Instant) -> Option<Duration> {
        self.last_failure_time.map(|t| now.saturating_duration_since(t))
    }

    /// Moves Open to HalfOpen once the recovery timeout has passed.
    fn refresh(&mut self, now: Instant) -> Option<(CircuitState, CircuitState)> {
        if self.state != CircuitState::Open {
            return None;
        }
        let elapsed = self.since_last_failure(now).unwrap_or(Duration::MAX);
        if elapsed > self.recovery_timeout {
            self.state = CircuitState::HalfOpen;
            self.trial_in_flight = false;
            Some((CircuitState::Open, CircuitState::HalfOpen))
        } else {
            None
        }
    }

    fn on_success(&mut self) -> Option<(CircuitState, CircuitState)> {
        self.failure_count = 0;
        self.trial_in_flight = false;
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Closed;
                Some((CircuitState::HalfOpen, CircuitState::Closed))
            }
            _ => None,
        }
    }

    fn on_failure(&mut self, now: Instant) -> Option<(CircuitState, CircuitState)> {
        self.last_failure_time = Some(now);
        self.trial_in_flight = false;
        match self.state {
            CircuitState::Closed => {
                self.failure_count = self.failure_count.saturating_add(1);
                if self.failure_count >= self.threshold {
                    self.state = CircuitState::Open;
                    Some((CircuitState::Closed, CircuitState::Open))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                self.failure_count = self.failure_count.saturating_add(1);
                self.state = CircuitState::Open;
                Some((CircuitState::HalfOpen, CircuitState::Open))
            }
            CircuitState::Open => None,
        }
    }

    fn snapshot(&self, now: Instant) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state,
            failure_count: self.failure_count,
            last_failure_age: self.since_last_failure(now),
            threshold: self.threshold,
            recovery_timeout: self.recovery_timeout,
        }
    }
}

/// Registry of circuit breakers keyed by operation name.
///
/// Circuits are created lazily on first use and live as long as the registry.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    circuits: Mutex<HashMap<String, Circuit>>,
    hook: Option<Arc<dyn CircuitBreakerHook>>,
}

impl CircuitBreakerRegistry {
    /// Create a new registry; every circuit starts from `config`
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
            hook: None,
        }
    }

    /// Add a hook for circuit breaker state changes
    pub fn with_hook(mut self, hook: Arc<dyn CircuitBreakerHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Gives one operation its own thresholds, resetting its circuit.
    pub fn configure(&self, operation: &str, config: CircuitBreakerConfig) {
        self.circuits
            .lock()
            .insert(operation.to_string(), Circuit::new(&config));
    }

    /// Runs `operation` through the named circuit.
    ///
    /// While the circuit is open the operation is not invoked.
    pub async fn execute<T, E, F, Fut>(&self, name: &str, operation: F) -> ResilienceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let permit = self.try_acquire(name)?;
        match operation().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(err) => {
                permit.failure();
                Err(ResilienceError::operation(err))
            }
        }
    }

    /// Admits one call or rejects it with [`ResilienceError::CircuitOpen`].
    ///
    /// The permit must be settled with `success` or `failure`; dropping an
    /// unsettled half-open permit frees the trial slot.
    pub fn try_acquire(&self, name: &str) -> ResilienceResult<CircuitPermit<'_>> {
        let now = Instant::now();
        let mut circuits = self.circuits.lock();
        let circuit = circuits
            .entry(name.to_string())
            .or_insert_with(|| Circuit::new(&self.config));
        let transition = circuit.refresh(now);

        let admitted = match circuit.state {
            CircuitState::Closed => Ok(false),
            CircuitState::HalfOpen if !circuit.trial_in_flight => {
                circuit.trial_in_flight = true;
                Ok(true)
            }
            CircuitState::HalfOpen => Err(Duration::ZERO),
            CircuitState::Open => {
                let elapsed = circuit.since_last_failure(now).unwrap_or_default();
                Err(circuit.recovery_timeout.saturating_sub(elapsed))
            }
        };
        drop(circuits);

        if let Some((old, new)) = transition {
            self.notify(name, old, new);
        }

        match admitted {
            Ok(trial) => Ok(CircuitPermit {
                registry: self,
                name: name.to_string(),
                trial,
                settled: false,
            }),
            Err(retry_after) => {
                tracing::debug!(
                    operation = name,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Circuit open, call rejected"
                );
                Err(ResilienceError::CircuitOpen {
                    operation: name.to_string(),
                    retry_after,
                })
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self, name: &str) {
        self.settle(name, Outcome::Success, None);
    }

    /// Record a failed call
    pub fn record_failure(&self, name: &str) {
        self.settle(name, Outcome::Failure, None);
    }

    /// Applies a call outcome. `trial` is `None` for direct callers and the
    /// permit's trial flag otherwise.
    ///
    /// Permit results only count while the circuit is Closed, or while it is
    /// HalfOpen and the permit is the trial. Anything else finished after the
    /// circuit opened and is dropped.
    fn settle(&self, name: &str, outcome: Outcome, trial: Option<bool>) {
        let now = Instant::now();
        let transition = {
            let mut circuits = self.circuits.lock();
            let circuit = circuits
                .entry(name.to_string())
                .or_insert_with(|| Circuit::new(&self.config));
            let applies = matches!(
                (trial, circuit.state),
                (None, _) | (_, CircuitState::Closed) | (Some(true), CircuitState::HalfOpen)
            );
            if !applies {
                tracing::debug!(
                    operation = name,
                    state = ?circuit.state,
                    outcome = ?outcome,
                    "Ignoring stale call result"
                );
                return;
            }
            match outcome {
                Outcome::Success => circuit.on_success(),
                Outcome::Failure => circuit.on_failure(now),
            }
        };
        if let Some((old, new)) = transition {
            self.notify(name, old, new);
        }
    }

    /// Current state of the named circuit; unknown names are closed.
    pub fn state(&self, name: &str) -> CircuitState {
        self.snapshot(name)
            .map(|s| s.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Full view of the named circuit, if it has been used.
    pub fn snapshot(&self, name: &str) -> Option<CircuitSnapshot> {
        let now = Instant::now();
        let (snapshot, transition) = {
            let mut circuits = self.circuits.lock();
            let circuit = circuits.get_mut(name)?;
            let transition = circuit.refresh(now);
            (circuit.snapshot(now), transition)
        };
        if let Some((old, new)) = transition {
            self.notify(name, old, new);
        }
        Some(snapshot)
    }

    /// Closes the named circuit and clears its counters.
    pub fn reset(&self, name: &str) {
        let old = {
            let mut circuits = self.circuits.lock();
            match circuits.get_mut(name) {
                Some(circuit) => {
                    let old = circuit.state;
                    circuit.state = CircuitState::Closed;
                    circuit.failure_count = 0;
                    circuit.last_failure_time = None;
                    circuit.trial_in_flight = false;
                    old
                }
                None => return,
            }
        };
        if old != CircuitState::Closed {
            self.notify(name, old, CircuitState::Closed);
        }
    }

    /// Names of all circuits created so far.
    pub fn operations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.circuits.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn release_trial(&self, name: &str) {
        if let Some(circuit) = self.circuits.lock().get_mut(name) {
            circuit.trial_in_flight = false;
        }
    }

    fn notify(&self, name: &str, old: CircuitState, new: CircuitState) {
        match new {
            CircuitState::Open => tracing::warn!(operation = name, from = ?old, "Circuit opened"),
            _ => tracing::info!(operation = name, from = ?old, to = ?new, "Circuit state changed"),
        }
        if let Some(hook) = &self.hook {
            hook.on_state_change(name, old, new);
        }
    }
}

/// Admission to call through a circuit.
pub struct CircuitPermit<'a> {
    registry: &'a CircuitBreakerRegistry,
    name: String,
    trial: bool,
    settled: bool,
}

impl CircuitPermit<'_> {
    /// True when this call is the half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Reports that the call succeeded.
    pub fn success(mut self) {
        self.settled = true;
        self.registry.settle(&self.name, Outcome::Success, Some(self.trial));
    }

    /// Reports that the call failed.
    pub fn failure(mut self) {
        self.settled = true;
        self.registry.settle(&self.name, Outcome::Failure, Some(self.trial));
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.registry.release_trial(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::OperationFailure;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn registry(threshold: u32, recovery: Duration) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: recovery,
        })
    }

    async fn fail(registry: &CircuitBreakerRegistry, name: &str) -> ResilienceResult<()> {
        registry
            .execute(name, || async { Err::<(), _>(OperationFailure::new("upstream down")) })
            .await
    }

    #[test]
    fn test_unknown_circuit_is_closed() {
        let registry = registry(3, Duration::from_secs(1));
        assert_eq!(registry.state("insights"), CircuitState::Closed);
        assert!(registry.snapshot("insights").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold_and_rejects_without_invoking() {
        let registry = registry(3, Duration::from_secs(30));
        let calls = AtomicU32::new(0);

        for _ in 0..2 {
            assert!(fail(&registry, "insights").await.is_err());
            assert_eq!(registry.state("insights"), CircuitState::Closed);
        }
        assert!(fail(&registry, "insights").await.is_err());
        assert_eq!(registry.state("insights"), CircuitState::Open);

        let result = registry
            .execute("insights", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, OperationFailure>(1)
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_only_after_recovery_timeout() {
        let registry = registry(2, Duration::from_secs(10));
        let _ = fail(&registry, "insights").await;
        let _ = fail(&registry, "insights").await;
        assert_eq!(registry.state("insights"), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(registry.state("insights"), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert_eq!(registry.state("insights"), CircuitState::HalfOpen);

        let result = registry
            .execute("insights", || async { Ok::<_, OperationFailure>("ok") })
            .await;
        assert_eq!(result.unwrap(), "ok");

        let snapshot = registry.snapshot("insights").unwrap();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let registry = registry(1, Duration::from_secs(5));
        let _ = fail(&registry, "insights").await;
        assert_eq!(registry.state("insights"), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(6)).await;
        let _ = fail(&registry, "insights").await;
        assert_eq!(registry.state("insights"), CircuitState::Open);

        let rejected = fail(&registry, "insights").await;
        match rejected {
            Err(ResilienceError::CircuitOpen { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::from_secs(5));
            }
            other => panic!("expected open circuit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let registry = registry(3, Duration::from_secs(30));
        let _ = fail(&registry, "insights").await;
        let _ = fail(&registry, "insights").await;
        registry
            .execute("insights", || async { Ok::<_, OperationFailure>(()) })
            .await
            .unwrap();
        let _ = fail(&registry, "insights").await;
        let _ = fail(&registry, "insights").await;

        assert_eq!(registry.state("insights"), CircuitState::Closed);
        assert_eq!(registry.snapshot("insights").unwrap().failure_count, 2);
    }

    #[tokio::test]
    async fn test_circuits_are_isolated_by_name() {
        let registry = registry(1, Duration::from_secs(30));
        let _ = fail(&registry, "pricing").await;

        assert_eq!(registry.state("pricing"), CircuitState::Open);
        assert_eq!(registry.state("trends"), CircuitState::Closed);
        assert!(registry
            .execute("trends", || async { Ok::<_, OperationFailure>(()) })
            .await
            .is_ok());
        assert_eq!(registry.operations(), vec!["pricing".to_string(), "trends".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_in_half_open() {
        let registry = registry(1, Duration::from_secs(1));
        registry.record_failure("insights");
        tokio::time::advance(Duration::from_secs(2)).await;

        let trial = registry.try_acquire("insights").unwrap();
        assert!(trial.is_trial());
        assert!(registry.try_acquire("insights").is_err());

        drop(trial);
        let retry = registry.try_acquire("insights").unwrap();
        retry.success();
        assert_eq!(registry.state("insights"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_success_does_not_close_during_trial() {
        let registry = registry(1, Duration::from_secs(5));
        let slow = registry.try_acquire("insights").unwrap();
        assert!(!slow.is_trial());
        registry.record_failure("insights");
        tokio::time::advance(Duration::from_secs(6)).await;
        let trial = registry.try_acquire("insights").unwrap();
        assert!(trial.is_trial());

        slow.success();

        assert_eq!(registry.state("insights"), CircuitState::HalfOpen);
        assert!(matches!(
            registry.try_acquire("insights"),
            Err(ResilienceError::CircuitOpen { .. })
        ));
        trial.success();
        assert_eq!(registry.state("insights"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_failure_does_not_extend_cooldown() {
        let registry = registry(1, Duration::from_secs(5));
        let first = registry.try_acquire("insights").unwrap();
        let second = registry.try_acquire("insights").unwrap();
        first.failure();
        assert_eq!(registry.state("insights"), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(3)).await;
        second.failure();
        assert_eq!(registry.snapshot("insights").unwrap().failure_count, 1);

        tokio::time::advance(Duration::from_millis(2_500)).await;
        assert_eq!(registry.state("insights"), CircuitState::HalfOpen);
    }

    #[test]
    fn test_configure_and_reset() {
        let registry = registry(5, Duration::from_secs(30));
        registry.configure(
            "insights",
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
            },
        );
        registry.record_failure("insights");
        assert_eq!(registry.state("insights"), CircuitState::Open);
        assert_eq!(registry.snapshot("insights").unwrap().threshold, 1);

        registry.reset("insights");
        assert_eq!(registry.state("insights"), CircuitState::Closed);
    }

    struct RecordingHook {
        transitions: Mutex<Vec<(String, CircuitState, CircuitState)>>,
    }

    impl CircuitBreakerHook for RecordingHook {
        fn on_state_change(&self, operation: &str, old_state: CircuitState, new_state: CircuitState) {
            self.transitions
                .lock()
                .push((operation.to_string(), old_state, new_state));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hook_sees_full_cycle() {
        let hook = Arc::new(RecordingHook {
            transitions: Mutex::new(Vec::new()),
        });
        let registry = registry(1, Duration::from_secs(1)).with_hook(hook.clone());

        registry.record_failure("insights");
        tokio::time::advance(Duration::from_secs(2)).await;
        registry
            .execute("insights", || async { Ok::<_, OperationFailure>(()) })
            .await
            .unwrap();

        let transitions = hook.transitions.lock().clone();
        assert_eq!(
            transitions,
            vec![
                ("insights".to_string(), CircuitState::Closed, CircuitState::Open),
                ("insights".to_string(), CircuitState::Open, CircuitState::HalfOpen),
                ("insights".to_string(), CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }
}
