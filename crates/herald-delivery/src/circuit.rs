//! Per-destination circuit breakers.
//!
//! A breaker fails fast while a destination is unhealthy and probes recovery
//! after a cool-down. Outcomes are tracked both as a consecutive-failure
//! counter and as a fixed-size ring of recent results, so a destination that
//! fails intermittently can still trip the breaker.
//!
//! # State machine
//!
//! ```text
//!                          ┌─────────────────────────┐
//!                          │        CLOSED           │
//!                          │   (Normal Operation)    │
//!                          └─────────────────────────┘
//!                           │                        ▲
//!  failure_threshold        │                        │ success_threshold
//!  consecutive failures     │                        │ consecutive successes
//!  OR window failure rate   ▼                        │
//!    ┌─────────────────────────┐                  ┌───────────────────────┐
//!    │         OPEN            │    timeout       │       HALF-OPEN       │
//!    │      (Fail Fast)        │ ───────────────▶ │   (Testing Recovery)  │
//!    └─────────────────────────┘                  └───────────────────────┘
//!                 ▲                                           │
//!                 └───────────────── any failure ─────────────┘
//! ```
//!
//! Admission and outcome recording happen under one lock; the protected
//! work itself runs outside it. State-change listeners are invoked on a
//! spawned task after the lock is released.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use herald_core::{CircuitState, Clock};
use serde::Serialize;

use crate::error::{DeliveryError, Result};

/// Callback invoked with `(destination, from, to)` on every transition.
pub type StateChangeListener = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Breaker tuning for one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit. Also the numerator of the
    /// window failure-rate threshold.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
    /// Time the circuit stays open after the last failure.
    pub timeout: Duration,
    /// In-flight cap, enforced in every state.
    pub max_concurrent_calls: u32,
    /// Number of outcomes kept in the sliding window.
    pub sliding_window_size: usize,
    /// Samples required before the window failure rate is considered.
    pub minimum_request_count: usize,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout: Duration::from_secs(30),
            max_concurrent_calls: 10,
            sliding_window_size: 20,
            minimum_request_count: 5,
        }
    }
}

impl CircuitConfig {
    /// Checks the configuration for values the state machine cannot honour.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` for zero thresholds, a zero
    /// concurrency cap or an empty window.
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(DeliveryError::configuration("failure_threshold must be greater than 0"));
        }
        if self.success_threshold == 0 {
            return Err(DeliveryError::configuration("success_threshold must be greater than 0"));
        }
        if self.max_concurrent_calls == 0 {
            return Err(DeliveryError::configuration(
                "max_concurrent_calls must be greater than 0",
            ));
        }
        if self.sliding_window_size == 0 {
            return Err(DeliveryError::configuration("sliding_window_size must be greater than 0"));
        }
        Ok(())
    }

    /// Window failure rate at or above which the circuit opens.
    pub fn failure_rate_threshold(&self) -> f64 {
        f64::from(self.failure_threshold) / self.sliding_window_size as f64
    }
}

/// Fixed-capacity ring of call outcomes (`true` = success).
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    slots: Vec<bool>,
    cursor: usize,
    filled: usize,
}

impl SlidingWindow {
    /// Creates an empty window holding up to `capacity` outcomes.
    pub fn new(capacity: usize) -> Self {
        Self { slots: vec![false; capacity.max(1)], cursor: 0, filled: 0 }
    }

    /// Records an outcome, overwriting the oldest once full.
    pub fn record(&mut self, success: bool) {
        self.slots[self.cursor] = success;
        self.cursor = (self.cursor + 1) % self.slots.len();
        self.filled = (self.filled + 1).min(self.slots.len());
    }

    /// Number of valid samples.
    pub fn len(&self) -> usize {
        self.filled
    }

    /// Whether no samples have been recorded.
    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Maximum number of samples.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Failures among the valid samples.
    pub fn failures(&self) -> usize {
        self.valid_slots().filter(|success| !**success).count()
    }

    /// Failure ratio over the valid samples; 0.0 when empty.
    pub fn failure_rate(&self) -> f64 {
        if self.filled == 0 {
            0.0
        } else {
            self.failures() as f64 / self.filled as f64
        }
    }

    /// Success ratio over the valid samples; 1.0 when empty.
    pub fn success_rate(&self) -> f64 {
        if self.filled == 0 {
            1.0
        } else {
            1.0 - self.failure_rate()
        }
    }

    /// Forgets every sample.
    pub fn clear(&mut self) {
        self.cursor = 0;
        self.filled = 0;
    }

    fn valid_slots(&self) -> impl Iterator<Item = &bool> {
        // Until the ring wraps, valid samples are exactly [0, filled).
        self.slots[..self.filled].iter()
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    window: SlidingWindow,
    active_calls: u32,
    last_fail_time: Option<Instant>,
    half_open_entered_at: Option<Instant>,
}

impl BreakerState {
    fn new(window_size: usize) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            window: SlidingWindow::new(window_size),
            active_calls: 0,
            last_fail_time: None,
            half_open_entered_at: None,
        }
    }
}

type Transition = (CircuitState, CircuitState);

/// Snapshot of a breaker for inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStats {
    /// Destination name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures.
    pub failure_count: u32,
    /// Consecutive half-open successes.
    pub success_count: u32,
    /// Calls currently executing.
    pub active_calls: u32,
    /// Valid samples in the window.
    pub window_samples: usize,
    /// Failures in the window.
    pub window_failures: usize,
    /// Success ratio over the window.
    pub success_rate: f64,
    /// Milliseconds since the last failure, when open or half-open.
    pub elapsed_since_failure_ms: Option<u64>,
    /// Milliseconds until an open circuit admits a probe.
    pub remaining_open_ms: Option<u64>,
    /// Milliseconds spent half-open so far.
    pub half_open_for_ms: Option<u64>,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Failure-isolation state machine for one destination.
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerState>,
    listener: Option<StateChangeListener>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the config is invalid.
    pub fn new(name: impl Into<String>, config: CircuitConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let inner = Mutex::new(BreakerState::new(config.sliding_window_size));
        Ok(Self { name: name.into(), config, clock, inner, listener: None })
    }

    /// Registers the transition listener.
    #[must_use]
    pub fn with_listener(mut self, listener: StateChangeListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Destination name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration.
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Current state. Does not perform the open → half-open transition.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Runs `work` under breaker protection.
    ///
    /// Returns `Err` when the breaker refused admission (open circuit or
    /// in-flight cap reached) without running `work`; otherwise returns the
    /// work's own result, whose `Ok`/`Err` is recorded as the outcome.
    ///
    /// # Errors
    ///
    /// `DeliveryError::CircuitOpen` or `DeliveryError::TooManyConcurrentCalls`.
    pub async fn execute<T, E, F, Fut>(&self, work: F) -> Result<std::result::Result<T, E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.admit()?;
        let mut guard = CallGuard { breaker: self, finished: false };

        let result = work().await;

        guard.finished = true;
        self.record(result.is_ok());
        Ok(result)
    }

    /// Returns the breaker to closed with cleared counters and window.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.lock();
            let from = inner.state;
            inner.state = CircuitState::Closed;
            inner.failure_count = 0;
            inner.success_count = 0;
            inner.window.clear();
            inner.last_fail_time = None;
            inner.half_open_entered_at = None;
            (from != CircuitState::Closed).then_some((from, CircuitState::Closed))
        };

        tracing::info!(destination = %self.name, "circuit breaker reset");
        self.notify(transition);
    }

    /// Snapshot of counters and timing.
    pub fn stats(&self) -> CircuitStats {
        let now = self.clock.now();
        let inner = self.lock();

        let elapsed_since_failure = match inner.state {
            CircuitState::Closed => None,
            CircuitState::Open | CircuitState::HalfOpen => {
                inner.last_fail_time.map(|failed_at| now.saturating_duration_since(failed_at))
            },
        };
        let remaining_open = match inner.state {
            CircuitState::Open => {
                elapsed_since_failure.map(|elapsed| self.config.timeout.saturating_sub(elapsed))
            },
            CircuitState::Closed | CircuitState::HalfOpen => None,
        };
        let half_open_for = match inner.state {
            CircuitState::HalfOpen => {
                inner.half_open_entered_at.map(|entered| now.saturating_duration_since(entered))
            },
            CircuitState::Closed | CircuitState::Open => None,
        };

        CircuitStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            active_calls: inner.active_calls,
            window_samples: inner.window.len(),
            window_failures: inner.window.failures(),
            success_rate: inner.window.success_rate(),
            elapsed_since_failure_ms: elapsed_since_failure.map(millis),
            remaining_open_ms: remaining_open.map(millis),
            half_open_for_ms: half_open_for.map(millis),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(&self) -> Result<()> {
        let now = self.clock.now();
        let (admission, transition) = {
            let mut inner = self.lock();
            let mut transition = None;

            if inner.state == CircuitState::Open {
                let cooled_down = inner
                    .last_fail_time
                    .is_none_or(|failed_at| now.saturating_duration_since(failed_at) >= self.config.timeout);
                if !cooled_down {
                    return Err(DeliveryError::circuit_open(&self.name));
                }
                inner.state = CircuitState::HalfOpen;
                inner.success_count = 0;
                inner.half_open_entered_at = Some(now);
                transition = Some((CircuitState::Open, CircuitState::HalfOpen));
            }

            let admission = if inner.active_calls >= self.config.max_concurrent_calls {
                Err(DeliveryError::too_many_concurrent_calls(
                    &self.name,
                    self.config.max_concurrent_calls,
                ))
            } else {
                inner.active_calls += 1;
                Ok(())
            };
            (admission, transition)
        };

        self.notify(transition);
        admission
    }

    fn release(&self) {
        let mut inner = self.lock();
        inner.active_calls = inner.active_calls.saturating_sub(1);
    }

    fn record(&self, success: bool) {
        let now = self.clock.now();
        let transition = {
            let mut inner = self.lock();
            inner.active_calls = inner.active_calls.saturating_sub(1);
            inner.window.record(success);
            if !success {
                inner.last_fail_time = Some(now);
            }

            match (inner.state, success) {
                (CircuitState::Closed, true) => {
                    inner.failure_count = 0;
                    None
                },
                (CircuitState::Closed, false) => {
                    inner.failure_count += 1;
                    self.should_open(&inner).then(|| self.open(&mut inner, CircuitState::Closed))
                },
                (CircuitState::HalfOpen, true) => {
                    inner.success_count += 1;
                    (inner.success_count >= self.config.success_threshold).then(|| {
                        inner.state = CircuitState::Closed;
                        inner.failure_count = 0;
                        inner.success_count = 0;
                        inner.window.clear();
                        inner.half_open_entered_at = None;
                        (CircuitState::HalfOpen, CircuitState::Closed)
                    })
                },
                (CircuitState::HalfOpen, false) => {
                    inner.success_count = 0;
                    Some(self.open(&mut inner, CircuitState::HalfOpen))
                },
                (CircuitState::Open, _) => None,
            }
        };

        self.notify(transition);
    }

    fn should_open(&self, inner: &BreakerState) -> bool {
        if inner.failure_count >= self.config.failure_threshold {
            return true;
        }

        inner.window.len() >= self.config.minimum_request_count
            && inner.window.failure_rate() >= self.config.failure_rate_threshold()
    }

    fn open(&self, inner: &mut BreakerState, from: CircuitState) -> Transition {
        tracing::warn!(
            destination = %self.name,
            failures = inner.failure_count,
            failure_rate = inner.window.failure_rate(),
            "circuit breaker opening"
        );
        inner.state = CircuitState::Open;
        inner.half_open_entered_at = None;
        (from, CircuitState::Open)
    }

    fn notify(&self, transition: Option<Transition>) {
        let Some((from, to)) = transition else {
            return;
        };

        match to {
            CircuitState::Open => {},
            CircuitState::HalfOpen => {
                tracing::info!(destination = %self.name, "circuit breaker half-open, probing");
            },
            CircuitState::Closed => {
                tracing::info!(destination = %self.name, "circuit breaker closed, destination recovered");
            },
        }

        if let Some(listener) = &self.listener {
            let listener = listener.clone();
            let name = self.name.clone();
            tokio::spawn(async move {
                listener(&name, from, to);
            });
        }
    }
}

/// Releases the in-flight slot if the protected work never completes
/// (cancelled future or panic).
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    finished: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.breaker.release();
        }
    }
}

/// Lazily-populated breakers keyed by destination name.
pub struct CircuitBreakerRegistry {
    clock: Arc<dyn Clock>,
    listener: Option<StateChangeListener>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry").finish_non_exhaustive()
    }
}

impl CircuitBreakerRegistry {
    /// Creates an empty registry.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, listener: None, breakers: Mutex::new(HashMap::new()) }
    }

    /// Listener attached to every breaker the registry creates.
    #[must_use]
    pub fn with_listener(mut self, listener: StateChangeListener) -> Self {
        self.listener = Some(listener);
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the breaker for `name`, creating it on first reference.
    ///
    /// The config only applies on creation; later calls return the existing
    /// breaker unchanged.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if a new breaker would be
    /// created from an invalid config.
    pub fn get_or_create(&self, name: &str, config: &CircuitConfig) -> Result<Arc<CircuitBreaker>> {
        let mut breakers = self.lock();
        if let Some(existing) = breakers.get(name) {
            return Ok(existing.clone());
        }

        let mut breaker = CircuitBreaker::new(name, config.clone(), self.clock.clone())?;
        if let Some(listener) = &self.listener {
            breaker = breaker.with_listener(listener.clone());
        }
        let breaker = Arc::new(breaker);
        breakers.insert(name.to_string(), breaker.clone());
        Ok(breaker)
    }

    /// Returns the breaker for `name` if one exists.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.lock().get(name).cloned()
    }

    /// Resets the named breaker. Returns `false` if it does not exist.
    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            },
            None => false,
        }
    }

    /// Stats for every known breaker, sorted by name.
    pub fn all_stats(&self) -> Vec<CircuitStats> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.lock().values().cloned().collect();
        let mut stats: Vec<CircuitStats> = breakers.iter().map(|breaker| breaker.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use herald_core::TestClock;

    use super::*;

    fn test_config() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout: Duration::from_secs(10),
            max_concurrent_calls: 4,
            sliding_window_size: 10,
            minimum_request_count: 10,
        }
    }

    fn breaker(config: CircuitConfig) -> (CircuitBreaker, TestClock) {
        let clock = TestClock::new();
        let breaker = CircuitBreaker::new("pager", config, Arc::new(clock.clone())).unwrap();
        (breaker, clock)
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<std::result::Result<(), ()>> {
        breaker.execute(|| async { Err::<(), ()>(()) }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<std::result::Result<(), ()>> {
        breaker.execute(|| async { Ok::<(), ()>(()) }).await
    }

    #[test]
    fn window_wraps_and_tracks_validity() {
        let mut window = SlidingWindow::new(3);
        assert!(window.is_empty());
        assert_eq!(window.success_rate(), 1.0);

        window.record(false);
        assert_eq!(window.len(), 1);
        assert_eq!(window.failures(), 1);

        window.record(true);
        window.record(true);
        window.record(true);
        assert_eq!(window.len(), 3);
        assert_eq!(window.failures(), 0, "oldest failure overwritten");

        window.clear();
        assert_eq!(window.len(), 0);
        assert_eq!(window.failures(), 0);
    }

    #[test]
    fn zero_failure_threshold_is_rejected() {
        let config = CircuitConfig { failure_threshold: 0, ..CircuitConfig::default() };
        let err = CircuitBreaker::new("x", config, Arc::new(TestClock::new())).unwrap_err();
        assert!(matches!(err, DeliveryError::ConfigurationError { .. }));
    }

    #[tokio::test]
    async fn starts_closed() {
        let (breaker, _clock) = breaker(test_config());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(succeed(&breaker).await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn consecutive_failures_open_and_next_call_is_rejected() {
        let (breaker, _clock) = breaker(test_config());

        for _ in 0..2 {
            assert!(fail(&breaker).await.is_ok());
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        assert!(fail(&breaker).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::Open);

        let invoked = AtomicUsize::new(0);
        let result = breaker
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<(), ()>(())
            })
            .await;

        assert!(matches!(result, Err(DeliveryError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let (breaker, _clock) = breaker(test_config());

        fail(&breaker).await.unwrap().unwrap_err();
        fail(&breaker).await.unwrap().unwrap_err();
        assert_eq!(breaker.stats().failure_count, 2);

        succeed(&breaker).await.unwrap().unwrap();
        assert_eq!(breaker.stats().failure_count, 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn window_failure_rate_opens_circuit() {
        // threshold 3 of window 6 -> opens at >= 50% once 4 samples exist
        let config = CircuitConfig {
            failure_threshold: 3,
            sliding_window_size: 6,
            minimum_request_count: 4,
            ..test_config()
        };
        let (breaker, _clock) = breaker(config);

        fail(&breaker).await.unwrap().unwrap_err();
        succeed(&breaker).await.unwrap().unwrap();
        fail(&breaker).await.unwrap().unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Closed, "below minimum request count");

        succeed(&breaker).await.unwrap().unwrap();
        fail(&breaker).await.unwrap().unwrap_err();

        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.stats().failure_count, 1);
    }

    #[tokio::test]
    async fn timeout_moves_to_half_open_and_success_closes() {
        let config = CircuitConfig { success_threshold: 1, ..test_config() };
        let (breaker, clock) = breaker(config);

        for _ in 0..3 {
            fail(&breaker).await.unwrap().unwrap_err();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(9));
        assert!(succeed(&breaker).await.is_err(), "still cooling down");

        clock.advance(Duration::from_secs(1));
        succeed(&breaker).await.unwrap().unwrap();

        assert_eq!(breaker.state(), CircuitState::Closed);
        let stats = breaker.stats();
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.success_count, 0);
    }

    #[tokio::test]
    async fn half_open_requires_success_threshold() {
        let (breaker, clock) = breaker(test_config());

        for _ in 0..3 {
            fail(&breaker).await.unwrap().unwrap_err();
        }
        clock.advance(Duration::from_secs(10));

        succeed(&breaker).await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.stats().success_count, 1);

        succeed(&breaker).await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let (breaker, clock) = breaker(test_config());

        for _ in 0..3 {
            fail(&breaker).await.unwrap().unwrap_err();
        }
        clock.advance(Duration::from_secs(10));

        succeed(&breaker).await.unwrap().unwrap();
        fail(&breaker).await.unwrap().unwrap_err();

        assert_eq!(breaker.state(), CircuitState::Open);
        let stats = breaker.stats();
        assert_eq!(stats.success_count, 0);
        assert_eq!(stats.remaining_open_ms, Some(10_000));
    }

    #[tokio::test]
    async fn concurrency_cap_rejects_excess_calls() {
        let config = CircuitConfig { max_concurrent_calls: 1, ..test_config() };
        let (breaker, _clock) = breaker(config);
        let breaker = Arc::new(breaker);

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();

        let holder = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .execute(|| async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        Ok::<(), ()>(())
                    })
                    .await
            })
        };

        started_rx.await.unwrap();
        assert_eq!(breaker.stats().active_calls, 1);

        let rejected = succeed(&breaker).await;
        assert!(matches!(rejected, Err(DeliveryError::TooManyConcurrentCalls { limit: 1, .. })));

        release_tx.send(()).unwrap();
        holder.await.unwrap().unwrap().unwrap();
        assert_eq!(breaker.stats().active_calls, 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn dropped_call_releases_slot() {
        let config = CircuitConfig { max_concurrent_calls: 1, ..test_config() };
        let (breaker, _clock) = breaker(config);

        let pending = breaker.execute(|| std::future::pending::<std::result::Result<(), ()>>());
        let _ = tokio::time::timeout(Duration::from_millis(10), pending).await;

        assert_eq!(breaker.stats().active_calls, 0);
        assert!(succeed(&breaker).await.is_ok());
    }

    #[tokio::test]
    async fn reset_returns_to_closed() {
        let (breaker, _clock) = breaker(test_config());
        for _ in 0..3 {
            fail(&breaker).await.unwrap().unwrap_err();
        }

        breaker.reset();

        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.window_samples, 0);
    }

    #[tokio::test]
    async fn listener_observes_transitions() {
        let clock = TestClock::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let listener: StateChangeListener = Arc::new(move |name: &str, from, to| {
            let _ = tx.send((name.to_string(), from, to));
        });
        let breaker = CircuitBreaker::new("chat", test_config(), Arc::new(clock.clone()))
            .unwrap()
            .with_listener(listener);

        for _ in 0..3 {
            fail(&breaker).await.unwrap().unwrap_err();
        }
        clock.advance(Duration::from_secs(10));
        fail(&breaker).await.unwrap().unwrap_err();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let third = rx.recv().await.unwrap();
        assert_eq!(first, ("chat".to_string(), CircuitState::Closed, CircuitState::Open));
        assert_eq!(second, ("chat".to_string(), CircuitState::Open, CircuitState::HalfOpen));
        assert_eq!(third, ("chat".to_string(), CircuitState::HalfOpen, CircuitState::Open));
    }

    #[tokio::test]
    async fn registry_creates_lazily_and_shares_instances() {
        let registry = CircuitBreakerRegistry::new(Arc::new(TestClock::new()));
        assert!(registry.get("siem").is_none());

        let first = registry.get_or_create("siem", &test_config()).unwrap();
        let second = registry.get_or_create("siem", &CircuitConfig::default()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.config().failure_threshold, 3);

        registry.get_or_create("chat", &test_config()).unwrap();
        let names: Vec<String> = registry.all_stats().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["chat".to_string(), "siem".to_string()]);

        assert!(registry.reset("siem"));
        assert!(!registry.reset("missing"));
    }
}
