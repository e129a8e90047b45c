//! Backoff retry loop with error-category aware decisions.
//!
//! A `Retrier` runs a unit of work up to `max_attempts` times. Between
//! attempts it sleeps according to the policy's backoff strategy; the sleep
//! is the only intentional wait and aborts as soon as the caller's
//! cancellation token fires.

use std::{future::Future, sync::Arc, time::Duration};

use herald_core::Clock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{DeliveryError, ErrorCategory, Result};

/// Jitter bound as a fraction of the nominal delay.
pub const JITTER_FRACTION: f64 = 0.1;

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `base_delay * multiplier^(attempt-1)`.
    #[default]
    Exponential,
    /// `base_delay * attempt`.
    Linear,
    /// `base_delay` for every attempt.
    Constant,
}

/// Retry policy for one destination.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// How delays grow between attempts.
    pub backoff: BackoffStrategy,
    /// Delay unit for every strategy.
    pub base_delay: Duration,
    /// Cap applied before jitter.
    pub max_delay: Duration,
    /// Growth factor for exponential backoff.
    pub multiplier: f64,
    /// Whether to randomise delays by up to ±10%.
    pub jitter: bool,
    /// Case-insensitive substrings that make otherwise unclassified errors
    /// retryable.
    pub retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
            retryable_errors: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Checks the policy for values the loop cannot honour.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` for zero attempts, a
    /// multiplier below 1.0 or a cap smaller than the base delay.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(DeliveryError::configuration("max_attempts must be greater than 0"));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(DeliveryError::configuration("multiplier must be at least 1.0"));
        }
        if self.max_delay < self.base_delay {
            return Err(DeliveryError::configuration("max_delay must not be below base_delay"));
        }
        Ok(())
    }

    /// Delay after failed attempt `attempt` (1-based), capped at
    /// `max_delay`, before jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let raw = match self.backoff {
            BackoffStrategy::Constant => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
                Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
            },
        };

        raw.min(self.max_delay)
    }

    /// Delay to wait after failed attempt `attempt`, with jitter applied when
    /// enabled. Never exceeds `max_delay`, jittered or not.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter {
            apply_jitter(nominal, self.base_delay).min(self.max_delay)
        } else {
            nominal
        }
    }

    /// Whether `error` should be retried under this policy.
    ///
    /// The substring list is only consulted for errors that classify as
    /// `ErrorCategory::Unknown`.
    pub fn is_retryable(&self, error: &DeliveryError) -> bool {
        match error.category() {
            ErrorCategory::Unknown => self.matches_retryable_text(error),
            category => category.is_retryable(),
        }
    }

    fn matches_retryable_text(&self, error: &DeliveryError) -> bool {
        if self.retryable_errors.is_empty() {
            return false;
        }

        let text = error.to_string().to_lowercase();
        self.retryable_errors
            .iter()
            .filter(|needle| !needle.is_empty())
            .any(|needle| text.contains(&needle.to_lowercase()))
    }
}

/// Randomises `nominal` uniformly within ±10%, falling back to `base` if the
/// adjustment would go negative.
fn apply_jitter(nominal: Duration, base: Duration) -> Duration {
    let nominal_secs = nominal.as_secs_f64();
    if nominal_secs <= 0.0 {
        return nominal;
    }

    let mut rng = rand::rng();
    let offset = rng.random_range(-JITTER_FRACTION..=JITTER_FRACTION) * nominal_secs;
    let jittered = nominal_secs + offset;

    if jittered < 0.0 {
        base
    } else {
        Duration::from_secs_f64(jittered)
    }
}

/// Result of one `Retrier::execute` call.
#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    /// Value returned by the successful attempt.
    pub value: Option<T>,
    /// Whether an attempt succeeded.
    pub success: bool,
    /// Attempts actually made.
    pub attempts: u32,
    /// Sum of the delays slept between attempts.
    pub total_delay: Duration,
    /// Error from the final failed attempt, or the cancellation.
    pub last_error: Option<DeliveryError>,
    /// Every error encountered, in order.
    pub errors: Vec<DeliveryError>,
}

impl<T> RetryOutcome<T> {
    fn new() -> Self {
        Self {
            value: None,
            success: false,
            attempts: 0,
            total_delay: Duration::ZERO,
            last_error: None,
            errors: Vec::new(),
        }
    }

    fn record_error(&mut self, error: DeliveryError) {
        self.errors.push(error.clone());
        self.last_error = Some(error);
    }
}

/// Drives a unit of work through a `RetryPolicy`.
#[derive(Debug, Clone)]
pub struct Retrier {
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl Retrier {
    /// Creates a retrier.
    pub fn new(policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { policy, clock }
    }

    /// The policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `work(attempt)` until it succeeds, fails with a non-retryable
    /// error, exhausts `max_attempts` or `cancel` fires during a backoff.
    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, mut work: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut outcome = RetryOutcome::new();
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            outcome.attempts = attempt;

            let error = match work(attempt).await {
                Ok(value) => {
                    outcome.value = Some(value);
                    outcome.success = true;
                    return outcome;
                },
                Err(error) => error,
            };

            let retryable = self.policy.is_retryable(&error);
            tracing::debug!(
                attempt,
                max_attempts,
                category = %error.category(),
                retryable,
                error = %error,
                "attempt failed"
            );
            outcome.record_error(error);

            if !retryable || attempt == max_attempts {
                break;
            }

            let delay = self.policy.calculate_delay(attempt);
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::debug!(attempt, "retry backoff cancelled");
                    outcome.record_error(DeliveryError::Cancelled);
                    return outcome;
                }
                () = self.clock.sleep(delay) => {
                    outcome.total_delay += delay;
                }
            }
        }

        outcome
    }
}
