//! Per-destination delivery settings.

use std::{
    collections::{BTreeMap, HashSet},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    circuit::CircuitConfig,
    error::{DeliveryError, Result},
    format::Encoding,
    retry::{BackoffStrategy, RetryPolicy},
};

/// Transform engine selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformSpec {
    /// Engine kind understood by the engine factory.
    pub kind: String,
    /// Engine-specific specification text.
    pub spec: String,
}

impl Default for TransformSpec {
    fn default() -> Self {
        Self { kind: "passthrough".to_string(), spec: String::new() }
    }
}

/// Retry settings as configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Attempts including the first.
    pub max_attempts: u32,
    /// Delay growth between attempts.
    pub backoff: BackoffStrategy,
    /// First retry delay in milliseconds.
    pub base_delay_ms: u64,
    /// Delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Exponential growth factor.
    pub multiplier: f64,
    /// Apply +/-10% jitter.
    pub jitter: bool,
    /// Case-insensitive substrings that make an unclassified error retryable.
    pub retryable_errors: Vec<String>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
            retryable_errors: Vec::new(),
        }
    }
}

/// Circuit breaker settings as configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitSettings {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Half-open successes that close it again.
    pub success_threshold: u32,
    /// Open period before a trial call, in seconds.
    pub timeout_secs: u64,
    /// In-flight calls admitted at once.
    pub max_concurrent_calls: u32,
    /// Outcomes kept for the failure-rate check.
    pub sliding_window_size: usize,
    /// Samples required before the failure rate counts.
    pub minimum_request_count: usize,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        let defaults = CircuitConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            success_threshold: defaults.success_threshold,
            timeout_secs: defaults.timeout.as_secs(),
            max_concurrent_calls: defaults.max_concurrent_calls,
            sliding_window_size: defaults.sliding_window_size,
            minimum_request_count: defaults.minimum_request_count,
        }
    }
}

/// One delivery target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationConfig {
    /// Unique name; also the breaker key.
    pub name: String,
    /// Target URL.
    pub url: String,
    /// Disabled destinations are skipped by fan-out and refused by name.
    pub enabled: bool,
    /// HTTP method.
    pub method: String,
    /// Extra request headers.
    pub headers: BTreeMap<String, String>,
    /// Transform engine.
    pub transform: TransformSpec,
    /// Body encoding.
    pub encoding: Encoding,
    /// Retry behaviour.
    pub retry: RetrySettings,
    /// Breaker behaviour.
    pub circuit: CircuitSettings,
    /// Deliver each alert as its own unit, transformed individually.
    pub per_alert: bool,
    /// Split the batch into groups of `batch_size` alerts.
    pub split_alerts: bool,
    /// Alerts per unit when splitting.
    pub batch_size: usize,
    /// Units delivered concurrently.
    pub parallel_requests: usize,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            url: String::new(),
            enabled: true,
            method: "POST".to_string(),
            headers: BTreeMap::new(),
            transform: TransformSpec::default(),
            encoding: Encoding::Json,
            retry: RetrySettings::default(),
            circuit: CircuitSettings::default(),
            per_alert: false,
            split_alerts: false,
            batch_size: 1,
            parallel_requests: 1,
        }
    }
}

impl DestinationConfig {
    /// Minimal enabled destination posting JSON to `url`.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self { name: name.into(), url: url.into(), ..Self::default() }
    }

    /// Retry policy for the retrier.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            backoff: self.retry.backoff,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            multiplier: self.retry.multiplier,
            jitter: self.retry.jitter,
            retryable_errors: self.retry.retryable_errors.clone(),
        }
    }

    /// Breaker configuration.
    pub fn to_circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit.failure_threshold,
            success_threshold: self.circuit.success_threshold,
            timeout: Duration::from_secs(self.circuit.timeout_secs),
            max_concurrent_calls: self.circuit.max_concurrent_calls,
            sliding_window_size: self.circuit.sliding_window_size,
            minimum_request_count: self.circuit.minimum_request_count,
        }
    }

    /// Whether the batch is delivered as several units.
    pub fn splits(&self) -> bool {
        self.per_alert || self.split_alerts
    }

    /// Alerts per unit when splitting. Per-alert delivery forces 1.
    pub fn unit_size(&self) -> usize {
        if self.per_alert {
            1
        } else {
            self.batch_size.max(1)
        }
    }

    /// Checks the destination for unusable values.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` describing the first
    /// problem found.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(DeliveryError::configuration("destination name must not be empty"));
        }
        let invalid = |message: String| DeliveryError::configuration(format!("destination '{}': {message}", self.name));

        if self.url.trim().is_empty() {
            return Err(invalid("url must not be empty".to_string()));
        }
        let parsed = url::Url::parse(&self.url).map_err(|e| invalid(format!("invalid url: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported url scheme '{}'", parsed.scheme())));
        }
        if reqwest::Method::from_bytes(self.method.to_uppercase().as_bytes()).is_err() {
            return Err(invalid(format!("invalid HTTP method '{}'", self.method)));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size must be greater than 0".to_string()));
        }
        if self.parallel_requests == 0 {
            return Err(invalid("parallel_requests must be greater than 0".to_string()));
        }

        self.to_retry_policy().validate().map_err(|e| invalid(e.to_string()))?;
        self.to_circuit_config().validate().map_err(|e| invalid(e.to_string()))?;
        // Each worker holds a breaker slot for its whole retry loop.
        if self.parallel_requests > self.circuit.max_concurrent_calls as usize {
            return Err(invalid(format!(
                "parallel_requests ({}) exceeds circuit.max_concurrent_calls ({})",
                self.parallel_requests, self.circuit.max_concurrent_calls
            )));
        }
        Ok(())
    }
}

/// Validates every destination and rejects duplicate names.
///
/// # Errors
///
/// Returns the first `DeliveryError::ConfigurationError` found.
pub fn validate_destinations(destinations: &[DestinationConfig]) -> Result<()> {
    let mut seen = HashSet::new();
    for destination in destinations {
        destination.validate()?;
        if !seen.insert(destination.name.as_str()) {
            return Err(DeliveryError::configuration(format!(
                "duplicate destination name '{}'",
                destination.name
            )));
        }
    }
    Ok(())
}
