//! Dispatch orchestration for one destination and one alert batch.
//!
//! ```text
//!  batch ──▶ split into units ──▶ [permit] ──▶ transform ──▶ format
//!                                                  │
//!                                                  ▼
//!                       breaker.execute(|| retrier.execute(send))
//!                                                  │
//!                                 delivered ◀──────┴──────▶ dead-letter
//! ```
//!
//! Each unit acquires a semaphore permit before its task is spawned, so a
//! destination with `parallel_requests = 1` delivers units strictly in order.
//! A unit task that panics is caught at the join point and dead-lettered;
//! its siblings keep running.

use std::{collections::HashMap, sync::Arc, time::Duration};

use herald_core::{
    events::emit_detached, Alert, AlertBatch, Clock, DispatchEvent, EventHandler, Fingerprint, NoOpEventHandler,
};
use serde::Serialize;
use serde_json::Value;
use tokio::{
    sync::Semaphore,
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    circuit::{CircuitBreaker, CircuitBreakerRegistry},
    client::{SendRequest, Sender},
    config::DestinationConfig,
    dead_letter::{DeadLetterRecord, DeadLetterStore},
    error::{DeliveryError, Result},
    format::{DefaultFormatter, Formatter},
    retry::{Retrier, RetryOutcome},
    template::EngineCache,
    transform::{BuiltinEngineFactory, EngineFactory, SharedEngine},
};

/// Outcome counts for one dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    /// Destination name.
    pub destination: String,
    /// Units the batch was split into.
    pub units_total: usize,
    /// Units delivered.
    pub succeeded: usize,
    /// Units not delivered, dead-lettered or not.
    pub failed: usize,
    /// Failed units archived in the dead-letter store.
    pub dead_lettered: usize,
    /// Wall time per unit, indexed by unit.
    pub per_unit_durations: Vec<Duration>,
}

/// Input of one unit.
#[derive(Debug, Clone)]
enum UnitPayload {
    Batch(AlertBatch),
    Alert(Alert),
}

#[derive(Debug, Clone)]
struct DispatchUnit {
    index: usize,
    payload: UnitPayload,
    fingerprints: Vec<Fingerprint>,
}

impl DispatchUnit {
    fn raw_payload(&self) -> Value {
        let encoded = match &self.payload {
            UnitPayload::Batch(batch) => serde_json::to_value(batch),
            UnitPayload::Alert(alert) => serde_json::to_value(alert),
        };
        encoded.unwrap_or(Value::Null)
    }
}

/// Splits `batch` into the units `destination` delivers.
fn split_units(destination: &DestinationConfig, batch: &AlertBatch) -> Vec<DispatchUnit> {
    let fingerprints = |alerts: &[Alert]| alerts.iter().map(Alert::identity).collect::<Vec<_>>();

    if !destination.splits() {
        return vec![DispatchUnit {
            index: 0,
            payload: UnitPayload::Batch(batch.clone()),
            fingerprints: fingerprints(&batch.alerts),
        }];
    }

    let size = destination.unit_size();
    if size == 1 {
        return batch
            .alerts
            .iter()
            .enumerate()
            .map(|(index, alert)| DispatchUnit {
                index,
                payload: UnitPayload::Alert(alert.clone()),
                fingerprints: vec![alert.identity()],
            })
            .collect();
    }

    batch
        .alerts
        .chunks(size)
        .enumerate()
        .map(|(index, chunk)| DispatchUnit {
            index,
            payload: UnitPayload::Batch(batch.with_alerts(chunk.to_vec())),
            fingerprints: fingerprints(chunk),
        })
        .collect()
}

#[derive(Debug)]
enum UnitOutcome {
    Delivered { duration: Duration },
    Failed { duration: Duration },
    DeadLettered { duration: Duration },
}

/// Shared per-dispatch state handed to every unit task.
#[derive(Debug)]
struct DispatchContext {
    destination: DestinationConfig,
    batch: Arc<AlertBatch>,
    engine: SharedEngine,
    breaker: Arc<CircuitBreaker>,
    retrier: Retrier,
    cancel: CancellationToken,
}

/// Drives alert batches to destinations.
///
/// Cheap to clone; every collaborator is shared.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    clock: Arc<dyn Clock>,
    sender: Arc<dyn Sender>,
    formatter: Arc<dyn Formatter>,
    engines: Arc<dyn EngineFactory>,
    cache: Arc<EngineCache>,
    breakers: Arc<CircuitBreakerRegistry>,
    dead_letters: Arc<DeadLetterStore>,
    events: Arc<dyn EventHandler>,
}

impl Dispatcher {
    /// Creates a dispatcher with the built-in formatter and engine factory
    /// and no event subscribers.
    pub fn new(
        clock: Arc<dyn Clock>,
        sender: Arc<dyn Sender>,
        cache: Arc<EngineCache>,
        breakers: Arc<CircuitBreakerRegistry>,
        dead_letters: Arc<DeadLetterStore>,
    ) -> Self {
        Self {
            clock,
            sender,
            formatter: Arc::new(DefaultFormatter),
            engines: Arc::new(BuiltinEngineFactory),
            cache,
            breakers,
            dead_letters,
            events: Arc::new(NoOpEventHandler),
        }
    }

    /// Replaces the formatter.
    #[must_use]
    pub fn with_formatter(mut self, formatter: Arc<dyn Formatter>) -> Self {
        self.formatter = formatter;
        self
    }

    /// Replaces the engine factory.
    #[must_use]
    pub fn with_engine_factory(mut self, engines: Arc<dyn EngineFactory>) -> Self {
        self.engines = engines;
        self
    }

    /// Sets the event subscriber.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = events;
        self
    }

    /// Breaker registry in use.
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Dead-letter store in use.
    pub fn dead_letters(&self) -> &Arc<DeadLetterStore> {
        &self.dead_letters
    }

    /// Delivers `batch` to `destination` and waits for every unit to reach a
    /// terminal outcome.
    ///
    /// Transform and format failures are counted as failed units but not
    /// dead-lettered; delivery failures and breaker rejections are.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the destination's
    /// breaker settings are invalid.
    pub async fn dispatch(
        &self,
        destination: &DestinationConfig,
        batch: Arc<AlertBatch>,
        cancel: &CancellationToken,
    ) -> Result<DispatchSummary> {
        let units = split_units(destination, &batch);
        let mut summary = DispatchSummary {
            destination: destination.name.clone(),
            units_total: units.len(),
            per_unit_durations: vec![Duration::ZERO; units.len()],
            ..DispatchSummary::default()
        };

        let breaker = self.breakers.get_or_create(&destination.name, &destination.to_circuit_config())?;

        let engine = match self.cache.get(self.engines.as_ref(), &destination.transform.kind, &destination.transform.spec) {
            Ok(engine) => engine,
            Err(e) => {
                error!(destination = %destination.name, error = %e, "transform engine unavailable, dropping dispatch");
                summary.failed = summary.units_total;
                return Ok(summary);
            },
        };

        let context = Arc::new(DispatchContext {
            destination: destination.clone(),
            batch,
            engine,
            breaker,
            retrier: Retrier::new(destination.to_retry_policy(), self.clock.clone()),
            cancel: cancel.clone(),
        });

        debug!(
            destination = %destination.name,
            units = summary.units_total,
            parallel = destination.parallel_requests,
            "dispatch started"
        );

        // Workers hold a breaker slot across retries.
        let breaker_slots = context.breaker.config().max_concurrent_calls.max(1) as usize;
        let workers = destination.parallel_requests.clamp(1, breaker_slots);
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();
        let mut in_flight = HashMap::new();

        for unit in units {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| DeliveryError::internal(format!("dispatch semaphore closed: {e}")))?;

            let dispatcher = self.clone();
            let context = context.clone();
            let task_unit = unit.clone();
            let handle = tasks.spawn(async move {
                let _permit = permit;
                let index = task_unit.index;
                (index, dispatcher.run_unit(&context, task_unit).await)
            });
            in_flight.insert(handle.id(), unit);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            let (index, outcome) = match joined {
                Ok((id, (index, outcome))) => {
                    in_flight.remove(&id);
                    (index, outcome)
                },
                Err(join_error) => {
                    let Some(unit) = in_flight.remove(&join_error.id()) else {
                        error!(destination = %destination.name, error = %join_error, "unknown dispatch task failed");
                        continue;
                    };
                    error!(
                        destination = %destination.name,
                        unit_index = unit.index,
                        error = %join_error,
                        "unit task aborted"
                    );
                    let outcome = self.dead_letter_aborted(&context, &unit, &join_error.to_string()).await;
                    (unit.index, outcome)
                },
            };

            match outcome {
                UnitOutcome::Delivered { duration } => {
                    summary.succeeded += 1;
                    summary.per_unit_durations[index] = duration;
                },
                UnitOutcome::Failed { duration } => {
                    summary.failed += 1;
                    summary.per_unit_durations[index] = duration;
                },
                UnitOutcome::DeadLettered { duration } => {
                    summary.failed += 1;
                    summary.dead_lettered += 1;
                    summary.per_unit_durations[index] = duration;
                },
            }
        }

        info!(
            destination = %summary.destination,
            units = summary.units_total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            dead_lettered = summary.dead_lettered,
            "dispatch finished"
        );
        Ok(summary)
    }

    /// Runs `dispatch` on a detached task. The outcome is only observable
    /// through logs, events and the dead-letter store.
    pub fn spawn_dispatch(
        &self,
        destination: DestinationConfig,
        batch: Arc<AlertBatch>,
        cancel: CancellationToken,
    ) -> JoinHandle<Option<DispatchSummary>> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            match dispatcher.dispatch(&destination, batch, &cancel).await {
                Ok(summary) => Some(summary),
                Err(e) => {
                    error!(destination = %destination.name, error = %e, "dispatch failed");
                    None
                },
            }
        })
    }

    async fn run_unit(&self, context: &DispatchContext, unit: DispatchUnit) -> UnitOutcome {
        let destination = &context.destination;
        let start = self.clock.now();
        let started_at = self.clock.now_utc();

        let transformed = match &unit.payload {
            UnitPayload::Batch(batch) => context.engine.transform(batch),
            UnitPayload::Alert(alert) => context.engine.transform_alert(alert, &context.batch),
        };
        let value = match transformed {
            Ok(value) => value,
            Err(e) => {
                error!(destination = %destination.name, unit_index = unit.index, error = %e, "transform failed");
                return UnitOutcome::Failed { duration: self.elapsed_since(start) };
            },
        };

        let formatted = match self.formatter.format(&value, destination.encoding) {
            Ok(formatted) => formatted,
            Err(e) => {
                error!(destination = %destination.name, unit_index = unit.index, error = %e, "format failed");
                return UnitOutcome::Failed { duration: self.elapsed_since(start) };
            },
        };

        let template = SendRequest {
            destination: destination.name.clone(),
            url: destination.url.clone(),
            method: destination.method.clone(),
            headers: destination.headers.clone(),
            body: formatted.body,
            content_type: formatted.content_type.clone(),
            unit_index: unit.index,
            attempt: 0,
        };

        let admitted = context
            .breaker
            .execute(|| async {
                let outcome = context
                    .retrier
                    .execute(&context.cancel, |attempt| {
                        let sender = self.sender.clone();
                        let request = SendRequest { attempt, ..template.clone() };
                        async move { sender.send(request).await }
                    })
                    .await;
                if outcome.success {
                    Ok(outcome)
                } else {
                    Err(outcome)
                }
            })
            .await;

        let duration = self.elapsed_since(start);
        let outcome = match admitted {
            Ok(Ok(outcome)) => {
                self.emit(DispatchEvent::RetryCompleted {
                    destination: destination.name.clone(),
                    attempts: outcome.attempts,
                    success: true,
                });
                self.emit(DispatchEvent::UnitDelivered {
                    destination: destination.name.clone(),
                    unit_index: unit.index,
                    duration,
                });
                debug!(
                    destination = %destination.name,
                    unit_index = unit.index,
                    attempts = outcome.attempts,
                    duration_ms = duration.as_millis() as u64,
                    "unit delivered"
                );
                return UnitOutcome::Delivered { duration };
            },
            Ok(Err(outcome)) => {
                self.emit(DispatchEvent::RetryCompleted {
                    destination: destination.name.clone(),
                    attempts: outcome.attempts,
                    success: false,
                });
                outcome
            },
            Err(rejection) => {
                warn!(
                    destination = %destination.name,
                    unit_index = unit.index,
                    error = %rejection,
                    "circuit breaker rejected unit"
                );
                RetryOutcome {
                    value: None,
                    success: false,
                    attempts: 0,
                    total_delay: Duration::ZERO,
                    last_error: Some(rejection.clone()),
                    errors: vec![rejection],
                }
            },
        };

        let mut record = DeadLetterRecord::new(destination.name.clone(), value, started_at)
            .with_metadata("content_type", formatted.content_type);
        record.attempts = outcome.attempts;
        record.last_error = outcome.last_error.map(|e| e.to_string()).unwrap_or_default();
        record.error_history = outcome.errors.iter().map(ToString::to_string).collect();
        self.archive(context, &unit, record, duration).await
    }

    async fn dead_letter_aborted(&self, context: &DispatchContext, unit: &DispatchUnit, reason: &str) -> UnitOutcome {
        let mut record =
            DeadLetterRecord::new(context.destination.name.clone(), unit.raw_payload(), self.clock.now_utc())
                .with_metadata("aborted", "true");
        record.last_error = reason.to_string();
        record.error_history = vec![reason.to_string()];
        self.archive(context, unit, record, Duration::ZERO).await
    }

    async fn archive(
        &self,
        context: &DispatchContext,
        unit: &DispatchUnit,
        record: DeadLetterRecord,
        duration: Duration,
    ) -> UnitOutcome {
        let destination = &context.destination;
        let record = record
            .with_metadata("unit_index", unit.index.to_string())
            .with_metadata("fingerprints", unit.fingerprints.join(","))
            .with_metadata("url", destination.url.clone())
            .with_metadata("group_key", context.batch.group_key.clone());
        let attempts = record.attempts;

        match self.dead_letters.add(record).await {
            Ok(record_id) => {
                warn!(
                    destination = %destination.name,
                    unit_index = unit.index,
                    attempts,
                    record_id = %record_id,
                    "unit dead-lettered"
                );
                self.emit(DispatchEvent::DeadLettered { destination: destination.name.clone(), record_id });
                UnitOutcome::DeadLettered { duration }
            },
            Err(e) => {
                error!(destination = %destination.name, unit_index = unit.index, error = %e, "dead-letter write failed");
                UnitOutcome::Failed { duration }
            },
        }
    }

    fn elapsed_since(&self, start: std::time::Instant) -> Duration {
        self.clock.now().saturating_duration_since(start)
    }

    fn emit(&self, event: DispatchEvent) {
        emit_detached(&self.events, event);
    }
}

#[cfg(test)]
mod tests {
    use herald_core::AlertStatus;

    use super::*;

    fn batch(alerts: usize) -> AlertBatch {
        let alerts = (0..alerts)
            .map(|n| Alert {
                status: if n % 2 == 0 { AlertStatus::Firing } else { AlertStatus::Resolved },
                fingerprint: format!("fp-{n}"),
                ..Alert::default()
            })
            .collect();
        AlertBatch { group_key: "g".to_string(), alerts, ..AlertBatch::default() }
    }

    #[test]
    fn unsplit_batch_is_one_unit() {
        let destination = DestinationConfig::new("chat", "http://localhost");
        let units = split_units(&destination, &batch(3));

        assert_eq!(units.len(), 1);
        assert_eq!(units[0].fingerprints, vec!["fp-0", "fp-1", "fp-2"]);
        assert!(matches!(units[0].payload, UnitPayload::Batch(_)));
    }

    #[test]
    fn split_with_unit_size_one_yields_alert_units() {
        let destination = DestinationConfig { split_alerts: true, ..DestinationConfig::new("chat", "http://localhost") };
        let units = split_units(&destination, &batch(3));

        assert_eq!(units.len(), 3);
        for (n, unit) in units.iter().enumerate() {
            assert_eq!(unit.index, n);
            assert_eq!(unit.fingerprints, vec![format!("fp-{n}")]);
            assert!(matches!(unit.payload, UnitPayload::Alert(_)));
        }
    }

    #[test]
    fn split_groups_into_sub_batches() {
        let destination = DestinationConfig {
            split_alerts: true,
            batch_size: 2,
            ..DestinationConfig::new("chat", "http://localhost")
        };
        let units = split_units(&destination, &batch(5));

        assert_eq!(units.len(), 3);
        assert_eq!(units[2].fingerprints, vec!["fp-4"]);
        let UnitPayload::Batch(last) = &units[2].payload else {
            unreachable!("grouped units carry sub-batches");
        };
        assert_eq!(last.group_key, "g");
        assert_eq!(last.status, AlertStatus::Firing);
        let UnitPayload::Batch(middle) = &units[1].payload else {
            unreachable!("grouped units carry sub-batches");
        };
        assert_eq!(middle.len(), 2);
    }
}
