//! Dispatch events for metrics and other observers.
//!
//! Components emit `DispatchEvent`s describing what happened (an auth
//! attempt, a circuit transition, a retry loop finishing, a dead-letter
//! insertion, a cache lookup). Subscribers implement `EventHandler`.
//! Handling is fire-and-forget: a slow or failing subscriber never changes a
//! delivery outcome.
//!
//! ```text
//! ┌──────────────┐   DispatchEvent   ┌────────────────────┐
//! │ Dispatcher / │ ─────────────────▶│ MulticastHandler   │──▶ metrics
//! │ Breaker /    │                   │                    │──▶ audit log
//! │ RateLimiter  │                   └────────────────────┘
//! └──────────────┘
//! ```

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::models::CircuitState;

/// Events emitted by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DispatchEvent {
    /// An inbound request went through authentication.
    AuthAttempt {
        /// Resolved source key (client address).
        source: String,
        /// Whether the rate limiter admitted the request.
        allowed: bool,
        /// Whether the credentials were accepted.
        success: bool,
    },

    /// A destination's circuit breaker changed state.
    CircuitStateChanged {
        /// Destination name.
        destination: String,
        /// Previous state.
        from: CircuitState,
        /// New state.
        to: CircuitState,
    },

    /// A retry loop reached a terminal outcome.
    RetryCompleted {
        /// Destination name.
        destination: String,
        /// Attempts made.
        attempts: u32,
        /// Whether the final attempt succeeded.
        success: bool,
    },

    /// A unit was archived in the dead-letter store.
    DeadLettered {
        /// Destination name.
        destination: String,
        /// Assigned record id.
        record_id: String,
    },

    /// A template cache lookup completed.
    CacheLookup {
        /// Whether a live entry was found.
        hit: bool,
    },

    /// A unit was delivered.
    UnitDelivered {
        /// Destination name.
        destination: String,
        /// Index of the unit within its dispatch.
        unit_index: usize,
        /// Time from unit start to successful response.
        duration: Duration,
    },
}

impl DispatchEvent {
    /// Short metric-style name for the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthAttempt { .. } => "auth_attempt",
            Self::CircuitStateChanged { .. } => "circuit_state_changed",
            Self::RetryCompleted { .. } => "retry_completed",
            Self::DeadLettered { .. } => "dead_lettered",
            Self::CacheLookup { .. } => "cache_lookup",
            Self::UnitDelivered { .. } => "unit_delivered",
        }
    }
}

/// Receiver of dispatch events.
///
/// Implementations must not block; anything slow should be handed off to a
/// task of its own.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles one event.
    async fn handle_event(&self, event: DispatchEvent);
}

/// Handler that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: DispatchEvent) {}
}

/// Forwards each event to every registered subscriber concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Registers a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: DispatchEvent) {
        let futures = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move {
                handler.handle_event(event).await;
            }
        });

        futures::future::join_all(futures).await;
    }
}

/// Emits an event on a detached task so the caller never waits on
/// subscribers.
pub fn emit_detached(handler: &Arc<dyn EventHandler>, event: DispatchEvent) {
    let handler = handler.clone();
    tokio::spawn(async move {
        handler.handle_event(event).await;
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug)]
    struct CountingHandler {
        count: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl EventHandler for CountingHandler {
        async fn handle_event(&self, _event: DispatchEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn sample_event() -> DispatchEvent {
        DispatchEvent::CircuitStateChanged {
            destination: "slack".to_string(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
        }
    }

    #[tokio::test]
    async fn multicast_forwards_to_all_subscribers() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let mut multicast = MulticastEventHandler::new();
        multicast.add_subscriber(Arc::new(CountingHandler { count: first.clone() }));
        multicast.add_subscriber(Arc::new(CountingHandler { count: second.clone() }));
        assert_eq!(multicast.subscriber_count(), 2);

        multicast.handle_event(sample_event()).await;

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_multicast_is_harmless() {
        MulticastEventHandler::new().handle_event(sample_event()).await;
        NoOpEventHandler::new().handle_event(sample_event()).await;
    }

    #[test]
    fn event_kinds() {
        assert_eq!(sample_event().kind(), "circuit_state_changed");
        assert_eq!(DispatchEvent::CacheLookup { hit: true }.kind(), "cache_lookup");
    }
}
