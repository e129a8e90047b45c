//! Core domain models and event types for the herald alert gateway.
//!
//! Provides the alert payload model accepted from the monitoring source,
//! the circuit state shared between the delivery engine and the API, a
//! clock abstraction for deterministic timing, and the observer-style event
//! system used as the metrics sink. Every other crate in the workspace
//! depends on these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{DispatchEvent, EventHandler, MulticastEventHandler, NoOpEventHandler};
pub use models::{Alert, AlertBatch, AlertStatus, CircuitState, Fingerprint, LabelSet};
pub use time::{Clock, RealClock, TestClock};
