//! Reliable alert dispatch.
//!
//! This crate turns "send this alert batch to destination D" into bounded,
//! failure-isolated delivery:
//!
//! 1. **Split** - the batch becomes one or more units (whole batch, one per
//!    alert, or groups of N)
//! 2. **Transform** - a cached engine produces each unit's payload
//! 3. **Format** - the payload is encoded into a request body
//! 4. **Deliver** - the send runs under the destination's circuit breaker,
//!    retried with backoff
//! 5. **Archive** - units that cannot be delivered land in the dead-letter
//!    store
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use herald_core::{AlertBatch, RealClock};
//! use herald_delivery::{
//!     CircuitBreakerRegistry, DeadLetterConfig, DeadLetterStore, DestinationConfig, Dispatcher,
//!     HttpSender, TemplateCache, TemplateCacheConfig,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(batch: AlertBatch) -> herald_delivery::Result<()> {
//! let clock = Arc::new(RealClock::new());
//! let dispatcher = Dispatcher::new(
//!     clock.clone(),
//!     Arc::new(HttpSender::with_defaults()?),
//!     Arc::new(TemplateCache::new(TemplateCacheConfig::default(), clock.clone())?),
//!     Arc::new(CircuitBreakerRegistry::new(clock.clone())),
//!     Arc::new(DeadLetterStore::new(DeadLetterConfig::default(), clock)),
//! );
//!
//! let destination = DestinationConfig::new("chat", "https://chat.example.com/hook");
//! let summary = dispatcher.dispatch(&destination, Arc::new(batch), &CancellationToken::new()).await?;
//! println!("{} of {} units delivered", summary.succeeded, summary.units_total);
//! # Ok(())
//! # }
//! ```

pub mod circuit;
pub mod client;
pub mod config;
pub mod dead_letter;
pub mod dispatch;
pub mod error;
pub mod format;
pub mod retry;
pub mod sweeper;
pub mod template;
pub mod transform;

pub use circuit::{CircuitBreaker, CircuitBreakerRegistry, CircuitConfig, CircuitStats, StateChangeListener};
pub use client::{ClientConfig, HttpSender, SendRequest, SendResponse, Sender};
pub use config::{validate_destinations, DestinationConfig};
pub use dead_letter::{DeadLetterConfig, DeadLetterRecord, DeadLetterStats, DeadLetterStore};
pub use dispatch::{DispatchSummary, Dispatcher};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use format::{DefaultFormatter, Encoding, FormattedBody, Formatter};
pub use retry::{BackoffStrategy, Retrier, RetryOutcome, RetryPolicy};
pub use template::{EngineCache, TemplateCache, TemplateCacheConfig, TemplateCacheStats};
pub use transform::{BuiltinEngineFactory, EngineFactory, SharedEngine, TransformEngine};
