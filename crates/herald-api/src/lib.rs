//! herald HTTP API.
//!
//! Accepts alert webhooks, authenticates them, and hands each batch to the
//! delivery engine for every configured destination. Also exposes the
//! dead-letter store and circuit breakers for inspection.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod rate_limit;
pub mod server;
pub mod state;

pub use config::Config;
pub use rate_limit::{RateLimitConfig, RateLimiter, RateLimiterStats};
pub use server::{create_router, start_server};
pub use state::{AppState, Gateway};
