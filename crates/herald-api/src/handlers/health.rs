//! Health check handlers for service monitoring.
//!
//! `/health` summarises destination health from breaker state, `/live` is a
//! dependency-free liveness probe, and `/stats` exposes the rate limiter and
//! template cache counters.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use herald_core::{CircuitState, Clock};
use herald_delivery::{CircuitBreakerRegistry, TemplateCacheStats};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::{rate_limit::RateLimiterStats, AppState};

/// Health check response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall service health status
    pub status: HealthStatus,
    /// Timestamp when health check was performed
    pub timestamp: DateTime<Utc>,
    /// Per-component results
    pub checks: HealthChecks,
    /// Service version information
    pub version: String,
    /// Seconds since the gateway started
    pub uptime_secs: u64,
}

/// Overall health status enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All destinations reachable
    Healthy,
    /// At least one destination is isolated by its breaker
    Degraded,
    /// Shutting down
    Unhealthy,
}

/// Component results.
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    /// Breaker summary across destinations
    pub circuits: CircuitHealth,
    /// Records awaiting inspection
    pub dead_letters: usize,
}

/// Breaker counts by state.
#[derive(Debug, Default, Serialize)]
pub struct CircuitHealth {
    /// Breakers closed
    pub closed: usize,
    /// Breakers half-open
    pub half_open: usize,
    /// Breakers open
    pub open: usize,
}

/// Builds health reports from the breaker registry.
pub struct HealthService {
    clock: Arc<dyn Clock>,
}

impl HealthService {
    /// Creates a new health service with the given clock.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Summarises breaker states into an overall status.
    pub fn circuit_health(&self, breakers: &CircuitBreakerRegistry) -> CircuitHealth {
        breakers.all_stats().iter().fold(CircuitHealth::default(), |mut health, stats| {
            match stats.state {
                CircuitState::Closed => health.closed += 1,
                CircuitState::HalfOpen => health.half_open += 1,
                CircuitState::Open => health.open += 1,
            }
            health
        })
    }

    /// Current time as reported by the clock.
    pub fn timestamp(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.clock.now_system())
    }
}

/// Health check endpoint handler.
#[instrument(name = "health_check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Response {
    let service = HealthService::new(state.clock().clone());
    let circuits = service.circuit_health(state.breakers());
    let dead_letters = state.dead_letters().size().await;

    let status = if state.is_shutting_down() {
        HealthStatus::Unhealthy
    } else if circuits.open > 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };

    let status_code = match status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    debug!(status = ?status, open_circuits = circuits.open, dead_letters, "Health check completed");

    let response = HealthResponse {
        status,
        timestamp: service.timestamp(),
        checks: HealthChecks { circuits, dead_letters },
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.uptime().as_secs(),
    };

    (status_code, Json(response)).into_response()
}

/// Liveness check endpoint.
///
/// Returns as long as the HTTP server is responding.
#[instrument(name = "liveness_check", skip(state))]
pub async fn liveness_check(State(state): State<AppState>) -> Response {
    let response = serde_json::json!({
        "status": "alive",
        "timestamp": DateTime::<Utc>::from(state.clock().now_system()),
        "service": "herald"
    });

    (StatusCode::OK, Json(response)).into_response()
}

/// Runtime counters.
#[derive(Debug, Serialize)]
pub struct RuntimeStats {
    /// Inbound auth throttling
    pub rate_limiter: RateLimiterStats,
    /// Compiled transform cache
    pub template_cache: TemplateCacheStats,
}

/// `GET /stats`
#[instrument(name = "runtime_stats", skip(state))]
pub async fn runtime_stats(State(state): State<AppState>) -> Response {
    Json(RuntimeStats {
        rate_limiter: state.rate_limiter().stats(),
        template_cache: state.cache().stats(),
    })
    .into_response()
}
