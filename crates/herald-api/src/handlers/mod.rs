//! HTTP request handlers for the herald API.
//!
//! Handlers are grouped by functionality:
//! - `ingest` - Alert webhook ingestion and fan-out
//! - `dead_letters` - Inspection and removal of undeliverable units
//! - `circuits` - Breaker inspection and manual reset
//! - `health` - Health, liveness and runtime statistics
//!
//! Every error response has the shape `{"error": {"code", "message"}}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

pub mod circuits;
pub mod dead_letters;
pub mod health;
pub mod ingest;

pub use circuits::{list_circuits, reset_circuit};
pub use dead_letters::{clear_dead_letters, dead_letter_stats, delete_dead_letter, get_dead_letter, list_dead_letters};
pub use health::{health_check, liveness_check, runtime_stats};
pub use ingest::{ingest_all, ingest_destination};

/// Error response with code and message.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error details including code and message
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Machine-readable error code
    pub code: String,
    /// Human-readable error description
    pub message: String,
}

pub(crate) fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    let error_response =
        ErrorResponse { error: ErrorDetail { code: code.to_string(), message: message.into() } };

    (status, Json(error_response)).into_response()
}
