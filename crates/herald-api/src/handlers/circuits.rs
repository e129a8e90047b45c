//! Circuit breaker inspection and manual reset.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{info, instrument};

use super::error_response;
use crate::AppState;

/// `GET /circuits`
#[instrument(name = "list_circuits", skip(state))]
pub async fn list_circuits(State(state): State<AppState>) -> Response {
    Json(state.breakers().all_stats()).into_response()
}

/// `POST /circuits/{name}/reset`
///
/// Only breakers that have been used exist; resetting an unknown name is a
/// 404.
#[instrument(name = "reset_circuit", skip(state))]
pub async fn reset_circuit(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    if !state.breakers().reset(&name) {
        return error_response(StatusCode::NOT_FOUND, "circuit_not_found", format!("no circuit for '{name}'"));
    }

    info!(destination = %name, "circuit manually reset");
    match state.breakers().get(&name) {
        Some(breaker) => Json(breaker.stats()).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}
