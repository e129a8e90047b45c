//! Alert webhook ingestion.
//!
//! Decodes the alert batch, resolves the target destinations and hands the
//! batch to the dispatcher on detached tasks. The response only reports
//! validation: delivery outcomes surface through logs, events and the
//! dead-letter store.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use herald_core::{AlertBatch, CoreError};
use herald_delivery::DestinationConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::error_response;
use crate::AppState;

/// Response for an accepted batch.
#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    /// Always `accepted`.
    pub status: String,
    /// Destinations a dispatch was started for.
    pub destinations: Vec<String>,
    /// Alerts in the batch.
    pub alerts: usize,
}

/// Fans a batch out to every enabled destination.
#[instrument(name = "ingest_webhook", skip(state, body), fields(body_size = body.len()))]
pub async fn ingest_all(State(state): State<AppState>, body: Bytes) -> Response {
    let batch = match decode(&body) {
        Ok(batch) => batch,
        Err(response) => return response,
    };

    let destinations: Vec<DestinationConfig> =
        state.config().destinations.iter().filter(|destination| destination.enabled).cloned().collect();

    if destinations.is_empty() {
        warn!(alerts = batch.len(), "no enabled destinations, batch accepted but not dispatched");
    }

    accept(&state, destinations, batch)
}

/// Sends a batch to one named destination.
///
/// # Errors
///
/// - 400: Malformed payload or empty batch
/// - 404: Unknown destination
/// - 409: Destination disabled
#[instrument(name = "ingest_destination", skip(state, body), fields(destination = %name, body_size = body.len()))]
pub async fn ingest_destination(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    let Some(destination) = state.config().destination(&name).cloned() else {
        warn!("unknown destination");
        return error_response(
            StatusCode::NOT_FOUND,
            "destination_not_found",
            format!("destination '{name}' is not configured"),
        );
    };

    if !destination.enabled {
        warn!("destination disabled");
        return error_response(
            StatusCode::CONFLICT,
            "destination_disabled",
            format!("destination '{name}' is disabled"),
        );
    }

    let batch = match decode(&body) {
        Ok(batch) => batch,
        Err(response) => return response,
    };

    accept(&state, vec![destination], batch)
}

fn decode(body: &[u8]) -> Result<AlertBatch, Response> {
    AlertBatch::from_slice(body).map_err(|e| {
        warn!(error = %e, "rejected alert payload");
        let code = match e {
            CoreError::InvalidPayload(_) => "invalid_payload",
            CoreError::InvalidInput(_) => "invalid_input",
        };
        error_response(StatusCode::BAD_REQUEST, code, e.to_string())
    })
}

fn accept(state: &AppState, destinations: Vec<DestinationConfig>, batch: AlertBatch) -> Response {
    let alerts = batch.len();
    let names: Vec<String> = destinations.iter().map(|destination| destination.name.clone()).collect();

    debug!(group_key = %batch.group_key, alerts, "alert batch decoded");
    let dispatches = state.dispatch(destinations, Arc::new(batch));

    info!(alerts, dispatches, destinations = ?names, "alert batch accepted");

    (
        StatusCode::ACCEPTED,
        Json(IngestResponse { status: "accepted".to_string(), destinations: names, alerts }),
    )
        .into_response()
}
