//! Dead-letter inspection.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use herald_delivery::DeadLetterRecord;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use super::error_response;
use crate::AppState;

/// Query parameters for listing.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Only records for this destination.
    pub destination: Option<String>,
}

/// Listing response.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeadLetterList {
    /// Number of records returned.
    pub count: usize,
    /// Records in insertion order.
    pub records: Vec<DeadLetterRecord>,
}

/// `GET /dead-letters[?destination=name]`
#[instrument(name = "list_dead_letters", skip(state))]
pub async fn list_dead_letters(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Response {
    let store = state.dead_letters();
    let records = match query.destination.as_deref() {
        Some(destination) => store.list_by_destination(destination).await,
        None => store.list().await,
    };

    Json(DeadLetterList { count: records.len(), records }).into_response()
}

/// `GET /dead-letters/stats`
#[instrument(name = "dead_letter_stats", skip(state))]
pub async fn dead_letter_stats(State(state): State<AppState>) -> Response {
    Json(state.dead_letters().stats().await).into_response()
}

/// `GET /dead-letters/{id}`
#[instrument(name = "get_dead_letter", skip(state))]
pub async fn get_dead_letter(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.dead_letters().get(&id).await {
        Some(record) => Json(record).into_response(),
        None => not_found(&id),
    }
}

/// `DELETE /dead-letters/{id}`
#[instrument(name = "delete_dead_letter", skip(state))]
pub async fn delete_dead_letter(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.dead_letters().remove(&id).await {
        Some(_) => {
            info!(record_id = %id, "dead-letter record removed");
            StatusCode::NO_CONTENT.into_response()
        },
        None => not_found(&id),
    }
}

/// `DELETE /dead-letters`
#[instrument(name = "clear_dead_letters", skip(state))]
pub async fn clear_dead_letters(State(state): State<AppState>) -> Response {
    let cleared = state.dead_letters().clear().await;
    info!(cleared, "dead-letter store cleared");
    Json(serde_json::json!({ "cleared": cleared })).into_response()
}

fn not_found(id: &str) -> Response {
    error_response(StatusCode::NOT_FOUND, "dead_letter_not_found", format!("no dead-letter record '{id}'"))
}
