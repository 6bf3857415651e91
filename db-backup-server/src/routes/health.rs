//! Health check endpoint.

use crate::services::scheduler::JobKind;
use crate::state::AppState;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let jobs: Map<String, Value> = JobKind::ALL
        .into_iter()
        .map(|kind| {
            let status = state.timers.get(kind).status();
            (kind.name().to_string(), json!(status))
        })
        .collect();

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "jobs": jobs,
        "transfers_in_flight": state.transfers.in_flight(),
    }))
}
