use axum::{extract::Extension, Json};
use serde::Serialize;

use crate::server::app::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    /// Dispatches awaiting acknowledgment.
    pub in_flight: usize,
    /// Committed records.
    pub records: usize,
}

/// Health check endpoint
///
/// Always 200 while the process is serving. The counters are a snapshot.
pub async fn health_handler(Extension(state): Extension<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        in_flight: state.dispatcher.in_flight(),
        records: state.dispatcher.records().len(),
    })
}
