use axum::{body::Bytes, extract::Extension, Json};
use courier::OperationType;
use serde::Serialize;
use serde_json::Value;

use crate::server::app::AppState;
use crate::server::error::ApiError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordResponse {
    pub message: String,
    pub operation_type: OperationType,
    pub record_id: String,
}

/// Create or update a record.
///
/// Responds once the downstream processor acknowledges the record, or with
/// an error once retries run out. If the client disconnects first, the
/// handler future is dropped and the dispatch is cancelled with it.
pub async fn record_handler(
    Extension(state): Extension<AppState>,
    body: Bytes,
) -> Result<Json<RecordResponse>, ApiError> {
    let raw: Value =
        serde_json::from_slice(&body).map_err(|_| ApiError::invalid_record_format())?;

    let receipt = state.dispatcher.dispatch(raw).await?;

    Ok(Json(RecordResponse {
        message: receipt.message(),
        operation_type: receipt.operation_type,
        record_id: receipt.record_id,
    }))
}
