//! HTTP error responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use courier::{DispatchError, ErrorCategory};
use serde::Serialize;

/// Error body: `{ "message": ..., "code": ... }`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
    pub code: String,
}

/// An error that renders as a JSON response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                message: message.into(),
                code: category.to_string(),
            },
        }
    }

    /// Body was not JSON at all.
    pub fn invalid_record_format() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            ErrorCategory::Validation,
            "Invalid record format",
        )
    }
}

/// HTTP status for each error category.
pub fn status_for(category: ErrorCategory) -> StatusCode {
    match category {
        ErrorCategory::Validation => StatusCode::BAD_REQUEST,
        ErrorCategory::NotFound => StatusCode::NOT_FOUND,
        ErrorCategory::Conflict => StatusCode::CONFLICT,
        ErrorCategory::Unavailable | ErrorCategory::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        let category = err.category();
        let message = match &err {
            DispatchError::Validation(e) if e.subject == "user" => "Invalid user format".to_string(),
            DispatchError::Validation(_) | DispatchError::Encode(_) => {
                "Invalid record format".to_string()
            }
            DispatchError::NotFound(_) => "Record not found for update".to_string(),
            DispatchError::NotReady => "Health check failed".to_string(),
            DispatchError::AckTimeout { .. } => "Failed to send record for auditing".to_string(),
            DispatchError::Conflict(_)
            | DispatchError::Cancelled(_)
            | DispatchError::Transport(_) => err.to_string(),
        };
        Self::new(status_for(category), category, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
