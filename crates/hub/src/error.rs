//! Request-level errors and their HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// Missing or wrong `x-api-key` for the device.
    #[error("invalid or missing api key")]
    Unauthorized,

    /// Enrollment secret required and not supplied correctly.
    #[error("enrollment secret rejected")]
    Forbidden,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// `expectedVersion` did not match the stored desired state.
    #[error("version conflict: expected {expected}, current {current}")]
    Conflict { expected: i64, current: i64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0:#}")]
    Database(#[from] anyhow::Error),
}

impl HubError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if let Self::Database(e) = &self {
            tracing::error!("request failed: {e:#}");
        }
        let body = ErrorResponse {
            error: ErrorBody {
                code: status.as_u16(),
                message: self.to_string(),
            },
        };
        (status, axum::Json(body)).into_response()
    }
}
