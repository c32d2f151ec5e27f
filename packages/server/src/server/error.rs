//! HTTP mapping of coordinator errors.

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::common::{CoordinatorError, LeaseConflict};

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

pub fn status_for(err: &CoordinatorError) -> StatusCode {
    match err {
        CoordinatorError::Authentication => StatusCode::UNAUTHORIZED,
        CoordinatorError::Validation(_) => StatusCode::BAD_REQUEST,
        CoordinatorError::NotFound(_) => StatusCode::NOT_FOUND,
        CoordinatorError::LeaseConflict(LeaseConflict::NotLocked) => StatusCode::BAD_REQUEST,
        CoordinatorError::LeaseConflict(_) => StatusCode::FORBIDDEN,
        CoordinatorError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        CoordinatorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for CoordinatorError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        let message = match &self {
            CoordinatorError::Internal(e) => {
                error!(error = ?e, "request failed");
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorBody {
            error: self.code(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

/// Malformed JSON is reported like any other validation failure.
pub fn from_rejection(rejection: JsonRejection) -> CoordinatorError {
    CoordinatorError::validation(rejection.body_text())
}
