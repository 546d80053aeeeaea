//! HTTP-layer error type. Mirrors the teacher's `api/rest/error.rs` shape:
//! a flat enum with `IntoResponse`, mapping core error kinds to the status
//! codes in SPEC_FULL.md §7.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::error::CoreError;

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Forbidden(String),
    BadRequest(String),
    NotFound(String),
    EngineUnavailable(String),
    Internal(anyhow::Error),
}

#[derive(Serialize)]
struct ErrorResponse {
    message: String,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::EngineUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal error: {e}"),
            ),
        };
        (status, Json(ErrorResponse { message })).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::Forbidden { .. } => ApiError::Forbidden(e.to_string()),
            CoreError::SessionNotFound { .. } => ApiError::NotFound(e.to_string()),
            CoreError::CommandNotAllowed(_) => ApiError::BadRequest(e.to_string()),
            CoreError::PathInvalid(_) => ApiError::BadRequest(e.to_string()),
            CoreError::SizeLimitExceeded { .. } => ApiError::BadRequest(e.to_string()),
            CoreError::EngineUnavailable(_) => ApiError::EngineUnavailable(e.to_string()),
            CoreError::ResourceExhausted(_) => ApiError::EngineUnavailable(e.to_string()),
            CoreError::Internal(err) => ApiError::Internal(err),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}
