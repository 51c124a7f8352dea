//! API error handling
//!
//! Maps engine errors to HTTP statuses: malformed requests to 400, a
//! duplicate running pipeline id to 409, everything the engine could not
//! help to 500.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::logs::FabricError;
use crate::pipeline::PipelineError;
use crate::worker::WorkerError;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => {
                tracing::error!("internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::InvalidRequest(_) | PipelineError::Cycle(_) => {
                ApiError::BadRequest(err.to_string())
            }
            PipelineError::AlreadyRunning(_) => ApiError::Conflict(err.to_string()),
            PipelineError::Stage { .. } | PipelineError::Canceled => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl From<WorkerError> for ApiError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::EmptyBatch => ApiError::BadRequest(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<FabricError> for ApiError {
    fn from(err: FabricError) -> Self {
        match err {
            FabricError::InvalidRegistration(_) => ApiError::BadRequest(err.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
