use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use dispatch_common::error::{PersistenceError, RegistryError, ValidationError};

/// Errors surfaced at the queue's HTTP boundary. Each variant maps to one
/// of the error codes in the external interface's taxonomy.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("bad_secret")]
    BadSecret,
    #[error("bad_id")]
    BadId,
    #[error("empty_queue")]
    EmptyQueue,
    #[error("no_version")]
    NoVersion,
    #[error("invalid_model")]
    InvalidModel(#[from] RegistryError),
    #[error("validation_error: {0}")]
    Validation(#[from] ValidationError),
    #[error("corrupt_state_file: {0}")]
    Persistence(#[from] PersistenceError),
}

impl IntoResponse for QueueError {
    fn into_response(self) -> Response {
        let status = match self {
            QueueError::BadSecret => StatusCode::UNAUTHORIZED,
            QueueError::BadId => StatusCode::NOT_FOUND,
            QueueError::EmptyQueue | QueueError::NoVersion => StatusCode::OK,
            QueueError::InvalidModel(_) => StatusCode::UNPROCESSABLE_ENTITY,
            QueueError::Validation(_) => StatusCode::BAD_REQUEST,
            QueueError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let code = match &self {
            QueueError::BadSecret => "bad_secret",
            QueueError::BadId => "bad_id",
            QueueError::EmptyQueue => "empty_queue",
            QueueError::NoVersion => "no_version",
            QueueError::InvalidModel(_) => "invalid_model",
            QueueError::Validation(_) => "validation_error",
            QueueError::Persistence(_) => "corrupt_state_file",
        };

        (status, Json(json!({ "error": code }))).into_response()
    }
}
