use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use thiserror::Error;

pub use dispatch_common::error::ValidationError;

use crate::templates::render_message;

/// Errors surfaced at the web frontend's boundary. `Validation` is handled
/// specially by the submit handler (the form is re-rendered with the
/// error inline, per the taxonomy); everything else here falls through to
/// a plain error page.
#[derive(Error, Debug)]
pub enum WebError {
    #[error("no model named '{0}' is loaded")]
    UnknownModel(String),
    #[error("{0}")]
    Validation(#[from] ValidationError),
    #[error("request to the queue daemon failed: {0}")]
    Queue(#[from] reqwest::Error),
    #[error("queue daemon returned a response we couldn't interpret: {0}")]
    MalformedResponse(String),
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let status = match self {
            WebError::UnknownModel(_) => StatusCode::NOT_FOUND,
            WebError::Validation(_) => StatusCode::BAD_REQUEST,
            WebError::Queue(_) | WebError::MalformedResponse(_) => StatusCode::BAD_GATEWAY,
        };
        (status, Html(render_message("Error", &self.to_string()))).into_response()
    }
}
