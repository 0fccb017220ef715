use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use panel_supervisor::ProcessError;
use serde::Serialize;

use crate::start_args::InvalidStartArgs;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
}

pub fn json_error(code: StatusCode, message: impl Into<String>) -> Response {
    (
        code,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
        .into_response()
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Process(ProcessError),
}

impl From<ProcessError> for ApiError {
    fn from(value: ProcessError) -> Self {
        Self::Process(value)
    }
}

impl From<InvalidStartArgs> for ApiError {
    fn from(value: InvalidStartArgs) -> Self {
        Self::BadRequest(value.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            // Plain text, like the informational bodies the panel page shows.
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            ApiError::Process(err) => {
                tracing::error!(%err, "process operation failed");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        }
    }
}
