use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::time::Duration;

/// Errors scoped to a single request.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),
    #[error("upstream format error: {0}")]
    UpstreamFormat(String),
    #[error("malformed stream line: {0}")]
    StreamParse(#[from] serde_json::Error),
    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: &'static str, after: Duration },
    #[error("{0}")]
    BadRequest(String),
    #[error("client disconnected")]
    ClientDisconnected,
}

impl AppError {
    /// Transport failures and timeouts may succeed on a second attempt; format errors won't.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::UpstreamTransport(_) | AppError::Timeout { .. }
        )
    }

    /// Maps the error to a response, hiding upstream details behind `public_message`.
    pub fn into_response_with(self, public_message: &str) -> Response {
        match self {
            AppError::BadRequest(msg) => error_body(StatusCode::BAD_REQUEST, &msg),
            other => {
                log::error!("request failed: {:#}", other);
                error_body(StatusCode::INTERNAL_SERVER_ERROR, public_message)
            }
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        AppError::UpstreamTransport(e.to_string())
    }
}

fn error_body(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
