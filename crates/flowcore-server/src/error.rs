//! Error-handling edge: `thiserror` inside every library module, but the
//! binary's own request handlers collapse everything down to an HTTP
//! response through one `ServerError` type, matching the teacher's
//! handlers returning `(StatusCode, Json(json!({...})))` tuples directly
//! rather than propagating a typed error through axum's `IntoResponse`.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("workflow '{0}' not found")]
    WorkflowNotFound(String),
    #[error("missing required parameter '{0}'")]
    MissingParam(String),
    #[error("invalid parameter '{name}': {message}")]
    InvalidParam { name: String, message: String },
    #[error("rate limit exceeded, retry after {retry_after_sec}s")]
    RateLimited { retry_after_sec: u64 },
    #[error("workflow execution failed: {0}")]
    ExecutionFailed(String),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::WorkflowNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::MissingParam(_) | ServerError::InvalidParam { .. } => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            ServerError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            ServerError::ExecutionFailed(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            ServerError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        let mut response = (status, Json(json!({ "error": message }))).into_response();
        if let ServerError::RateLimited { retry_after_sec } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_sec.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}
