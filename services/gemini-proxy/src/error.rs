//! Per-request API errors and their HTTP rendering

use axum::extract::rejection::BytesRejection;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use provider::UpstreamError;
use thiserror::Error;

/// Seconds a client is told to wait after a capacity error.
pub const RETRY_AFTER_SECS: u64 = 5;

/// Everything `POST /api/gemini` can fail with.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Pool(#[from] key_pool::Error),

    #[error("{}", .0.message)]
    Upstream(#[from] UpstreamError),

    #[error("invalid request body: {0}")]
    BadRequest(String),

    /// Body could not be read, e.g. it exceeds `max_body_bytes`.
    #[error("request body rejected: {}", .0.body_text())]
    Body(#[from] BytesRejection),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Pool(key_pool::Error::AtCapacity { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Pool(key_pool::Error::NoCredentialsConfigured) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Upstream(err) => upstream_status(err.status),
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Body(rejection) => rejection.status(),
        }
    }

    /// Render as a JSON response tagged with `request_id`.
    pub fn into_response_with_id(self, request_id: &str) -> Response {
        let status = self.status();
        let mut body = serde_json::json!({
            "ok": false,
            "error": self.to_string(),
            "request_id": request_id,
        });

        let queue_position = match &self {
            ApiError::Pool(err) => err.queue_position(),
            _ => None,
        };

        let mut response = match queue_position {
            Some(position) => {
                body["queued"] = true.into();
                body["queue_position"] = position.into();
                let mut response = (status, axum::Json(body)).into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
                response
            }
            None => (status, axum::Json(body)).into_response(),
        };
        response.headers_mut().insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        );
        response
    }
}

/// Upstream rate-limit and auth statuses reach the client as-is; anything
/// else becomes a 500.
fn upstream_status(status: u16) -> StatusCode {
    match status {
        429 => StatusCode::TOO_MANY_REQUESTS,
        401 => StatusCode::UNAUTHORIZED,
        403 => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
