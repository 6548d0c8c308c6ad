//! `POST /api/gemini` request handling
//!
//! Leases one key, makes exactly one upstream call with it, and resolves the
//! lease from the outcome before answering. No retries on another key: the
//! client gets the upstream's verdict and decides.

use axum::body::Bytes;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use key_pool::{KeyPool, Resolution};
use provider::{GenerateRequest, Provider};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::ApiError;

/// State shared by generation requests.
#[derive(Clone)]
pub struct GenerateState {
    pub pool: KeyPool,
    pub provider: Arc<dyn Provider>,
    pub default_model: String,
}

/// Inbound request body. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateBody {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub contents: Option<Value>,
    /// Shorthand for `contents: {"parts": promptParts}`
    #[serde(default)]
    pub prompt_parts: Option<Value>,
    #[serde(default)]
    pub config: Option<Value>,
}

impl GenerateBody {
    /// Parse a raw body. An empty body is the same as `{}`.
    pub fn parse(bytes: &[u8]) -> Result<Self, ApiError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(bytes).map_err(|e| ApiError::BadRequest(e.to_string()))
    }

    fn into_request(self, default_model: &str) -> GenerateRequest {
        let contents = self.contents.unwrap_or_else(|| {
            serde_json::json!({ "parts": self.prompt_parts.unwrap_or_else(|| Value::Array(Vec::new())) })
        });
        GenerateRequest {
            model: self
                .model
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| default_model.to_string()),
            contents,
            config: self.config.unwrap_or(Value::Null),
        }
    }
}

/// Handle one generation request end to end and record its metrics.
///
/// `body` is the extraction result, so an unreadable or oversized body still
/// gets a JSON error carrying `request_id`.
#[instrument(skip_all, fields(request_id = %request_id))]
pub async fn generate(
    state: &GenerateState,
    body: Result<Bytes, ApiError>,
    request_id: String,
) -> Response {
    let start = Instant::now();
    let outcome = match body {
        Ok(body) => run(state, &body).await,
        Err(err) => Err(err),
    };
    let response = match outcome {
        Ok(response) => (
            StatusCode::OK,
            axum::Json(serde_json::json!({ "ok": true, "response": response })),
        )
            .into_response(),
        Err(err) => {
            match &err {
                ApiError::Pool(key_pool::Error::AtCapacity { queue_position, .. }) => {
                    debug!(queue_position, "all keys busy");
                }
                ApiError::Pool(e) => warn!(error = %e, "cannot serve request"),
                ApiError::Upstream(e) => warn!(status = e.status, error = %e.message, "upstream call failed"),
                ApiError::BadRequest(e) => debug!(error = %e, "rejected request body"),
                ApiError::Body(e) => debug!(status = %e.status(), error = %e, "unreadable request body"),
            }
            err.into_response_with_id(&request_id)
        }
    };

    crate::metrics::record_request(response.status().as_u16(), start.elapsed().as_secs_f64());
    response
}

async fn run(state: &GenerateState, body: &[u8]) -> Result<Value, ApiError> {
    let request = GenerateBody::parse(body)?.into_request(&state.default_model);

    let lease = state.pool.acquire()?;
    let key_index = lease.index();
    debug!(key_index, model = %request.model, provider = state.provider.id(), "key leased");

    let outcome = state.provider.generate(lease.credential(), request).await;

    match outcome {
        Ok(response) => {
            lease.release();
            Ok(response.body)
        }
        Err(err) => {
            let resolution = lease.report_error(err.status, &err.message);
            let error_type = match resolution {
                Resolution::CooledDown { class, cooldown, .. } => {
                    info!(
                        key_index,
                        cooldown_secs = cooldown.as_secs(),
                        "key cooled down after upstream error"
                    );
                    class.label()
                }
                Resolution::Released | Resolution::Stale => key_pool::ErrorClass::Other.label(),
            };
            crate::metrics::record_upstream_error(error_type);
            Err(ApiError::Upstream(err))
        }
    }
}
