//! Gemini provider: `generateContent` over the Generative Language REST API.
//!
//! The key travels in the `x-goog-api-key` header, never in the URL, so
//! request URLs and reqwest error messages are safe to log.

use crate::{GenerateRequest, GenerateResponse, Provider, UpstreamError};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{Value, json};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

/// Header carrying the API key.
const API_KEY_HEADER: &str = "x-goog-api-key";

/// Gemini REST client.
pub struct GeminiProvider {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl GeminiProvider {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }

    fn endpoint(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            model
        )
    }

    async fn call(&self, api_key: &str, request: GenerateRequest) -> crate::Result<GenerateResponse> {
        let mut body = json!({ "contents": normalize_contents(request.contents) });
        if !request.config.is_null() {
            body["generationConfig"] = request.config;
        }

        // Unsendable key: reported as 401 so the pool cools it down.
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(api_key)
            .map_err(|_| UpstreamError::new(401, "API key is not a valid header value"))?;
        headers.insert(API_KEY_HEADER, key);

        let url = self.endpoint(&request.model);
        debug!(model = %request.model, "calling generateContent");

        let response = self
            .client
            .post(&url)
            .headers(headers)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::new(
                        504,
                        format!("upstream timeout after {}s", self.timeout.as_secs()),
                    )
                } else {
                    UpstreamError::new(502, format!("upstream request failed: {e}"))
                }
            })?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| UpstreamError::new(502, format!("upstream response read error: {e}")))?;

        if !status.is_success() {
            let message = error_message(&bytes).unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("upstream error")
                    .to_string()
            });
            warn!(status = status.as_u16(), error = %message, "upstream returned error");
            return Err(UpstreamError::new(status.as_u16(), message));
        }

        let mut body: Value = serde_json::from_slice(&bytes)
            .map_err(|e| UpstreamError::new(502, format!("invalid upstream response: {e}")))?;
        let text = normalized_text(&body).map(Value::from).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut body {
            map.insert("text".into(), text);
        } else {
            body = json!({ "response": body, "text": text });
        }

        Ok(GenerateResponse { body })
    }
}

impl Provider for GeminiProvider {
    fn id(&self) -> &str {
        "gemini"
    }

    fn generate<'a>(
        &'a self,
        api_key: &'a str,
        request: GenerateRequest,
    ) -> Pin<Box<dyn Future<Output = crate::Result<GenerateResponse>> + Send + 'a>> {
        Box::pin(self.call(api_key, request))
    }
}

/// Coerce caller contents into the `contents` array the REST API expects.
///
/// A bare string becomes one text part; a single content object is wrapped in
/// an array; arrays pass through.
pub fn normalize_contents(contents: Value) -> Value {
    match contents {
        Value::Array(_) => contents,
        Value::String(text) => json!([{ "parts": [{ "text": text }] }]),
        Value::Null => json!([]),
        other => json!([other]),
    }
}

/// Extract the generated text from the known response shapes, first match wins.
pub fn normalized_text(body: &Value) -> Option<String> {
    const PATHS: &[&str] = &[
        "/text",
        "/candidates/0/content/parts/0/text",
        "/candidates/0/content/0/text",
        "/output/0/content/0/text",
    ];
    PATHS
        .iter()
        .find_map(|path| body.pointer(path).and_then(Value::as_str))
        .map(str::to_owned)
}

/// `error.message` from an upstream JSON error body, or the raw text.
fn error_message(bytes: &[u8]) -> Option<String> {
    if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
        if let Some(msg) = value.pointer("/error/message").and_then(Value::as_str) {
            return Some(msg.to_string());
        }
    }
    let text = String::from_utf8_lossy(bytes).trim().to_string();
    (!text.is_empty()).then_some(text)
}
