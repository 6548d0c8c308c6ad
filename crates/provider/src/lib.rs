//! Upstream generative-AI client abstraction
//!
//! Defines the `Provider` trait the proxy calls once per leased key. A provider
//! is a black box: it takes a key and a request and returns either the
//! upstream JSON (with a normalised `text` field) or an `UpstreamError` that
//! carries the upstream status code. Deciding what that error means for the
//! key is the pool's job, not the provider's.

pub mod gemini;

pub use gemini::GeminiProvider;

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// A single content-generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    /// Prompt contents in the upstream's native shape
    pub contents: serde_json::Value,
    /// Generation options; `Null` when the caller sent none
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Successful upstream response.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateResponse {
    /// Upstream JSON with a top-level `text` field added (possibly `null`)
    pub body: serde_json::Value,
}

impl GenerateResponse {
    /// The normalised generated text, if the upstream produced any.
    pub fn text(&self) -> Option<&str> {
        self.body.get("text").and_then(|t| t.as_str())
    }
}

/// Failed upstream call, with the status code the pool classifies on.
///
/// Transport failures that never reached upstream use gateway statuses
/// (502 connection, 504 timeout).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("upstream error {status}: {message}")]
pub struct UpstreamError {
    pub status: u16,
    pub message: String,
}

impl UpstreamError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Result alias for provider operations.
pub type Result<T> = std::result::Result<T, UpstreamError>;

/// Abstraction over the upstream generation API.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Provider>`).
pub trait Provider: Send + Sync {
    /// Identifier for logging (e.g. "gemini")
    fn id(&self) -> &str;

    /// Run one generation call authenticated with `api_key`.
    ///
    /// Called exactly once per lease; the caller resolves the lease from the
    /// outcome.
    fn generate<'a>(
        &'a self,
        api_key: &'a str,
        request: GenerateRequest,
    ) -> Pin<Box<dyn Future<Output = Result<GenerateResponse>> + Send + 'a>>;
}
