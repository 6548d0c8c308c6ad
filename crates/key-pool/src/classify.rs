//! Upstream error classification
//!
//! Decides whether a failed upstream call should quarantine the key that made
//! it. Matching is on the numeric status and on plain substrings of the error
//! message, because upstream client errors often only carry the status inside
//! their message text. Substring checks are case-sensitive.

/// How an upstream failure affects the key that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 429: the key hit its rate limit, cool it down
    RateLimited,
    /// 401/403 or key rejected: cool it down as well
    Auth,
    /// Anything else: not the key's fault, release it untouched
    Other,
}

impl ErrorClass {
    /// Whether this class places the key into cooldown.
    pub fn is_penalizing(self) -> bool {
        !matches!(self, ErrorClass::Other)
    }

    /// Label for logs and metrics.
    pub fn label(self) -> &'static str {
        match self {
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Auth => "auth",
            ErrorClass::Other => "other",
        }
    }
}

/// Message fragments that mark an authentication failure.
const AUTH_PATTERNS: &[&str] = &["401", "403", "API key", "authentication"];

/// Classify an upstream failure by status code and message.
///
/// Rate limiting wins over auth when both match.
pub fn classify(status: u16, message: &str) -> ErrorClass {
    if status == 429 || message.contains("429") {
        return ErrorClass::RateLimited;
    }
    if matches!(status, 401 | 403) || AUTH_PATTERNS.iter().any(|p| message.contains(p)) {
        return ErrorClass::Auth;
    }
    ErrorClass::Other
}
