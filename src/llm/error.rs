//! Model-call error types with retry classification.
//!
//! The request queue only looks at one bit of this: whether the failure is a
//! rate-limit signal. Everything else is a terminal failure for the caller.

use std::time::Duration;

/// Error from a model call.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}{}: {message}", status_suffix(.status_code))]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub status_code: Option<u16>,
    pub message: String,
    /// Retry-After header value, if the provider sent one.
    ///
    /// Informational only; the queue uses its fixed cool-down window.
    pub retry_after: Option<Duration>,
}

fn status_suffix(status_code: &Option<u16>) -> String {
    status_code
        .map(|code| format!(" (HTTP {})", code))
        .unwrap_or_default()
}

impl LlmError {
    fn new(kind: LlmErrorKind, status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_code,
            message: message.into(),
            retry_after: None,
        }
    }

    /// The provider asked us to slow down (HTTP 429).
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(LlmErrorKind::RateLimited, Some(429), message)
        }
    }

    pub fn server_error(status_code: u16, message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::ServerError, Some(status_code), message)
    }

    /// Bad request, auth failure, unknown model.
    pub fn client_error(status_code: u16, message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::ClientError, Some(status_code), message)
    }

    pub fn network_error(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::NetworkError, None, message)
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::ParseError, None, message)
    }

    /// Build an error from an HTTP status and response body.
    pub fn from_status(status_code: u16, body: &str, retry_after: Option<Duration>) -> Self {
        match classify_http_status(status_code) {
            LlmErrorKind::RateLimited => Self::rate_limited(body, retry_after),
            kind => Self::new(kind, Some(status_code), body),
        }
    }

    /// An error reported inside a streaming response, after the HTTP status
    /// was already sent. `code` is the provider's error code, if any.
    pub fn in_stream(code: Option<u16>, message: impl Into<String>) -> Self {
        match code {
            Some(code) => Self::from_status(code, &message.into(), None),
            None => Self::new(LlmErrorKind::ServerError, None, message),
        }
    }

    /// Whether the request queue should requeue this failure behind a pause.
    pub fn is_rate_limited(&self) -> bool {
        self.kind == LlmErrorKind::RateLimited
    }
}

/// What went wrong with a model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LlmErrorKind {
    /// 429, requeued by the request queue
    #[error("Rate limited")]
    RateLimited,
    #[error("Server error")]
    ServerError,
    /// 4xx other than 429
    #[error("Client error")]
    ClientError,
    /// Connection failed or timed out
    #[error("Network error")]
    NetworkError,
    /// Response framing could not be decoded
    #[error("Parse error")]
    ParseError,
}

/// Parse HTTP status code into error kind.
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        400..=499 => LlmErrorKind::ClientError,
        _ => LlmErrorKind::ServerError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_classification() {
        assert_eq!(classify_http_status(429), LlmErrorKind::RateLimited);
        assert_eq!(classify_http_status(500), LlmErrorKind::ServerError);
        assert_eq!(classify_http_status(503), LlmErrorKind::ServerError);
        assert_eq!(classify_http_status(400), LlmErrorKind::ClientError);
        assert_eq!(classify_http_status(401), LlmErrorKind::ClientError);
    }

    #[test]
    fn test_only_429_is_rate_limit_signal() {
        assert!(LlmError::from_status(429, "slow down", None).is_rate_limited());
        assert!(!LlmError::from_status(503, "unavailable", None).is_rate_limited());
        assert!(!LlmError::network_error("reset").is_rate_limited());
    }

    #[test]
    fn test_display_includes_status() {
        let err = LlmError::client_error(401, "bad key");
        assert_eq!(err.to_string(), "Client error (HTTP 401): bad key");
        let err = LlmError::network_error("connection reset");
        assert_eq!(err.to_string(), "Network error: connection reset");
    }

    #[test]
    fn test_retry_after_kept_for_rate_limits() {
        let err = LlmError::from_status(429, "slow down", Some(Duration::from_secs(7)));
        assert_eq!(err.status_code, Some(429));
        assert_eq!(err.retry_after, Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_in_stream_errors_keep_provider_code() {
        let err = LlmError::in_stream(Some(429), "Rate limit exceeded");
        assert!(err.is_rate_limited());

        let err = LlmError::in_stream(None, "overloaded");
        assert_eq!(err.kind, LlmErrorKind::ServerError);
        assert_eq!(err.status_code, None);
        assert_eq!(err.to_string(), "Server error: overloaded");
    }
}
