//! Provider error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility — these types carry the context needed to build
//! meaningful log entries.

use thiserror::Error;

/// Errors that can occur while talking to an upstream model provider.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the provider endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The provider did not respond within the configured timeout.
    #[error("provider timeout after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// Non-2xx HTTP response from the provider.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// The response body could not be understood.
    #[error("malformed response: {reason}")]
    MalformedResponse { reason: String },

    /// Stream read or frame-level error.
    #[error("stream error: {reason}")]
    StreamError { reason: String },

    /// Failed to parse tool call arguments emitted by the model.
    #[error("tool call parse error: {reason}")]
    ToolCallParseError { raw_response: String, reason: String },

    /// Credentials are missing, or expired and could not be refreshed.
    #[error("authentication failed: {reason}")]
    AuthFailed { reason: String },

    /// The request named a provider that is not configured.
    #[error("unknown provider: '{name}'")]
    UnknownProvider { name: String },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl InferenceError {
    /// Whether the upstream rejected the credential (HTTP 401).
    ///
    /// Only this class of failure is eligible for a token refresh.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, InferenceError::HttpError { status: 401, .. })
    }

    /// Whether this error is terminal for authentication purposes.
    pub fn is_auth_error(&self) -> bool {
        self.is_auth_failure() || matches!(self, InferenceError::AuthFailed { .. })
    }

    /// Extract the error body text, if this is an `HttpError`.
    pub fn error_body(&self) -> Option<&str> {
        match self {
            InferenceError::HttpError { body, .. } => Some(body),
            _ => None,
        }
    }

    /// The message to surface to the caller.
    ///
    /// For HTTP errors this digs `error.message` (or `message`) out of a JSON
    /// body, which is where OpenAI, Anthropic and most gateways put it.
    pub fn upstream_message(&self) -> String {
        match self {
            InferenceError::HttpError { status, body } => {
                let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
                let message = parsed.as_ref().and_then(|v| {
                    v.get("error")
                        .and_then(|e| e.get("message").or(Some(e)))
                        .or_else(|| v.get("message"))
                        .and_then(|m| m.as_str())
                        .map(String::from)
                });
                match message {
                    Some(m) => m,
                    None if body.trim().is_empty() => format!("upstream returned HTTP {status}"),
                    None => body.clone(),
                }
            }
            InferenceError::MalformedResponse { .. } => "malformed response".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for InferenceError {
    fn from(e: reqwest::Error) -> Self {
        let endpoint = e
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        if e.is_timeout() {
            InferenceError::Timeout { duration_secs: 0 }
        } else if e.is_decode() {
            InferenceError::MalformedResponse {
                reason: e.to_string(),
            }
        } else {
            InferenceError::ConnectionFailed {
                endpoint,
                reason: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_auth_failure_only_for_401() {
        let err = InferenceError::HttpError {
            status: 401,
            body: "expired".to_string(),
        };
        assert!(err.is_auth_failure());

        let err = InferenceError::HttpError {
            status: 403,
            body: "forbidden".to_string(),
        };
        assert!(!err.is_auth_failure());
        assert!(!InferenceError::Timeout { duration_secs: 5 }.is_auth_failure());
    }

    #[test]
    fn test_auth_failed_is_auth_error() {
        let err = InferenceError::AuthFailed {
            reason: "refresh rejected".into(),
        };
        assert!(err.is_auth_error());
        assert!(!err.is_auth_failure());
    }

    #[test]
    fn test_upstream_message_from_openai_body() {
        let err = InferenceError::HttpError {
            status: 400,
            body: r#"{"error":{"message":"model not found","type":"invalid_request_error"}}"#
                .to_string(),
        };
        assert_eq!(err.upstream_message(), "model not found");
    }

    #[test]
    fn test_upstream_message_plain_body() {
        let err = InferenceError::HttpError {
            status: 502,
            body: "bad gateway".to_string(),
        };
        assert_eq!(err.upstream_message(), "bad gateway");
    }

    #[test]
    fn test_upstream_message_empty_body() {
        let err = InferenceError::HttpError {
            status: 503,
            body: String::new(),
        };
        assert_eq!(err.upstream_message(), "upstream returned HTTP 503");
    }

    #[test]
    fn test_upstream_message_malformed() {
        let err = InferenceError::MalformedResponse {
            reason: "expected value at line 1".into(),
        };
        assert_eq!(err.upstream_message(), "malformed response");
    }

    #[test]
    fn test_error_body_non_http() {
        let err = InferenceError::Timeout { duration_secs: 5 };
        assert!(err.error_body().is_none());
    }
}
