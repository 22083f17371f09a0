//! Agent Core error types.
//!
//! `AgentError` is the request-level taxonomy. Provider failures
//! (`InferenceError`) fold into it via `From`; the HTTP layer maps each
//! variant to a status code.

use thiserror::Error;

use crate::inference::{ErrorKind, InferenceError};

/// Errors that can occur while handling one orchestrated request.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Malformed request, rejected before any provider call.
    #[error("{reason}")]
    ValidationError { reason: String },

    /// Missing credentials, or expired ones that could not be refreshed.
    #[error("{reason}")]
    AuthError { reason: String },

    /// Upstream 4xx/5xx, malformed payload, or timeout.
    #[error("{reason}")]
    ProviderError { reason: String },

    /// Tool dispatch failed (disallowed statement, bad identifier, executor).
    #[error("tool execution failed: {reason}")]
    ToolExecutionError { reason: String },

    /// Database operation failed.
    #[error("database error: {reason}")]
    DatabaseError { reason: String },

    /// Session not found.
    #[error("session not found: '{session_id}'")]
    SessionNotFound { session_id: String },

    /// Serialization error.
    #[error("serialization error: {reason}")]
    SerializationError { reason: String },

    /// The request was cancelled (client disconnect or stream timeout).
    #[error("request cancelled")]
    Cancelled,
}

impl AgentError {
    pub fn validation(reason: impl Into<String>) -> Self {
        AgentError::ValidationError {
            reason: reason.into(),
        }
    }

    /// The outward error class for this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::ValidationError { .. } | AgentError::SessionNotFound { .. } => {
                ErrorKind::Validation
            }
            AgentError::AuthError { .. } => ErrorKind::Auth,
            AgentError::ProviderError { .. } => ErrorKind::Provider,
            AgentError::ToolExecutionError { .. } => ErrorKind::ToolExecution,
            AgentError::Cancelled => ErrorKind::Timeout,
            AgentError::DatabaseError { .. } | AgentError::SerializationError { .. } => {
                ErrorKind::Internal
            }
        }
    }

    /// Rebuild an error from a canonical error event.
    pub fn from_event(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::Validation => AgentError::ValidationError { reason: message },
            ErrorKind::Auth => AgentError::AuthError { reason: message },
            ErrorKind::ToolExecution => AgentError::ToolExecutionError { reason: message },
            ErrorKind::Timeout => AgentError::Cancelled,
            ErrorKind::Provider | ErrorKind::Internal => AgentError::ProviderError { reason: message },
        }
    }
}

impl From<InferenceError> for AgentError {
    fn from(e: InferenceError) -> Self {
        if e.is_auth_error() {
            let reason = match e {
                InferenceError::AuthFailed { reason } => reason,
                other => other.upstream_message(),
            };
            return AgentError::AuthError { reason };
        }
        match e {
            InferenceError::UnknownProvider { name } => AgentError::ValidationError {
                reason: format!("unknown provider: '{name}'"),
            },
            other => AgentError::ProviderError {
                reason: other.upstream_message(),
            },
        }
    }
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::DatabaseError {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::SerializationError {
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_401_maps_to_auth_error() {
        let err: AgentError = InferenceError::HttpError {
            status: 401,
            body: r#"{"error":{"message":"invalid x-api-key"}}"#.into(),
        }
        .into();
        assert!(matches!(err, AgentError::AuthError { ref reason } if reason == "invalid x-api-key"));
        assert_eq!(err.kind(), ErrorKind::Auth);
    }

    #[test]
    fn test_refresh_failure_is_verbatim() {
        let err: AgentError = InferenceError::AuthFailed {
            reason: "token refresh failed: invalid_grant".into(),
        }
        .into();
        assert_eq!(err.to_string(), "token refresh failed: invalid_grant");
    }

    #[test]
    fn test_upstream_5xx_is_provider_error() {
        let err: AgentError = InferenceError::HttpError {
            status: 529,
            body: r#"{"message":"overloaded"}"#.into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Provider);
        assert_eq!(err.to_string(), "overloaded");
    }

    #[test]
    fn test_unknown_provider_is_validation() {
        let err: AgentError = InferenceError::UnknownProvider {
            name: "nope".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_from_event_round_trips_kind() {
        for kind in [ErrorKind::Validation, ErrorKind::Auth, ErrorKind::Provider, ErrorKind::ToolExecution] {
            assert_eq!(AgentError::from_event(kind, "m".into()).kind(), kind);
        }
        assert!(matches!(
            AgentError::from_event(ErrorKind::Timeout, "t".into()),
            AgentError::Cancelled
        ));
    }
}
