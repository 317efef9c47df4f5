//! Error types for sandboxed execution and terminal sessions
//!
//! Failures are classified where they originate. The container engine client
//! turns transport and API failures into an [`EngineError`] by inspecting the
//! error variant it received, and everything above the runtime boundary works
//! with [`ExecError`], whose [`ErrorCode`] is a closed set that transports can
//! forward to clients unchanged.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-checkable error codes shared by the HTTP and terminal transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    UnsupportedLanguage,
    SecurityViolation,
    RuntimeUnavailable,
    ContainerError,
    SessionNotFound,
    SessionClosed,
    SessionLimit,
    InvalidMessage,
    ConfigError,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::UnsupportedLanguage => "UNSUPPORTED_LANGUAGE",
            ErrorCode::SecurityViolation => "SECURITY_VIOLATION",
            ErrorCode::RuntimeUnavailable => "RUNTIME_UNAVAILABLE",
            ErrorCode::ContainerError => "CONTAINER_ERROR",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::SessionClosed => "SESSION_CLOSED",
            ErrorCode::SessionLimit => "SESSION_LIMIT",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::ConfigError => "CONFIG_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Security violation: {0}")]
    SecurityViolation(String),
    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("Container runtime failed during {operation}: {message}")]
    ContainerRuntime { operation: String, message: String },
    #[error("session not found")]
    SessionNotFound(String),
    #[error("Session {0} is closed")]
    SessionClosed(String),
    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl ExecError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn container(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ContainerRuntime {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ExecError::UnsupportedLanguage(_) => ErrorCode::UnsupportedLanguage,
            ExecError::Validation(_) => ErrorCode::ValidationError,
            ExecError::SecurityViolation(_) => ErrorCode::SecurityViolation,
            ExecError::RuntimeUnavailable(_) => ErrorCode::RuntimeUnavailable,
            ExecError::ContainerRuntime { .. } => ErrorCode::ContainerError,
            ExecError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            ExecError::SessionClosed(_) => ErrorCode::SessionClosed,
            ExecError::LimitExceeded(_) => ErrorCode::SessionLimit,
            ExecError::Config(_) => ErrorCode::ConfigError,
            ExecError::Io(_) => ErrorCode::InternalError,
        }
    }

    /// HTTP status class for batch callers.
    pub fn status_code(&self) -> u16 {
        match self {
            ExecError::UnsupportedLanguage(_) | ExecError::Validation(_) => 400,
            ExecError::SecurityViolation(_) => 403,
            ExecError::SessionNotFound(_) => 404,
            ExecError::SessionClosed(_) => 409,
            ExecError::LimitExceeded(_) => 429,
            ExecError::RuntimeUnavailable(_) => 503,
            ExecError::ContainerRuntime { .. } | ExecError::Config(_) | ExecError::Io(_) => 500,
        }
    }

    /// Client-input errors are terminal for the request and never retried.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ExecError::UnsupportedLanguage(_)
                | ExecError::Validation(_)
                | ExecError::SecurityViolation(_)
        )
    }
}

impl From<std::io::Error> for ExecError {
    fn from(err: std::io::Error) -> Self {
        ExecError::Io(err.to_string())
    }
}

/// Failure reported by a [`ContainerEngine`](crate::runtime::ContainerEngine).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("container engine unreachable: {0}")]
    Unreachable(String),
    #[error("no such container or image: {0}")]
    NotFound(String),
    #[error("conflicting container state: {0}")]
    Conflict(String),
    #[error("container engine returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("container stream I/O failed: {0}")]
    Io(String),
}

impl EngineError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, EngineError::Unreachable(_))
    }

    /// Lift an engine failure into the public taxonomy, naming the operation
    /// that was in flight.
    pub fn into_exec(self, operation: &str) -> ExecError {
        match self {
            EngineError::Unreachable(msg) => ExecError::RuntimeUnavailable(msg),
            other => ExecError::container(operation, other.to_string()),
        }
    }
}

impl From<bollard::errors::Error> for EngineError {
    fn from(err: bollard::errors::Error) -> Self {
        use bollard::errors::Error as BollardError;
        match err {
            BollardError::DockerResponseServerError {
                status_code,
                message,
            } => match status_code {
                404 => EngineError::NotFound(message),
                409 => EngineError::Conflict(message),
                status => EngineError::Api { status, message },
            },
            BollardError::IOError { err } => EngineError::Unreachable(err.to_string()),
            BollardError::RequestTimeoutError => {
                EngineError::Unreachable("request to container engine timed out".to_string())
            }
            BollardError::SocketNotFoundError(path) => {
                EngineError::Unreachable(format!("socket not found: {}", path))
            }
            other => EngineError::Api {
                status: 500,
                message: other.to_string(),
            },
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_statuses() {
        let err = ExecError::UnsupportedLanguage("cobol".to_string());
        assert_eq!(err.code(), ErrorCode::UnsupportedLanguage);
        assert_eq!(err.status_code(), 400);
        assert!(err.is_client_error());

        let err = ExecError::RuntimeUnavailable("down".to_string());
        assert_eq!(err.code(), ErrorCode::RuntimeUnavailable);
        assert_eq!(err.status_code(), 503);
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_session_not_found_message() {
        let err = ExecError::SessionNotFound("abc".to_string());
        assert_eq!(err.to_string(), "session not found");
    }

    #[test]
    fn test_error_code_serialization() {
        let json = serde_json::to_string(&ErrorCode::SecurityViolation).unwrap();
        assert_eq!(json, "\"SECURITY_VIOLATION\"");
        assert_eq!(ErrorCode::SessionLimit.as_str(), "SESSION_LIMIT");
    }

    #[test]
    fn test_bollard_error_classification() {
        let not_found: EngineError = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container: x".to_string(),
        }
        .into();
        assert_eq!(not_found, EngineError::NotFound("No such container: x".to_string()));

        let timeout: EngineError = bollard::errors::Error::RequestTimeoutError.into();
        assert!(timeout.is_unreachable());

        let io: EngineError = bollard::errors::Error::IOError {
            err: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        }
        .into();
        assert!(io.is_unreachable());
    }

    #[test]
    fn test_engine_error_lifting() {
        let exec = EngineError::Unreachable("gone".to_string()).into_exec("create");
        assert_eq!(exec.code(), ErrorCode::RuntimeUnavailable);

        let exec = EngineError::Conflict("busy".to_string()).into_exec("remove");
        match exec {
            ExecError::ContainerRuntime { operation, .. } => assert_eq!(operation, "remove"),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
