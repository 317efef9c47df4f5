//! Error types for the CodeJoin server.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use codejoin_core::{ErrorCode, ExecError};
use serde_json::json;
use thiserror::Error;

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors that can occur in the CodeJoin server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Failure reported by the execution core
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid request format
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Server configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::Exec(e) => e.status_code(),
            ServerError::Json(_) | ServerError::InvalidRequest(_) => 400,
            ServerError::Io(_) | ServerError::Config(_) | ServerError::Internal(_) => 500,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServerError::Exec(e) => e.code(),
            ServerError::Json(_) | ServerError::InvalidRequest(_) => ErrorCode::InvalidMessage,
            ServerError::Config(_) => ErrorCode::ConfigError,
            ServerError::Io(_) | ServerError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            log::error!("Request failed: {}", self);
        } else {
            log::warn!("Request rejected: {}", self);
        }
        (
            status,
            Json(json!({
                "success": false,
                "error": self.to_string(),
                "code": self.error_code(),
                "timestamp": chrono::Utc::now()
            })),
        )
            .into_response()
    }
}
