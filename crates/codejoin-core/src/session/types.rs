//! Session data types, commands and events

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::{ErrorCode, ExecError};
use crate::guardrails::RawInput;

pub type SessionId = String;
pub type ConnectionId = String;

/// Outbound channel of one client connection.
pub type EventSink = mpsc::Sender<SessionEvent>;

/// `Starting -> Ready -> Active -> Stopping -> Closed`; `Starting` may go
/// straight to `Closed` when the container cannot be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Ready,
    Active,
    Stopping,
    Closed,
}

impl SessionStatus {
    /// Whether the session accepts input and resize requests.
    pub fn is_live(&self) -> bool {
        matches!(self, SessionStatus::Ready | SessionStatus::Active)
    }
}

/// Client-supplied parameters of a start request
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    pub language: String,
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
}

impl SessionContext {
    pub fn new(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            ..Default::default()
        }
    }
}

/// Typed commands decoded from the transport
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalCommand {
    StartSession(SessionContext),
    SendInput {
        session_id: SessionId,
        input: RawInput,
    },
    Resize {
        session_id: SessionId,
        cols: u16,
        rows: u16,
    },
    StopSession {
        session_id: SessionId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitReason {
    /// The program in the container exited on its own.
    Exited,
    Stopped,
    Idle,
    Lifetime,
    Disconnected,
    Shutdown,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Exited => "exited",
            ExitReason::Stopped => "stopped",
            ExitReason::Idle => "idle",
            ExitReason::Lifetime => "lifetime",
            ExitReason::Disconnected => "disconnected",
            ExitReason::Shutdown => "shutdown",
        }
    }
}

/// Events pushed to the owning connection
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Ready {
        session_id: SessionId,
    },
    Data {
        session_id: SessionId,
        chunk: Bytes,
    },
    Error {
        session_id: Option<SessionId>,
        message: String,
        code: Option<ErrorCode>,
    },
    Exit {
        session_id: SessionId,
        code: Option<i64>,
        reason: Option<ExitReason>,
    },
}

impl SessionEvent {
    pub fn from_error(session_id: Option<SessionId>, err: &ExecError) -> Self {
        SessionEvent::Error {
            session_id,
            message: err.to_string(),
            code: Some(err.code()),
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            SessionEvent::Ready { session_id }
            | SessionEvent::Data { session_id, .. }
            | SessionEvent::Exit { session_id, .. } => Some(session_id),
            SessionEvent::Error { session_id, .. } => session_id.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Ready(SessionId),
    /// The container engine is down. `first_notice` is set only for the first
    /// refusal a connection sees during an outage.
    Unavailable { first_notice: bool },
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub connection_id: ConnectionId,
    pub language: String,
    pub project_id: Option<String>,
    pub user_id: Option<String>,
    pub status: SessionStatus,
    pub container_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}
