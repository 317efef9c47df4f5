//! Terminal wire protocol
//!
//! Every WebSocket text frame carries one JSON envelope of the form
//! `{"event": "terminal:<name>", "data": {...}}`. Inbound envelopes decode into
//! [`TerminalCommand`]s; [`SessionEvent`]s encode into outbound envelopes.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use codejoin_core::guardrails::RawInput;
use codejoin_core::session::{ExitReason, SessionContext, SessionEvent, TerminalCommand};
use codejoin_core::ErrorCode;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ServerError};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "terminal:start")]
    Start(SessionContext),
    #[serde(rename = "terminal:input", rename_all = "camelCase")]
    Input { session_id: String, input: RawInput },
    #[serde(rename = "terminal:resize", rename_all = "camelCase")]
    Resize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    #[serde(rename = "terminal:stop", rename_all = "camelCase")]
    Stop { session_id: String },
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| ServerError::invalid_request(format!("malformed terminal message: {}", e)))
    }
}

impl From<ClientMessage> for TerminalCommand {
    fn from(message: ClientMessage) -> Self {
        match message {
            ClientMessage::Start(context) => TerminalCommand::StartSession(context),
            ClientMessage::Input { session_id, input } => {
                TerminalCommand::SendInput { session_id, input }
            }
            ClientMessage::Resize {
                session_id,
                cols,
                rows,
            } => TerminalCommand::Resize {
                session_id,
                cols,
                rows,
            },
            ClientMessage::Stop { session_id } => TerminalCommand::StopSession { session_id },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "terminal:ready", rename_all = "camelCase")]
    Ready { session_id: String },
    #[serde(rename = "terminal:data", rename_all = "camelCase")]
    Data {
        session_id: String,
        chunk: String,
        /// Set to `base64` when the chunk is not valid UTF-8.
        #[serde(skip_serializing_if = "Option::is_none")]
        encoding: Option<&'static str>,
    },
    #[serde(rename = "terminal:error", rename_all = "camelCase")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },
    #[serde(rename = "terminal:exit", rename_all = "camelCase")]
    Exit {
        session_id: String,
        code: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<ExitReason>,
    },
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<SessionEvent> for ServerMessage {
    fn from(event: SessionEvent) -> Self {
        match event {
            SessionEvent::Ready { session_id } => ServerMessage::Ready { session_id },
            SessionEvent::Data { session_id, chunk } => match std::str::from_utf8(&chunk) {
                Ok(text) => ServerMessage::Data {
                    session_id,
                    chunk: text.to_string(),
                    encoding: None,
                },
                Err(_) => ServerMessage::Data {
                    session_id,
                    chunk: BASE64.encode(&chunk),
                    encoding: Some("base64"),
                },
            },
            SessionEvent::Error {
                session_id,
                message,
                code,
            } => ServerMessage::Error {
                session_id,
                message,
                code,
            },
            SessionEvent::Exit {
                session_id,
                code,
                reason,
            } => ServerMessage::Exit {
                session_id,
                code,
                reason,
            },
        }
    }
}
