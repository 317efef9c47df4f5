//! WebSocket bridge between browser terminals and the session manager
//!
//! One socket is one connection: it gets a fresh connection id, a bounded
//! event channel that every session it starts reports into, and on close all
//! of its sessions are stopped. Starts run off the read loop so a slow image
//! pull never holds up input for sessions that are already live.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use codejoin_core::session::{EventSink, SessionEvent, SessionManager, TerminalCommand};
use codejoin_core::ErrorCode;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::protocol::{ClientMessage, ServerMessage};
use crate::AppState;

/// Handler for the /ws/terminal GET endpoint.
pub async fn terminal_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let sessions = state.sessions.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, sessions))
}

async fn handle_socket(socket: WebSocket, sessions: SessionManager) {
    let connection_id = Uuid::new_v4().to_string();
    log::info!("Terminal connection {} opened", connection_id);

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (sink, mut events) = mpsc::channel::<SessionEvent>(sessions.config().event_buffer.max(1));

    let forward_id = connection_id.clone();
    let forward = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match ServerMessage::from(event).to_json() {
                Ok(text) => text,
                Err(e) => {
                    log::error!("Failed to encode terminal event for {}: {}", forward_id, e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                log::debug!("Terminal connection {} stopped accepting events", forward_id);
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut starts = JoinSet::new();
    while let Some(frame) = ws_rx.next().await {
        while starts.try_join_next().is_some() {}
        match frame {
            Ok(Message::Text(text)) => {
                handle_text(&sessions, &connection_id, text.as_str(), &sink, &mut starts).await;
            }
            Ok(Message::Binary(_)) => {
                report(&sink, "binary frames are not supported", ErrorCode::InvalidMessage).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                log::debug!("Terminal connection {} failed: {}", connection_id, e);
                break;
            }
        }
    }

    // a start still in flight would otherwise register after the cleanup
    while starts.join_next().await.is_some() {}
    sessions.on_disconnect(&connection_id).await;
    drop(sink);
    forward.abort();
    log::info!("Terminal connection {} closed", connection_id);
}

async fn handle_text(
    sessions: &SessionManager,
    connection_id: &str,
    text: &str,
    sink: &EventSink,
    starts: &mut JoinSet<()>,
) {
    let command = match ClientMessage::parse(text) {
        Ok(message) => TerminalCommand::from(message),
        Err(e) => {
            log::debug!("Bad terminal message from {}: {}", connection_id, e);
            report(sink, e.to_string(), ErrorCode::InvalidMessage).await;
            return;
        }
    };

    if matches!(command, TerminalCommand::StartSession(_)) {
        let sessions = sessions.clone();
        let connection_id = connection_id.to_string();
        let sink = sink.clone();
        starts.spawn(async move {
            sessions.dispatch(&connection_id, command, &sink).await;
        });
    } else {
        sessions.dispatch(connection_id, command, sink).await;
    }
}

async fn report(sink: &EventSink, message: impl Into<String>, code: ErrorCode) {
    let _ = sink
        .send(SessionEvent::Error {
            session_id: None,
            message: message.into(),
            code: Some(code),
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use codejoin_core::config::SessionConfig;
    use codejoin_core::runtime::{ContainerRuntime, MockEngine};
    use codejoin_core::LanguageRegistry;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_malformed_text_is_reported_on_the_sink() {
        let runtime = ContainerRuntime::new(Arc::new(MockEngine::new()), true);
        let sessions = SessionManager::new(
            runtime,
            Arc::new(LanguageRegistry::builtin()),
            SessionConfig::default(),
            4096,
        )
        .unwrap();
        let (sink, mut rx) = mpsc::channel(8);
        let mut starts = JoinSet::new();

        handle_text(
            &sessions,
            "conn-1",
            "{\"event\":\"terminal:nope\"}",
            &sink,
            &mut starts,
        )
        .await;
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            SessionEvent::Error { session_id, code, .. } => {
                assert_eq!(session_id, None);
                assert_eq!(code, Some(ErrorCode::InvalidMessage));
            }
            other => panic!("expected an error event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_text_commands_reach_the_session_manager() {
        let engine = Arc::new(MockEngine::new());
        let runtime = ContainerRuntime::new(engine.clone(), true);
        let sessions = SessionManager::new(
            runtime,
            Arc::new(LanguageRegistry::builtin()),
            SessionConfig::default(),
            4096,
        )
        .unwrap();
        let (sink, mut rx) = mpsc::channel(8);
        let mut starts = JoinSet::new();

        handle_text(
            &sessions,
            "conn-1",
            r#"{"event":"terminal:start","data":{"language":"bash"}}"#,
            &sink,
            &mut starts,
        )
        .await;
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, SessionEvent::Ready { .. }));
        assert_eq!(sessions.count_for("conn-1"), 1);
        assert_eq!(engine.live_count(), 1);

        sessions.on_disconnect("conn-1").await;
        assert_eq!(engine.live_count(), 0);
    }

    fn text(event: &str, data: serde_json::Value) -> String {
        serde_json::json!({ "event": event, "data": data }).to_string()
    }

    #[tokio::test]
    async fn test_pending_start_does_not_hold_up_other_sessions() {
        let engine = Arc::new(MockEngine::new().with_create_delay(Duration::from_millis(300)));
        let runtime = ContainerRuntime::new(engine.clone(), true);
        let sessions = SessionManager::new(
            runtime,
            Arc::new(LanguageRegistry::builtin()),
            SessionConfig::default(),
            4096,
        )
        .unwrap();
        let (sink, mut rx) = mpsc::channel(16);
        let mut starts = JoinSet::new();
        let start = text("terminal:start", serde_json::json!({ "language": "bash" }));

        handle_text(&sessions, "conn-1", &start, &sink, &mut starts).await;
        let first = match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(SessionEvent::Ready { session_id })) => session_id,
            other => panic!("expected ready, got {:?}", other),
        };

        while starts.join_next().await.is_some() {}

        // the second start is now parked in the slow create
        handle_text(&sessions, "conn-1", &start, &sink, &mut starts).await;
        assert_eq!(starts.len(), 1);

        let resize = text(
            "terminal:resize",
            serde_json::json!({ "sessionId": first, "cols": 100, "rows": 30 }),
        );
        let stop = text("terminal:stop", serde_json::json!({ "sessionId": first }));
        tokio::time::timeout(Duration::from_millis(100), async {
            handle_text(&sessions, "conn-1", &resize, &sink, &mut starts).await;
            handle_text(&sessions, "conn-1", &stop, &sink, &mut starts).await;
        })
        .await
        .expect("commands for a live session are handled while a start is pending");

        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(SessionEvent::Exit { session_id, .. })) => assert_eq!(session_id, first),
            other => panic!("expected exit of the first session, got {:?}", other),
        }
        assert!(sessions.get(&first).is_none());

        while starts.join_next().await.is_some() {}
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(SessionEvent::Ready { session_id })) => assert_ne!(session_id, first),
            other => panic!("expected the second session to become ready, got {:?}", other),
        }
        assert_eq!(sessions.count_for("conn-1"), 1);
    }
}
