//! Interactive terminal sessions
//!
//! A [`SessionManager`] is constructed once per process and owns the table of
//! live sessions. Each session binds one tty container to one client
//! connection. Two tasks run per session: a writer draining guarded input
//! into the pty, and a reader framing pty output through a
//! [`StreamProcessor`](crate::stream::StreamProcessor) and pushing it to the
//! connection's event sink.
//!
//! Every exit path (stop, disconnect, reaping, shutdown, the program exiting)
//! funnels into one teardown that kills and removes the container exactly
//! once and leaves the session `Closed` and out of the table.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::{BoxStream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::errors::{EngineError, ExecError};
use crate::guardrails::{InputGuard, LineTracker, RawInput};
use crate::languages::LanguageRegistry;
use crate::runtime::{ContainerRuntime, InteractiveContainer};
use crate::stream::{StreamConfig, StreamProcessor};

pub mod types;

pub use types::*;

#[cfg(test)]
mod tests;

const INPUT_QUEUE_DEPTH: usize = 256;
const EXIT_STATUS_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_TERMINAL_DIMENSION: u16 = 1000;
const KILL_LINE: &[u8] = b"\x15";

struct SlotState {
    status: SessionStatus,
    container_id: Option<String>,
    input_tx: Option<mpsc::Sender<Bytes>>,
    tracker: LineTracker,
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

struct SessionSlot {
    id: SessionId,
    connection_id: ConnectionId,
    language: String,
    project_id: Option<String>,
    user_id: Option<String>,
    created_at: DateTime<Utc>,
    created: Instant,
    sink: EventSink,
    processor: Mutex<StreamProcessor>,
    state: Mutex<SlotState>,
}

impl SessionSlot {
    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn processor(&self) -> MutexGuard<'_, StreamProcessor> {
        self.processor.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn touch(&self) {
        let mut state = self.state();
        state.last_activity = Instant::now();
        state.last_activity_at = Utc::now();
    }

    fn info(&self) -> SessionInfo {
        let state = self.state();
        SessionInfo {
            id: self.id.clone(),
            connection_id: self.connection_id.clone(),
            language: self.language.clone(),
            project_id: self.project_id.clone(),
            user_id: self.user_id.clone(),
            status: state.status,
            container_id: state.container_id.clone(),
            created_at: self.created_at,
            last_activity: state.last_activity_at,
        }
    }
}

/// Who is tearing the session down; the reader must not abort itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Reader,
    External,
}

struct Inner {
    runtime: ContainerRuntime,
    registry: Arc<LanguageRegistry>,
    guard: InputGuard,
    config: SessionConfig,
    sessions: RwLock<HashMap<SessionId, Arc<SessionSlot>>>,
    notified: Mutex<HashSet<ConnectionId>>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        runtime: ContainerRuntime,
        registry: Arc<LanguageRegistry>,
        config: SessionConfig,
        max_input_bytes: usize,
    ) -> Result<Self, ExecError> {
        Ok(Self {
            inner: Arc::new(Inner {
                runtime,
                registry,
                guard: InputGuard::new(max_input_bytes)?,
                config,
                sessions: RwLock::new(HashMap::new()),
                notified: Mutex::new(HashSet::new()),
            }),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    fn sessions_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<SessionId, Arc<SessionSlot>>> {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sessions_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<SessionId, Arc<SessionSlot>>> {
        self.inner
            .sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notified(&self) -> MutexGuard<'_, HashSet<ConnectionId>> {
        self.inner
            .notified
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot(&self, session_id: &str) -> Option<Arc<SessionSlot>> {
        self.sessions_read().get(session_id).cloned()
    }

    /// A slot the connection may address; anything else is "not found".
    fn owned_slot(&self, connection_id: &str, session_id: &str) -> Result<Arc<SessionSlot>, ExecError> {
        match self.slot(session_id) {
            Some(slot) if slot.connection_id == connection_id && slot.state().status.is_live() => Ok(slot),
            _ => Err(ExecError::SessionNotFound(session_id.to_string())),
        }
    }

    pub fn count(&self) -> usize {
        self.sessions_read().len()
    }

    pub fn count_for(&self, connection_id: &str) -> usize {
        self.sessions_read()
            .values()
            .filter(|slot| slot.connection_id == connection_id)
            .count()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions_read().values().map(|slot| slot.info()).collect()
    }

    pub fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.slot(session_id).map(|slot| slot.info())
    }

    /// Start a session for `connection_id`.
    ///
    /// The `ready` event is the first event the session pushes to `sink`.
    /// When the engine is down no session is created; the outcome says
    /// whether this connection has already been told about the outage.
    pub async fn start(
        &self,
        connection_id: &str,
        context: SessionContext,
        sink: EventSink,
    ) -> Result<StartOutcome, ExecError> {
        let profile = self.inner.registry.lookup(&context.language)?;
        let cols = context.cols.unwrap_or(self.inner.config.default_cols);
        let rows = context.rows.unwrap_or(self.inner.config.default_rows);
        validate_size(cols, rows)?;

        match self.inner.runtime.ping().await {
            Ok(()) => {
                if self.notified().remove(connection_id) {
                    log::info!("Container runtime reachable again for connection {}", connection_id);
                }
            }
            Err(ExecError::RuntimeUnavailable(reason)) => {
                return Ok(self.outage(connection_id, &reason));
            }
            Err(e) => return Err(e),
        }

        let session_id = Uuid::new_v4().to_string();
        let now = Instant::now();
        let slot = Arc::new(SessionSlot {
            id: session_id.clone(),
            connection_id: connection_id.to_string(),
            language: profile.id.clone(),
            project_id: context.project_id.clone(),
            user_id: context.user_id.clone(),
            created_at: Utc::now(),
            created: now,
            sink,
            processor: Mutex::new(StreamProcessor::new(StreamConfig::new(
                profile.prompt,
                self.inner.config.stream_buffer_bytes,
                self.inner.config.fix_line_endings,
            ))),
            state: Mutex::new(SlotState {
                status: SessionStatus::Starting,
                container_id: None,
                input_tx: None,
                tracker: LineTracker::new(),
                last_activity: now,
                last_activity_at: Utc::now(),
                reader: None,
                writer: None,
            }),
        });

        {
            let mut sessions = self.sessions_write();
            if sessions.len() >= self.inner.config.max_sessions {
                return Err(ExecError::LimitExceeded(format!(
                    "server is at its limit of {} terminal sessions",
                    self.inner.config.max_sessions
                )));
            }
            let owned = sessions
                .values()
                .filter(|s| s.connection_id == connection_id)
                .count();
            if owned >= self.inner.config.max_sessions_per_connection {
                return Err(ExecError::LimitExceeded(format!(
                    "a connection may hold at most {} terminal sessions",
                    self.inner.config.max_sessions_per_connection
                )));
            }
            sessions.insert(session_id.clone(), Arc::clone(&slot));
        }

        let container = match self
            .inner
            .runtime
            .create_interactive(&profile, &session_id, cols, rows)
            .await
        {
            Ok(container) => container,
            Err(e) => {
                slot.state().status = SessionStatus::Closed;
                self.sessions_write().remove(&session_id);
                return match e {
                    ExecError::RuntimeUnavailable(reason) => Ok(self.outage(connection_id, &reason)),
                    e => {
                        log::warn!("Session {} failed to start: {}", session_id, e);
                        Err(e)
                    }
                };
            }
        };

        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
        let InteractiveContainer { id: container_id, streams } = container;
        let stopped = {
            let mut state = slot.state();
            if state.status == SessionStatus::Starting {
                state.status = SessionStatus::Ready;
                state.container_id = Some(container_id.clone());
                state.input_tx = Some(input_tx);
                state.writer = Some(tokio::spawn(pump_input(streams.input, input_rx)));
                state.reader = Some(tokio::spawn(pump_output(
                    Arc::downgrade(&self.inner),
                    Arc::clone(&slot),
                    streams.output,
                    self.inner.config.flush_interval(),
                )));
                false
            } else {
                true
            }
        };
        if stopped {
            log::info!("Session {} was stopped while starting", session_id);
            self.inner.runtime.destroy(&container_id).await;
            self.sessions_write().remove(&session_id);
            return Err(ExecError::SessionClosed(session_id));
        }

        log::info!(
            "Session {} ready: language={} connection={} container={}",
            session_id,
            profile.id,
            connection_id,
            container_id
        );
        Ok(StartOutcome::Ready(session_id))
    }

    /// Record an engine outage seen while starting; only the first one per
    /// connection is worth telling the client about.
    fn outage(&self, connection_id: &str, reason: &str) -> StartOutcome {
        let first_notice = self.notified().insert(connection_id.to_string());
        if first_notice {
            log::warn!(
                "Refusing session for connection {}: container runtime unavailable ({})",
                connection_id,
                reason
            );
        } else {
            log::debug!(
                "Refusing session for connection {}: container runtime still unavailable",
                connection_id
            );
        }
        StartOutcome::Unavailable { first_notice }
    }

    /// Stop a session. Unknown, closed and foreign ids are a no-op.
    pub async fn stop(&self, connection_id: &str, session_id: &str) {
        match self.slot(session_id) {
            Some(slot) if slot.connection_id == connection_id => {
                teardown(&self.inner, &slot, ExitReason::Stopped, true, Origin::External).await;
            }
            Some(_) => log::debug!(
                "Connection {} tried to stop session {} it does not own",
                connection_id,
                session_id
            ),
            None => log::debug!("Stop for unknown session {}", session_id),
        }
    }

    /// Guard and forward keystrokes. Never waits for the pty.
    pub fn input(&self, connection_id: &str, session_id: &str, raw: RawInput) -> Result<(), ExecError> {
        let slot = self.owned_slot(connection_id, session_id)?;
        let bytes = self.inner.guard.inspect(raw)?;
        if bytes.is_empty() {
            return Ok(());
        }

        let mut state = slot.state();
        if let Err(e) = self.inner.guard.check_submitted(&mut state.tracker, &bytes) {
            // discard what was typed so far instead of leaving it on the prompt
            if let Some(tx) = &state.input_tx {
                let _ = tx.try_send(Bytes::from_static(KILL_LINE));
            }
            return Err(e);
        }

        let bytes = slot.processor().process_input(&bytes);
        let tx = state
            .input_tx
            .as_ref()
            .ok_or_else(|| ExecError::SessionNotFound(session_id.to_string()))?;
        match tx.try_send(bytes) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                return Err(ExecError::LimitExceeded(
                    "terminal input is arriving faster than the session consumes it".to_string(),
                ))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(ExecError::SessionClosed(session_id.to_string()))
            }
        }

        if state.status == SessionStatus::Ready {
            state.status = SessionStatus::Active;
        }
        state.last_activity = Instant::now();
        state.last_activity_at = Utc::now();
        Ok(())
    }

    /// Forward a terminal size change; the engine call runs detached.
    pub fn resize(&self, connection_id: &str, session_id: &str, cols: u16, rows: u16) -> Result<(), ExecError> {
        validate_size(cols, rows)?;
        let slot = self.owned_slot(connection_id, session_id)?;
        let container_id = slot
            .state()
            .container_id
            .clone()
            .ok_or_else(|| ExecError::SessionNotFound(session_id.to_string()))?;

        let runtime = self.inner.runtime.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = runtime.resize(&container_id, cols, rows).await {
                log::debug!("Resize of session {} failed: {}", session_id, e);
            }
        });
        Ok(())
    }

    /// Stop every session owned by a connection that went away.
    pub async fn on_disconnect(&self, connection_id: &str) {
        let owned: Vec<Arc<SessionSlot>> = self
            .sessions_read()
            .values()
            .filter(|slot| slot.connection_id == connection_id)
            .cloned()
            .collect();
        if !owned.is_empty() {
            log::info!(
                "Connection {} closed, stopping {} session(s)",
                connection_id,
                owned.len()
            );
        }
        for slot in owned {
            teardown(&self.inner, &slot, ExitReason::Disconnected, false, Origin::External).await;
        }
        self.notified().remove(connection_id);
    }

    /// Stop sessions idle past the idle timeout or older than the maximum
    /// lifetime. Returns how many were stopped.
    pub async fn reap_idle(&self) -> usize {
        self.reap_idle_at(Instant::now()).await
    }

    pub(crate) async fn reap_idle_at(&self, now: Instant) -> usize {
        let idle_limit = self.inner.config.idle_timeout();
        let lifetime_limit = self.inner.config.max_lifetime();
        if idle_limit.is_none() && lifetime_limit.is_none() {
            return 0;
        }

        let expired: Vec<(Arc<SessionSlot>, ExitReason)> = self
            .sessions_read()
            .values()
            .filter_map(|slot| {
                let state = slot.state();
                if !state.status.is_live() {
                    return None;
                }
                let age = now.saturating_duration_since(slot.created);
                let idle = now.saturating_duration_since(state.last_activity);
                if lifetime_limit.is_some_and(|limit| age >= limit) {
                    return Some((Arc::clone(slot), ExitReason::Lifetime));
                }
                if idle_limit.is_some_and(|limit| idle >= limit) {
                    return Some((Arc::clone(slot), ExitReason::Idle));
                }
                None
            })
            .collect();

        let count = expired.len();
        for (slot, reason) in expired {
            log::info!("Reaping session {} ({})", slot.id, reason.as_str());
            teardown(&self.inner, &slot, reason, true, Origin::External).await;
        }
        count
    }

    pub async fn shutdown_all(&self) {
        let all: Vec<Arc<SessionSlot>> = self.sessions_read().values().cloned().collect();
        if !all.is_empty() {
            log::info!("Stopping {} terminal session(s) for shutdown", all.len());
        }
        for slot in all {
            teardown(&self.inner, &slot, ExitReason::Shutdown, true, Origin::External).await;
        }
    }

    /// Execute one transport command, reporting failures on `sink`.
    pub async fn dispatch(&self, connection_id: &str, command: TerminalCommand, sink: &EventSink) {
        let (session_id, result) = match command {
            TerminalCommand::StartSession(context) => {
                match self.start(connection_id, context, sink.clone()).await {
                    Ok(StartOutcome::Ready(_)) => (None, Ok(())),
                    Ok(StartOutcome::Unavailable { first_notice: true }) => (
                        None,
                        Err(ExecError::RuntimeUnavailable(
                            "the code execution runtime is temporarily unavailable".to_string(),
                        )),
                    ),
                    Ok(StartOutcome::Unavailable { first_notice: false }) => (None, Ok(())),
                    Err(e) => (None, Err(e)),
                }
            }
            TerminalCommand::SendInput { session_id, input } => {
                let result = self.input(connection_id, &session_id, input);
                (Some(session_id), result)
            }
            TerminalCommand::Resize {
                session_id,
                cols,
                rows,
            } => {
                let result = self.resize(connection_id, &session_id, cols, rows);
                (Some(session_id), result)
            }
            TerminalCommand::StopSession { session_id } => {
                self.stop(connection_id, &session_id).await;
                (Some(session_id), Ok(()))
            }
        };

        if let Err(e) = result {
            log::debug!("Terminal command from {} rejected: {}", connection_id, e);
            let _ = sink.send(SessionEvent::from_error(session_id, &e)).await;
        }
    }
}

fn validate_size(cols: u16, rows: u16) -> Result<(), ExecError> {
    if cols == 0 || rows == 0 || cols > MAX_TERMINAL_DIMENSION || rows > MAX_TERMINAL_DIMENSION {
        return Err(ExecError::validation(format!(
            "terminal size {}x{} is out of range",
            cols, rows
        )));
    }
    Ok(())
}

/// Move a session to `Closed`, destroying its container. Idempotent: only
/// the first caller does any work.
async fn teardown(inner: &Inner, slot: &Arc<SessionSlot>, reason: ExitReason, notify: bool, origin: Origin) {
    let (container_id, reader, writer) = {
        let mut state = slot.state();
        match state.status {
            SessionStatus::Stopping | SessionStatus::Closed => return,
            _ => state.status = SessionStatus::Stopping,
        }
        state.input_tx = None;
        (state.container_id.take(), state.reader.take(), state.writer.take())
    };

    if let Some(writer) = writer {
        writer.abort();
    }
    if let Some(reader) = reader {
        if origin == Origin::External {
            reader.abort();
        }
    }

    let mut exit_code = None;
    if let Some(container_id) = &container_id {
        if reason == ExitReason::Exited {
            exit_code = match tokio::time::timeout(EXIT_STATUS_TIMEOUT, inner.runtime.wait(container_id)).await {
                Ok(Ok(code)) => Some(code),
                Ok(Err(e)) => {
                    log::debug!("No exit status for session {}: {}", slot.id, e);
                    None
                }
                Err(_) => None,
            };
        }
        inner.runtime.destroy(container_id).await;
    }

    slot.state().status = SessionStatus::Closed;
    {
        let mut sessions = inner
            .sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions.remove(&slot.id);
    }
    log::info!("Session {} closed ({})", slot.id, reason.as_str());

    if notify {
        let _ = slot
            .sink
            .send(SessionEvent::Exit {
                session_id: slot.id.clone(),
                code: exit_code,
                reason: Some(reason),
            })
            .await;
    }
}

async fn pump_input(mut input: Pin<Box<dyn AsyncWrite + Send>>, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = input.write_all(&bytes).await {
            log::debug!("Pty write failed: {}", e);
            break;
        }
        if let Err(e) = input.flush().await {
            log::debug!("Pty flush failed: {}", e);
            break;
        }
    }
    let _ = input.shutdown().await;
}

async fn pump_output(
    inner: Weak<Inner>,
    slot: Arc<SessionSlot>,
    mut output: BoxStream<'static, Result<Bytes, EngineError>>,
    flush_interval: Duration,
) {
    if slot
        .sink
        .send(SessionEvent::Ready {
            session_id: slot.id.clone(),
        })
        .await
        .is_err()
    {
        log::debug!("Connection for session {} went away before ready", slot.id);
    }

    let mut connected = true;
    while connected {
        let pending = slot.processor().buffered() > 0;
        let next = if pending {
            match tokio::time::timeout(flush_interval, output.next()).await {
                Ok(next) => next,
                Err(_) => {
                    let chunk = slot.processor().flush();
                    if let Some(chunk) = chunk {
                        connected = send_chunk(&slot, chunk).await;
                    }
                    continue;
                }
            }
        } else {
            output.next().await
        };

        match next {
            Some(Ok(bytes)) => {
                slot.touch();
                let chunks = slot.processor().push(&bytes);
                for chunk in chunks {
                    if !send_chunk(&slot, chunk).await {
                        connected = false;
                        break;
                    }
                }
            }
            Some(Err(e)) => {
                log::debug!("Pty stream of session {} failed: {}", slot.id, e);
                break;
            }
            None => break,
        }
    }

    if !connected {
        // the connection is gone; disconnect handling owns the teardown
        return;
    }

    let rest = slot.processor().finish();
    if let Some(chunk) = rest {
        send_chunk(&slot, chunk).await;
    }
    if let Some(inner) = inner.upgrade() {
        teardown(&inner, &slot, ExitReason::Exited, true, Origin::Reader).await;
    }
}

async fn send_chunk(slot: &SessionSlot, chunk: Bytes) -> bool {
    slot.sink
        .send(SessionEvent::Data {
            session_id: slot.id.clone(),
            chunk,
        })
        .await
        .is_ok()
}
