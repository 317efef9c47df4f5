//! In-memory container engine
//!
//! Used by the orchestrator, session and router tests so that none of them
//! needs a container daemon. Batch containers "run" for a configurable time
//! and then exit with canned output. Interactive containers echo whatever is
//! written to their pty and exit when a line reading `exit` is submitted.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};

use super::policy::LABEL_MANAGED;
use super::{CapturedOutput, ContainerEngine, ContainerSpec, PtyStreams};
use crate::errors::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockState {
    Created,
    Running,
    Exited(i64),
}

struct MockContainer {
    spec: ContainerSpec,
    state: Arc<watch::Sender<MockState>>,
}

#[derive(Default)]
struct MockInner {
    next_id: u64,
    containers: HashMap<String, MockContainer>,
    created: Vec<ContainerSpec>,
    killed: Vec<String>,
    removed: Vec<String>,
    resizes: Vec<(String, u16, u16)>,
    pulled: Vec<String>,
    pty_input: HashMap<String, Arc<Mutex<Vec<u8>>>>,
}

pub struct MockEngine {
    inner: Mutex<MockInner>,
    unreachable: AtomicBool,
    fail_create: AtomicBool,
    fail_start: AtomicBool,
    fail_attach: AtomicBool,
    exit_code: i64,
    stdout: String,
    stderr: String,
    run_duration: Duration,
    create_delay: Duration,
    banner: Option<String>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MockInner::default()),
            unreachable: AtomicBool::new(false),
            fail_create: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            fail_attach: AtomicBool::new(false),
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            run_duration: Duration::from_millis(10),
            create_delay: Duration::ZERO,
            banner: None,
        }
    }

    pub fn with_output(mut self, stdout: &str, stderr: &str) -> Self {
        self.stdout = stdout.to_string();
        self.stderr = stderr.to_string();
        self
    }

    pub fn with_exit_code(mut self, code: i64) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_run_duration(mut self, duration: Duration) -> Self {
        self.run_duration = duration;
        self
    }

    /// Time `create` spends before talking to the engine, like a slow pull.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Bytes written to every pty as soon as it is attached.
    pub fn with_banner(mut self, banner: &str) -> Self {
        self.banner = Some(banner.to_string());
        self
    }

    pub fn set_unreachable(&self, value: bool) {
        self.unreachable.store(value, Ordering::SeqCst);
    }

    pub fn set_fail_create(&self, value: bool) {
        self.fail_create.store(value, Ordering::SeqCst);
    }

    pub fn set_fail_start(&self, value: bool) {
        self.fail_start.store(value, Ordering::SeqCst);
    }

    pub fn set_fail_attach(&self, value: bool) {
        self.fail_attach.store(value, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.lock().created.clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.lock().killed.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.lock().removed.clone()
    }

    pub fn resizes(&self) -> Vec<(String, u16, u16)> {
        self.lock().resizes.clone()
    }

    pub fn pulled_images(&self) -> Vec<String> {
        self.lock().pulled.clone()
    }

    /// Containers created and not yet removed.
    pub fn live_count(&self) -> usize {
        self.lock().containers.len()
    }

    pub fn live_ids(&self) -> Vec<String> {
        self.lock().containers.keys().cloned().collect()
    }

    pub fn state_of(&self, id: &str) -> Option<MockState> {
        self.lock().containers.get(id).map(|c| *c.state.borrow())
    }

    /// Everything written to the pty of container `id` so far.
    pub fn pty_input(&self, id: &str) -> Vec<u8> {
        self.lock()
            .pty_input
            .get(id)
            .map(|buf| buf.lock().map(|b| b.clone()).unwrap_or_default())
            .unwrap_or_default()
    }

    /// Make a running container exit on its own.
    pub fn exit_container(&self, id: &str, code: i64) {
        if let Some(container) = self.lock().containers.get(id) {
            container.state.send_replace(MockState::Exited(code));
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_reachable(&self) -> Result<(), EngineError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(EngineError::Unreachable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }

    fn state_handle(&self, id: &str) -> Result<Arc<watch::Sender<MockState>>, EngineError> {
        self.lock()
            .containers
            .get(id)
            .map(|c| Arc::clone(&c.state))
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }
}

async fn echo_pty(
    mut server: tokio::io::DuplexStream,
    tx: mpsc::UnboundedSender<Bytes>,
    state: Arc<watch::Sender<MockState>>,
    mut state_rx: watch::Receiver<MockState>,
    record: Arc<Mutex<Vec<u8>>>,
    banner: Option<String>,
) {
    if let Some(banner) = banner {
        let _ = tx.send(Bytes::from(banner));
    }

    let mut line = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        if matches!(*state_rx.borrow_and_update(), MockState::Exited(_)) {
            break;
        }
        tokio::select! {
            read = server.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let chunk = &buf[..n];
                if let Ok(mut rec) = record.lock() {
                    rec.extend_from_slice(chunk);
                }
                if tx.send(Bytes::copy_from_slice(chunk)).is_err() {
                    break;
                }
                let mut exit_requested = false;
                for &b in chunk {
                    if b == b'\n' || b == b'\r' {
                        if String::from_utf8_lossy(&line).trim() == "exit" {
                            exit_requested = true;
                        }
                        line.clear();
                    } else {
                        line.push(b);
                    }
                }
                if exit_requested {
                    state.send_replace(MockState::Exited(0));
                    break;
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() || matches!(*state_rx.borrow(), MockState::Exited(_)) {
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    fn endpoint_label(&self) -> String {
        "mock://in-memory".to_string()
    }

    async fn ping(&self) -> Result<(), EngineError> {
        self.check_reachable()
    }

    async fn ensure_image(&self, image: &str) -> Result<(), EngineError> {
        self.check_reachable()?;
        self.lock().pulled.push(image.to_string());
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        self.check_reachable()?;
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(EngineError::Api {
                status: 500,
                message: "simulated create failure".to_string(),
            });
        }
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = format!("mock-{}", inner.next_id);
        let (state, _) = watch::channel(MockState::Created);
        inner.created.push(spec.clone());
        inner.containers.insert(
            id.clone(),
            MockContainer {
                spec: spec.clone(),
                state: Arc::new(state),
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), EngineError> {
        self.check_reachable()?;
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(EngineError::Api {
                status: 500,
                message: "simulated start failure".to_string(),
            });
        }
        let (state, tty) = {
            let inner = self.lock();
            let container = inner
                .containers
                .get(id)
                .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
            (Arc::clone(&container.state), container.spec.tty)
        };
        state.send_replace(MockState::Running);

        if !tty {
            let duration = self.run_duration;
            let code = self.exit_code;
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                state.send_if_modified(|current| {
                    if *current == MockState::Running {
                        *current = MockState::Exited(code);
                        true
                    } else {
                        false
                    }
                });
            });
        }
        Ok(())
    }

    async fn attach(&self, id: &str) -> Result<PtyStreams, EngineError> {
        self.check_reachable()?;
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(EngineError::Api {
                status: 500,
                message: "simulated attach failure".to_string(),
            });
        }
        let state = self.state_handle(id)?;
        let state_rx = state.subscribe();
        let record = Arc::new(Mutex::new(Vec::new()));
        self.lock().pty_input.insert(id.to_string(), Arc::clone(&record));

        let (client, server) = tokio::io::duplex(4096);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(echo_pty(server, tx, state, state_rx, record, self.banner.clone()));

        let output = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (Ok(chunk), rx))
        })
        .boxed();

        Ok(PtyStreams {
            output,
            input: Box::pin(client),
        })
    }

    async fn wait(&self, id: &str) -> Result<i64, EngineError> {
        self.check_reachable()?;
        let mut rx = self.state_handle(id)?.subscribe();
        loop {
            if let MockState::Exited(code) = *rx.borrow_and_update() {
                return Ok(code);
            }
            if rx.changed().await.is_err() {
                return Err(EngineError::NotFound(id.to_string()));
            }
        }
    }

    async fn logs(&self, id: &str, max_bytes: usize) -> Result<CapturedOutput, EngineError> {
        self.check_reachable()?;
        if !self.lock().containers.contains_key(id) {
            return Err(EngineError::NotFound(id.to_string()));
        }
        let mut captured = CapturedOutput::default();
        let mut truncated = false;
        CapturedOutput::push_capped(&mut captured.stdout, self.stdout.as_bytes(), max_bytes, &mut truncated);
        CapturedOutput::push_capped(&mut captured.stderr, self.stderr.as_bytes(), max_bytes, &mut truncated);
        captured.truncated = truncated;
        Ok(captured)
    }

    async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), EngineError> {
        self.check_reachable()?;
        let mut inner = self.lock();
        if !inner.containers.contains_key(id) {
            return Err(EngineError::NotFound(id.to_string()));
        }
        inner.resizes.push((id.to_string(), cols, rows));
        Ok(())
    }

    async fn kill(&self, id: &str) -> Result<(), EngineError> {
        self.check_reachable()?;
        let state = self.state_handle(id)?;
        if matches!(*state.borrow(), MockState::Exited(_)) {
            return Err(EngineError::Conflict(format!("container {} is not running", id)));
        }
        state.send_replace(MockState::Exited(137));
        self.lock().killed.push(id.to_string());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), EngineError> {
        self.check_reachable()?;
        let mut inner = self.lock();
        let container = inner
            .containers
            .remove(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        container.state.send_if_modified(|current| {
            if matches!(current, MockState::Exited(_)) {
                false
            } else {
                *current = MockState::Exited(137);
                true
            }
        });
        inner.removed.push(id.to_string());
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<String>, EngineError> {
        self.check_reachable()?;
        Ok(self
            .lock()
            .containers
            .iter()
            .filter(|(_, c)| c.spec.labels.get(LABEL_MANAGED).map(String::as_str) == Some("true"))
            .map(|(id, _)| id.clone())
            .collect())
    }
}
