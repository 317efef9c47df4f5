//! Container runtime abstraction
//!
//! [`ContainerEngine`] is the narrow seam to the backend (Docker in
//! production, an in-memory engine in tests). [`ContainerRuntime`] builds the
//! isolation-policy-bearing container specs, drives batch and interactive
//! lifecycles on top of an engine, and owns the cleanup guarantees: every
//! container it creates is removed again on every path out of a call.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncWrite;

use crate::errors::{EngineError, ExecError};
use crate::executors::ExecutionResult;
use crate::languages::{LanguageProfile, ResourceLimits};

pub mod docker;
pub mod endpoint;
pub mod mock;
pub mod policy;

pub use docker::DockerEngine;
pub use endpoint::EngineEndpoint;
pub use mock::MockEngine;
pub use policy::SecurityPolicy;

const LOG_COLLECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Who a container belongs to; carried into labels and the container name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    Execution(String),
    Session(String),
}

impl Owner {
    pub fn kind(&self) -> &'static str {
        match self {
            Owner::Execution(_) => "execution",
            Owner::Session(_) => "session",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Owner::Execution(id) | Owner::Session(id) => id,
        }
    }
}

/// Engine-neutral description of a container to create.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: String,
    pub tty: bool,
    pub open_stdin: bool,
    pub labels: HashMap<String, String>,
    pub limits: ResourceLimits,
    pub policy: SecurityPolicy,
    /// Size at which the engine rotates the container's log away.
    pub log_max_bytes: u64,
}

/// Both directions of an attached pseudo-terminal.
pub struct PtyStreams {
    pub output: BoxStream<'static, Result<Bytes, EngineError>>,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

impl std::fmt::Debug for PtyStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyStreams").finish_non_exhaustive()
    }
}

/// Output collected from a finished container, each stream capped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub truncated: bool,
}

impl CapturedOutput {
    /// Append to one stream without exceeding `limit` bytes.
    pub fn push_capped(buf: &mut Vec<u8>, chunk: &[u8], limit: usize, truncated: &mut bool) {
        let room = limit.saturating_sub(buf.len());
        if chunk.len() > room {
            *truncated = true;
        }
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    fn name(&self) -> &str;

    fn endpoint_label(&self) -> String;

    async fn ping(&self) -> Result<(), EngineError>;

    /// Make the image available locally, pulling it if needed.
    async fn ensure_image(&self, image: &str) -> Result<(), EngineError>;

    async fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    async fn start(&self, id: &str) -> Result<(), EngineError>;

    async fn attach(&self, id: &str) -> Result<PtyStreams, EngineError>;

    /// Block until the container exits and return its exit status.
    async fn wait(&self, id: &str) -> Result<i64, EngineError>;

    async fn logs(&self, id: &str, max_bytes: usize) -> Result<CapturedOutput, EngineError>;

    async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), EngineError>;

    async fn kill(&self, id: &str) -> Result<(), EngineError>;

    /// Force-remove the container together with its anonymous volumes.
    async fn remove(&self, id: &str) -> Result<(), EngineError>;

    /// Ids of every container carrying the managed label.
    async fn list_managed(&self) -> Result<Vec<String>, EngineError>;
}

/// A batch workload handed to [`ContainerRuntime::run_once`].
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub execution_id: String,
    pub code: String,
    pub stdin: Option<String>,
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

/// A running interactive container with its pty attached.
#[derive(Debug)]
pub struct InteractiveContainer {
    pub id: String,
    pub streams: PtyStreams,
}

#[derive(Clone)]
pub struct ContainerRuntime {
    engine: Arc<dyn ContainerEngine>,
    pull_images: bool,
    known_images: Arc<Mutex<HashSet<String>>>,
}

impl ContainerRuntime {
    pub fn new(engine: Arc<dyn ContainerEngine>, pull_images: bool) -> Self {
        Self {
            engine,
            pull_images,
            known_images: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    pub fn endpoint_label(&self) -> String {
        self.engine.endpoint_label()
    }

    pub async fn ping(&self) -> Result<(), ExecError> {
        self.engine.ping().await.map_err(|e| e.into_exec("ping"))
    }

    async fn prepare_image(&self, image: &str) -> Result<(), ExecError> {
        if !self.pull_images {
            return Ok(());
        }
        let known = self
            .known_images
            .lock()
            .map(|set| set.contains(image))
            .unwrap_or(false);
        if known {
            return Ok(());
        }
        self.engine
            .ensure_image(image)
            .await
            .map_err(|e| e.into_exec("pull image"))?;
        if let Ok(mut set) = self.known_images.lock() {
            set.insert(image.to_string());
        }
        Ok(())
    }

    /// Run a program to completion or timeout and collect its output.
    ///
    /// The container is removed before this returns, whatever the outcome.
    pub async fn run_once(
        &self,
        profile: &LanguageProfile,
        job: &BatchJob,
    ) -> Result<ExecutionResult, ExecError> {
        self.prepare_image(&profile.image).await?;

        let owner = Owner::Execution(job.execution_id.clone());
        let spec = policy::batch_spec(
            profile,
            &owner,
            &job.code,
            job.stdin.as_deref(),
            job.max_output_bytes,
        );
        let id = self
            .engine
            .create(&spec)
            .await
            .map_err(|e| e.into_exec("create"))?;
        log::debug!(
            "Created {} container {} for execution {}",
            profile.id,
            id,
            job.execution_id
        );

        let outcome = self.drive_batch(&id, profile, job).await;

        if let Err(e) = self.engine.remove(&id).await {
            if !matches!(e, EngineError::NotFound(_)) {
                log::warn!("Failed to remove container {} after execution: {}", id, e);
            }
        }

        outcome
    }

    async fn drive_batch(
        &self,
        id: &str,
        profile: &LanguageProfile,
        job: &BatchJob,
    ) -> Result<ExecutionResult, ExecError> {
        let started = Instant::now();
        self.engine
            .start(id)
            .await
            .map_err(|e| e.into_exec("start"))?;

        let (exit_code, timed_out) = match tokio::time::timeout(job.timeout, self.engine.wait(id)).await {
            Ok(Ok(code)) => (Some(code), false),
            Ok(Err(e)) => return Err(e.into_exec("wait")),
            Err(_) => {
                log::warn!(
                    "Execution {} exceeded {}ms, killing container {}",
                    job.execution_id,
                    job.timeout.as_millis(),
                    id
                );
                if let Err(e) = self.engine.kill(id).await {
                    log::warn!("Failed to kill timed out container {}: {}", id, e);
                }
                (None, true)
            }
        };
        let duration = started.elapsed();

        let captured = match tokio::time::timeout(
            LOG_COLLECTION_TIMEOUT,
            self.engine.logs(id, job.max_output_bytes),
        )
        .await
        {
            Ok(Ok(captured)) => captured,
            Ok(Err(e)) => {
                log::warn!("Failed to collect output of container {}: {}", id, e);
                CapturedOutput::default()
            }
            Err(_) => {
                log::warn!("Timed out collecting output of container {}", id);
                CapturedOutput::default()
            }
        };

        Ok(ExecutionResult {
            language: profile.id.clone(),
            stdout: decode_output(captured.stdout),
            stderr: decode_output(captured.stderr),
            exit_code,
            duration,
            timed_out,
            output_truncated: captured.truncated,
        })
    }

    /// Create and start a tty container running the profile's REPL.
    ///
    /// The pty is attached before the process starts so the first prompt is
    /// not lost. On any failure the half-built container is destroyed.
    pub async fn create_interactive(
        &self,
        profile: &LanguageProfile,
        session_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<InteractiveContainer, ExecError> {
        self.prepare_image(&profile.image).await?;

        let owner = Owner::Session(session_id.to_string());
        let spec = policy::interactive_spec(profile, &owner);
        let id = self
            .engine
            .create(&spec)
            .await
            .map_err(|e| e.into_exec("create"))?;

        let streams = match self.engine.attach(&id).await {
            Ok(streams) => streams,
            Err(e) => {
                self.destroy(&id).await;
                return Err(e.into_exec("attach"));
            }
        };
        if let Err(e) = self.engine.start(&id).await {
            self.destroy(&id).await;
            return Err(e.into_exec("start"));
        }
        if let Err(e) = self.engine.resize(&id, cols, rows).await {
            log::debug!("Initial resize of container {} failed: {}", id, e);
        }

        log::info!(
            "Started interactive {} container {} for session {}",
            profile.id,
            id,
            session_id
        );
        Ok(InteractiveContainer { id, streams })
    }

    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), ExecError> {
        self.engine
            .resize(id, cols, rows)
            .await
            .map_err(|e| e.into_exec("resize"))
    }

    pub async fn wait(&self, id: &str) -> Result<i64, ExecError> {
        self.engine.wait(id).await.map_err(|e| e.into_exec("wait"))
    }

    /// Kill then remove. Failures are logged and swallowed; a container that
    /// is already gone counts as destroyed.
    pub async fn destroy(&self, id: &str) {
        match self.engine.kill(id).await {
            Ok(()) | Err(EngineError::NotFound(_)) | Err(EngineError::Conflict(_)) => {}
            Err(e) => log::warn!("Failed to kill container {}: {}", id, e),
        }
        match self.engine.remove(id).await {
            Ok(()) | Err(EngineError::NotFound(_)) => {}
            Err(e) => log::warn!("Failed to remove container {}: {}", id, e),
        }
    }

    /// Remove managed containers left behind by a previous process.
    pub async fn sweep_orphans(&self) -> Result<usize, ExecError> {
        let ids = self
            .engine
            .list_managed()
            .await
            .map_err(|e| e.into_exec("list containers"))?;
        let count = ids.len();
        for id in ids {
            log::info!("Removing orphaned sandbox container {}", id);
            self.destroy(&id).await;
        }
        Ok(count)
    }
}

/// Decode captured bytes, dropping an incomplete trailing UTF-8 sequence left
/// by the output cap.
pub fn decode_output(mut bytes: Vec<u8>) -> String {
    if let Err(e) = std::str::from_utf8(&bytes) {
        if e.error_len().is_none() {
            bytes.truncate(e.valid_up_to());
        }
    }
    match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}
