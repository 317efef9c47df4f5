// src/runtime/docker.rs
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, HostConfig, HostConfigLogConfig, ResourcesUlimits};
use bollard::query_parameters::{
    AttachContainerOptionsBuilder, CreateContainerOptions as BollardCreateContainerOptionsQuery,
    CreateImageOptions as BollardCreateImageOptionsQuery, KillContainerOptionsBuilder,
    ListContainersOptions as BollardListContainersOptionsQuery,
    LogsOptions as BollardLogsOptionsQuery, RemoveContainerOptionsBuilder,
    ResizeContainerTTYOptionsBuilder, StartContainerOptions as BollardStartContainerOptionsQuery,
    WaitContainerOptions as BollardWaitContainerOptionsQuery,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use bytes::Bytes;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use super::endpoint::EngineEndpoint;
use super::policy::LABEL_MANAGED;
use super::{CapturedOutput, ContainerEngine, ContainerSpec, PtyStreams};
use crate::config::RuntimeConfig;
use crate::errors::{EngineError, ExecError};

const FALLBACK_PING_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DockerEngine {
    docker: Docker,
    endpoint_label: String,
}

impl DockerEngine {
    /// Connect to the configured endpoint.
    ///
    /// When an explicit endpoint does not answer a ping, the engine's local
    /// default is tried once, here and never again for this instance.
    pub async fn connect(config: &RuntimeConfig) -> Result<Self, ExecError> {
        let endpoint = EngineEndpoint::parse(config.endpoint.as_deref().unwrap_or(""))?;
        let primary = client_for(&endpoint, config.connect_timeout_secs)?;

        if endpoint == EngineEndpoint::LocalDefault {
            return Ok(Self {
                docker: primary,
                endpoint_label: endpoint.label(),
            });
        }

        let (docker, endpoint_label) = settle_endpoint(
            primary,
            endpoint.label(),
            || Docker::connect_with_local_defaults().map_err(|e| e.to_string()),
            |docker: Docker| async move {
                docker.ping().await.map(|_| ()).map_err(|e| e.to_string())
            },
        )
        .await;
        Ok(Self {
            docker,
            endpoint_label,
        })
    }
}

/// Keep the primary client when it answers; otherwise try the local default
/// once and switch to it only if it answers. With neither reachable the
/// primary stays, so later calls report the outage against it.
async fn settle_endpoint<C, F, P, Fut>(
    primary: C,
    primary_label: String,
    fallback: F,
    ping: P,
) -> (C, String)
where
    C: Clone,
    F: FnOnce() -> Result<C, String>,
    P: Fn(C) -> Fut,
    Fut: Future<Output = Result<(), String>>,
{
    let reason = match ping_within(&ping, primary.clone()).await {
        Ok(()) => {
            log::info!("Connected to container engine at {}", primary_label);
            return (primary, primary_label);
        }
        Err(reason) => reason,
    };
    log::warn!(
        "Container engine at {} is unreachable ({}); trying the local default",
        primary_label,
        reason
    );

    let local_label = EngineEndpoint::LocalDefault.label();
    let local = match fallback() {
        Ok(client) => client,
        Err(e) => {
            log::warn!("Local default container engine unavailable: {}", e);
            return (primary, primary_label);
        }
    };
    match ping_within(&ping, local.clone()).await {
        Ok(()) => {
            log::info!("Connected to container engine at {}", local_label);
            (local, local_label)
        }
        Err(e) => {
            log::warn!(
                "Local default container engine unreachable too ({}); staying on {}",
                e,
                primary_label
            );
            (primary, primary_label)
        }
    }
}

async fn ping_within<C, P, Fut>(ping: &P, client: C) -> Result<(), String>
where
    P: Fn(C) -> Fut,
    Fut: Future<Output = Result<(), String>>,
{
    match tokio::time::timeout(FALLBACK_PING_TIMEOUT, ping(client)).await {
        Ok(outcome) => outcome,
        Err(_) => Err("ping timed out".to_string()),
    }
}

fn client_for(endpoint: &EngineEndpoint, timeout_secs: u64) -> Result<Docker, ExecError> {
    let connected = match endpoint {
        EngineEndpoint::LocalDefault => Docker::connect_with_local_defaults(),
        #[cfg(unix)]
        EngineEndpoint::UnixSocket(path) => {
            Docker::connect_with_unix(path, timeout_secs, API_DEFAULT_VERSION)
        }
        #[cfg(not(unix))]
        EngineEndpoint::UnixSocket(_) => {
            return Err(ExecError::Config(
                "unix socket endpoints are not available on this platform".to_string(),
            ))
        }
        EngineEndpoint::Tcp { address, tls: false } => Docker::connect_with_http(
            &format!("http://{}", address),
            timeout_secs,
            API_DEFAULT_VERSION,
        ),
        EngineEndpoint::Tcp { tls: true, .. } => {
            return Err(ExecError::Config(
                "TLS engine endpoints are not supported; expose the engine on a local socket"
                    .to_string(),
            ))
        }
        #[cfg(windows)]
        EngineEndpoint::NamedPipe(pipe) => {
            Docker::connect_with_named_pipe(pipe, timeout_secs, API_DEFAULT_VERSION)
        }
        #[cfg(not(windows))]
        EngineEndpoint::NamedPipe(_) => {
            return Err(ExecError::Config(
                "named pipe endpoints are only available on Windows".to_string(),
            ))
        }
    };
    connected.map_err(|e| EngineError::from(e).into_exec("connect"))
}

/// Translate an engine-neutral spec into the Docker create body.
pub(crate) fn container_body(spec: &ContainerSpec) -> ContainerCreateBody {
    let limits = &spec.limits;
    let policy = &spec.policy;

    let mut tmpfs = HashMap::new();
    tmpfs.insert(policy.tmpfs_path.clone(), policy.tmpfs_options(limits.tmpfs_bytes));

    // one file only: the engine never keeps more than max-size on the host
    let mut log_opts = HashMap::new();
    log_opts.insert("max-size".to_string(), spec.log_max_bytes.to_string());
    log_opts.insert("max-file".to_string(), "1".to_string());

    ContainerCreateBody {
        image: Some(spec.image.clone()),
        cmd: Some(spec.cmd.clone()),
        env: Some(spec.env.clone()),
        user: Some(policy.user.clone()),
        working_dir: Some(spec.working_dir.clone()),
        tty: Some(spec.tty),
        open_stdin: Some(spec.open_stdin),
        attach_stdin: Some(spec.open_stdin),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        network_disabled: Some(policy.network_disabled),
        labels: Some(spec.labels.clone()),
        host_config: Some(HostConfig {
            memory: Some(limits.memory_bytes),
            memory_swap: Some(limits.memory_bytes),
            nano_cpus: Some(limits.nano_cpus),
            pids_limit: Some(limits.max_processes),
            ulimits: Some(vec![ResourcesUlimits {
                name: Some("nofile".to_string()),
                soft: Some(limits.max_open_files),
                hard: Some(limits.max_open_files),
            }]),
            readonly_rootfs: Some(policy.read_only_root),
            tmpfs: Some(tmpfs),
            cap_drop: Some(policy.cap_drop.clone()),
            security_opt: Some(policy.security_opts.clone()),
            network_mode: policy.network_disabled.then(|| "none".to_string()),
            log_config: Some(HostConfigLogConfig {
                typ: Some(policy.log_driver.clone()),
                config: Some(log_opts),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn log_bytes(output: LogOutput) -> (bool, Bytes) {
    match output {
        LogOutput::StdErr { message } => (true, message),
        LogOutput::StdOut { message }
        | LogOutput::Console { message }
        | LogOutput::StdIn { message } => (false, message),
    }
}

/// Split `name:tag` without mistaking a registry port for a tag.
fn split_image_tag(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, tag),
        _ => (image, "latest"),
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    fn name(&self) -> &str {
        "docker"
    }

    fn endpoint_label(&self) -> String {
        self.endpoint_label.clone()
    }

    async fn ping(&self) -> Result<(), EngineError> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<(), EngineError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(e) => {
                let err = EngineError::from(e);
                if err.is_unreachable() {
                    return Err(err);
                }
            }
        }

        let (from_image, tag) = split_image_tag(image);
        log::info!("Pulling sandbox image {}:{}", from_image, tag);
        let pull_options = Some(BollardCreateImageOptionsQuery {
            from_image: Some(from_image.to_string()),
            tag: Some(tag.to_string()),
            ..Default::default()
        });
        let mut pull_stream = self.docker.create_image(pull_options, None, None);
        while let Some(progress) = pull_stream.next().await {
            progress?;
        }
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(spec.name.clone()),
            ..Default::default()
        });
        let created = self
            .docker
            .create_container(options, container_body(spec))
            .await?;
        for warning in &created.warnings {
            log::debug!("Engine warning for {}: {}", spec.name, warning);
        }
        Ok(created.id)
    }

    async fn start(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<BollardStartContainerOptionsQuery>)
            .await?;
        Ok(())
    }

    async fn attach(&self, id: &str) -> Result<PtyStreams, EngineError> {
        let options = AttachContainerOptionsBuilder::new()
            .stdin(true)
            .stdout(true)
            .stderr(true)
            .stream(true)
            .logs(true)
            .build();
        let attached = self.docker.attach_container(id, Some(options)).await?;

        let output = attached
            .output
            .map(|item| item.map(|out| log_bytes(out).1).map_err(EngineError::from))
            .boxed();

        Ok(PtyStreams {
            output,
            input: attached.input,
        })
    }

    async fn wait(&self, id: &str) -> Result<i64, EngineError> {
        let mut stream = self
            .docker
            .wait_container(id, None::<BollardWaitContainerOptionsQuery>);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(EngineError::Api {
                status: 500,
                message: format!("wait stream for {} ended without a status", id),
            }),
        }
    }

    async fn logs(&self, id: &str, max_bytes: usize) -> Result<CapturedOutput, EngineError> {
        let mut output_stream = self.docker.logs(
            id,
            Some(BollardLogsOptionsQuery {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        let mut captured = CapturedOutput::default();
        let mut truncated = false;
        while let Some(log_result) = output_stream.next().await {
            let (is_stderr, message) = log_bytes(log_result?);
            let target = if is_stderr {
                &mut captured.stderr
            } else {
                &mut captured.stdout
            };
            CapturedOutput::push_capped(target, &message, max_bytes, &mut truncated);
            if captured.stdout.len() >= max_bytes && captured.stderr.len() >= max_bytes {
                break;
            }
        }
        captured.truncated = truncated;
        Ok(captured)
    }

    async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), EngineError> {
        let options = ResizeContainerTTYOptionsBuilder::new()
            .h(i32::from(rows))
            .w(i32::from(cols))
            .build();
        self.docker.resize_container_tty(id, options).await?;
        Ok(())
    }

    async fn kill(&self, id: &str) -> Result<(), EngineError> {
        let options = KillContainerOptionsBuilder::new().signal("SIGKILL").build();
        self.docker.kill_container(id, Some(options)).await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), EngineError> {
        let options = RemoveContainerOptionsBuilder::new().force(true).v(true).build();
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<String>, EngineError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}=true", LABEL_MANAGED)]);
        let containers = self
            .docker
            .list_containers(Some(BollardListContainersOptionsQuery {
                all: true,
                filters: Some(filters),
                ..Default::default()
            }))
            .await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}
