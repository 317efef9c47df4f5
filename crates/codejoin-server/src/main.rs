//! codejoin-server binary
//!
//! Serves batch code execution and interactive terminals backed by the local
//! container engine.

use anyhow::Context;
use clap::Parser;
use codejoin_core::config::{ConfigLoader, SandboxConfig};
use codejoin_core::{
    ContainerRuntime, DockerEngine, ExecutionOrchestrator, LanguageRegistry, SessionManager,
};
use codejoin_server::{shutdown_signal, CodeJoinServer, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;

/// Command line arguments for the CodeJoin server.
#[derive(Parser, Debug)]
#[command(name = "codejoin-server")]
#[command(about = "Sandboxed code execution and terminal sessions for CodeJoin")]
#[command(version)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server bind address
    #[arg(short, long, default_value = "127.0.0.1:3001")]
    bind_addr: String,

    /// Enable CORS
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    cors: bool,

    /// CORS allowed origins (comma-separated)
    #[arg(long)]
    cors_origins: Option<String>,

    /// Maximum request body size in bytes
    #[arg(long, default_value = "1048576")] // 1MB
    max_body_size: usize,

    /// Enable request logging
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    logging: bool,

    /// Log level; falls back to the configuration file, RUST_LOG wins over both
    #[arg(long)]
    log_level: Option<String>,
}

async fn load(args: &Args) -> anyhow::Result<SandboxConfig> {
    let config = match &args.config {
        Some(path) => ConfigLoader::from_file(path).await?,
        None => ConfigLoader::from_env()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Parse the configuration before logging is up so its level can apply
    let config = load(&args).await;
    let level = args.log_level.clone().unwrap_or_else(|| {
        config
            .as_ref()
            .map(|c| c.logging.level.clone())
            .unwrap_or_else(|_| "info".to_string())
    });
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&level)).init();
    let config = config.context("failed to load configuration")?;

    let cors_origins: Option<Vec<String>> = args
        .cors_origins
        .as_ref()
        .map(|origins| origins.split(',').map(|s| s.trim().to_string()).collect());

    let registry = Arc::new(LanguageRegistry::with_overrides(&config.languages)?);
    let engine = DockerEngine::connect(&config.runtime).await?;
    let runtime = ContainerRuntime::new(Arc::new(engine), config.runtime.pull_images);

    match runtime.ping().await {
        Ok(()) => {
            if config.runtime.sweep_orphans_on_start {
                match runtime.sweep_orphans().await {
                    Ok(0) => {}
                    Ok(count) => log::info!("Removed {} orphaned sandbox container(s)", count),
                    Err(e) => log::warn!("Orphan sweep failed: {}", e),
                }
            }
        }
        Err(e) => log::warn!(
            "Container engine at {} is not reachable yet: {}",
            runtime.endpoint_label(),
            e
        ),
    }

    let orchestrator = Arc::new(ExecutionOrchestrator::new(
        Arc::clone(&registry),
        runtime.clone(),
        config.limits.clone(),
    ));
    let sessions = SessionManager::new(
        runtime.clone(),
        Arc::clone(&registry),
        config.sessions.clone(),
        config.limits.max_input_bytes,
    )?;

    let mut server_config = ServerConfig::new()
        .with_bind_addr_str(&args.bind_addr)
        .with_context(|| format!("invalid bind address '{}'", args.bind_addr))?
        .with_cors(args.cors)
        .with_max_body_size(args.max_body_size)
        .with_logging(args.logging);
    if let Some(origins) = cors_origins {
        server_config = server_config.with_cors_origins(origins);
    }

    log::info!("Starting CodeJoin server...");
    log::info!("Configuration:");
    log::info!("  Bind address: {}", server_config.bind_addr);
    log::info!("  CORS enabled: {}", server_config.enable_cors);
    log::info!("  Request logging: {}", server_config.enable_logging);
    log::info!("  Container engine: {}", runtime.endpoint_label());
    log::info!("  Languages: {}", registry.len());
    log::info!("  Max code size: {} bytes", config.limits.max_code_bytes);
    log::info!("  Max execution time: {}ms", config.limits.max_timeout_ms);
    log::info!("  Max sessions: {}", config.sessions.max_sessions);
    log::info!(
        "  Idle session timeout: {}s (0 = never)",
        config.sessions.idle_timeout_secs
    );

    let server = CodeJoinServer::new(orchestrator, sessions, runtime, server_config);
    server.serve_with_shutdown(shutdown_signal()).await?;

    Ok(())
}
