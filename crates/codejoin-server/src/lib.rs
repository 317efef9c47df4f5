//! HTTP and WebSocket front end for CodeJoin code execution
//!
//! Batch executions are served as JSON request/response over `/api/execute`;
//! interactive terminals are bridged over a WebSocket at `/ws/terminal`. All
//! sandboxing, session bookkeeping and input screening lives in
//! `codejoin-core`; this crate only translates between the wire and the core.

pub mod error;
pub mod protocol;
pub mod terminal;

pub use error::{Result, ServerError};
pub use protocol::{ClientMessage, ServerMessage};

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::{middleware, Router};
use codejoin_core::{
    CodeExecutor, ContainerEngine, ContainerRuntime, ExecutionOrchestrator, ExecutionRequest,
    ExecutionResult, LanguageProfile, SessionManager,
};
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
}

/// Body of a finished batch execution.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub success: bool,
    pub language: String,
    pub output: String,
    pub error: String,
    pub exit_code: Option<i64>,
    /// Wall-clock run time in milliseconds.
    pub execution_time: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub timed_out: bool,
    pub output_truncated: bool,
}

impl From<ExecutionResult> for ExecuteResponse {
    fn from(result: ExecutionResult) -> Self {
        Self {
            success: result.success(),
            execution_time: u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
            language: result.language,
            output: result.stdout,
            error: result.stderr,
            exit_code: result.exit_code,
            timestamp: chrono::Utc::now(),
            timed_out: result.timed_out,
            output_truncated: result.output_truncated,
        }
    }
}

/// Configuration for the CodeJoin server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Enable CORS
    pub enable_cors: bool,
    /// CORS allowed origins (if None, allows any origin)
    pub cors_origins: Option<Vec<String>>,
    /// Maximum request body size in bytes
    pub max_body_size: usize,
    /// Enable request logging
    pub enable_logging: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3001)),
            enable_cors: true,
            cors_origins: None,
            max_body_size: 1024 * 1024,
            enable_logging: true,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Parse and set the bind address from a string.
    pub fn with_bind_addr_str(mut self, addr: &str) -> Result<Self> {
        self.bind_addr = addr
            .parse()
            .map_err(|e| ServerError::config_error(format!("Invalid bind address: {}", e)))?;
        Ok(self)
    }

    pub fn with_cors(mut self, enable: bool) -> Self {
        self.enable_cors = enable;
        self
    }

    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Some(origins);
        self
    }

    pub fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    pub fn with_logging(mut self, enable: bool) -> Self {
        self.enable_logging = enable;
        self
    }
}

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ExecutionOrchestrator>,
    pub sessions: SessionManager,
    pub runtime: ContainerRuntime,
    pub started_at: Instant,
    pub config: ServerConfig,
}

/// Handler for the /api/execute POST endpoint.
///
/// The body is decoded by hand so that malformed JSON still gets the
/// structured error body.
async fn execute_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ExecuteResponse>> {
    let request: ExecutionRequest = serde_json::from_slice(&body)?;
    log::info!(
        "Received execute request: language={} code_bytes={}",
        request.language,
        request.code.len()
    );
    let result = state.orchestrator.execute(request).await?;
    Ok(Json(ExecuteResponse::from(result)))
}

/// Handler for the /api/languages GET endpoint.
async fn languages_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let profiles: Vec<&LanguageProfile> = state
        .orchestrator
        .registry()
        .profiles()
        .iter()
        .map(|profile| profile.as_ref())
        .collect();
    Json(json!({
        "languages": profiles,
        "count": profiles.len(),
        "timestamp": chrono::Utc::now()
    }))
}

/// Handler for the /api/system GET endpoint.
async fn system_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let healthy = match state.runtime.ping().await {
        Ok(()) => true,
        Err(e) => {
            log::debug!("System check: container runtime not healthy: {}", e);
            false
        }
    };
    let sessions = state.sessions.config();
    let limits = state.orchestrator.limits();
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "runtime": {
            "engine": state.runtime.engine().name(),
            "endpoint": state.runtime.endpoint_label(),
            "healthy": healthy
        },
        "sessions": {
            "active": state.sessions.count(),
            "maxSessions": sessions.max_sessions,
            "maxSessionsPerConnection": sessions.max_sessions_per_connection,
            "idleTimeoutSecs": sessions.idle_timeout_secs,
            "maxLifetimeSecs": sessions.max_lifetime_secs
        },
        "limits": {
            "maxCodeBytes": limits.max_code_bytes,
            "maxStdinBytes": limits.max_stdin_bytes,
            "maxOutputBytes": limits.max_output_bytes,
            "maxTimeoutMs": limits.max_timeout_ms,
            "maxInputBytes": limits.max_input_bytes
        },
        "languages": state.orchestrator.registry().len(),
        "timestamp": chrono::Utc::now()
    }))
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn not_found_handler() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "success": false,
            "error": "Not found",
            "timestamp": chrono::Utc::now()
        })),
    )
}

/// The CodeJoin execution server.
pub struct CodeJoinServer {
    state: AppState,
}

impl CodeJoinServer {
    pub fn new(
        orchestrator: Arc<ExecutionOrchestrator>,
        sessions: SessionManager,
        runtime: ContainerRuntime,
        config: ServerConfig,
    ) -> Self {
        Self {
            state: AppState {
                orchestrator,
                sessions,
                runtime,
                started_at: Instant::now(),
                config,
            },
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.state.sessions
    }

    /// Build the Axum router with all routes and middleware.
    pub fn build_router(&self) -> Router {
        let config = &self.state.config;
        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/api/execute", post(execute_handler))
            .route("/api/languages", get(languages_handler))
            .route("/api/system", get(system_handler))
            .route("/ws/terminal", get(terminal::terminal_handler))
            .fallback(not_found_handler)
            .layer(DefaultBodyLimit::max(config.max_body_size))
            .with_state(self.state.clone());

        if config.enable_logging {
            router = router.layer(middleware::from_fn(
                |request: axum::http::Request<axum::body::Body>, next: axum::middleware::Next| async {
                    let request_id = uuid::Uuid::new_v4().to_string();
                    let method = request.method().clone();
                    let uri = request.uri().clone();

                    // health probes would drown everything else
                    if uri.path() == "/health" {
                        log::debug!("Request {} {} {}", request_id, method, uri);
                    } else {
                        log::info!("Request {} {} {}", request_id, method, uri);
                    }

                    let start = Instant::now();
                    let response = next.run(request).await;
                    let duration = start.elapsed();

                    if uri.path() == "/health" {
                        log::debug!("Response {} {} in {:?}", request_id, response.status(), duration);
                    } else {
                        log::info!("Response {} {} in {:?}", request_id, response.status(), duration);
                    }

                    response
                },
            ));
        }

        router = router.layer(TraceLayer::new_for_http());

        if config.enable_cors {
            let cors_layer = match &config.cors_origins {
                Some(origins) => {
                    let origins: std::result::Result<Vec<_>, _> =
                        origins.iter().map(|s| s.parse()).collect();
                    match origins {
                        Ok(origins) => CorsLayer::new()
                            .allow_origin(origins)
                            .allow_methods(Any)
                            .allow_headers(Any),
                        Err(_) => {
                            log::warn!("Invalid CORS origin configured, allowing any origin");
                            CorsLayer::permissive()
                        }
                    }
                }
                None => CorsLayer::permissive(),
            };
            router = router.layer(cors_layer);
        }

        router
    }

    /// Start the server with graceful shutdown support.
    ///
    /// Once `shutdown_signal` resolves the listener stops accepting, and every
    /// live terminal session is stopped before this returns.
    pub async fn serve_with_shutdown<F>(self, shutdown_signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();
        let bind_addr = self.state.config.bind_addr;
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            ServerError::config_error(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        log::info!("CodeJoin server starting on {}", bind_addr);
        log::info!("Health check: http://{}/health", bind_addr);
        log::info!("Execute endpoint: http://{}/api/execute", bind_addr);
        log::info!("Terminal endpoint: ws://{}/ws/terminal", bind_addr);

        let reaper = spawn_reaper(self.state.sessions.clone());

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ServerError::internal(format!("Server error: {}", e)));

        if let Some(reaper) = reaper {
            reaper.abort();
        }
        self.state.sessions.shutdown_all().await;
        served?;

        log::info!("CodeJoin server shut down gracefully");
        Ok(())
    }
}

/// Periodically stop idle and over-age sessions. `None` when reaping is off.
pub fn spawn_reaper(sessions: SessionManager) -> Option<tokio::task::JoinHandle<()>> {
    let config = sessions.config();
    if config.idle_timeout().is_none() && config.max_lifetime().is_none() {
        log::info!("Idle session reaping disabled");
        return None;
    }
    let period = Duration::from_secs(config.reap_interval_secs.max(1));
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let reaped = sessions.reap_idle().await;
            if reaped > 0 {
                log::info!("Reaped {} terminal session(s)", reaped);
            }
        }
    }))
}

/// Utility function to create a shutdown signal from Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}
