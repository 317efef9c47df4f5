//! Sandboxed code execution and interactive terminals for the CodeJoin platform.
//!
//! This crate runs untrusted, user-submitted programs inside locked-down
//! containers, either as one-shot batch executions or as long-lived
//! interactive REPL sessions bridged to a browser terminal.
//!
//! # Architecture Overview
//!
//! - **Language registry**: Static per-language profiles (image, commands, limits)
//! - **Container runtime**: Engine abstraction with the isolation policy and cleanup guarantees
//! - **Execution orchestrator**: Validates batch requests and runs them to completion
//! - **Session manager**: Lifecycle of interactive tty sessions owned by client connections
//! - **Stream processing**: Frames raw pty output into client-friendly chunks
//! - **Input guardrails**: Normalizes keystrokes and rejects destructive commands
//! - **Configuration system**: YAML documents with environment overrides

pub mod config;
pub mod errors;
pub mod executors;
pub mod guardrails;
pub mod languages;
pub mod runtime;
pub mod session;
pub mod stream;

pub use config::*;
pub use errors::{EngineError, ErrorCode, ExecError};
pub use executors::{CodeExecutor, ExecutionOrchestrator, ExecutionRequest, ExecutionResult};
pub use guardrails::{InputGuard, RawInput};
pub use languages::{LanguageProfile, LanguageRegistry};
pub use runtime::{ContainerEngine, ContainerRuntime, DockerEngine, MockEngine};
pub use session::{SessionEvent, SessionManager, TerminalCommand};
pub use stream::StreamProcessor;
