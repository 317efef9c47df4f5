//! One-shot code execution in disposable sandboxes.
//!
//! A request is validated against the language table and the server-side
//! ceilings before any container exists, then handed to the container runtime
//! which runs it to completion or timeout and always tears the sandbox down.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::errors::ExecError;

pub mod orchestrator;

pub use orchestrator::ExecutionOrchestrator;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub language: String,
    pub code: String,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ExecutionRequest {
    pub fn new(language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            code: code.into(),
            ..Default::default()
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub language: String,
    pub stdout: String,
    pub stderr: String,
    /// `None` when the program was killed before it exited.
    pub exit_code: Option<i64>,
    pub duration: Duration,
    pub timed_out: bool,
    pub output_truncated: bool,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }
}

#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, ExecError>;
}
