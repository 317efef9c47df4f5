use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{CodeExecutor, ExecutionRequest, ExecutionResult};
use crate::config::LimitsConfig;
use crate::errors::ExecError;
use crate::languages::{LanguageProfile, LanguageRegistry};
use crate::runtime::{BatchJob, ContainerRuntime};

/// Validates batch requests and drives them through the container runtime
pub struct ExecutionOrchestrator {
    registry: Arc<LanguageRegistry>,
    runtime: ContainerRuntime,
    limits: LimitsConfig,
}

impl ExecutionOrchestrator {
    pub fn new(registry: Arc<LanguageRegistry>, runtime: ContainerRuntime, limits: LimitsConfig) -> Self {
        Self {
            registry,
            runtime,
            limits,
        }
    }

    pub fn registry(&self) -> &Arc<LanguageRegistry> {
        &self.registry
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    /// Check a request against the language table and the server ceilings.
    ///
    /// Returns the profile to run with and the effective timeout: the
    /// requested value when given, never above the profile's own timeout or
    /// the server maximum.
    pub fn validate(
        &self,
        request: &ExecutionRequest,
    ) -> Result<(Arc<LanguageProfile>, Duration), ExecError> {
        if request.language.trim().is_empty() {
            return Err(ExecError::validation("language is required"));
        }
        let profile = self.registry.lookup(&request.language)?;

        if request.code.trim().is_empty() {
            return Err(ExecError::validation("code cannot be empty"));
        }
        if request.code.len() > self.limits.max_code_bytes {
            return Err(ExecError::validation(format!(
                "code is {} bytes, the limit is {} bytes",
                request.code.len(),
                self.limits.max_code_bytes
            )));
        }
        if request.code.contains('\0') {
            return Err(ExecError::validation("code must not contain NUL bytes"));
        }
        if let Some(input) = &request.input {
            if input.len() > self.limits.max_stdin_bytes {
                return Err(ExecError::validation(format!(
                    "input is {} bytes, the limit is {} bytes",
                    input.len(),
                    self.limits.max_stdin_bytes
                )));
            }
        }

        let ceiling = profile.limits.timeout().min(self.limits.max_timeout());
        let timeout = match request.timeout_ms {
            Some(0) => return Err(ExecError::validation("timeoutMs must be greater than 0")),
            Some(ms) => Duration::from_millis(ms).min(ceiling),
            None => ceiling,
        };

        Ok((profile, timeout))
    }
}

#[async_trait]
impl CodeExecutor for ExecutionOrchestrator {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, ExecError> {
        let (profile, timeout) = self.validate(&request)?;
        let job = BatchJob {
            execution_id: Uuid::new_v4().to_string(),
            code: request.code,
            stdin: request.input,
            timeout,
            max_output_bytes: self.limits.max_output_bytes,
        };
        log::info!(
            "Executing {} request {} with a {}ms limit",
            profile.id,
            job.execution_id,
            timeout.as_millis()
        );

        // The run owns its container; detaching it from the caller keeps
        // teardown intact when the caller goes away mid-run.
        let runtime = self.runtime.clone();
        let execution_id = job.execution_id.clone();
        let handle = tokio::spawn(async move { runtime.run_once(&profile, &job).await });
        let result = handle
            .await
            .map_err(|e| ExecError::container("execute", format!("execution task failed: {}", e)))??;

        log::info!(
            "Execution {} finished: exit={:?} timed_out={} in {}ms",
            execution_id,
            result.exit_code,
            result.timed_out,
            result.duration.as_millis()
        );
        Ok(result)
    }
}
