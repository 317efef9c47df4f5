//! Configuration type definitions for the execution sandbox
//!
//! Every section is optional in YAML and falls back to conservative defaults,
//! so an empty document yields a working single-host configuration. Security
//! ceilings (code size, output size, wall-clock timeout) live here rather than
//! in the language table so that operators can tighten them without touching
//! the per-language profiles.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::errors::ExecError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SandboxConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub languages: HashMap<String, LanguageOverride>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Container engine connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Engine endpoint URI (`unix://`, `tcp://`, `npipe://`). When unset the
    /// engine's local default is used.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub pull_images: bool,
    #[serde(default = "default_true")]
    pub sweep_orphans_on_start: bool,
}

/// Server-side ceilings applied to every request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_code_bytes")]
    pub max_code_bytes: usize,
    #[serde(default = "default_max_stdin_bytes")]
    pub max_stdin_bytes: usize,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    #[serde(default = "default_max_input_bytes")]
    pub max_input_bytes: usize,
}

/// Interactive terminal session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sessions without input or output for this long are reaped; 0 disables.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Hard ceiling on a session's age; 0 disables.
    #[serde(default = "default_max_lifetime")]
    pub max_lifetime_secs: u64,
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_max_sessions_per_connection")]
    pub max_sessions_per_connection: usize,
    #[serde(default = "default_stream_buffer_bytes")]
    pub stream_buffer_bytes: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default)]
    pub fix_line_endings: bool,
    #[serde(default = "default_cols")]
    pub default_cols: u16,
    #[serde(default = "default_rows")]
    pub default_rows: u16,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

/// Operator overrides for a single language profile
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct LanguageOverride {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub cpus: Option<f64>,
    #[serde(default)]
    pub max_processes: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_true() -> bool { true }
fn default_connect_timeout() -> u64 { 120 }
fn default_max_code_bytes() -> usize { 64 * 1024 }
fn default_max_stdin_bytes() -> usize { 64 * 1024 }
fn default_max_output_bytes() -> usize { 1024 * 1024 }
fn default_max_timeout_ms() -> u64 { 30_000 }
fn default_max_input_bytes() -> usize { 8 * 1024 }
fn default_idle_timeout() -> u64 { 1800 }
fn default_max_lifetime() -> u64 { 7200 }
fn default_reap_interval() -> u64 { 30 }
fn default_max_sessions() -> usize { 200 }
fn default_max_sessions_per_connection() -> usize { 4 }
fn default_stream_buffer_bytes() -> usize { 64 * 1024 }
fn default_flush_interval_ms() -> u64 { 15 }
fn default_cols() -> u16 { 80 }
fn default_rows() -> u16 { 24 }
fn default_event_buffer() -> usize { 256 }
fn default_log_level() -> String { "info".to_string() }

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            connect_timeout_secs: default_connect_timeout(),
            pull_images: true,
            sweep_orphans_on_start: true,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_code_bytes: default_max_code_bytes(),
            max_stdin_bytes: default_max_stdin_bytes(),
            max_output_bytes: default_max_output_bytes(),
            max_timeout_ms: default_max_timeout_ms(),
            max_input_bytes: default_max_input_bytes(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            max_lifetime_secs: default_max_lifetime(),
            reap_interval_secs: default_reap_interval(),
            max_sessions: default_max_sessions(),
            max_sessions_per_connection: default_max_sessions_per_connection(),
            stream_buffer_bytes: default_stream_buffer_bytes(),
            flush_interval_ms: default_flush_interval_ms(),
            fix_line_endings: false,
            default_cols: default_cols(),
            default_rows: default_rows(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LimitsConfig {
    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        (self.max_lifetime_secs > 0).then(|| Duration::from_secs(self.max_lifetime_secs))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<(), ExecError> {
        if self.limits.max_code_bytes == 0 {
            return Err(ExecError::Config("limits.max_code_bytes must be greater than 0".to_string()));
        }
        if self.limits.max_output_bytes == 0 {
            return Err(ExecError::Config("limits.max_output_bytes must be greater than 0".to_string()));
        }
        if self.limits.max_timeout_ms == 0 {
            return Err(ExecError::Config("limits.max_timeout_ms must be greater than 0".to_string()));
        }
        if self.limits.max_input_bytes == 0 {
            return Err(ExecError::Config("limits.max_input_bytes must be greater than 0".to_string()));
        }
        if self.sessions.max_sessions == 0 || self.sessions.max_sessions_per_connection == 0 {
            return Err(ExecError::Config("session caps must be greater than 0".to_string()));
        }
        if self.sessions.stream_buffer_bytes < 1024 {
            return Err(ExecError::Config(
                "sessions.stream_buffer_bytes must be at least 1024".to_string(),
            ));
        }
        if self.sessions.reap_interval_secs == 0 {
            return Err(ExecError::Config("sessions.reap_interval_secs must be greater than 0".to_string()));
        }
        if self.sessions.default_cols == 0 || self.sessions.default_rows == 0 {
            return Err(ExecError::Config("default terminal size must be non-zero".to_string()));
        }
        if self.sessions.event_buffer == 0 {
            return Err(ExecError::Config("sessions.event_buffer must be greater than 0".to_string()));
        }

        for (language, over) in &self.languages {
            if let Some(image) = &over.image {
                if image.trim().is_empty() {
                    return Err(ExecError::Config(format!(
                        "Language '{}' image override cannot be empty",
                        language
                    )));
                }
            }
            if over.timeout_ms == Some(0) {
                return Err(ExecError::Config(format!(
                    "Language '{}' timeout_ms must be greater than 0",
                    language
                )));
            }
            if over.memory_mb == Some(0) {
                return Err(ExecError::Config(format!(
                    "Language '{}' memory_mb must be greater than 0",
                    language
                )));
            }
            if let Some(cpus) = over.cpus {
                if !(cpus > 0.0 && cpus.is_finite()) {
                    return Err(ExecError::Config(format!(
                        "Language '{}' cpus must be a positive number",
                        language
                    )));
                }
            }
            if matches!(over.max_processes, Some(n) if n <= 0) {
                return Err(ExecError::Config(format!(
                    "Language '{}' max_processes must be greater than 0",
                    language
                )));
            }
        }

        Ok(())
    }
}
