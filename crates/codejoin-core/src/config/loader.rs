//! Configuration loader for YAML files and environment overrides
//!
//! Resolution order is YAML document, then environment variables, then
//! validation. Environment lookups go through a caller-supplied function so
//! the override rules can be exercised without touching process state.

use std::path::Path;
use tokio::fs;

use crate::config::types::*;
use crate::errors::ExecError;

pub const ENV_DOCKER_HOST: &str = "CODEJOIN_DOCKER_HOST";
pub const ENV_FALLBACK_DOCKER_HOST: &str = "DOCKER_HOST";
pub const ENV_MAX_CODE_BYTES: &str = "CODEJOIN_MAX_CODE_BYTES";
pub const ENV_MAX_OUTPUT_BYTES: &str = "CODEJOIN_MAX_OUTPUT_BYTES";
pub const ENV_MAX_TIMEOUT_MS: &str = "CODEJOIN_MAX_TIMEOUT_MS";
pub const ENV_SESSION_IDLE_TIMEOUT: &str = "CODEJOIN_SESSION_IDLE_TIMEOUT_SECS";
const ENV_LANG_PREFIX: &str = "CODEJOIN_LANG_";

/// Configuration loader with environment resolution
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file, then apply process environment overrides
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<SandboxConfig, ExecError> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).await.map_err(|e| {
            ExecError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        log::info!("Loaded sandbox configuration from {}", path.display());
        Self::from_str_with_env(&content, |key| std::env::var(key).ok())
    }

    /// Defaults plus process environment overrides; used when no file is given
    pub fn from_env() -> Result<SandboxConfig, ExecError> {
        Self::from_str_with_env("", |key| std::env::var(key).ok())
    }

    /// Parse a YAML document and apply overrides from `lookup`
    pub fn from_str_with_env<F>(content: &str, lookup: F) -> Result<SandboxConfig, ExecError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config: SandboxConfig = if content.trim().is_empty() {
            SandboxConfig::default()
        } else {
            serde_yaml::from_str(content)
                .map_err(|e| ExecError::Config(format!("Failed to parse YAML config: {}", e)))?
        };

        Self::apply_env_overrides(&mut config, lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides on top of an already-parsed configuration
    pub fn apply_env_overrides<F>(config: &mut SandboxConfig, lookup: F) -> Result<(), ExecError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup(ENV_DOCKER_HOST).or_else(|| lookup(ENV_FALLBACK_DOCKER_HOST)) {
            if !endpoint.trim().is_empty() {
                config.runtime.endpoint = Some(endpoint.trim().to_string());
            }
        }

        if let Some(value) = parse_env::<usize, _>(&lookup, ENV_MAX_CODE_BYTES)? {
            config.limits.max_code_bytes = value;
        }
        if let Some(value) = parse_env::<usize, _>(&lookup, ENV_MAX_OUTPUT_BYTES)? {
            config.limits.max_output_bytes = value;
        }
        if let Some(value) = parse_env::<u64, _>(&lookup, ENV_MAX_TIMEOUT_MS)? {
            config.limits.max_timeout_ms = value;
        }
        if let Some(value) = parse_env::<u64, _>(&lookup, ENV_SESSION_IDLE_TIMEOUT)? {
            config.sessions.idle_timeout_secs = value;
        }

        for language in crate::languages::builtin_language_ids() {
            let prefix = format!("{}{}_", ENV_LANG_PREFIX, language.to_ascii_uppercase());
            let timeout = parse_env::<u64, _>(&lookup, &format!("{}TIMEOUT_MS", prefix))?;
            let memory = parse_env::<u64, _>(&lookup, &format!("{}MEMORY_MB", prefix))?;
            let cpus = parse_env::<f64, _>(&lookup, &format!("{}CPUS", prefix))?;

            if timeout.is_none() && memory.is_none() && cpus.is_none() {
                continue;
            }

            let entry = config.languages.entry(language.to_string()).or_default();
            if timeout.is_some() {
                entry.timeout_ms = timeout;
            }
            if memory.is_some() {
                entry.memory_mb = memory;
            }
            if cpus.is_some() {
                entry.cpus = cpus;
            }
            log::debug!("Applied environment overrides for language '{}'", language);
        }

        Ok(())
    }
}

fn parse_env<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ExecError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            ExecError::Config(format!("Invalid value '{}' for {}: {}", raw, key, e))
        }),
    }
}
