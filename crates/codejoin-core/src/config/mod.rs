//! Configuration module for the execution sandbox
//!
//! YAML documents are parsed into [`SandboxConfig`], environment overrides are
//! applied on top, and the result is validated before any component is built.

pub mod loader;
pub mod types;

pub use loader::*;
pub use types::*;

#[cfg(test)]
mod tests;

use crate::errors::ExecError;
use std::path::Path;

/// Load a configuration from a YAML file
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<SandboxConfig, ExecError> {
    ConfigLoader::from_file(path).await
}
