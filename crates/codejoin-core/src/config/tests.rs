//! Tests for configuration parsing, overrides and validation

use super::*;
use std::collections::HashMap;
use std::io::Write;
use tempfile::NamedTempFile;

fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key: &str| map.get(key).cloned()
}

#[test]
fn test_empty_document_yields_defaults() {
    let config = ConfigLoader::from_str_with_env("", env_from(&[])).unwrap();
    assert_eq!(config.limits.max_code_bytes, 64 * 1024);
    assert_eq!(config.limits.max_timeout_ms, 30_000);
    assert_eq!(config.sessions.max_sessions_per_connection, 4);
    assert!(config.runtime.endpoint.is_none());
    assert!(config.runtime.pull_images);
    assert!(!config.sessions.fix_line_endings);
}

#[test]
fn test_yaml_sections_are_parsed() {
    let yaml = r#"
runtime:
  endpoint: "tcp://10.0.0.5:2375"
  pull_images: false
limits:
  max_code_bytes: 1024
  max_timeout_ms: 5000
sessions:
  idle_timeout_secs: 0
  fix_line_endings: true
languages:
  python:
    image: "python:3.11-alpine"
    memory_mb: 128
"#;
    let config = ConfigLoader::from_str_with_env(yaml, env_from(&[])).unwrap();
    assert_eq!(config.runtime.endpoint.as_deref(), Some("tcp://10.0.0.5:2375"));
    assert!(!config.runtime.pull_images);
    assert_eq!(config.limits.max_code_bytes, 1024);
    assert_eq!(config.limits.max_output_bytes, 1024 * 1024);
    assert!(config.sessions.idle_timeout().is_none());
    assert!(config.sessions.fix_line_endings);
    let python = config.languages.get("python").unwrap();
    assert_eq!(python.image.as_deref(), Some("python:3.11-alpine"));
    assert_eq!(python.memory_mb, Some(128));
}

#[test]
fn test_environment_overrides_take_precedence() {
    let yaml = "runtime:\n  endpoint: \"unix:///var/run/docker.sock\"\n";
    let env = env_from(&[
        ("CODEJOIN_DOCKER_HOST", "tcp://127.0.0.1:2376"),
        ("DOCKER_HOST", "unix:///ignored.sock"),
        ("CODEJOIN_MAX_OUTPUT_BYTES", "2048"),
        ("CODEJOIN_LANG_PYTHON_TIMEOUT_MS", "2500"),
        ("CODEJOIN_LANG_JAVA_CPUS", "1.5"),
    ]);
    let config = ConfigLoader::from_str_with_env(yaml, env).unwrap();
    assert_eq!(config.runtime.endpoint.as_deref(), Some("tcp://127.0.0.1:2376"));
    assert_eq!(config.limits.max_output_bytes, 2048);
    assert_eq!(config.languages["python"].timeout_ms, Some(2500));
    assert_eq!(config.languages["java"].cpus, Some(1.5));
    assert!(!config.languages.contains_key("ruby"));
}

#[test]
fn test_docker_host_fallback() {
    let env = env_from(&[("DOCKER_HOST", "unix:///run/user/1000/docker.sock")]);
    let config = ConfigLoader::from_str_with_env("", env).unwrap();
    assert_eq!(
        config.runtime.endpoint.as_deref(),
        Some("unix:///run/user/1000/docker.sock")
    );
}

#[test]
fn test_invalid_environment_value_is_rejected() {
    let env = env_from(&[("CODEJOIN_MAX_CODE_BYTES", "lots")]);
    let err = ConfigLoader::from_str_with_env("", env).unwrap_err();
    assert!(err.to_string().contains("CODEJOIN_MAX_CODE_BYTES"));
}

#[test]
fn test_validation_rejects_zero_ceilings() {
    let err = ConfigLoader::from_str_with_env("limits:\n  max_timeout_ms: 0\n", env_from(&[]))
        .unwrap_err();
    assert!(matches!(err, crate::errors::ExecError::Config(_)));

    let err = ConfigLoader::from_str_with_env(
        "languages:\n  python:\n    cpus: -1.0\n",
        env_from(&[]),
    )
    .unwrap_err();
    assert!(err.to_string().contains("cpus"));
}

#[test]
fn test_malformed_yaml_is_a_config_error() {
    let err = ConfigLoader::from_str_with_env("limits: [", env_from(&[])).unwrap_err();
    assert!(err.to_string().contains("Failed to parse YAML config"));
}

#[tokio::test]
async fn test_load_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "sessions:\n  max_sessions: 10\n  default_cols: 120").unwrap();

    let config = load_config(file.path()).await.unwrap();
    assert_eq!(config.sessions.max_sessions, 10);
    assert_eq!(config.sessions.default_cols, 120);
}

#[tokio::test]
async fn test_missing_file_is_reported() {
    let err = load_config("/definitely/not/here.yaml").await.unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}
