//! Static language table for sandboxed execution
//!
//! Each profile names the container image, how source is materialised inside
//! the sandbox, how it is compiled and run, the REPL used for interactive
//! sessions and the resource ceiling for a single workload. The registry is
//! built once at startup and is read-only afterwards.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LanguageOverride;
use crate::errors::ExecError;

const MIB: i64 = 1024 * 1024;
const NANO_CPUS_PER_CPU: f64 = 1_000_000_000.0;

/// Directory inside the sandbox holding sources and build artifacts.
pub const SANDBOX_WORKDIR: &str = "/tmp";

/// How the interactive program announces that it is waiting for input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptStyle {
    Shell,
    Python,
    Node,
    Deno,
    Ruby,
    Php,
    Jshell,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub max_processes: i64,
    pub max_open_files: i64,
    pub tmpfs_bytes: i64,
    pub timeout_ms: u64,
}

impl ResourceLimits {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cpus(&self) -> f64 {
        self.nano_cpus as f64 / NANO_CPUS_PER_CPU
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 256 * MIB,
            nano_cpus: 500_000_000,
            max_processes: 64,
            max_open_files: 256,
            tmpfs_bytes: 64 * MIB,
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageProfile {
    pub id: String,
    pub display_name: String,
    pub image: String,
    pub extension: String,
    /// File stem of the source file; some toolchains require a fixed name.
    pub source_stem: String,
    /// Run command template; `{file}` expands to the source path.
    pub run_command: Vec<String>,
    pub compile_command: Option<Vec<String>>,
    pub repl_command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub aliases: Vec<String>,
    pub prompt: PromptStyle,
    pub limits: ResourceLimits,
}

impl LanguageProfile {
    pub fn source_path(&self) -> String {
        format!("{}/{}.{}", SANDBOX_WORKDIR, self.source_stem, self.extension)
    }

    pub fn run_argv(&self) -> Vec<String> {
        self.expand(&self.run_command)
    }

    pub fn compile_argv(&self) -> Option<Vec<String>> {
        self.compile_command.as_ref().map(|cmd| self.expand(cmd))
    }

    fn expand(&self, template: &[String]) -> Vec<String> {
        let file = self.source_path();
        template
            .iter()
            .map(|part| part.replace("{file}", &file))
            .collect()
    }

    fn apply_override(&mut self, over: &LanguageOverride) {
        if let Some(image) = &over.image {
            self.image = image.clone();
        }
        if let Some(timeout_ms) = over.timeout_ms {
            self.limits.timeout_ms = timeout_ms;
        }
        if let Some(memory_mb) = over.memory_mb {
            self.limits.memory_bytes = (memory_mb as i64).saturating_mul(MIB);
        }
        if let Some(cpus) = over.cpus {
            self.limits.nano_cpus = (cpus * NANO_CPUS_PER_CPU) as i64;
        }
        if let Some(max_processes) = over.max_processes {
            self.limits.max_processes = max_processes;
        }
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn builtin_profiles() -> Vec<LanguageProfile> {
    let base_env = vec![
        ("HOME".to_string(), SANDBOX_WORKDIR.to_string()),
        ("LANG".to_string(), "C.UTF-8".to_string()),
        ("TERM".to_string(), "xterm-256color".to_string()),
    ];
    let with_env = |extra: &[(&str, &str)]| {
        let mut env = base_env.clone();
        env.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        env
    };

    vec![
        LanguageProfile {
            id: "python".to_string(),
            display_name: "Python 3.12".to_string(),
            image: "python:3.12-slim".to_string(),
            extension: "py".to_string(),
            source_stem: "main".to_string(),
            run_command: argv(&["python3", "-u", "{file}"]),
            compile_command: None,
            repl_command: argv(&["python3", "-q"]),
            env: with_env(&[("PYTHONDONTWRITEBYTECODE", "1"), ("PYTHONUNBUFFERED", "1")]),
            aliases: argv(&["py", "python3"]),
            prompt: PromptStyle::Python,
            limits: ResourceLimits::default(),
        },
        LanguageProfile {
            id: "javascript".to_string(),
            display_name: "JavaScript (Node.js 20)".to_string(),
            image: "node:20-slim".to_string(),
            extension: "js".to_string(),
            source_stem: "main".to_string(),
            run_command: argv(&["node", "{file}"]),
            compile_command: None,
            repl_command: argv(&["node"]),
            env: with_env(&[("NODE_DISABLE_COLORS", "0")]),
            aliases: argv(&["js", "node", "nodejs"]),
            prompt: PromptStyle::Node,
            limits: ResourceLimits::default(),
        },
        LanguageProfile {
            id: "typescript".to_string(),
            display_name: "TypeScript (Deno 2)".to_string(),
            image: "denoland/deno:2.1.4".to_string(),
            extension: "ts".to_string(),
            source_stem: "main".to_string(),
            run_command: argv(&["deno", "run", "--quiet", "--no-prompt", "{file}"]),
            compile_command: None,
            repl_command: argv(&["deno", "repl", "--quiet"]),
            env: with_env(&[("DENO_DIR", "/tmp/.deno"), ("NO_COLOR", "1")]),
            aliases: argv(&["ts", "deno"]),
            prompt: PromptStyle::Deno,
            limits: ResourceLimits {
                memory_bytes: 384 * MIB,
                timeout_ms: 15_000,
                ..ResourceLimits::default()
            },
        },
        LanguageProfile {
            id: "java".to_string(),
            display_name: "Java 21".to_string(),
            image: "eclipse-temurin:21-jdk".to_string(),
            extension: "java".to_string(),
            source_stem: "Main".to_string(),
            run_command: argv(&["java", "-Xshare:off", "-cp", "/tmp/build", "Main"]),
            compile_command: Some(argv(&["javac", "-d", "/tmp/build", "{file}"])),
            repl_command: argv(&["jshell", "-q"]),
            env: with_env(&[("JAVA_TOOL_OPTIONS", "-XX:+UseSerialGC -XX:TieredStopAtLevel=1")]),
            aliases: argv(&["jdk"]),
            prompt: PromptStyle::Jshell,
            limits: ResourceLimits {
                memory_bytes: 512 * MIB,
                nano_cpus: 1_000_000_000,
                max_processes: 128,
                timeout_ms: 20_000,
                ..ResourceLimits::default()
            },
        },
        LanguageProfile {
            id: "ruby".to_string(),
            display_name: "Ruby 3.3".to_string(),
            image: "ruby:3.3-slim".to_string(),
            extension: "rb".to_string(),
            source_stem: "main".to_string(),
            run_command: argv(&["ruby", "{file}"]),
            compile_command: None,
            repl_command: argv(&["irb", "--simple-prompt"]),
            env: with_env(&[]),
            aliases: argv(&["rb"]),
            prompt: PromptStyle::Ruby,
            limits: ResourceLimits::default(),
        },
        LanguageProfile {
            id: "php".to_string(),
            display_name: "PHP 8.3".to_string(),
            image: "php:8.3-cli".to_string(),
            extension: "php".to_string(),
            source_stem: "main".to_string(),
            run_command: argv(&["php", "{file}"]),
            compile_command: None,
            repl_command: argv(&["php", "-a"]),
            env: with_env(&[]),
            aliases: Vec::new(),
            prompt: PromptStyle::Php,
            limits: ResourceLimits::default(),
        },
        LanguageProfile {
            id: "bash".to_string(),
            display_name: "Bash 5.2".to_string(),
            image: "bash:5.2".to_string(),
            extension: "sh".to_string(),
            source_stem: "main".to_string(),
            run_command: argv(&["bash", "{file}"]),
            compile_command: None,
            repl_command: argv(&["bash", "--norc", "--noprofile", "-i"]),
            env: with_env(&[("PS1", "$ ")]),
            aliases: argv(&["sh", "shell"]),
            prompt: PromptStyle::Shell,
            limits: ResourceLimits {
                timeout_ms: 5_000,
                ..ResourceLimits::default()
            },
        },
    ]
}

/// Identifiers of the built-in profiles, in registration order.
pub fn builtin_language_ids() -> Vec<&'static str> {
    vec!["python", "javascript", "typescript", "java", "ruby", "php", "bash"]
}

/// Read-only mapping from language identifier (or alias) to profile
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: Vec<Arc<LanguageProfile>>,
    index: HashMap<String, usize>,
}

impl LanguageRegistry {
    pub fn builtin() -> Self {
        Self::from_profiles(builtin_profiles())
    }

    /// Built-in table with operator overrides applied. Overrides naming an
    /// unknown language are a configuration error, not silently dropped.
    pub fn with_overrides(overrides: &HashMap<String, LanguageOverride>) -> Result<Self, ExecError> {
        let mut profiles = builtin_profiles();
        for (language, over) in overrides {
            let key = language.to_ascii_lowercase();
            let profile = profiles
                .iter_mut()
                .find(|p| p.id == key || p.aliases.iter().any(|a| *a == key))
                .ok_or_else(|| {
                    ExecError::Config(format!("Override for unknown language '{}'", language))
                })?;
            profile.apply_override(over);
            log::info!("Applied configuration override for language '{}'", profile.id);
        }
        Ok(Self::from_profiles(profiles))
    }

    pub fn from_profiles(profiles: Vec<LanguageProfile>) -> Self {
        let mut index = HashMap::new();
        let profiles: Vec<Arc<LanguageProfile>> = profiles.into_iter().map(Arc::new).collect();
        for (pos, profile) in profiles.iter().enumerate() {
            index.insert(profile.id.to_ascii_lowercase(), pos);
            for alias in &profile.aliases {
                index.entry(alias.to_ascii_lowercase()).or_insert(pos);
            }
        }
        Self { profiles, index }
    }

    pub fn lookup(&self, id: &str) -> Result<Arc<LanguageProfile>, ExecError> {
        let key = id.trim().to_ascii_lowercase();
        self.index
            .get(&key)
            .map(|&pos| Arc::clone(&self.profiles[pos]))
            .ok_or_else(|| ExecError::UnsupportedLanguage(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(&id.trim().to_ascii_lowercase())
    }

    pub fn profiles(&self) -> &[Arc<LanguageProfile>] {
        &self.profiles
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_id_and_alias() {
        let registry = LanguageRegistry::builtin();
        assert_eq!(registry.lookup("python").unwrap().id, "python");
        assert_eq!(registry.lookup("PY").unwrap().id, "python");
        assert_eq!(registry.lookup("nodejs").unwrap().id, "javascript");
        assert_eq!(registry.lookup(" shell ").unwrap().id, "bash");
    }

    #[test]
    fn test_unknown_language_is_unsupported() {
        let registry = LanguageRegistry::builtin();
        let err = registry.lookup("cobol").unwrap_err();
        assert_eq!(err, ExecError::UnsupportedLanguage("cobol".to_string()));
        assert!(!registry.contains("cobol"));
    }

    #[test]
    fn test_builtin_ids_match_table() {
        let registry = LanguageRegistry::builtin();
        let ids: Vec<&str> = registry.profiles().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, builtin_language_ids());
    }

    #[test]
    fn test_command_expansion() {
        let registry = LanguageRegistry::builtin();
        let python = registry.lookup("python").unwrap();
        assert_eq!(python.source_path(), "/tmp/main.py");
        assert_eq!(python.run_argv(), vec!["python3", "-u", "/tmp/main.py"]);
        assert!(python.compile_argv().is_none());

        let java = registry.lookup("java").unwrap();
        assert_eq!(java.source_path(), "/tmp/Main.java");
        assert_eq!(
            java.compile_argv().unwrap(),
            vec!["javac", "-d", "/tmp/build", "/tmp/Main.java"]
        );
    }

    #[test]
    fn test_overrides_apply_to_profile() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "py".to_string(),
            LanguageOverride {
                image: Some("python:3.11-alpine".to_string()),
                timeout_ms: Some(1234),
                memory_mb: Some(128),
                cpus: Some(2.0),
                max_processes: Some(16),
            },
        );
        let registry = LanguageRegistry::with_overrides(&overrides).unwrap();
        let python = registry.lookup("python").unwrap();
        assert_eq!(python.image, "python:3.11-alpine");
        assert_eq!(python.limits.timeout(), Duration::from_millis(1234));
        assert_eq!(python.limits.memory_bytes, 128 * MIB);
        assert_eq!(python.limits.nano_cpus, 2_000_000_000);
        assert_eq!(python.limits.max_processes, 16);
        assert!((python.limits.cpus() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_override_for_unknown_language_fails() {
        let mut overrides = HashMap::new();
        overrides.insert("cobol".to_string(), LanguageOverride::default());
        let err = LanguageRegistry::with_overrides(&overrides).unwrap_err();
        assert!(matches!(err, ExecError::Config(_)));
    }

    #[test]
    fn test_profiles_serialize_for_listing() {
        let registry = LanguageRegistry::builtin();
        let value = serde_json::to_value(registry.lookup("bash").unwrap().as_ref()).unwrap();
        assert_eq!(value["id"], "bash");
        assert_eq!(value["displayName"], "Bash 5.2");
        assert_eq!(value["limits"]["timeoutMs"], 5000);
        assert_eq!(value["prompt"], "shell");
    }
}
