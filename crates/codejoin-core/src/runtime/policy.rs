//! Fixed isolation posture and container spec construction
//!
//! The policy is not configurable per request. Language profiles only choose
//! the size of the box (memory, CPU, processes, files, tmpfs); everything
//! else about the box is decided here.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::collections::HashMap;

use super::{ContainerSpec, Owner};
use crate::languages::{LanguageProfile, SANDBOX_WORKDIR};

pub const LABEL_MANAGED: &str = "codejoin.managed";
pub const LABEL_OWNER_KIND: &str = "codejoin.owner";
pub const LABEL_OWNER_ID: &str = "codejoin.owner_id";
pub const LABEL_LANGUAGE: &str = "codejoin.language";

pub const ENV_SOURCE: &str = "CODEJOIN_SOURCE";
pub const ENV_STDIN: &str = "CODEJOIN_STDIN";

const STDIN_PATH: &str = "/tmp/.stdin";

/// Host-side log ceiling for tty containers; their output is read off the
/// attached pty, never from the log.
pub const INTERACTIVE_LOG_BYTES: u64 = 1024 * 1024;
const MIN_BATCH_LOG_BYTES: u64 = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityPolicy {
    pub network_disabled: bool,
    pub read_only_root: bool,
    /// `uid:gid` of the workload; never root.
    pub user: String,
    pub cap_drop: Vec<String>,
    pub security_opts: Vec<String>,
    pub tmpfs_path: String,
    pub tmpfs_flags: Vec<String>,
    /// Engine log driver; it must support reading logs back.
    pub log_driver: String,
}

impl SecurityPolicy {
    pub fn locked_down() -> Self {
        Self {
            network_disabled: true,
            read_only_root: true,
            user: "65534:65534".to_string(),
            cap_drop: vec!["ALL".to_string()],
            security_opts: vec!["no-new-privileges".to_string()],
            tmpfs_path: SANDBOX_WORKDIR.to_string(),
            tmpfs_flags: vec![
                "rw".to_string(),
                "noexec".to_string(),
                "nosuid".to_string(),
                "nodev".to_string(),
            ],
            log_driver: "local".to_string(),
        }
    }

    /// Mount options for the writable scratch area, size included.
    pub fn tmpfs_options(&self, size_bytes: i64) -> String {
        let mut opts = self.tmpfs_flags.clone();
        opts.push(format!("size={}", size_bytes));
        opts.push("mode=1777".to_string());
        opts.join(",")
    }
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self::locked_down()
    }
}

pub fn managed_labels(owner: &Owner, language: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
    labels.insert(LABEL_OWNER_KIND.to_string(), owner.kind().to_string());
    labels.insert(LABEL_OWNER_ID.to_string(), owner.id().to_string());
    labels.insert(LABEL_LANGUAGE.to_string(), language.to_string());
    labels
}

fn profile_env(profile: &LanguageProfile) -> Vec<String> {
    profile
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect()
}

fn container_name(owner: &Owner) -> String {
    format!("codejoin-{}-{}", owner.kind(), owner.id())
}

/// Single-quote an argument for `/bin/sh`.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:@+,".contains(&b))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Host-side log ceiling for a batch run: room for stdout and stderr at
/// their cap plus the driver's per-entry framing.
pub fn batch_log_limit(max_output_bytes: usize) -> u64 {
    u64::try_from(max_output_bytes)
        .unwrap_or(u64::MAX)
        .saturating_mul(4)
        .max(MIN_BATCH_LOG_BYTES)
}

fn join_argv(argv: &[String]) -> String {
    argv.iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Shell script that materialises the source from the environment, compiles
/// it when the profile needs it, and replaces itself with the program.
pub fn batch_script(profile: &LanguageProfile, has_stdin: bool) -> String {
    let source = shell_quote(&profile.source_path());
    let mut steps = vec![format!(
        "printf '%s' \"${}\" | base64 -d > {}",
        ENV_SOURCE, source
    )];
    if has_stdin {
        steps.push(format!(
            "printf '%s' \"${}\" | base64 -d > {}",
            ENV_STDIN, STDIN_PATH
        ));
    }
    steps.push(format!("unset {} {}", ENV_SOURCE, ENV_STDIN));
    if let Some(compile) = profile.compile_argv() {
        steps.push(join_argv(&compile));
    }
    let stdin_redirect = if has_stdin { STDIN_PATH } else { "/dev/null" };
    steps.push(format!("exec {} < {}", join_argv(&profile.run_argv()), stdin_redirect));
    steps.join(" && ")
}

pub fn batch_spec(
    profile: &LanguageProfile,
    owner: &Owner,
    code: &str,
    stdin: Option<&str>,
    max_output_bytes: usize,
) -> ContainerSpec {
    let mut env = profile_env(profile);
    env.push(format!("{}={}", ENV_SOURCE, BASE64.encode(code.as_bytes())));
    let has_stdin = matches!(stdin, Some(s) if !s.is_empty());
    if let Some(input) = stdin.filter(|s| !s.is_empty()) {
        env.push(format!("{}={}", ENV_STDIN, BASE64.encode(input.as_bytes())));
    }

    ContainerSpec {
        name: container_name(owner),
        image: profile.image.clone(),
        cmd: vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            batch_script(profile, has_stdin),
        ],
        env,
        working_dir: SANDBOX_WORKDIR.to_string(),
        tty: false,
        open_stdin: false,
        labels: managed_labels(owner, &profile.id),
        limits: profile.limits.clone(),
        policy: SecurityPolicy::locked_down(),
        log_max_bytes: batch_log_limit(max_output_bytes),
    }
}

pub fn interactive_spec(profile: &LanguageProfile, owner: &Owner) -> ContainerSpec {
    ContainerSpec {
        name: container_name(owner),
        image: profile.image.clone(),
        cmd: profile.repl_command.clone(),
        env: profile_env(profile),
        working_dir: SANDBOX_WORKDIR.to_string(),
        tty: true,
        open_stdin: true,
        labels: managed_labels(owner, &profile.id),
        limits: profile.limits.clone(),
        policy: SecurityPolicy::locked_down(),
        log_max_bytes: INTERACTIVE_LOG_BYTES,
    }
}
