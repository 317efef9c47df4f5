//! Input guardrails for live terminal sessions
//!
//! Everything a client types passes through [`InputGuard`] before it reaches a
//! pty. Payloads arrive as text, serialized byte buffers or plain byte arrays
//! and are normalized into one byte representation. Oversized payloads are
//! rejected, as are payloads matching a fixed set of dangerous shell patterns.
//! Control characters (Ctrl-C, Ctrl-D, arrow keys) are signals to the running
//! program and pass through untouched.
//!
//! Terminals usually send one keystroke per message, so a pattern check on
//! each payload alone would never see a whole command. [`LineTracker`]
//! reassembles the line being typed and the guard re-checks it when Enter is
//! submitted, before the Enter itself is forwarded.

use bytes::Bytes;
use regex::bytes::Regex;
use serde::Deserialize;

use crate::errors::ExecError;

// ============================================================================
// INPUT REPRESENTATIONS
// ============================================================================

/// Input payload as it arrives from a client
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawInput {
    /// Plain text
    Text(String),
    /// A serialized byte buffer: `{"type": "Buffer", "data": [..]}`
    Buffer {
        #[serde(rename = "type")]
        kind: String,
        data: Vec<u8>,
    },
    /// A typed byte array
    Array(Vec<u8>),
}

impl From<&str> for RawInput {
    fn from(text: &str) -> Self {
        RawInput::Text(text.to_string())
    }
}

// ============================================================================
// DANGEROUS PATTERNS
// ============================================================================

const DANGEROUS_PATTERNS: &[(&str, &str)] = &[
    ("fork bomb", r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:"),
    ("fork bomb", r"[\w:.-]+\s*\(\s*\)\s*\{[^}]*\|\s*[\w:.-]+\s*&\s*\}"),
    (
        "recursive delete of the root or home directory",
        r"\brm\s+(?:-{1,2}[\w-]*\s+)*(?:/\*?|~/?)(?:\s|;|&|\||$)",
    ),
    ("filesystem creation", r"\bmkfs(?:\.\w+)?\b"),
    (
        "raw write to a block device",
        r"\bdd\b[^\n]*\bof=/dev/(?:sd|hd|nvme|xvd|vd|mmcblk)",
    ),
    (
        "redirect to a block device",
        r">\s*/dev/(?:sd|hd|nvme|xvd|vd|mmcblk)\w*",
    ),
    (
        "recursive permission change on the root directory",
        r"\bch(?:mod|own)\s+-[a-zA-Z]*R[a-zA-Z]*\s+\S+\s+/(?:\s|;|&|\||$)",
    ),
    (
        "process substitution into a shell",
        r"(?:\b(?:bash|sh|zsh|dash|source)|(?:^|[;&|\s])\.)\s+<\(",
    ),
    (
        "download piped into a shell",
        r"\b(?:curl|wget)\b[^|\n]*\|\s*(?:sudo\s+)?(?:ba|z|da)?sh\b",
    ),
];

#[derive(Debug, Clone)]
struct DangerRule {
    name: &'static str,
    pattern: Regex,
}

// ============================================================================
// GUARD
// ============================================================================

#[derive(Debug, Clone)]
pub struct InputGuard {
    max_input_bytes: usize,
    rules: Vec<DangerRule>,
}

impl InputGuard {
    pub fn new(max_input_bytes: usize) -> Result<Self, ExecError> {
        let rules = DANGEROUS_PATTERNS
            .iter()
            .map(|&(name, pattern)| {
                Regex::new(&format!("(?m){}", pattern))
                    .map(|pattern| DangerRule { name, pattern })
                    .map_err(|e| ExecError::Config(format!("Invalid guard pattern for {}: {}", name, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            max_input_bytes,
            rules,
        })
    }

    pub fn max_input_bytes(&self) -> usize {
        self.max_input_bytes
    }

    /// Convert any accepted representation into bytes and enforce the size limit.
    pub fn normalize(&self, raw: RawInput) -> Result<Bytes, ExecError> {
        let bytes = match raw {
            RawInput::Text(text) => {
                let text = text.strip_prefix('\u{feff}').unwrap_or(&text);
                Bytes::copy_from_slice(text.as_bytes())
            }
            RawInput::Buffer { kind, data } => {
                if kind != "Buffer" {
                    return Err(ExecError::validation(format!(
                        "unsupported input buffer type '{}'",
                        kind
                    )));
                }
                Bytes::from(data)
            }
            RawInput::Array(data) => Bytes::from(data),
        };

        if bytes.len() > self.max_input_bytes {
            return Err(ExecError::validation(format!(
                "input is {} bytes, the limit is {} bytes",
                bytes.len(),
                self.max_input_bytes
            )));
        }
        Ok(bytes)
    }

    /// Reject data matching any dangerous pattern.
    pub fn check(&self, data: &[u8]) -> Result<(), ExecError> {
        match self.rules.iter().find(|rule| rule.pattern.is_match(data)) {
            Some(rule) => {
                log::warn!("Rejected terminal input: {}", rule.name);
                Err(ExecError::SecurityViolation(format!(
                    "input rejected: {}",
                    rule.name
                )))
            }
            None => Ok(()),
        }
    }

    /// Normalize then check a single payload.
    pub fn inspect(&self, raw: RawInput) -> Result<Bytes, ExecError> {
        let bytes = self.normalize(raw)?;
        self.check(&bytes)?;
        Ok(bytes)
    }

    /// Feed a payload into `tracker` and check every line it submits. The
    /// tracker is reset when a line is rejected.
    pub fn check_submitted(&self, tracker: &mut LineTracker, data: &[u8]) -> Result<(), ExecError> {
        for line in tracker.feed(data) {
            if let Err(e) = self.check(&line) {
                tracker.clear();
                return Err(e);
            }
        }
        Ok(())
    }
}

// ============================================================================
// LINE TRACKING
// ============================================================================

const MAX_TRACKED_LINE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum KeyState {
    #[default]
    Text,
    Escape,
    Sequence,
}

/// Approximation of the line a terminal user is editing
#[derive(Debug, Clone, Default)]
pub struct LineTracker {
    line: Vec<u8>,
    keys: KeyState,
}

impl LineTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> &[u8] {
        &self.line
    }

    pub fn clear(&mut self) {
        self.line.clear();
        self.keys = KeyState::Text;
    }

    /// Apply keystrokes; returns each line submitted with Enter.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut submitted = Vec::new();
        for &b in data {
            match self.keys {
                KeyState::Escape => {
                    self.keys = if b == b'[' || b == b'O' {
                        KeyState::Sequence
                    } else {
                        KeyState::Text
                    };
                    continue;
                }
                KeyState::Sequence => {
                    if (0x40..=0x7e).contains(&b) {
                        self.keys = KeyState::Text;
                    }
                    continue;
                }
                KeyState::Text => {}
            }

            match b {
                b'\r' | b'\n' => {
                    if !self.line.is_empty() {
                        submitted.push(std::mem::take(&mut self.line));
                    }
                }
                0x7f | 0x08 => self.backspace(),
                0x03 | 0x15 => self.line.clear(),
                0x1b => self.keys = KeyState::Escape,
                b if b < 0x20 => {}
                b => {
                    self.line.push(b);
                    if self.line.len() > MAX_TRACKED_LINE {
                        let excess = self.line.len() - MAX_TRACKED_LINE;
                        self.line.drain(..excess);
                    }
                }
            }
        }
        submitted
    }

    fn backspace(&mut self) {
        while let Some(b) = self.line.pop() {
            if (b & 0xc0) != 0x80 {
                break;
            }
        }
    }
}
