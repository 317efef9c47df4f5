//! REPL prompt recognition
//!
//! Prompts are matched against the unterminated tail of the output buffer,
//! i.e. the bytes after the last newline. Interpreters decorate prompts with
//! cursor and colour sequences, so any number of CSI sequences may surround
//! the prompt text.

use regex::bytes::Regex;

use crate::languages::PromptStyle;

const CSI: &str = r"(?:\x1b\[[0-9;?]*[ -/]*[@-~])*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromptMode {
    /// No prompt seen since the last command was submitted.
    #[default]
    Unknown,
    /// Waiting for a new statement.
    Primary,
    /// Waiting for the rest of an unfinished statement.
    Continuation,
}

#[derive(Debug, Clone)]
pub struct PromptDetector {
    primary: Option<Regex>,
    secondary: Option<Regex>,
}

fn anchored(prompt: &str) -> Option<Regex> {
    Regex::new(&format!(r"^{csi}(?:{prompt}){csi}$", csi = CSI, prompt = prompt)).ok()
}

impl PromptDetector {
    pub fn for_style(style: PromptStyle) -> Self {
        let (primary, secondary) = match style {
            PromptStyle::Shell => (None, None),
            PromptStyle::Python => (Some(r">>> "), Some(r"\.\.\. ")),
            PromptStyle::Node => (Some(r"> "), Some(r"\.\.\. ")),
            PromptStyle::Deno => (Some(r"> "), None),
            PromptStyle::Ruby => (Some(r">> "), Some(r#"[?"'*]> "#)),
            PromptStyle::Php => (Some(r"php > "), Some(r#"php [{("'] "#)),
            PromptStyle::Jshell => (Some(r"jshell> "), Some(r"\s*\.\.\.> ")),
        };
        Self {
            primary: primary.and_then(anchored),
            secondary: secondary.and_then(anchored),
        }
    }

    pub fn has_prompts(&self) -> bool {
        self.primary.is_some()
    }

    /// Classify an unterminated line; `None` when it is not a prompt.
    pub fn classify(&self, tail: &[u8]) -> Option<PromptMode> {
        if tail.is_empty() {
            return None;
        }
        if self.primary.as_ref().is_some_and(|re| re.is_match(tail)) {
            return Some(PromptMode::Primary);
        }
        if self.secondary.as_ref().is_some_and(|re| re.is_match(tail)) {
            return Some(PromptMode::Continuation);
        }
        None
    }
}
