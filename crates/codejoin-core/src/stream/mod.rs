//! Pty output framing
//!
//! [`StreamProcessor`] sits between a pseudo-terminal and the transport. It
//! buffers partial reads and cuts the byte stream into chunks at logical
//! boundaries: the last newline, or the whole buffer when its unterminated
//! tail is a REPL prompt. When neither shows up before the buffer reaches its
//! ceiling, a prefix is force-flushed, preferring a cut that splits neither a
//! UTF-8 character nor an escape sequence.
//!
//! Content is never rewritten. Escape sequences and control characters are
//! counted and passed through; the only transformation is the optional
//! CRLF to LF normalization.

use bytes::{Bytes, BytesMut};

use crate::languages::PromptStyle;

pub mod prompt;

pub use prompt::{PromptDetector, PromptMode};

const ESC: u8 = 0x1b;

/// Longest escape sequence the forced-flush cut will try to keep whole.
const MAX_HELD_SEQUENCE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub max_buffer: usize,
    pub fix_line_endings: bool,
    pub prompt: PromptStyle,
}

impl StreamConfig {
    pub fn new(prompt: PromptStyle, max_buffer: usize, fix_line_endings: bool) -> Self {
        Self {
            max_buffer: max_buffer.max(1),
            fix_line_endings,
            prompt,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub bytes_processed: u64,
    pub chunks_emitted: u64,
    pub control_chars: u64,
    pub ansi_sequences: u64,
    pub forced_flushes: u64,
    pub prompts_detected: u64,
    pub input_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum AnsiState {
    #[default]
    Ground,
    Escape,
    EscIntermediate,
    Csi,
    Osc,
    OscEscape,
}

/// Incremental escape-sequence recogniser; state survives chunk borders.
#[derive(Debug, Clone, Default)]
struct AnsiScanner {
    state: AnsiState,
}

impl AnsiScanner {
    /// Feed one byte. Returns `(sequence_completed, is_control_char)`.
    fn feed(&mut self, b: u8) -> (bool, bool) {
        use AnsiState::*;
        match self.state {
            Ground => {
                if b == ESC {
                    self.state = Escape;
                    (false, false)
                } else {
                    (false, is_counted_control(b))
                }
            }
            Escape => match b {
                b'[' => {
                    self.state = Csi;
                    (false, false)
                }
                b']' => {
                    self.state = Osc;
                    (false, false)
                }
                0x20..=0x2f => {
                    self.state = EscIntermediate;
                    (false, false)
                }
                _ => {
                    self.state = Ground;
                    (true, false)
                }
            },
            EscIntermediate => match b {
                0x20..=0x2f => (false, false),
                _ => {
                    self.state = Ground;
                    (true, false)
                }
            },
            Csi => {
                if (0x40..=0x7e).contains(&b) {
                    self.state = Ground;
                    (true, false)
                } else {
                    (false, false)
                }
            }
            Osc => match b {
                0x07 => {
                    self.state = Ground;
                    (true, false)
                }
                ESC => {
                    self.state = OscEscape;
                    (false, false)
                }
                _ => (false, false),
            },
            OscEscape => {
                if b == b'\\' {
                    self.state = Ground;
                    (true, false)
                } else {
                    self.state = Osc;
                    (false, false)
                }
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.state == AnsiState::Ground
    }
}

fn is_counted_control(b: u8) -> bool {
    (b < 0x20 && !matches!(b, b'\n' | b'\r' | b'\t')) || b == 0x7f
}

/// Largest cut `<= limit` that does not land inside a UTF-8 character or an
/// unterminated escape sequence. Falls back to `limit` when no such cut
/// exists in the window.
fn safe_cut(buf: &[u8], limit: usize) -> usize {
    let limit = limit.min(buf.len());
    let mut cut = limit;

    let window_start = limit.saturating_sub(MAX_HELD_SEQUENCE);
    if let Some(pos) = buf[window_start..limit].iter().rposition(|&b| b == ESC) {
        let esc_at = window_start + pos;
        let mut scanner = AnsiScanner::default();
        let terminated = buf[esc_at..limit].iter().any(|&b| scanner.feed(b).0);
        if !terminated && esc_at > 0 {
            cut = esc_at;
        }
    }

    let cut = utf8_boundary(buf, cut);
    if cut == 0 {
        return limit;
    }
    cut
}

/// Move `cut` back to the start of the character it would otherwise split.
fn utf8_boundary(buf: &[u8], cut: usize) -> usize {
    let floor = cut.saturating_sub(4);
    let Some(lead) = (floor..cut).rev().find(|&i| (buf[i] & 0xc0) != 0x80) else {
        return cut;
    };
    let width = match buf[lead] {
        0x00..=0x7f => 1,
        0xc0..=0xdf => 2,
        0xe0..=0xef => 3,
        0xf0..=0xf7 => 4,
        _ => 1,
    };
    if lead + width > cut {
        lead
    } else {
        cut
    }
}

#[derive(Debug)]
pub struct StreamProcessor {
    config: StreamConfig,
    buffer: BytesMut,
    pending_cr: bool,
    detector: PromptDetector,
    scanner: AnsiScanner,
    mode: PromptMode,
    multiline: bool,
    stats: StreamStats,
}

impl StreamProcessor {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            detector: PromptDetector::for_style(config.prompt),
            buffer: BytesMut::with_capacity(config.max_buffer.min(8192)),
            config,
            pending_cr: false,
            scanner: AnsiScanner::default(),
            mode: PromptMode::Unknown,
            multiline: false,
            stats: StreamStats::default(),
        }
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    pub fn prompt_mode(&self) -> PromptMode {
        self.mode
    }

    /// True while the REPL is waiting for the rest of a statement.
    pub fn in_multiline(&self) -> bool {
        self.multiline
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len() + usize::from(self.pending_cr)
    }

    /// Feed pty output; returns the chunks that became ready, in order.
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.stats.bytes_processed += data.len() as u64;
        if self.config.fix_line_endings {
            self.append_normalized(data);
        } else {
            self.append(data);
        }

        let mut chunks = Vec::new();
        if let Some(chunk) = self.take_boundary() {
            chunks.push(chunk);
        }
        while self.buffer.len() >= self.config.max_buffer {
            let cut = safe_cut(&self.buffer, self.config.max_buffer);
            self.stats.forced_flushes += 1;
            chunks.push(self.emit(cut));
        }
        chunks
    }

    /// Emit whatever is buffered; used when the pty has gone quiet. A
    /// trailing CR is held back for one more quiet period so a late LF can
    /// still be normalized, then released on its own.
    pub fn flush(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            if !self.pending_cr {
                return None;
            }
            self.release_cr();
        }
        let len = self.buffer.len();
        Some(self.emit(len))
    }

    /// Emit everything, including a held CR; used when the pty has closed.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.pending_cr {
            self.release_cr();
        }
        self.flush()
    }

    fn release_cr(&mut self) {
        self.pending_cr = false;
        self.observe(b'\r');
        self.buffer.extend_from_slice(b"\r");
    }

    /// Input direction: bytes are forwarded untouched. Submitting a line
    /// leaves the prompt state unknown until the program prompts again.
    pub fn process_input(&mut self, data: &[u8]) -> Bytes {
        self.stats.input_bytes += data.len() as u64;
        if data.iter().any(|&b| b == b'\r' || b == b'\n') {
            self.mode = PromptMode::Unknown;
        }
        Bytes::copy_from_slice(data)
    }

    fn append(&mut self, data: &[u8]) {
        for &b in data {
            self.observe(b);
        }
        self.buffer.extend_from_slice(data);
    }

    fn append_normalized(&mut self, data: &[u8]) {
        for &b in data {
            if self.pending_cr {
                self.pending_cr = false;
                if b == b'\n' {
                    self.observe(b'\n');
                    self.buffer.extend_from_slice(b"\n");
                    continue;
                }
                self.observe(b'\r');
                self.buffer.extend_from_slice(b"\r");
            }
            if b == b'\r' {
                self.pending_cr = true;
            } else {
                self.observe(b);
                self.buffer.extend_from_slice(&[b]);
            }
        }
    }

    fn observe(&mut self, b: u8) {
        let (completed, control) = self.scanner.feed(b);
        if completed {
            self.stats.ansi_sequences += 1;
        }
        if control {
            self.stats.control_chars += 1;
        }
    }

    fn take_boundary(&mut self) -> Option<Bytes> {
        let tail_start = self
            .buffer
            .iter()
            .rposition(|&b| b == b'\n')
            .map(|pos| pos + 1)
            .unwrap_or(0);

        if self.detector.has_prompts() && !self.pending_cr && self.scanner.is_idle() {
            if let Some(mode) = self.detector.classify(&self.buffer[tail_start..]) {
                self.mode = mode;
                self.multiline = mode == PromptMode::Continuation;
                self.stats.prompts_detected += 1;
                let len = self.buffer.len();
                return Some(self.emit(len));
            }
        }

        if tail_start > 0 {
            return Some(self.emit(tail_start));
        }
        None
    }

    fn emit(&mut self, len: usize) -> Bytes {
        self.stats.chunks_emitted += 1;
        self.buffer.split_to(len).freeze()
    }
}
