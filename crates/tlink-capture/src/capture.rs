//! Bounded window of cleaned terminal output lines.
//!
//! Raw PTY output is split into lines, stripped of escape sequences and
//! cursor/box-drawing decoration, and kept in a FIFO bounded by both line
//! count and total bytes. Eviction always drops whole lines from the front.
//!
//! # Panic-Free Guarantees
//!
//! All slicing happens on char boundaries found via `char_indices`.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::noise::NoiseFilter;

/// Default maximum number of retained lines.
pub const DEFAULT_MAX_LINES: usize = 500;

/// Default maximum number of retained bytes (sum of line lengths).
pub const DEFAULT_MAX_BYTES: usize = 64 * 1024;

static LINE_BREAKS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\r\n]+").unwrap());

/// OSC sequences, CSI sequences, then two-byte escapes.
static ANSI_ESCAPES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b\[[0-?]*[ -/]*[@-~]|\x1b[@-Z\\-_]")
        .unwrap()
});

static CONTROL_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\x00-\x08\x0b-\x1f\x7f]").unwrap());

static CURSOR_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[❯>]+\s*").unwrap());

static BOX_DRAWING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[─│┌┐└┘├┤┬┴┼═║╔╗╚╝╠╣╦╩╬╭╮╯╰]").unwrap());

static CONTINUITY_COMMAND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^/(compact|resume)\b").unwrap());

/// Size bounds for a capture window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureLimits {
    pub max_lines: usize,
    pub max_bytes: usize,
}

impl Default for CaptureLimits {
    fn default() -> Self {
        Self {
            max_lines: DEFAULT_MAX_LINES,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

/// Strips ANSI/OSC escape sequences and remaining control characters.
pub fn strip_ansi(text: &str) -> String {
    let without_escapes = ANSI_ESCAPES.replace_all(text, "");
    let tabs = without_escapes.replace('\t', " ");
    CONTROL_CHARS.replace_all(&tabs, "").into_owned()
}

/// Removes the selection cursor and box-drawing characters, then trims.
pub fn clean_line(line: &str) -> String {
    let stripped = strip_ansi(line);
    let no_cursor = CURSOR_PREFIX.replace(stripped.trim_start(), "");
    BOX_DRAWING.replace_all(&no_cursor, "").trim().to_string()
}

/// Returns true if the line starts with a command that changes the
/// assistant's conversation id.
pub fn is_continuity_command(line: &str) -> bool {
    CONTINUITY_COMMAND.is_match(line)
}

/// Bounded FIFO of cleaned lines.
#[derive(Debug, Clone)]
pub struct CaptureWindow {
    lines: VecDeque<String>,
    retained_bytes: usize,
    partial: String,
    /// Trailing bytes of an incomplete UTF-8 sequence.
    pending_bytes: Vec<u8>,
    limits: CaptureLimits,
    filter: NoiseFilter,
    bytes_written: u64,
    updated_at: Option<DateTime<Utc>>,
    continuity_pending: bool,
}

impl Default for CaptureWindow {
    fn default() -> Self {
        Self::new(CaptureLimits::default())
    }
}

impl CaptureWindow {
    /// Creates a window that drops terminal chrome as it captures.
    pub fn new(limits: CaptureLimits) -> Self {
        Self::with_filter(limits, NoiseFilter::terminal())
    }

    pub fn with_filter(limits: CaptureLimits, filter: NoiseFilter) -> Self {
        Self {
            lines: VecDeque::new(),
            retained_bytes: 0,
            partial: String::new(),
            pending_bytes: Vec::new(),
            limits,
            filter,
            bytes_written: 0,
            updated_at: None,
            continuity_pending: false,
        }
    }

    /// Appends raw PTY bytes.
    ///
    /// A multi-byte character split across two reads is held back until
    /// the rest arrives. Invalid sequences are replaced.
    pub fn append_bytes(&mut self, data: &[u8]) -> usize {
        let mut buf = std::mem::take(&mut self.pending_bytes);
        buf.extend_from_slice(data);

        let keep_from = match std::str::from_utf8(&buf) {
            Ok(_) => buf.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => buf.len(),
        };
        self.pending_bytes = buf.split_off(keep_from);

        let text = String::from_utf8_lossy(&buf).into_owned();
        // Count the held-back tail once it completes.
        self.bytes_written += buf.len() as u64;
        self.push_text(&text)
    }

    /// Appends a text fragment. Returns the number of lines retained.
    pub fn append(&mut self, text: &str) -> usize {
        self.bytes_written += text.len() as u64;
        self.push_text(text)
    }

    fn push_text(&mut self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.updated_at = Some(Utc::now());

        let mut combined = std::mem::take(&mut self.partial);
        combined.push_str(text);

        let ends_with_break = combined.ends_with(['\r', '\n']);
        let mut parts: Vec<&str> = LINE_BREAKS.split(&combined).collect();
        if !ends_with_break {
            self.partial = parts.pop().unwrap_or_default().to_string();
        }

        let mut added = 0;
        for raw in parts {
            if self.push_line(raw) {
                added += 1;
            }
        }

        // A line that never terminates is flushed once it alone fills the window.
        if self.partial.len() > self.limits.max_bytes {
            let flushed = std::mem::take(&mut self.partial);
            if self.push_line(&flushed) {
                added += 1;
            }
        }

        self.evict();
        added
    }

    fn push_line(&mut self, raw: &str) -> bool {
        let clean = clean_line(raw);
        if clean.is_empty() {
            return false;
        }

        if is_continuity_command(&clean) {
            debug!(line = %clean, "Continuity command observed");
            self.continuity_pending = true;
        }

        if self.filter.is_noise(&clean) {
            return false;
        }

        let clean = truncate_front(clean, self.limits.max_bytes);
        self.retained_bytes += clean.len();
        self.lines.push_back(clean);
        true
    }

    fn evict(&mut self) {
        while self.lines.len() > self.limits.max_lines || self.retained_bytes > self.limits.max_bytes {
            match self.lines.pop_front() {
                Some(line) => self.retained_bytes -= line.len(),
                None => break,
            }
        }
    }

    /// Retained lines, oldest first.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    /// The most recent `n` lines, oldest first.
    pub fn last_n(&self, n: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Bytes currently retained.
    pub fn retained_bytes(&self) -> usize {
        self.retained_bytes
    }

    /// Total raw bytes ever appended.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn limits(&self) -> CaptureLimits {
        self.limits
    }

    pub fn continuity_pending(&self) -> bool {
        self.continuity_pending
    }

    /// Clears the continuity flag, returning its previous value.
    pub fn acknowledge_continuity_command(&mut self) -> bool {
        std::mem::replace(&mut self.continuity_pending, false)
    }
}

/// Keeps the last `max_bytes` of `line`, cut on a char boundary.
fn truncate_front(line: String, max_bytes: usize) -> String {
    if line.len() <= max_bytes {
        return line;
    }
    let start = line.len() - max_bytes;
    let boundary = line
        .char_indices()
        .map(|(i, _)| i)
        .find(|&i| i >= start)
        .unwrap_or(line.len());
    line.get(boundary..).unwrap_or_default().to_string()
}
