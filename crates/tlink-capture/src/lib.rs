//! threadlink capture - terminal output capture and prompt reconstruction
//!
//! - [`capture`]: bounded window of cleaned output lines
//! - [`store`]: per-process capture windows and atomic snapshot files
//! - [`noise`]: data-driven noise predicates
//! - [`parser`]: rebuilds numbered-option prompts from captured lines
//! - [`transcript`]: read-only views over the assistant's transcript streams

pub mod capture;
pub mod noise;
pub mod parser;
pub mod store;
pub mod transcript;

pub use capture::{clean_line, strip_ansi, CaptureLimits, CaptureWindow, DEFAULT_MAX_BYTES, DEFAULT_MAX_LINES};
pub use noise::{NoiseFilter, NoiseMatch, NoisePredicate};
pub use parser::{OptionParser, ParseOutcome, DEFAULT_CONTEXT_LOOKBACK};
pub use store::{read_snapshot, write_snapshot, CaptureError, CaptureMeta, CaptureSnapshot, CaptureStore};
pub use transcript::{
    transcript_dir, transcript_path, AssistantResponse, Role, StopReason, TodoItem, TodoState,
    TodoStatus, Transcript, TranscriptError, TranscriptMessage, TranscriptSummary,
    MAX_HISTORY_MESSAGES,
};
