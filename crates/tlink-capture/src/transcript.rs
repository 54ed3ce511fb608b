//! Read-only views over the assistant's `.jsonl` transcript streams.
//!
//! Each line of a stream is one JSON entry. Lines that do not parse are
//! skipped: the wrapped tool appends while we read, so a torn last line is
//! normal.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use tlink_core::ConversationId;

/// Upper bound on messages returned by [`Transcript::last_messages`].
pub const MAX_HISTORY_MESSAGES: usize = 25;

/// Tools whose `file_path` input counts as a modified file.
const EDIT_TOOLS: &[&str] = &["Edit", "MultiEdit", "Write"];

const TODO_TOOL: &str = "TodoWrite";

#[derive(Error, Debug)]
pub enum TranscriptError {
    #[error("Transcript not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Transcript directory for a project: path separators become `-`.
pub fn transcript_dir(root: &Path, project_dir: &Path) -> PathBuf {
    let slug = project_dir.to_string_lossy().replace('/', "-");
    root.join(format!("-{}", slug.trim_start_matches('-')))
}

/// Stream file of one conversation.
pub fn transcript_path(root: &Path, project_dir: &Path, conversation: &ConversationId) -> PathBuf {
    transcript_dir(root, project_dir).join(format!("{}.jsonl", conversation.as_str()))
}

// ============================================================================
// Entry Shapes
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
struct Entry {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: Option<MessageBody>,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct MessageBody {
    #[serde(default)]
    content: Content,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Content {
    Text(String),
    Blocks(Vec<Block>),
}

impl Default for Content {
    fn default() -> Self {
        Self::Blocks(Vec::new())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Block {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

impl Content {
    /// Text blocks joined by a blank line; `None` when there are none.
    fn text(&self) -> Option<String> {
        let joined = match self {
            Self::Text(text) => text.trim().to_string(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    Block::Text { text } if !text.trim().is_empty() => Some(text.trim()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n\n"),
        };
        (!joined.is_empty()).then_some(joined)
    }

    fn tool_uses(&self) -> impl Iterator<Item = (&str, &Value)> {
        let blocks: &[Block] = match self {
            Self::Blocks(blocks) => blocks,
            Self::Text(_) => &[],
        };
        blocks.iter().filter_map(|b| match b {
            Block::ToolUse { name, input } => Some((name.as_str(), input)),
            _ => None,
        })
    }
}

// ============================================================================
// Public Views
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One conversational turn with its text content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptMessage {
    pub role: Role,
    pub text: String,
    pub timestamp: Option<String>,
}

/// The assistant's most recent text reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantResponse {
    pub text: String,
    pub model: Option<String>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoState {
    #[default]
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub content: String,
    #[serde(default)]
    pub status: TodoState,
    #[serde(default, rename = "activeForm", skip_serializing_if = "Option::is_none")]
    pub active_form: Option<String>,
}

/// The last task list the assistant wrote.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TodoStatus {
    pub items: Vec<TodoItem>,
}

impl TodoStatus {
    /// Reads a task list from a todo tool input. `None` when the shape is wrong.
    pub fn from_tool_input(input: &Value) -> Option<Self> {
        #[derive(Deserialize)]
        struct Todos {
            todos: Vec<TodoItem>,
        }
        serde_json::from_value::<Todos>(input.clone())
            .ok()
            .map(|t| Self { items: t.todos })
    }

    pub fn count(&self, state: TodoState) -> usize {
        self.items.iter().filter(|i| i.status == state).count()
    }

    pub fn is_complete(&self) -> bool {
        !self.items.is_empty() && self.count(TodoState::Completed) == self.items.len()
    }

    /// The item being worked on, if any.
    pub fn current(&self) -> Option<&TodoItem> {
        self.items.iter().find(|i| i.status == TodoState::InProgress)
    }
}

/// Why the last assistant turn stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    ToolUse,
    MaxTokens,
    Unknown,
}

/// Summary posted when a session stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptSummary {
    pub response: Option<AssistantResponse>,
    pub todos: Option<TodoStatus>,
    pub modified_files: Vec<PathBuf>,
    pub stop_reason: StopReason,
}

// ============================================================================
// Transcript
// ============================================================================

/// Parsed entries of one stream, in file order.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    entries: Vec<Entry>,
}

impl Transcript {
    /// Loads a stream, skipping lines that are not JSON entries.
    pub fn load(path: &Path) -> Result<Self, TranscriptError> {
        let file = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TranscriptError::NotFound(path.to_path_buf()),
            _ => TranscriptError::Io {
                path: path.to_path_buf(),
                source: e,
            },
        })?;

        let mut entries = Vec::new();
        let mut skipped = 0usize;
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| TranscriptError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Entry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            debug!(path = %path.display(), skipped, "Skipped unparseable transcript lines");
        }
        Ok(Self { entries })
    }

    /// Parses stream text already in memory.
    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .filter_map(|line| serde_json::from_str::<Entry>(line).ok())
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn messages(&self) -> impl DoubleEndedIterator<Item = (Role, &Entry, &MessageBody)> {
        self.entries.iter().filter_map(|e| {
            let role = match e.kind.as_str() {
                "user" => Role::User,
                "assistant" => Role::Assistant,
                _ => return None,
            };
            e.message.as_ref().map(|m| (role, e, m))
        })
    }

    /// Text of the last assistant message. `None` if that message carries
    /// only tool calls.
    pub fn latest_response(&self) -> Option<AssistantResponse> {
        let (_, entry, body) = self
            .messages()
            .rev()
            .find(|(role, _, _)| *role == Role::Assistant)?;
        Some(AssistantResponse {
            text: body.content.text()?,
            model: body.model.clone(),
            timestamp: entry.timestamp.clone(),
        })
    }

    /// The task list from the last todo tool call.
    pub fn todo_status(&self) -> Option<TodoStatus> {
        self.messages()
            .rev()
            .filter(|(role, _, _)| *role == Role::Assistant)
            .flat_map(|(_, _, body)| body.content.tool_uses().collect::<Vec<_>>().into_iter().rev())
            .find(|(name, _)| *name == TODO_TOOL)
            .and_then(|(_, input)| TodoStatus::from_tool_input(input))
    }

    /// Sorted, de-duplicated files touched by edit tools.
    pub fn modified_files(&self) -> Vec<PathBuf> {
        let files: BTreeSet<PathBuf> = self
            .messages()
            .filter(|(role, _, _)| *role == Role::Assistant)
            .flat_map(|(_, _, body)| body.content.tool_uses())
            .filter(|(name, _)| EDIT_TOOLS.contains(name))
            .filter_map(|(_, input)| input.get("file_path").and_then(Value::as_str))
            .map(PathBuf::from)
            .collect();
        files.into_iter().collect()
    }

    /// The last `n` messages with text, oldest first. `n` is clamped to
    /// `1..=MAX_HISTORY_MESSAGES`.
    pub fn last_messages(&self, n: usize) -> Vec<TranscriptMessage> {
        let n = n.clamp(1, MAX_HISTORY_MESSAGES);
        let mut out: Vec<TranscriptMessage> = self
            .messages()
            .rev()
            .filter_map(|(role, entry, body)| {
                body.content.text().map(|text| TranscriptMessage {
                    role,
                    text,
                    timestamp: entry.timestamp.clone(),
                })
            })
            .take(n)
            .collect();
        out.reverse();
        out
    }

    pub fn stop_reason(&self) -> StopReason {
        let last = self
            .messages()
            .rev()
            .find(|(role, _, _)| *role == Role::Assistant)
            .and_then(|(_, _, body)| body.stop_reason.as_deref());
        match last {
            Some("end_turn") | Some("stop_sequence") => StopReason::Completed,
            Some("tool_use") => StopReason::ToolUse,
            Some("max_tokens") => StopReason::MaxTokens,
            _ => StopReason::Unknown,
        }
    }

    pub fn summary(&self) -> TranscriptSummary {
        TranscriptSummary {
            response: self.latest_response(),
            todos: self.todo_status(),
            modified_files: self.modified_files(),
            stop_reason: self.stop_reason(),
        }
    }
}
