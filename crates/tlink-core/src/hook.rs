//! Hook event types emitted by the wrapped assistant.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Types of hook events the assistant emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum HookEventType {
    /// Before a tool is executed (question tool is answered here)
    PreToolUse,

    /// After a tool completes execution
    PostToolUse,

    /// The tool is about to show a local permission prompt
    PermissionRequest,

    /// Notification event (informational)
    Notification,

    /// A conversation starts or resumes
    SessionStart,

    /// A conversation ends
    SessionEnd,

    /// The assistant finished its turn
    Stop,
}

impl HookEventType {
    /// Returns true if the event blocks on a user decision.
    pub fn awaits_answer(&self) -> bool {
        matches!(self, Self::PreToolUse | Self::PermissionRequest)
    }

    /// Parses from a hook event name string.
    pub fn from_event_name(name: &str) -> Option<Self> {
        match name {
            "PreToolUse" => Some(Self::PreToolUse),
            "PostToolUse" => Some(Self::PostToolUse),
            "PermissionRequest" => Some(Self::PermissionRequest),
            "Notification" => Some(Self::Notification),
            "SessionStart" => Some(Self::SessionStart),
            "SessionEnd" => Some(Self::SessionEnd),
            "Stop" => Some(Self::Stop),
            _ => None,
        }
    }
}

impl fmt::Display for HookEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PreToolUse => "PreToolUse",
            Self::PostToolUse => "PostToolUse",
            Self::PermissionRequest => "PermissionRequest",
            Self::Notification => "Notification",
            Self::SessionStart => "SessionStart",
            Self::SessionEnd => "SessionEnd",
            Self::Stop => "Stop",
        };
        f.write_str(name)
    }
}
