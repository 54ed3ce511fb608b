//! Parsing hook payloads emitted by the wrapped assistant.

use tlink_core::{ConversationId, HookEventType, PermissionInput, ToolInput};
use serde::Deserialize;

/// Raw hook event JSON as delivered on the hook's stdin.
///
/// Flat structure with every field optional except the identifiers.
/// Use [`RawHookEvent::tool_input`] for the typed view of the tool call.
#[derive(Debug, Clone, Deserialize)]
pub struct RawHookEvent {
    // === Common Fields (all events) ===
    /// The assistant's own conversation id, not the registry session id.
    pub session_id: String,
    pub hook_event_name: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub transcript_path: Option<String>,

    // === Tool Events (PreToolUse, PermissionRequest, PostToolUse) ===
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_input: Option<serde_json::Value>,
    #[serde(default)]
    pub permission_suggestions: Option<serde_json::Value>,

    // === Session Events (SessionStart, SessionEnd) ===
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,

    // === Notification ===
    #[serde(default)]
    pub message: Option<String>,
}

impl RawHookEvent {
    /// Parses the hook event type.
    pub fn event_type(&self) -> Option<HookEventType> {
        HookEventType::from_event_name(&self.hook_event_name)
    }

    /// Returns the conversation id the hook fired for.
    pub fn conversation_id(&self) -> ConversationId {
        ConversationId::new(self.session_id.as_str())
    }

    /// Resolves the tool call carried by this event, if any.
    pub fn tool_input(&self) -> Option<ToolInput> {
        let name = self.tool_name.as_deref()?;
        let input = self
            .tool_input
            .clone()
            .unwrap_or(serde_json::Value::Null);
        Some(ToolInput::from_tool_call(name, input))
    }

    /// Shortcut for permission-gated tool calls.
    pub fn permission(&self) -> Option<PermissionInput> {
        match self.tool_input()? {
            ToolInput::Permission(p) => Some(p),
            _ => None,
        }
    }

    /// Returns true if the event is a resume or compaction restart.
    pub fn is_continuation(&self) -> bool {
        self.event_type() == Some(HookEventType::SessionStart)
            && matches!(self.source.as_deref(), Some("resume") | Some("compact"))
    }
}
