//! Hook events from the wrapped assistant.
//!
//! [`registry_effect`] is what `tlink hook` applies to the session record.
//! A router process with a chat client also runs [`EventRouter::handle_hook`]:
//! blocking events (a permission request, a question) are posted as prompts
//! and answered with hook JSON, the rest become chat posts. When no answer
//! arrives nothing is returned and the local terminal prompt stays in charge.

use std::path::Path;

use serde_json::Value;
use tracing::{debug, info, warn};

use tlink_capture::{TodoStatus, Transcript};
use tlink_core::{ConversationId, HookEventType, PromptKind, SessionRecord, ToolInput};
use tlink_protocol::RawHookEvent;

use super::chat::{ChatClient, ChatError};
use super::format::{
    decision_for, format_summary, format_todos, permission_hook_output, question_hook_output,
};
use super::waiter::{PromptAnswer, WaitOutcome};
use super::{EventRouter, SessionGateway};

/// Tool whose input carries the assistant's task list.
pub const TODO_TOOL: &str = "TodoWrite";

/// What a hook event means for the session's registry record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEffect {
    /// Refresh activity (and promote a starting session).
    Heartbeat,
    /// The session now writes to a different conversation.
    Rebind(ConversationId),
    /// The wrapped assistant is gone.
    End,
}

/// Maps a hook event to its registry effect. `None` for unknown events.
///
/// A session end caused by `/clear` is followed by a fresh start in the same
/// process, so it only counts as activity.
pub fn registry_effect(event: &RawHookEvent) -> Option<RegistryEffect> {
    let effect = match event.event_type()? {
        HookEventType::SessionStart => RegistryEffect::Rebind(event.conversation_id()),
        HookEventType::SessionEnd if event.reason.as_deref() == Some("clear") => {
            RegistryEffect::Heartbeat
        }
        HookEventType::SessionEnd => RegistryEffect::End,
        _ => RegistryEffect::Heartbeat,
    };
    Some(effect)
}

impl<C: ChatClient, G: SessionGateway> EventRouter<C, G> {
    /// Handles one hook event for `session`.
    ///
    /// Returns the JSON to print for blocking events that got an answer.
    pub async fn handle_hook(
        &self,
        session: &SessionRecord,
        event: &RawHookEvent,
    ) -> Result<Option<Value>, ChatError> {
        let Some(kind) = event.event_type() else {
            debug!(event = %event.hook_event_name, "Unknown hook event");
            return Ok(None);
        };
        debug!(session_id = %session.session_id, event = %kind, "Hook event");

        if kind.awaits_answer() {
            return match (kind, event.tool_input()) {
                (HookEventType::PermissionRequest, input) => {
                    self.answer_hook(session, PromptKind::Permission, input).await
                }
                (_, Some(input @ ToolInput::Question(_))) => {
                    self.answer_hook(session, PromptKind::Question, Some(input))
                        .await
                }
                _ => Ok(None),
            };
        }

        match kind {
            HookEventType::SessionStart if event.is_continuation() => {
                self.post_output(
                    session,
                    &format!(
                        ":recycle: _Conversation continued as `{}`._",
                        event.conversation_id().short()
                    ),
                );
                Ok(None)
            }
            HookEventType::PostToolUse => {
                if event.tool_name.as_deref() == Some(TODO_TOOL) {
                    if let Some(status) = event.tool_input.as_ref().and_then(TodoStatus::from_tool_input) {
                        self.post_progress(session, &format_todos(&status)).await?;
                    }
                }
                Ok(None)
            }
            HookEventType::Stop => {
                if let Some(path) = event.transcript_path.as_deref() {
                    self.post_stop_summary(session, Path::new(path));
                }
                Ok(None)
            }
            HookEventType::Notification => {
                if let Some(message) = event.message.as_deref().filter(|m| !m.trim().is_empty()) {
                    self.post_output(session, &format!(":bell: {message}"));
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    async fn answer_hook(
        &self,
        session: &SessionRecord,
        kind: PromptKind,
        tool_input: Option<ToolInput>,
    ) -> Result<Option<Value>, ChatError> {
        let prompt = self.build_prompt(kind, tool_input.as_ref(), session.capture_path.as_deref());
        let answer = match self.ask(session, &prompt, None).await? {
            WaitOutcome::Answered(answer) => answer,
            outcome => {
                info!(session_id = %session.session_id, ?outcome, "No remote answer, deferring to terminal");
                return Ok(None);
            }
        };

        let output = match kind {
            PromptKind::Permission => {
                let message = match &answer {
                    PromptAnswer::Text(text) => Some(text.as_str()),
                    PromptAnswer::Choice(_) => None,
                };
                permission_hook_output(decision_for(&prompt, &answer), message)
            }
            PromptKind::Question => question_hook_output(&prompt, &answer),
        };
        Ok(Some(output))
    }

    fn post_stop_summary(&self, session: &SessionRecord, path: &Path) {
        match Transcript::load(path) {
            Ok(transcript) => {
                if let Some(text) = format_summary(&transcript.summary()) {
                    self.post_output(session, &text);
                }
            }
            Err(e) => warn!(session_id = %session.session_id, error = %e, "Transcript unreadable at stop"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use super::super::events::ChatEvent;
    use super::super::testing::{FakeGateway, RecordingChat};
    use super::super::{RouteOutcome, RouterConfig};
    use tlink_core::{RoutingKey, SessionStatus};

    fn router(
        timeout: Duration,
    ) -> (
        Arc<RecordingChat>,
        Arc<FakeGateway>,
        Arc<EventRouter<RecordingChat, FakeGateway>>,
    ) {
        let chat = Arc::new(RecordingChat::default());
        let gateway = Arc::new(FakeGateway::default());
        let router = EventRouter::new(
            Arc::clone(&chat),
            Arc::clone(&gateway),
            RouterConfig {
                bot_user: Some("UBOT".to_string()),
                prompt_timeout: timeout,
                ..RouterConfig::default()
            },
        );
        (chat, gateway, Arc::new(router))
    }

    fn hook(json: serde_json::Value) -> RawHookEvent {
        serde_json::from_value(json).unwrap()
    }

    fn reaction(message_ts: &str, emoji: &str) -> ChatEvent {
        ChatEvent::ReactionAdded {
            channel: "C1".to_string(),
            message_ts: message_ts.to_string(),
            thread: Some("100.0".to_string()),
            reactor: "U1".to_string(),
            emoji: emoji.to_string(),
        }
    }

    #[test]
    fn test_registry_effects() {
        let start = hook(serde_json::json!({
            "session_id": "c2", "hook_event_name": "SessionStart", "source": "resume"
        }));
        assert_eq!(
            registry_effect(&start),
            Some(RegistryEffect::Rebind(ConversationId::new("c2")))
        );

        let end = hook(serde_json::json!({
            "session_id": "c2", "hook_event_name": "SessionEnd", "reason": "logout"
        }));
        assert_eq!(registry_effect(&end), Some(RegistryEffect::End));

        let cleared = hook(serde_json::json!({
            "session_id": "c2", "hook_event_name": "SessionEnd", "reason": "clear"
        }));
        assert_eq!(registry_effect(&cleared), Some(RegistryEffect::Heartbeat));

        let tool = hook(serde_json::json!({
            "session_id": "c2", "hook_event_name": "PostToolUse", "tool_name": "Bash"
        }));
        assert_eq!(registry_effect(&tool), Some(RegistryEffect::Heartbeat));

        let unknown = hook(serde_json::json!({
            "session_id": "c2", "hook_event_name": "SubagentStop"
        }));
        assert_eq!(registry_effect(&unknown), None);
    }

    #[tokio::test]
    async fn test_permission_request_answered_from_chat() {
        let (chat, gateway, router) = router(Duration::from_secs(5));
        let session =
            gateway.add_session("s1", RoutingKey::thread("C1", "100.0"), SessionStatus::Active);
        let event = hook(serde_json::json!({
            "session_id": "c1",
            "hook_event_name": "PermissionRequest",
            "tool_name": "Bash",
            "tool_input": { "command": "cargo test" }
        }));

        let task = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.handle_hook(&session, &event).await })
        };
        while router.waiter().pending_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let posted = chat.posts()[0].0.clone();
        assert_eq!(
            router.handle_event(&reaction(&posted.ts, "+1")).await,
            RouteOutcome::PromptAnswered { index: Some(0) }
        );

        let output = task.await.unwrap().unwrap().unwrap();
        assert_eq!(
            output["hookSpecificOutput"]["hookEventName"],
            "PermissionRequest"
        );
        assert_eq!(output["hookSpecificOutput"]["decision"]["behavior"], "allow");
    }

    #[tokio::test]
    async fn test_question_answered_by_thread_reply() {
        let (_chat, gateway, router) = router(Duration::from_secs(5));
        let session =
            gateway.add_session("s1", RoutingKey::thread("C1", "100.0"), SessionStatus::Active);
        let event = hook(serde_json::json!({
            "session_id": "c1",
            "hook_event_name": "PreToolUse",
            "tool_name": "AskUserQuestion",
            "tool_input": { "questions": [{
                "question": "Which branch?",
                "header": "Branch",
                "multiSelect": false,
                "options": [
                    { "label": "main", "description": "" },
                    { "label": "develop", "description": "" }
                ]
            }]}
        }));

        let task = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.handle_hook(&session, &event).await })
        };
        while router.waiter().pending_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let reply = ChatEvent::Message {
            channel: "C1".to_string(),
            thread: Some("100.0".to_string()),
            author: "U1".to_string(),
            text: "release".to_string(),
            ts: "100.9".to_string(),
            is_bot: false,
            subtype: None,
            is_direct: false,
        };
        router.handle_event(&reply).await;

        let output = task.await.unwrap().unwrap().unwrap();
        assert_eq!(
            output["hookSpecificOutput"]["output"]["answers"]["question_0"],
            "release"
        );
    }

    #[tokio::test]
    async fn test_unanswered_prompt_defers_to_terminal() {
        let (_chat, gateway, router) = router(Duration::from_millis(20));
        let session =
            gateway.add_session("s1", RoutingKey::thread("C1", "100.0"), SessionStatus::Active);
        let event = hook(serde_json::json!({
            "session_id": "c1",
            "hook_event_name": "PermissionRequest",
            "tool_name": "Write",
            "tool_input": { "file_path": "/w/a.rs" }
        }));

        assert_eq!(router.handle_hook(&session, &event).await.unwrap(), None);
        assert_eq!(router.waiter().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_non_question_pre_tool_use_passes_through() {
        let (chat, gateway, router) = router(Duration::from_secs(5));
        let session =
            gateway.add_session("s1", RoutingKey::thread("C1", "100.0"), SessionStatus::Active);
        let event = hook(serde_json::json!({
            "session_id": "c1",
            "hook_event_name": "PreToolUse",
            "tool_name": "Bash",
            "tool_input": { "command": "ls" }
        }));

        assert_eq!(router.handle_hook(&session, &event).await.unwrap(), None);
        router.shutdown().await;
        assert!(chat.posts().is_empty());
    }

    #[tokio::test]
    async fn test_compaction_start_posts_notice() {
        let (chat, gateway, router) = router(Duration::from_secs(5));
        let session =
            gateway.add_session("s1", RoutingKey::thread("C1", "100.0"), SessionStatus::Active);
        let compacted = hook(serde_json::json!({
            "session_id": "c2", "hook_event_name": "SessionStart", "source": "compact"
        }));
        let fresh = hook(serde_json::json!({
            "session_id": "c3", "hook_event_name": "SessionStart", "source": "startup"
        }));

        router.handle_hook(&session, &compacted).await.unwrap();
        router.handle_hook(&session, &fresh).await.unwrap();
        router.shutdown().await;

        let posts = chat.posted_texts_in("C1");
        assert_eq!(posts.len(), 1);
        assert!(posts[0].contains("continued as `c2`"));
    }

    #[tokio::test]
    async fn test_todo_write_updates_progress_message() {
        let (chat, gateway, router) = router(Duration::from_secs(5));
        let session =
            gateway.add_session("s1", RoutingKey::thread("C1", "100.0"), SessionStatus::Active);
        let event = hook(serde_json::json!({
            "session_id": "c1",
            "hook_event_name": "PostToolUse",
            "tool_name": "TodoWrite",
            "tool_input": { "todos": [
                { "content": "build", "status": "completed", "activeForm": "Building" },
                { "content": "test", "status": "in_progress", "activeForm": "Testing" }
            ]}
        }));

        router.handle_hook(&session, &event).await.unwrap();
        router.shutdown().await;

        let posts = chat.posted_texts_in("C1");
        assert_eq!(posts.len(), 1);
        assert!(posts[0].contains("1/2 done"));
        assert!(gateway.updates()[0].1.todo_message.is_some());
    }

    #[tokio::test]
    async fn test_stop_posts_transcript_summary() {
        let (chat, gateway, router) = router(Duration::from_secs(5));
        let session =
            gateway.add_session("s1", RoutingKey::thread("C1", "100.0"), SessionStatus::Active);
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("c1.jsonl");
        let lines = [
            r#"{"type":"user","message":{"content":"fix it"}}"#,
            r#"{"type":"assistant","message":{"stop_reason":"tool_use","content":[{"type":"tool_use","name":"Edit","input":{"file_path":"/w/lib.rs"}}]}}"#,
            r#"{"type":"assistant","message":{"stop_reason":"end_turn","content":[{"type":"text","text":"Fixed the bug."}]}}"#,
        ];
        std::fs::write(&path, lines.join("\n")).unwrap();
        let event = hook(serde_json::json!({
            "session_id": "c1",
            "hook_event_name": "Stop",
            "transcript_path": path.to_string_lossy()
        }));

        assert_eq!(router.handle_hook(&session, &event).await.unwrap(), None);
        router.shutdown().await;

        let posts = chat.posted_texts_in("C1");
        assert_eq!(posts.len(), 1);
        assert!(posts[0].starts_with("Fixed the bug."));
        assert!(posts[0].contains("`/w/lib.rs`"));
    }
}
