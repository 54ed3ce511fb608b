//! Direct-message mode: a user attaches their DM with the bot to one session.
//!
//! While attached, anything the user writes in the DM is typed into that
//! session and the session's output is mirrored into the DM. Three commands
//! drive it: `/sessions`, `/attach <session-id> [N]` and `/detach`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use tlink_capture::{transcript_path, Role, Transcript, TranscriptMessage, MAX_HISTORY_MESSAGES};
use tlink_core::{RoutingKey, SessionId, SessionRecord};

use super::chat::ChatClient;
use super::events::{extract, ChatEvent, RoutedInput};
use super::outbound::Outbound;
use super::{EventRouter, RouteOutcome, SessionGateway, ACK_EMOJI, EXITED_REPLY, UNAVAILABLE_REPLY};

pub const ATTACH_USAGE: &str = "Usage: `/attach <session-id> [messages]`";

pub const NOT_ATTACHED_HINT: &str =
    ":wave: You are not attached to a session. Use `/sessions` to list them and `/attach <session-id>` to connect.";

/// History entries longer than this are cut.
const HISTORY_ENTRY_CHARS: usize = 500;

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DmCommand {
    /// List live sessions.
    Sessions,
    /// Attach to a session, optionally replaying its last `history` messages.
    Attach {
        session_id: SessionId,
        history: Option<usize>,
    },
    Detach,
    /// A known command with bad arguments; carries the usage text.
    Usage(&'static str),
}

/// Parses a DM command. `None` for anything that is not one of ours.
///
/// A history count that does not parse is ignored; a count outside
/// `1..=MAX_HISTORY_MESSAGES` is clamped.
pub fn parse_dm_command(text: &str) -> Option<DmCommand> {
    let mut words = text.split_whitespace();
    let command = words.next()?.to_ascii_lowercase();
    match command.as_str() {
        "/sessions" => Some(DmCommand::Sessions),
        "/detach" => Some(DmCommand::Detach),
        "/attach" => {
            let Some(id) = words.next() else {
                return Some(DmCommand::Usage(ATTACH_USAGE));
            };
            let history = words
                .next()
                .and_then(|n| n.parse::<usize>().ok())
                .map(|n| n.clamp(1, MAX_HISTORY_MESSAGES));
            Some(DmCommand::Attach {
                session_id: SessionId::new(id),
                history,
            })
        }
        _ => None,
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

/// One user's DM attached to one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmSubscription {
    pub user: String,
    pub session_id: SessionId,
    /// The user's DM channel with the bot.
    pub channel: String,
    pub attached_at: DateTime<Utc>,
}

/// Subscriptions keyed by user. A user is attached to at most one session.
#[derive(Debug, Default)]
pub struct DmSubscriptions {
    by_user: Mutex<HashMap<String, DmSubscription>>,
}

impl DmSubscriptions {
    fn map(&self) -> MutexGuard<'_, HashMap<String, DmSubscription>> {
        self.by_user
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attaches, returning the subscription it replaced.
    pub fn attach(&self, subscription: DmSubscription) -> Option<DmSubscription> {
        self.map().insert(subscription.user.clone(), subscription)
    }

    pub fn detach(&self, user: &str) -> Option<DmSubscription> {
        self.map().remove(user)
    }

    pub fn get(&self, user: &str) -> Option<DmSubscription> {
        self.map().get(user).cloned()
    }

    pub fn subscribers(&self, session_id: &SessionId) -> Vec<DmSubscription> {
        self.map()
            .values()
            .filter(|s| &s.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Drops every subscription to `session_id` and returns them.
    pub fn remove_session(&self, session_id: &SessionId) -> Vec<DmSubscription> {
        let mut map = self.map();
        let users: Vec<String> = map
            .iter()
            .filter(|(_, s)| &s.session_id == session_id)
            .map(|(user, _)| user.clone())
            .collect();
        users.iter().filter_map(|u| map.remove(u)).collect()
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}

// ============================================================================
// Formatting
// ============================================================================

pub fn format_session_list(sessions: &[SessionRecord]) -> String {
    if sessions.is_empty() {
        return ":zzz: No live sessions.".to_string();
    }
    let mut lines = vec![":computer: *Live sessions*".to_string()];
    for s in sessions {
        lines.push(format!(
            "• `{}` *{}* ({}) `{}`",
            s.session_id,
            s.project,
            s.status,
            s.project_dir.display()
        ));
    }
    lines.push(String::new());
    lines.push("Attach with `/attach <session-id>`.".to_string());
    lines.join("\n")
}

pub fn format_history(messages: &[TranscriptMessage]) -> String {
    let mut lines = vec![format!(":scroll: *Last {} messages*", messages.len())];
    for m in messages {
        let who = match m.role {
            Role::User => ":bust_in_silhouette:",
            Role::Assistant => ":robot_face:",
        };
        let text: String = m.text.chars().take(HISTORY_ENTRY_CHARS).collect();
        let cut = if m.text.chars().count() > HISTORY_ENTRY_CHARS { "…" } else { "" };
        lines.push(format!("{who} {text}{cut}"));
    }
    lines.join("\n\n")
}

// ============================================================================
// Router Handling
// ============================================================================

impl<C: ChatClient, G: SessionGateway> EventRouter<C, G> {
    pub fn dm_subscriptions(&self) -> &DmSubscriptions {
        &self.dm
    }

    /// Handles a message the user sent to the bot directly.
    pub(super) async fn handle_direct(&self, event: &ChatEvent) -> RouteOutcome {
        let Some(routed) = extract(event, self.config.bot_user.as_deref()) else {
            return RouteOutcome::Ignored;
        };
        let RoutedInput::Text(text) = &routed.input else {
            return RouteOutcome::Ignored;
        };
        let dm = RoutingKey::channel(routed.routing.channel.clone());

        if let Some(command) = parse_dm_command(text) {
            self.run_dm_command(&routed.user, &dm, command).await;
            return RouteOutcome::DirectCommand;
        }

        let Some(subscription) = self.dm.get(&routed.user) else {
            self.reply_direct(&dm, NOT_ATTACHED_HINT).await;
            return RouteOutcome::DirectNotAttached;
        };

        let session_id = subscription.session_id;
        match self.gateway.send(&session_id, text).await {
            Ok(()) => {
                info!(session_id = %session_id, user = %routed.user, bytes = text.len(), "Routed DM to session");
                self.react_direct(&routed.source, ACK_EMOJI).await;
                RouteOutcome::Delivered { session_id }
            }
            Err(e) if e.is_unreachable() || e.is_not_found() => {
                info!(session_id = %session_id, error = %e, "Attached session gone, detaching DM");
                self.dm.detach(&routed.user);
                self.reply_direct(&dm, EXITED_REPLY).await;
                RouteOutcome::ProcessExited { session_id }
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "DM send failed");
                self.reply_direct(&dm, UNAVAILABLE_REPLY).await;
                RouteOutcome::RegistryUnavailable
            }
        }
    }

    async fn run_dm_command(&self, user: &str, dm: &RoutingKey, command: DmCommand) {
        debug!(user, ?command, "DM command");
        match command {
            DmCommand::Sessions => {
                let text = match self.gateway.list_live().await {
                    Ok(sessions) => format_session_list(&sessions),
                    Err(e) => {
                        warn!(error = %e, "Session list failed");
                        UNAVAILABLE_REPLY.to_string()
                    }
                };
                self.reply_direct(dm, &text).await;
            }
            DmCommand::Attach { session_id, history } => {
                self.attach_dm(user, dm, session_id, history).await;
            }
            DmCommand::Detach => {
                let text = match self.dm.detach(user) {
                    Some(sub) => {
                        info!(user, session_id = %sub.session_id, "DM detached");
                        format!(":wave: Detached from `{}`.", sub.session_id)
                    }
                    None => ":information_source: You are not currently attached to a session."
                        .to_string(),
                };
                self.reply_direct(dm, &text).await;
            }
            DmCommand::Usage(usage) => self.reply_direct(dm, usage).await,
        }
    }

    async fn attach_dm(
        &self,
        user: &str,
        dm: &RoutingKey,
        session_id: SessionId,
        history: Option<usize>,
    ) {
        let session = match self.gateway.lookup_id(&session_id).await {
            Ok(session) => session,
            Err(e) if e.is_not_found() => {
                self.reply_direct(dm, &format!(":x: Session `{session_id}` not found."))
                    .await;
                return;
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Attach lookup failed");
                self.reply_direct(dm, UNAVAILABLE_REPLY).await;
                return;
            }
        };
        if !session.status.is_live() {
            self.reply_direct(dm, &format!(":x: Session `{session_id}` has ended."))
                .await;
            return;
        }

        let replaced = self.dm.attach(DmSubscription {
            user: user.to_string(),
            session_id: session.session_id.clone(),
            channel: dm.channel.clone(),
            attached_at: Utc::now(),
        });
        info!(user, session_id = %session.session_id, replaced = ?replaced.map(|s| s.session_id), "DM attached");
        self.reply_direct(
            dm,
            &format!(
                ":link: Attached to `{}` (*{}*). Messages here go to the session. `/detach` to stop.",
                session.session_id, session.project
            ),
        )
        .await;

        if let Some(n) = history {
            if let Some(text) = self.history_text(&session, n) {
                self.reply_direct(dm, &text).await;
            }
        }
    }

    fn history_text(&self, session: &SessionRecord, n: usize) -> Option<String> {
        let root = self.config.transcripts_root.as_deref()?;
        let conversation = session.conversation_id.as_ref()?;
        let path = transcript_path(root, &session.project_dir, conversation);
        match Transcript::load(&path) {
            Ok(transcript) => {
                let messages = transcript.last_messages(n);
                (!messages.is_empty()).then(|| format_history(&messages))
            }
            Err(e) => {
                debug!(session_id = %session.session_id, error = %e, "No history to replay");
                None
            }
        }
    }

    /// Mirrors session output into attached DMs, on the session's queue.
    pub(super) fn forward_to_dm(&self, session: &SessionRecord, text: &str) {
        for sub in self.dm.subscribers(&session.session_id) {
            self.outbound
                .enqueue(&session.session_id, Outbound::post(sub.channel, None, text));
        }
    }

    /// Tells attached users their session ended and detaches them.
    pub(super) async fn release_dm(&self, session_id: &SessionId) {
        for sub in self.dm.remove_session(session_id) {
            let text = format!(":black_circle: Session `{session_id}` ended. You have been detached.");
            self.reply_direct(&RoutingKey::channel(sub.channel), &text).await;
        }
    }
}
