//! Event router: chat events in, registry calls and prompt answers out.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  ChatEvent   ┌──────────────┐  lookup/send   ┌──────────────┐
//! │ chat platform│─────────────▶│ EventRouter  │───────────────▶│   tlinkd     │
//! └──────────────┘              └──────┬───────┘                └──────┬───────┘
//!        ▲                             │ resolve                       │ SessionEnded
//!        │ post/update/react           ▼                               ▼
//! ┌──────┴───────┐              ┌──────────────┐   cancel      ┌──────────────┐
//! │OutboundQueue │◀─────────────│ PromptWaiter │◀──────────────│ EventStream  │
//! └──────────────┘              └──────────────┘               └──────────────┘
//! ```
//!
//! A choice on a message with an open prompt answers that prompt. Anything
//! else is typed into the session found by routing key. Direct messages to
//! the bot follow the attach rules in [`dm`].
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Chat failures are logged; registry failures become user-facing replies

pub mod chat;
pub mod dm;
pub mod events;
pub mod format;
pub mod hooks;
pub mod outbound;
pub mod waiter;

#[cfg(test)]
pub(crate) mod testing;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tlink_capture::{read_snapshot, OptionParser, ParseOutcome};
use tlink_core::{
    ParsedPrompt, PromptKind, RoutingKey, SessionId, SessionRecord, SessionStatus, SessionUpdate,
    ToolInput,
};

use crate::client::{EventStream, RegistryClient, RegistryEvent};
use crate::error::ClientError;
use chat::{ChatClient, ChatError, MessageRef};
use dm::DmSubscriptions;
use events::{extract, ChatEvent, ChoiceRef, RoutedInput};
use outbound::{Outbound, OutboundQueue};
use waiter::{PromptWaiter, ResolveResult, WaitOutcome};

// ============================================================================
// Constants
// ============================================================================

/// Default bound on waiting for a prompt answer.
pub const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(300);

/// Reaction confirming input reached the session. Not in the choice map.
pub const ACK_EMOJI: &str = "eyes";

pub const NOT_FOUND_REPLY: &str =
    ":warning: No active session found for this thread. It may have ended.";
pub const STARTING_REPLY: &str =
    ":hourglass_flowing_sand: The session is still starting. Try again in a moment.";
pub const EXITED_REPLY: &str = ":x: The session appears to have exited.";
pub const UNAVAILABLE_REPLY: &str = ":warning: The session registry is not reachable right now.";

// ============================================================================
// Registry seam
// ============================================================================

/// Registry operations the router needs.
#[async_trait]
pub trait SessionGateway: Send + Sync + 'static {
    async fn lookup(&self, routing: &RoutingKey) -> Result<SessionRecord, ClientError>;
    async fn lookup_id(&self, session_id: &SessionId) -> Result<SessionRecord, ClientError>;
    /// Sessions that are starting or active.
    async fn list_live(&self) -> Result<Vec<SessionRecord>, ClientError>;
    async fn send(&self, session_id: &SessionId, payload: &str) -> Result<(), ClientError>;
    async fn update(
        &self,
        session_id: &SessionId,
        changes: SessionUpdate,
    ) -> Result<SessionRecord, ClientError>;
}

#[async_trait]
impl SessionGateway for RegistryClient {
    async fn lookup(&self, routing: &RoutingKey) -> Result<SessionRecord, ClientError> {
        self.lookup_by_thread(routing).await
    }

    async fn lookup_id(&self, session_id: &SessionId) -> Result<SessionRecord, ClientError> {
        self.lookup_by_id(session_id).await
    }

    async fn list_live(&self) -> Result<Vec<SessionRecord>, ClientError> {
        let sessions = self.list(None).await?;
        Ok(sessions.into_iter().filter(|s| s.status.is_live()).collect())
    }

    async fn send(&self, session_id: &SessionId, payload: &str) -> Result<(), ClientError> {
        RegistryClient::send(self, session_id, payload).await
    }

    async fn update(
        &self,
        session_id: &SessionId,
        changes: SessionUpdate,
    ) -> Result<SessionRecord, ClientError> {
        RegistryClient::update(self, session_id, changes).await
    }
}

// ============================================================================
// Router
// ============================================================================

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// The bot's own user id; its messages and reactions are ignored.
    pub bot_user: Option<String>,
    pub prompt_timeout: Duration,
    /// Where transcript streams live; DM history replay is off without it.
    pub transcripts_root: Option<PathBuf>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            bot_user: None,
            prompt_timeout: DEFAULT_PROMPT_TIMEOUT,
            transcripts_root: None,
        }
    }
}

/// What happened to one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Carried no input.
    Ignored,
    /// Answered an open prompt.
    PromptAnswered { index: Option<usize> },
    /// Typed into the session.
    Delivered { session_id: SessionId },
    SessionNotFound,
    SessionStarting { session_id: SessionId },
    ProcessExited { session_id: SessionId },
    RegistryUnavailable,
    /// A DM command was handled.
    DirectCommand,
    /// DM text from a user not attached to any session.
    DirectNotAttached,
}

pub struct EventRouter<C: ChatClient, G: SessionGateway> {
    chat: Arc<C>,
    gateway: Arc<G>,
    waiter: PromptWaiter,
    outbound: OutboundQueue<C>,
    parser: OptionParser,
    dm: DmSubscriptions,
    config: RouterConfig,
}

impl<C: ChatClient, G: SessionGateway> EventRouter<C, G> {
    pub fn new(chat: Arc<C>, gateway: Arc<G>, config: RouterConfig) -> Self {
        Self {
            outbound: OutboundQueue::new(Arc::clone(&chat)),
            chat,
            gateway,
            waiter: PromptWaiter::new(),
            parser: OptionParser::default(),
            dm: DmSubscriptions::default(),
            config,
        }
    }

    pub fn with_parser(mut self, parser: OptionParser) -> Self {
        self.parser = parser;
        self
    }

    pub fn waiter(&self) -> &PromptWaiter {
        &self.waiter
    }

    pub fn outbound(&self) -> &OutboundQueue<C> {
        &self.outbound
    }

    /// Builds the prompt to post for a blocking hook.
    ///
    /// Structured tool input wins. Otherwise the options are rebuilt from the
    /// session's capture snapshot, and the generic approve/deny prompt is used
    /// when that is not trustworthy.
    pub fn build_prompt(
        &self,
        kind: PromptKind,
        tool_input: Option<&ToolInput>,
        capture: Option<&Path>,
    ) -> ParsedPrompt {
        let lines = match capture.map(read_snapshot) {
            Some(Ok(snapshot)) => snapshot.lines,
            Some(Err(e)) => {
                warn!(error = %e, "Capture snapshot unreadable");
                Vec::new()
            }
            None => Vec::new(),
        };

        match self.parser.parse(kind, tool_input, &lines) {
            ParseOutcome::Parsed(prompt) => prompt,
            ParseOutcome::InsufficientData { reason } => {
                debug!(?kind, reason = %reason, "Using generic prompt");
                ParsedPrompt::generic_binary(kind, "")
            }
        }
    }

    /// Routes one inbound chat event.
    pub async fn handle_event(&self, event: &ChatEvent) -> RouteOutcome {
        if let ChatEvent::Message { is_direct: true, .. } = event {
            return self.handle_direct(event).await;
        }
        let Some(routed) = extract(event, self.config.bot_user.as_deref()) else {
            return RouteOutcome::Ignored;
        };

        match &routed.input {
            RoutedInput::Choice(choice) => {
                match self.waiter.resolve_choice(&routed.source, choice) {
                    ResolveResult::Resolved(index) => {
                        debug!(message = %routed.source, ?index, user = %routed.user, "Prompt answered by choice");
                        return RouteOutcome::PromptAnswered { index };
                    }
                    ResolveResult::OutOfRange => {
                        debug!(message = %routed.source, ?choice, "Choice outside prompt options");
                        return RouteOutcome::Ignored;
                    }
                    ResolveResult::NoPrompt => {}
                }
            }
            RoutedInput::Text(text) => {
                if routed.routing.thread.is_some() {
                    if let ResolveResult::Resolved(_) = self.waiter.resolve_text(&routed.routing, text) {
                        debug!(routing = %routed.routing, user = %routed.user, "Prompt answered by reply");
                        self.react_direct(&routed.source, ACK_EMOJI).await;
                        return RouteOutcome::PromptAnswered { index: None };
                    }
                }
            }
        }

        let session = match self.gateway.lookup(&routed.routing).await {
            Ok(session) => session,
            Err(e) if e.is_not_found() => {
                debug!(routing = %routed.routing, "No session for routing key");
                self.reply_direct(&routed.routing, NOT_FOUND_REPLY).await;
                return RouteOutcome::SessionNotFound;
            }
            Err(e) => {
                warn!(routing = %routed.routing, error = %e, "Registry lookup failed");
                self.reply_direct(&routed.routing, UNAVAILABLE_REPLY).await;
                return RouteOutcome::RegistryUnavailable;
            }
        };

        let session_id = session.session_id.clone();
        if session.status == SessionStatus::Starting {
            self.reply(&session, STARTING_REPLY);
            return RouteOutcome::SessionStarting { session_id };
        }

        let payload = match &routed.input {
            RoutedInput::Text(text) => text.clone(),
            RoutedInput::Choice(choice) => choice_payload(choice),
        };

        match self.gateway.send(&session_id, &payload).await {
            Ok(()) => {
                info!(session_id = %session_id, bytes = payload.len(), "Routed input to session");
                self.outbound.enqueue(
                    &session_id,
                    Outbound::React {
                        message: routed.source.clone(),
                        emoji: ACK_EMOJI.to_string(),
                    },
                );
                if matches!(routed.input, RoutedInput::Text(_)) {
                    self.remember_reply_target(&session, &routed.source).await;
                }
                RouteOutcome::Delivered { session_id }
            }
            Err(e) if e.is_unreachable() => {
                info!(session_id = %session_id, error = %e, "Session process unreachable");
                self.reply(&session, EXITED_REPLY);
                RouteOutcome::ProcessExited { session_id }
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Send failed");
                self.reply(&session, UNAVAILABLE_REPLY);
                RouteOutcome::RegistryUnavailable
            }
        }
    }

    /// Posts `prompt` for `session` and waits for an answer.
    ///
    /// Permission prompts go to the session's permissions channel when one is
    /// set. The posted message is edited to show the result.
    pub async fn ask(
        &self,
        session: &SessionRecord,
        prompt: &ParsedPrompt,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome, ChatError> {
        let (channel, thread) = match (&prompt.kind, &session.permissions_channel) {
            (PromptKind::Permission, Some(channel)) => (channel.clone(), None),
            _ => (session.routing.channel.clone(), reply_thread(session)),
        };

        let text = format::format_prompt(prompt);
        let posted = self
            .outbound
            .post_and_wait(&session.session_id, &channel, thread.as_deref(), &text)
            .await?;
        let pending = self
            .waiter
            .register(session.session_id.clone(), posted.clone(), prompt);

        for option in &prompt.options {
            if let Some(emoji) = format::reaction_for(option.index) {
                self.outbound.enqueue(
                    &session.session_id,
                    Outbound::React {
                        message: posted.clone(),
                        emoji: emoji.to_string(),
                    },
                );
            }
        }

        let outcome = pending
            .wait(timeout.unwrap_or(self.config.prompt_timeout))
            .await;

        let status = match &outcome {
            WaitOutcome::Answered(answer) => format::format_answered(prompt, answer),
            WaitOutcome::TimedOut => ":hourglass: _No answer received._".to_string(),
            WaitOutcome::Cancelled => ":black_circle: _Session ended._".to_string(),
        };
        self.outbound.enqueue(
            &session.session_id,
            Outbound::Update {
                message: posted,
                text: format!("{text}\n\n{status}"),
            },
        );
        info!(session_id = %session.session_id, ?outcome, "Prompt finished");
        Ok(outcome)
    }

    /// Posts session output, keeping per-session order. Attached DMs get a
    /// copy.
    pub fn post_output(&self, session: &SessionRecord, text: &str) {
        self.outbound.enqueue(
            &session.session_id,
            Outbound::post(session.routing.channel.clone(), reply_thread(session), text),
        );
        self.forward_to_dm(session, text);
    }

    /// Updates the session's progress message in place, creating it once.
    pub async fn post_progress(
        &self,
        session: &SessionRecord,
        text: &str,
    ) -> Result<MessageRef, ChatError> {
        let thread = reply_thread(session);
        if let Some(ts) = &session.todo_message {
            let message = MessageRef::new(session.routing.channel.clone(), thread, ts.clone());
            self.outbound.enqueue(
                &session.session_id,
                Outbound::Update {
                    message: message.clone(),
                    text: text.to_string(),
                },
            );
            return Ok(message);
        }

        let posted = self
            .outbound
            .post_and_wait(
                &session.session_id,
                &session.routing.channel,
                thread.as_deref(),
                text,
            )
            .await?;
        let changes = SessionUpdate {
            todo_message: Some(posted.ts.clone()),
            ..SessionUpdate::default()
        };
        if let Err(e) = self.gateway.update(&session.session_id, changes).await {
            warn!(session_id = %session.session_id, error = %e, "Failed to record progress message");
        }
        Ok(posted)
    }

    /// Applies a pushed registry event.
    pub async fn handle_registry_event(&self, event: &RegistryEvent) {
        match event {
            RegistryEvent::Ended(session_id) => {
                let cancelled = self.waiter.cancel_session(session_id);
                self.outbound.close_session(session_id).await;
                self.release_dm(session_id).await;
                info!(session_id = %session_id, cancelled, "Session ended, router state released");
            }
            RegistryEvent::Updated(session) => {
                debug!(session_id = %session.session_id, status = %session.status, "Session updated");
            }
        }
    }

    /// Feeds registry events into the router until cancelled or the stream ends.
    pub async fn watch_registry(&self, mut events: EventStream, cancel_token: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Registry watcher cancelled");
                    break;
                }
                next = events.next() => match next {
                    Ok(Some(event)) => self.handle_registry_event(&event).await,
                    Ok(None) => {
                        info!("Registry event stream closed");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Registry event stream failed");
                        break;
                    }
                },
            }
        }
    }

    /// Drains outbound work.
    pub async fn shutdown(&self) {
        self.outbound.shutdown().await;
    }

    /// Records the user's message so channel-mode output threads under it.
    async fn remember_reply_target(&self, session: &SessionRecord, source: &MessageRef) {
        if session.routing.thread.is_some() {
            return;
        }
        let changes = SessionUpdate {
            reply_to: Some(source.ts.clone()),
            ..SessionUpdate::default()
        };
        if let Err(e) = self.gateway.update(&session.session_id, changes).await {
            debug!(session_id = %session.session_id, error = %e, "Failed to record reply target");
        }
    }

    fn reply(&self, session: &SessionRecord, text: &str) {
        self.outbound.enqueue(
            &session.session_id,
            Outbound::post(
                session.routing.channel.clone(),
                session.routing.thread.clone(),
                text,
            ),
        );
    }

    /// Posts outside any session's queue (no session to order against).
    async fn reply_direct(&self, routing: &RoutingKey, text: &str) {
        if let Err(e) = self
            .chat
            .post_message(&routing.channel, routing.thread_id(), text)
            .await
        {
            warn!(routing = %routing, error = %e, "Failed to post reply");
        }
    }

    async fn react_direct(&self, message: &MessageRef, emoji: &str) {
        if let Err(e) = self.chat.add_reaction(message, emoji).await {
            debug!(message = %message, emoji, error = %e, "Failed to add reaction");
        }
    }
}

/// Thread that session output goes to: the session thread, or in channel
/// mode the user's last message.
fn reply_thread(session: &SessionRecord) -> Option<String> {
    session
        .routing
        .thread
        .clone()
        .or_else(|| session.reply_to.clone())
}

/// Text typed into the terminal for a choice with no open prompt.
///
/// Deny shortcuts pick option 3, the deny slot of a full permission prompt.
fn choice_payload(choice: &ChoiceRef) -> String {
    match choice {
        ChoiceRef::Index(i) => (i + 1).to_string(),
        ChoiceRef::Last => PromptKind::Permission.max_options().to_string(),
    }
}
