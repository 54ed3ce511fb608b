//! Outstanding prompts awaiting a chat answer.
//!
//! Each posted prompt registers a one-shot slot keyed by its chat message.
//! A reaction, button click, or thread reply resolves the slot; the session
//! ending cancels it. The slot is removed on every exit path, including a
//! dropped [`PendingPrompt`].
//!
//! # Panic-Free Guarantees
//!
//! Lock poisoning is recovered from rather than propagated; the map only
//! holds senders, so a panicking holder cannot leave it inconsistent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use tlink_core::{ParsedPrompt, RoutingKey, SessionId};

use super::chat::MessageRef;
use super::events::ChoiceRef;

/// Answer delivered to a waiting prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptAnswer {
    /// 0-based option index.
    Choice(usize),
    /// Free-text reply ("other").
    Text(String),
}

/// How a wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Answered(PromptAnswer),
    TimedOut,
    Cancelled,
}

/// Result of trying to resolve a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveResult {
    /// Answer delivered; carries the chosen index for choices.
    Resolved(Option<usize>),
    /// The choice does not exist on this prompt; the prompt stays open.
    OutOfRange,
    /// No open prompt for that message.
    NoPrompt,
}

/// Channel plus message id; thread is not part of the identity.
type MessageKey = (String, String);

fn key_of(message: &MessageRef) -> MessageKey {
    (message.channel.clone(), message.ts.clone())
}

struct Slot {
    token: u64,
    session_id: SessionId,
    routing: RoutingKey,
    option_count: usize,
    sender: oneshot::Sender<PromptAnswer>,
}

#[derive(Default)]
struct Inner {
    slots: Mutex<HashMap<MessageKey, Slot>>,
    next_token: AtomicU64,
}

/// Registry of outstanding prompts, shared by clone.
#[derive(Clone, Default)]
pub struct PromptWaiter {
    inner: Arc<Inner>,
}

impl PromptWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<MessageKey, Slot>> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Opens a slot for `prompt`, posted as `message` for `session_id`.
    ///
    /// Registering the same message twice replaces the earlier slot, whose
    /// waiter then sees `Cancelled`.
    pub fn register(
        &self,
        session_id: SessionId,
        message: MessageRef,
        prompt: &ParsedPrompt,
    ) -> PendingPrompt {
        let (sender, receiver) = oneshot::channel();
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let routing = message.routing_key();
        let slot = Slot {
            token,
            session_id: session_id.clone(),
            routing,
            option_count: prompt.options.len(),
            sender,
        };
        self.slots().insert(key_of(&message), slot);
        debug!(session_id = %session_id, message = %message, "Prompt registered");

        PendingPrompt {
            waiter: self.clone(),
            message,
            token,
            receiver,
        }
    }

    /// True if `message` has an open prompt.
    pub fn is_pending(&self, message: &MessageRef) -> bool {
        self.slots().contains_key(&key_of(message))
    }

    /// Resolves the prompt posted as `message` with a choice.
    pub fn resolve_choice(&self, message: &MessageRef, choice: &ChoiceRef) -> ResolveResult {
        let mut slots = self.slots();
        let key = key_of(message);
        let Some(slot) = slots.get(&key) else {
            return ResolveResult::NoPrompt;
        };
        let Some(index) = choice.resolve(slot.option_count) else {
            return ResolveResult::OutOfRange;
        };
        let Some(slot) = slots.remove(&key) else {
            return ResolveResult::NoPrompt;
        };
        drop(slots);
        deliver(slot, PromptAnswer::Choice(index));
        ResolveResult::Resolved(Some(index))
    }

    /// Resolves the most recent open prompt in `routing` with free text.
    pub fn resolve_text(&self, routing: &RoutingKey, text: &str) -> ResolveResult {
        let mut slots = self.slots();
        let newest = slots
            .iter()
            .filter(|(_, slot)| &slot.routing == routing)
            .max_by_key(|(_, slot)| slot.token)
            .map(|(key, _)| key.clone());
        let Some(slot) = newest.and_then(|key| slots.remove(&key)) else {
            return ResolveResult::NoPrompt;
        };
        drop(slots);
        deliver(slot, PromptAnswer::Text(text.to_string()));
        ResolveResult::Resolved(None)
    }

    /// Cancels every open prompt of `session_id`. Returns how many.
    pub fn cancel_session(&self, session_id: &SessionId) -> usize {
        let mut slots = self.slots();
        let before = slots.len();
        // Dropping the sender wakes the waiter with Cancelled.
        slots.retain(|_, slot| &slot.session_id != session_id);
        let cancelled = before - slots.len();
        if cancelled > 0 {
            debug!(session_id = %session_id, cancelled, "Cancelled open prompts");
        }
        cancelled
    }

    pub fn pending_count(&self) -> usize {
        self.slots().len()
    }

    fn release(&self, message: &MessageRef, token: u64) {
        let mut slots = self.slots();
        let key = key_of(message);
        if slots.get(&key).is_some_and(|slot| slot.token == token) {
            slots.remove(&key);
        }
    }
}

fn deliver(slot: Slot, answer: PromptAnswer) {
    if slot.sender.send(answer).is_err() {
        debug!(session_id = %slot.session_id, "Prompt waiter already gone");
    }
}

/// Handle for one open prompt.
pub struct PendingPrompt {
    waiter: PromptWaiter,
    message: MessageRef,
    token: u64,
    receiver: oneshot::Receiver<PromptAnswer>,
}

impl PendingPrompt {
    /// Chat message the prompt was posted as.
    pub fn message(&self) -> &MessageRef {
        &self.message
    }

    /// Waits for an answer, at most `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> WaitOutcome {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(answer)) => WaitOutcome::Answered(answer),
            Ok(Err(_)) => WaitOutcome::Cancelled,
            Err(_) => WaitOutcome::TimedOut,
        }
    }
}

impl Drop for PendingPrompt {
    fn drop(&mut self) {
        self.waiter.release(&self.message, self.token);
    }
}
