//! Per-session ordered posting.
//!
//! Every session gets one worker task draining its own `mpsc` channel, so
//! posts for one session reach the chat platform in production order while
//! different sessions proceed independently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tlink_core::SessionId;

use super::chat::{ChatClient, ChatError, MessageRef};

/// One queued chat operation.
#[derive(Debug)]
pub enum Outbound {
    Post {
        channel: String,
        thread: Option<String>,
        text: String,
        /// Receives the posted message's id.
        posted: Option<oneshot::Sender<Result<MessageRef, ChatError>>>,
    },
    Update {
        message: MessageRef,
        text: String,
    },
    React {
        message: MessageRef,
        emoji: String,
    },
}

impl Outbound {
    pub fn post(channel: impl Into<String>, thread: Option<String>, text: impl Into<String>) -> Self {
        Self::Post {
            channel: channel.into(),
            thread,
            text: text.into(),
            posted: None,
        }
    }
}

struct Worker {
    sender: mpsc::UnboundedSender<Outbound>,
    handle: JoinHandle<()>,
}

/// Ordered outbound queue keyed by session.
pub struct OutboundQueue<C: ChatClient> {
    chat: Arc<C>,
    workers: Mutex<HashMap<SessionId, Worker>>,
}

impl<C: ChatClient> OutboundQueue<C> {
    pub fn new(chat: Arc<C>) -> Self {
        Self {
            chat,
            workers: Mutex::new(HashMap::new()),
        }
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<SessionId, Worker>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues `item` behind everything already queued for `session_id`.
    pub fn enqueue(&self, session_id: &SessionId, item: Outbound) {
        let mut workers = self.workers();
        let item = match workers.get(session_id) {
            Some(worker) => match worker.sender.send(item) {
                Ok(()) => return,
                Err(mpsc::error::SendError(item)) => item,
            },
            None => item,
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(drain(
            session_id.clone(),
            Arc::clone(&self.chat),
            receiver,
        ));
        // The receiver is alive until the worker exits, which needs the sender dropped.
        let _ = sender.send(item);
        workers.insert(session_id.clone(), Worker { sender, handle });
        debug!(session_id = %session_id, "Started outbound worker");
    }

    /// Posts and waits for the message id, keeping the session's order.
    pub async fn post_and_wait(
        &self,
        session_id: &SessionId,
        channel: &str,
        thread: Option<&str>,
        text: &str,
    ) -> Result<MessageRef, ChatError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(
            session_id,
            Outbound::Post {
                channel: channel.to_string(),
                thread: thread.map(str::to_string),
                text: text.to_string(),
                posted: Some(tx),
            },
        );
        rx.await
            .unwrap_or_else(|_| Err(ChatError::Api("outbound worker stopped".to_string())))
    }

    /// Stops accepting work for `session_id` and waits for queued items to drain.
    pub async fn close_session(&self, session_id: &SessionId) {
        let worker = self.workers().remove(session_id);
        if let Some(Worker { sender, handle }) = worker {
            drop(sender);
            if let Err(e) = handle.await {
                warn!(session_id = %session_id, error = %e, "Outbound worker failed");
            }
        }
    }

    /// Drains and stops every worker.
    pub async fn shutdown(&self) {
        let workers: Vec<(SessionId, Worker)> = self.workers().drain().collect();
        for (session_id, Worker { sender, handle }) in workers {
            drop(sender);
            if let Err(e) = handle.await {
                warn!(session_id = %session_id, error = %e, "Outbound worker failed");
            }
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.workers().len()
    }
}

async fn drain<C: ChatClient>(
    session_id: SessionId,
    chat: Arc<C>,
    mut receiver: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(item) = receiver.recv().await {
        match item {
            Outbound::Post {
                channel,
                thread,
                text,
                posted,
            } => {
                let result = chat.post_message(&channel, thread.as_deref(), &text).await;
                if let Err(ref e) = result {
                    warn!(session_id = %session_id, error = %e, "Failed to post message");
                }
                if let Some(tx) = posted {
                    let _ = tx.send(result);
                }
            }
            Outbound::Update { message, text } => {
                if let Err(e) = chat.update_message(&message, &text).await {
                    warn!(session_id = %session_id, message = %message, error = %e, "Failed to update message");
                }
            }
            Outbound::React { message, emoji } => {
                if let Err(e) = chat.add_reaction(&message, &emoji).await {
                    debug!(session_id = %session_id, emoji, error = %e, "Failed to add reaction");
                }
            }
        }
    }
    debug!(session_id = %session_id, "Outbound worker finished");
}
