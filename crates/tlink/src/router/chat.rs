//! Chat platform seam.
//!
//! The router only needs to post, edit, and react. Platform clients
//! implement [`ChatClient`]; tests use an in-memory recorder.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tlink_core::RoutingKey;

/// Location of one posted chat message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub channel: String,
    /// Thread the message lives in, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    /// Platform message id (a timestamp on most platforms).
    pub ts: String,
}

impl MessageRef {
    pub fn new(channel: impl Into<String>, thread: Option<String>, ts: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            thread,
            ts: ts.into(),
        }
    }

    /// Routing key of the conversation this message belongs to.
    ///
    /// A top-level message starts its own thread, so its `ts` is the thread id
    /// for replies in thread mode.
    pub fn routing_key(&self) -> RoutingKey {
        RoutingKey {
            channel: self.channel.clone(),
            thread: self.thread.clone(),
        }
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.channel, self.ts)
    }
}

/// Failure reported by a chat platform client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("Chat API error: {0}")]
    Api(String),

    #[error("Rate limited by chat platform")]
    RateLimited,
}

/// Minimal chat platform surface used by the router.
#[async_trait]
pub trait ChatClient: Send + Sync + 'static {
    /// Posts `text` to `channel`, threaded under `thread` when given.
    async fn post_message(
        &self,
        channel: &str,
        thread: Option<&str>,
        text: &str,
    ) -> Result<MessageRef, ChatError>;

    /// Replaces the text of an existing message.
    async fn update_message(&self, message: &MessageRef, text: &str) -> Result<(), ChatError>;

    /// Adds an emoji reaction (name without colons).
    async fn add_reaction(&self, message: &MessageRef, emoji: &str) -> Result<(), ChatError>;
}
