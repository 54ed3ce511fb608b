//! Inbound chat events and their reduction to routed input.

use serde::{Deserialize, Serialize};
use tlink_core::RoutingKey;

use super::chat::MessageRef;

/// Message subtypes that never carry user input.
const IGNORED_SUBTYPES: &[&str] = &[
    "bot_message",
    "channel_join",
    "channel_leave",
    "group_join",
    "group_leave",
];

/// Event received from the chat platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Message {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread: Option<String>,
        author: String,
        text: String,
        ts: String,
        #[serde(default)]
        is_bot: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subtype: Option<String>,
        /// Sent to the bot in a direct-message channel.
        #[serde(default)]
        is_direct: bool,
    },
    ReactionAdded {
        channel: String,
        /// Message the reaction was added to.
        message_ts: String,
        /// Thread of that message; for a thread root this equals `message_ts`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread: Option<String>,
        reactor: String,
        emoji: String,
    },
    ActionClicked {
        action_id: String,
        value: String,
        actor: String,
        channel: String,
        message_ts: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread: Option<String>,
    },
}

/// What a user supplied, independent of how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutedInput {
    /// Free text to type into the session.
    Text(String),
    /// A 0-based option choice.
    Choice(ChoiceRef),
}

/// Option choice made by reaction or button.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChoiceRef {
    /// Concrete 0-based index.
    Index(usize),
    /// The last option of whatever prompt is answered (deny shortcuts).
    Last,
}

impl ChoiceRef {
    /// Resolves against a prompt with `option_count` options.
    pub fn resolve(&self, option_count: usize) -> Option<usize> {
        match self {
            Self::Index(i) if *i < option_count => Some(*i),
            Self::Index(_) => None,
            Self::Last => option_count.checked_sub(1),
        }
    }
}

/// A chat event reduced to a destination and an input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedEvent {
    pub routing: RoutingKey,
    pub input: RoutedInput,
    /// Message the input was attached to (reacted or clicked message, or the
    /// user's own message for text).
    pub source: MessageRef,
    pub user: String,
}

/// Maps an emoji name to an option choice.
///
/// Number emoji pick by position; approval emoji pick the first option and
/// rejection emoji the last.
pub fn emoji_choice(emoji: &str) -> Option<ChoiceRef> {
    let name = emoji.trim_matches(':');
    // Skin-tone variants arrive as "+1::skin-tone-2".
    let name = name.split("::").next().unwrap_or(name);
    match name {
        "one" | "1\u{fe0f}\u{20e3}" => Some(ChoiceRef::Index(0)),
        "two" | "2\u{fe0f}\u{20e3}" => Some(ChoiceRef::Index(1)),
        "three" | "3\u{fe0f}\u{20e3}" => Some(ChoiceRef::Index(2)),
        "four" | "4\u{fe0f}\u{20e3}" => Some(ChoiceRef::Index(3)),
        "+1" | "thumbsup" | "white_check_mark" | "heavy_check_mark" => Some(ChoiceRef::Index(0)),
        "-1" | "thumbsdown" | "x" => Some(ChoiceRef::Last),
        _ => None,
    }
}

/// Parses a button value: a 1-based option number.
fn action_choice(value: &str) -> Option<ChoiceRef> {
    let number: usize = value.trim().parse().ok()?;
    number.checked_sub(1).map(ChoiceRef::Index)
}

/// Reduces a chat event to routed input.
///
/// Returns `None` for events that carry no input: bot messages, join/leave
/// notices, empty text, unmapped emoji, and reactions by `bot_user`.
pub fn extract(event: &ChatEvent, bot_user: Option<&str>) -> Option<RoutedEvent> {
    match event {
        ChatEvent::Message {
            channel,
            thread,
            author,
            text,
            ts,
            is_bot,
            subtype,
            ..
        } => {
            if *is_bot || bot_user == Some(author.as_str()) {
                return None;
            }
            if subtype
                .as_deref()
                .is_some_and(|s| IGNORED_SUBTYPES.contains(&s))
            {
                return None;
            }
            let text = text.trim();
            if text.is_empty() {
                return None;
            }
            Some(RoutedEvent {
                routing: RoutingKey {
                    channel: channel.clone(),
                    thread: thread.clone(),
                },
                input: RoutedInput::Text(text.to_string()),
                source: MessageRef::new(channel.clone(), thread.clone(), ts.clone()),
                user: author.clone(),
            })
        }
        ChatEvent::ReactionAdded {
            channel,
            message_ts,
            thread,
            reactor,
            emoji,
        } => {
            if bot_user == Some(reactor.as_str()) {
                return None;
            }
            let choice = emoji_choice(emoji)?;
            Some(RoutedEvent {
                routing: RoutingKey {
                    channel: channel.clone(),
                    thread: thread.clone(),
                },
                input: RoutedInput::Choice(choice),
                source: MessageRef::new(channel.clone(), thread.clone(), message_ts.clone()),
                user: reactor.clone(),
            })
        }
        ChatEvent::ActionClicked {
            value,
            actor,
            channel,
            message_ts,
            thread,
            ..
        } => {
            let choice = action_choice(value)?;
            Some(RoutedEvent {
                routing: RoutingKey {
                    channel: channel.clone(),
                    thread: thread.clone(),
                },
                input: RoutedInput::Choice(choice),
                source: MessageRef::new(channel.clone(), thread.clone(), message_ts.clone()),
                user: actor.clone(),
            })
        }
    }
}
