//! threadlink router - registry client and chat event routing
//!
//! - `client` - request/reply client and event stream for the tlinkd socket
//! - `router` - chat event extraction, prompt waiting, ordered posting, hook
//!   events and direct-message attach mode
//! - `error` - client error type
//!
//! The chat platform itself stays behind the [`router::chat::ChatClient`]
//! trait.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, or `todo!()` outside tests.

pub mod client;
pub mod error;
pub mod router;

pub use client::{ClientConfig, EventStream, RegistryClient, RegistryEvent};
pub use error::{ClientError, Result};
pub use router::chat::{ChatClient, ChatError, MessageRef};
pub use router::events::{extract, ChatEvent, ChoiceRef, RoutedEvent, RoutedInput};
pub use router::dm::{parse_dm_command, DmCommand, DmSubscription, DmSubscriptions};
pub use router::format::{
    format_prompt, format_summary, format_todos, permission_hook_output, question_hook_output,
};
pub use router::hooks::{registry_effect, RegistryEffect};
pub use router::outbound::{Outbound, OutboundQueue};
pub use router::waiter::{PendingPrompt, PromptAnswer, PromptWaiter, ResolveResult, WaitOutcome};
pub use router::{EventRouter, RouteOutcome, RouterConfig, SessionGateway};
