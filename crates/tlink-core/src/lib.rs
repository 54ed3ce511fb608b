//! tlink core - Shared types for bridging terminal sessions to chat threads
//!
//! This crate provides the domain types shared between the registry
//! daemon (tlinkd), the capture/parser crate, and the event router.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod hook;
pub mod prompt;
pub mod session;
pub mod tool;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use hook::HookEventType;
pub use prompt::{
    ParsedPrompt, PermissionDecision, PromptKind, PromptOption, PromptSource,
    DEFAULT_FIRST_OPTION_LABEL, DEFAULT_SECOND_OPTION_LABEL,
};
pub use session::{
    ConversationId, IpcEndpoint, RoutingKey, SessionId, SessionMode, SessionRecord,
    SessionRegistration, SessionStatus, SessionUpdate, record_time,
};
pub use tool::{
    OptionSpec, PermissionInput, QuestionInput, QuestionSpec, ToolInput, QUESTION_TOOL,
};
