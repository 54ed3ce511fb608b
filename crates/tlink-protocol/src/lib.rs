//! threadlink protocol - wire types for registry communication
//!
//! Newline-delimited JSON messages exchanged between the registry daemon
//! and its clients (wrappers, hooks, the event router), plus parsing of
//! the hook payloads the wrapped assistant emits.

pub mod message;
pub mod parse;
pub mod version;

pub use message::{ClientMessage, DaemonMessage, ErrorCode, MessageType};
pub use parse::RawHookEvent;
pub use version::{ProtocolVersion, VersionError};
