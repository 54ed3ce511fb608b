//! Error types for the registry client and event router.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tlink_protocol::ErrorCode;

// ============================================================================
// Client Error Type
// ============================================================================

/// Errors talking to the registry daemon.
///
/// Daemon-side failures arrive as [`ClientError::Daemon`] carrying the wire
/// [`ErrorCode`], so callers can branch on `NotFound` or
/// `ProcessUnreachable` without string matching.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Could not reach the daemon socket.
    #[error("Failed to connect to daemon: {0}")]
    DaemonConnection(String),

    /// Client and daemon speak incompatible protocol versions.
    #[error("Protocol version mismatch (client: {client_version}, daemon: {daemon_version})")]
    VersionMismatch {
        client_version: String,
        daemon_version: String,
    },

    /// The daemon answered with something that does not fit the request.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The daemon rejected the request.
    #[error("Daemon error ({code}): {message}")]
    Daemon { code: ErrorCode, message: String },

    /// No reply within the request timeout.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Daemon closed the connection.
    #[error("Daemon closed the connection")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse message: {0}")]
    ParseError(#[from] serde_json::Error),
}

impl ClientError {
    /// Wire error code, when the daemon produced this error.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Daemon { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True if the daemon reported the session or routing key unknown.
    pub fn is_not_found(&self) -> bool {
        self.code() == Some(ErrorCode::NotFound)
    }

    /// True if the session's process did not accept the payload.
    pub fn is_unreachable(&self) -> bool {
        self.code() == Some(ErrorCode::ProcessUnreachable)
    }
}

// ============================================================================
// Result Type Alias
// ============================================================================

pub type Result<T> = std::result::Result<T, ClientError>;

// ============================================================================
// Tests
// ============================================================================
