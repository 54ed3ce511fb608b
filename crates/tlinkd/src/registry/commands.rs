//! Registry actor commands, errors, and events.
//!
//! This module defines the message types for communicating with the `RegistryActor`:
//! - `RegistryCommand`: Commands sent to the actor
//! - `RegistryError`: Errors that can occur during registry operations
//! - `SessionEvent`: Events published by the registry for subscribers

use std::path::PathBuf;

use thiserror::Error;
use tokio::sync::oneshot;

use tlink_core::{
    IpcEndpoint, RoutingKey, SessionId, SessionRecord, SessionRegistration, SessionStatus,
    SessionUpdate,
};
use tlink_protocol::ErrorCode;

use crate::store::StoreError;

/// Reply channel for commands that return a single session.
pub type SessionReply = oneshot::Sender<Result<SessionRecord, RegistryError>>;

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands sent to the registry actor.
///
/// Each command carries a oneshot channel for the response.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Register a new session.
    ///
    /// When `supersede` is set, that session is ended in the same
    /// transaction (its endpoint was found dead).
    ///
    /// # Errors
    /// - `RegistryError::DuplicateSession` if the id exists
    /// - `RegistryError::RoutingKeyInUse` if a live session holds the key
    Register {
        registration: Box<SessionRegistration>,
        supersede: Option<SessionId>,
        respond_to: SessionReply,
    },

    /// Get a single session by id.
    GetSession {
        session_id: SessionId,
        respond_to: SessionReply,
    },

    /// Get the live session for a routing key.
    LookupByRoutingKey {
        routing: RoutingKey,
        respond_to: SessionReply,
    },

    /// List sessions. `None` means all non-ended sessions.
    List {
        status: Option<SessionStatus>,
        respond_to: oneshot::Sender<Result<Vec<SessionRecord>, RegistryError>>,
    },

    /// Live sessions started from a project directory.
    FindByProjectDir {
        dir: PathBuf,
        respond_to: oneshot::Sender<Result<Vec<SessionRecord>, RegistryError>>,
    },

    /// Liveness signal from the wrapper. Promotes `Starting` to `Active`.
    Heartbeat {
        session_id: SessionId,
        respond_to: SessionReply,
    },

    /// Bump last activity without touching status.
    Touch {
        session_id: SessionId,
        respond_to: SessionReply,
    },

    /// Apply a partial update.
    Update {
        session_id: SessionId,
        changes: Box<SessionUpdate>,
        respond_to: SessionReply,
    },

    /// Mark a session ended. Idempotent.
    MarkEnded {
        session_id: SessionId,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Expire inactive sessions and purge old ended ones.
    ///
    /// Fire-and-forget; sent by the cleanup ticker.
    Cleanup,
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session already exists: {0}")]
    DuplicateSession(SessionId),

    #[error("routing key {routing} is in use by session {holder}")]
    RoutingKeyInUse {
        routing: RoutingKey,
        holder: SessionId,
        holder_endpoint: IpcEndpoint,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The actor has shut down.
    #[error("response channel closed")]
    ChannelClosed,
}

impl RegistryError {
    /// Wire error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::SessionNotFound(_) => ErrorCode::NotFound,
            Self::DuplicateSession(_) => ErrorCode::DuplicateSession,
            Self::RoutingKeyInUse { .. } => ErrorCode::RoutingKeyInUse,
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::StorageUnavailable(_) => ErrorCode::StorageUnavailable,
            Self::ChannelClosed => ErrorCode::Internal,
        }
    }
}

impl From<StoreError> for RegistryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::SessionNotFound(what),
            StoreError::DuplicateSession(id) => Self::DuplicateSession(id),
            StoreError::RoutingKeyInUse {
                routing,
                holder,
                holder_endpoint,
            } => Self::RoutingKeyInUse {
                routing,
                holder,
                holder_endpoint,
            },
            StoreError::Domain(e) => Self::InvalidRequest(e.to_string()),
            e @ (StoreError::Unavailable(_) | StoreError::Corrupt { .. }) => {
                Self::StorageUnavailable(e.to_string())
            }
        }
    }
}

// ============================================================================
// Session Events
// ============================================================================

/// Events published by the registry to subscribers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A new session was registered.
    Registered {
        session: Box<SessionRecord>,
    },

    /// A session changed (status, conversation id, message refs).
    Updated {
        session: Box<SessionRecord>,
    },

    /// A session ended.
    Ended {
        session_id: SessionId,
        reason: EndReason,
    },

    /// Old ended sessions were deleted.
    Purged {
        count: usize,
    },
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Client sent MARK_ENDED or an UPDATE to `ended`.
    Explicit,

    /// Its routing key was taken over after its endpoint stopped answering.
    Superseded,

    /// No activity within the inactivity timeout.
    Inactive,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Explicit => write!(f, "explicitly ended"),
            Self::Superseded => write!(f, "superseded by a new registration"),
            Self::Inactive => write!(f, "inactivity timeout"),
        }
    }
}
