//! Protocol message types for registry communication.

use crate::version::ProtocolVersion;
use serde::{Deserialize, Serialize};
use std::fmt;
use tlink_core::{SessionId, SessionRecord, SessionRegistration, SessionStatus, SessionUpdate};

/// Message types that can be sent by clients to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Client handshake/connection request
    Connect {
        /// Client identifier (optional)
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Register a new session
    Register {
        registration: SessionRegistration,
    },

    /// Find the live session for a routing key
    LookupByThread {
        channel: String,
        /// Absent for dedicated-channel sessions
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread: Option<String>,
    },

    /// Fetch a session by id
    LookupById { session_id: SessionId },

    /// Deliver a payload to the session's live process
    Send {
        session_id: SessionId,
        payload: String,
    },

    /// List sessions (non-ended unless a status filter is given)
    List {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<SessionStatus>,
    },

    /// Bump last-activity for a session
    Heartbeat { session_id: SessionId },

    /// Apply a partial update to a session
    Update {
        session_id: SessionId,
        changes: SessionUpdate,
    },

    /// Mark a session as ended (idempotent)
    MarkEnded { session_id: SessionId },

    /// Subscribe to session lifecycle events
    Subscribe {
        /// Optional filter by session ID
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },

    /// Unsubscribe from events
    Unsubscribe,

    /// Ping to check connection
    Ping {
        /// Sequence number for matching pong response
        seq: u64,
    },

    /// Client disconnecting gracefully
    Disconnect,
}

/// Messages sent from client to daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Protocol version
    pub protocol_version: ProtocolVersion,

    /// Message payload
    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    /// Creates a new client message with current protocol version.
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(MessageType::Connect { client_id })
    }

    pub fn register(registration: SessionRegistration) -> Self {
        Self::new(MessageType::Register { registration })
    }

    pub fn lookup_by_thread(channel: impl Into<String>, thread: Option<String>) -> Self {
        Self::new(MessageType::LookupByThread {
            channel: channel.into(),
            thread,
        })
    }

    pub fn lookup_by_id(session_id: SessionId) -> Self {
        Self::new(MessageType::LookupById { session_id })
    }

    pub fn send(session_id: SessionId, payload: impl Into<String>) -> Self {
        Self::new(MessageType::Send {
            session_id,
            payload: payload.into(),
        })
    }

    pub fn list(status: Option<SessionStatus>) -> Self {
        Self::new(MessageType::List { status })
    }

    pub fn heartbeat(session_id: SessionId) -> Self {
        Self::new(MessageType::Heartbeat { session_id })
    }

    pub fn update(session_id: SessionId, changes: SessionUpdate) -> Self {
        Self::new(MessageType::Update {
            session_id,
            changes,
        })
    }

    pub fn mark_ended(session_id: SessionId) -> Self {
        Self::new(MessageType::MarkEnded { session_id })
    }

    pub fn subscribe(session_id: Option<SessionId>) -> Self {
        Self::new(MessageType::Subscribe { session_id })
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }
}

/// Machine-readable error category carried in `DaemonMessage::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    DuplicateSession,
    RoutingKeyInUse,
    ProcessUnreachable,
    InvalidRequest,
    StorageUnavailable,
    Protocol,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "not_found",
            Self::DuplicateSession => "duplicate_session",
            Self::RoutingKeyInUse => "routing_key_in_use",
            Self::ProcessUnreachable => "process_unreachable",
            Self::InvalidRequest => "invalid_request",
            Self::StorageUnavailable => "storage_unavailable",
            Self::Protocol => "protocol",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Messages sent from daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    /// Connection accepted
    Connected {
        /// Daemon's protocol version
        protocol_version: ProtocolVersion,
        /// Assigned client ID
        client_id: String,
    },

    /// Connection rejected (version mismatch, etc.)
    Rejected {
        /// Reason for rejection
        reason: String,
        /// Daemon's protocol version (for client to upgrade)
        protocol_version: ProtocolVersion,
    },

    /// Single session reply (register, lookup, update)
    Session { session: Box<SessionRecord> },

    /// Session list reply
    SessionList { sessions: Vec<SessionRecord> },

    /// Payload reached the session's process
    Delivered { session_id: SessionId },

    /// Request applied, nothing to return
    Ack,

    /// Pushed to subscribers: a session was created or changed
    SessionUpdated { session: Box<SessionRecord> },

    /// Pushed to subscribers: a session ended
    SessionEnded { session_id: SessionId },

    /// Pong response to ping
    Pong {
        /// Sequence number from ping
        seq: u64,
    },

    /// Error response
    Error { message: String, code: ErrorCode },
}

impl DaemonMessage {
    pub fn connected(client_id: String) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn session(session: SessionRecord) -> Self {
        Self::Session {
            session: Box::new(session),
        }
    }

    pub fn session_list(sessions: Vec<SessionRecord>) -> Self {
        Self::SessionList { sessions }
    }

    pub fn delivered(session_id: SessionId) -> Self {
        Self::Delivered { session_id }
    }

    pub fn session_updated(session: SessionRecord) -> Self {
        Self::SessionUpdated {
            session: Box::new(session),
        }
    }

    pub fn session_ended(session_id: SessionId) -> Self {
        Self::SessionEnded { session_id }
    }

    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    pub fn error(message: &str, code: ErrorCode) -> Self {
        Self::Error {
            message: message.to_string(),
            code,
        }
    }

    /// Returns true for messages pushed to subscribers rather than replies.
    pub fn is_event(&self) -> bool {
        matches!(self, Self::SessionUpdated { .. } | Self::SessionEnded { .. })
    }
}
