//! Connection handler for individual client connections.
//!
//! Each client connection gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Parses newline-delimited JSON requests
//! - Routes requests to the registry or to a session endpoint
//! - Replies with exactly one message per request
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Connection errors are logged and result in graceful disconnect

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use tlink_core::{RoutingKey, SessionId, SessionStatus};
use tlink_protocol::{ClientMessage, DaemonMessage, ErrorCode, MessageType, ProtocolVersion};

use crate::delivery;
use crate::registry::{RegistryError, RegistryHandle};

/// Type alias for subscriber writer handle
pub type SubscriberWriter = Arc<Mutex<BufWriter<OwnedWriteHalf>>>;

/// Information about a subscribed client
pub struct Subscriber {
    /// Writer for sending events
    pub writer: SubscriberWriter,

    /// Optional filter for session-specific subscriptions
    pub filter: Option<SessionId>,
}

/// Type alias for the subscribers map
pub type SubscribersMap = Arc<RwLock<HashMap<String, Subscriber>>>;

/// Maximum number of concurrent subscribers
pub(crate) const MAX_SUBSCRIBERS: usize = 32;

/// Maximum message size (1 MB)
pub(crate) const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Read timeout for idle connections (5 minutes)
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
pub(crate) const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Unique identifier for this connection
type ClientId = String;

/// Connection handler for a single client.
pub struct ConnectionHandler {
    /// Buffered reader for incoming messages
    reader: BufReader<OwnedReadHalf>,

    /// Buffered writer for outgoing messages (shared for event broadcast)
    writer: SubscriberWriter,

    /// Handle to the session registry
    registry: RegistryHandle,

    /// Shared subscribers map for event broadcasting
    subscribers: SubscribersMap,

    /// Bound on one SEND delivery
    send_timeout: Duration,

    /// Unique client identifier (assigned after handshake)
    client_id: Option<ClientId>,

    /// Counter for generating client IDs
    connection_number: u64,
}

impl ConnectionHandler {
    /// Creates a new connection handler.
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        registry: RegistryHandle,
        subscribers: SubscribersMap,
        send_timeout: Duration,
        connection_number: u64,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: Arc::new(Mutex::new(BufWriter::new(writer))),
            registry,
            subscribers,
            send_timeout,
            client_id: None,
            connection_number,
        }
    }

    /// Runs the connection handler.
    ///
    /// Performs the handshake then enters the message processing loop.
    /// Returns the client id (if the handshake completed) when the
    /// connection closes.
    pub async fn run(mut self) -> Option<ClientId> {
        debug!(connection = self.connection_number, "New client connected");

        match self.handle_handshake().await {
            Ok(()) => {
                debug!(client_id = ?self.client_id, "Client handshake completed");
            }
            Err(e) => {
                warn!(
                    connection = self.connection_number,
                    error = %e,
                    "Handshake failed"
                );
                return None;
            }
        }

        let client_id = self.client_id.clone();

        if let Err(e) = self.process_messages().await {
            debug!(
                client_id = ?self.client_id,
                error = %e,
                "Connection closed"
            );
        }

        debug!(client_id = ?self.client_id, "Client disconnected");
        client_id
    }

    /// Handles the initial protocol handshake.
    ///
    /// Expects a `Connect` message, validates the protocol version, and
    /// responds with `Connected` or `Rejected`.
    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let msg = match timeout(READ_TIMEOUT, self.read_message()).await {
            Ok(result) => result?,
            Err(_) => return Err(ConnectionError::Timeout),
        };

        let client_version = msg.protocol_version;
        if let Err(e) = ProtocolVersion::CURRENT.check(&client_version) {
            warn!(
                client_version = %client_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );
            self.send_message(DaemonMessage::rejected(&e.to_string()))
                .await?;
            return Err(ConnectionError::VersionMismatch {
                client: client_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.message {
            MessageType::Connect { client_id } => {
                let assigned_id =
                    client_id.unwrap_or_else(|| format!("client-{}", self.connection_number));
                self.client_id = Some(assigned_id.clone());
                self.send_message(DaemonMessage::connected(assigned_id))
                    .await
            }
            other => {
                self.send_message(DaemonMessage::error(
                    "Expected connect message for handshake",
                    ErrorCode::Protocol,
                ))
                .await?;
                Err(ConnectionError::UnexpectedMessage(format!("{other:?}")))
            }
        }
    }

    /// Main message processing loop.
    ///
    /// Malformed requests get an error reply and the loop continues.
    /// EOF, idle timeout, oversize messages and write failures end it.
    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        loop {
            let msg = match timeout(READ_TIMEOUT, self.read_message()).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(ConnectionError::Eof)) => {
                    debug!(client_id = ?self.client_id, "Client sent EOF");
                    return Ok(());
                }
                Ok(Err(ConnectionError::ParseError(reason))) => {
                    debug!(client_id = ?self.client_id, reason = %reason, "Malformed request");
                    self.send_message(DaemonMessage::error(
                        &format!("Malformed request: {reason}"),
                        ErrorCode::Protocol,
                    ))
                    .await?;
                    continue;
                }
                Ok(Err(e @ ConnectionError::MessageTooLarge { .. })) => {
                    // Remainder of the line is unread; the stream cannot be resynced.
                    let _ = self
                        .send_message(DaemonMessage::error(&e.to_string(), ErrorCode::Protocol))
                        .await;
                    return Err(e);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(client_id = ?self.client_id, "Connection timed out");
                    return Err(ConnectionError::Timeout);
                }
            };

            if matches!(msg.message, MessageType::Disconnect) {
                debug!(client_id = ?self.client_id, "Client requested disconnect");
                return Ok(());
            }

            let reply = self.handle_message(msg.message).await;
            self.send_message(reply).await?;
        }
    }

    /// Handles a single request and builds its reply.
    async fn handle_message(&mut self, message: MessageType) -> DaemonMessage {
        let result = match message {
            MessageType::Connect { .. } => {
                return DaemonMessage::error("Already connected", ErrorCode::Protocol);
            }
            MessageType::Register { registration } => self
                .registry
                .register(registration)
                .await
                .map(DaemonMessage::session),
            MessageType::LookupByThread { channel, thread } => {
                let routing = RoutingKey { channel, thread };
                self.registry.lookup(routing).await.map(DaemonMessage::session)
            }
            MessageType::LookupById { session_id } => self
                .registry
                .get_session(session_id)
                .await
                .map(DaemonMessage::session),
            MessageType::Send {
                session_id,
                payload,
            } => return self.handle_send(session_id, payload).await,
            MessageType::List { status } => self
                .registry
                .list(status)
                .await
                .map(DaemonMessage::session_list),
            MessageType::Heartbeat { session_id } => self
                .registry
                .heartbeat(session_id)
                .await
                .map(DaemonMessage::session),
            MessageType::Update {
                session_id,
                changes,
            } => self
                .registry
                .update(session_id, changes)
                .await
                .map(DaemonMessage::session),
            MessageType::MarkEnded { session_id } => self
                .registry
                .mark_ended(session_id)
                .await
                .map(|()| DaemonMessage::Ack),
            MessageType::Subscribe { session_id } => return self.handle_subscribe(session_id).await,
            MessageType::Unsubscribe => {
                if let Some(ref client_id) = self.client_id {
                    self.subscribers.write().await.remove(client_id);
                }
                debug!(client_id = ?self.client_id, "Client unsubscribed from updates");
                Ok(DaemonMessage::Ack)
            }
            MessageType::Ping { seq } => Ok(DaemonMessage::pong(seq)),
            MessageType::Disconnect => Ok(DaemonMessage::Ack),
        };

        result.unwrap_or_else(|e| registry_error_reply(&e))
    }

    /// Delivers a payload to the session's wrapper process.
    ///
    /// Ended sessions are refused without a connection attempt. Any
    /// delivery failure maps to `process_unreachable`.
    async fn handle_send(&mut self, session_id: SessionId, payload: String) -> DaemonMessage {
        let session = match self.registry.get_session(session_id.clone()).await {
            Ok(s) => s,
            Err(e) => return registry_error_reply(&e),
        };

        if session.status == SessionStatus::Ended {
            return DaemonMessage::error(
                &format!("Session {session_id} has ended"),
                ErrorCode::ProcessUnreachable,
            );
        }

        if let Err(e) = delivery::deliver(&session.endpoint, &payload, self.send_timeout).await {
            warn!(session_id = %session_id, error = %e, "Send failed");
            return DaemonMessage::error(&e.to_string(), ErrorCode::ProcessUnreachable);
        }

        info!(session_id = %session_id, bytes = payload.len(), "Payload delivered to session");

        // Delivery succeeded; failing to record activity does not undo it.
        if let Err(e) = self.registry.touch(session_id.clone()).await {
            debug!(session_id = %session_id, error = %e, "Activity bump after send failed");
        }
        DaemonMessage::delivered(session_id)
    }

    async fn handle_subscribe(&mut self, filter: Option<SessionId>) -> DaemonMessage {
        let Some(client_id) = self.client_id.clone() else {
            return DaemonMessage::error("Must connect before subscribing", ErrorCode::Protocol);
        };

        {
            let mut subs = self.subscribers.write().await;
            if subs.len() >= MAX_SUBSCRIBERS && !subs.contains_key(&client_id) {
                return DaemonMessage::error(
                    &format!("Too many subscribers (max: {MAX_SUBSCRIBERS})"),
                    ErrorCode::Internal,
                );
            }
            subs.insert(
                client_id.clone(),
                Subscriber {
                    writer: Arc::clone(&self.writer),
                    filter: filter.clone(),
                },
            );
        }

        debug!(client_id = %client_id, filter = ?filter, "Client subscribed to updates");

        // Current live sessions as initial state
        match self.registry.list(None).await {
            Ok(sessions) => {
                let sessions = match filter {
                    Some(id) => sessions.into_iter().filter(|s| s.session_id == id).collect(),
                    None => sessions,
                };
                DaemonMessage::session_list(sessions)
            }
            Err(e) => registry_error_reply(&e),
        }
    }

    /// Reads a single newline-terminated message, bounded by
    /// [`MAX_MESSAGE_SIZE`].
    async fn read_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        let mut buf = Vec::new();

        let bytes_read = (&mut self.reader)
            .take(MAX_MESSAGE_SIZE as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }

        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(ConnectionError::MessageTooLarge {
                size: buf.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let msg: ClientMessage = serde_json::from_slice(&buf)
            .map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        debug!(
            client_id = ?self.client_id,
            message_type = ?std::mem::discriminant(&msg.message),
            "Received message"
        );

        Ok(msg)
    }

    /// Sends a message to the client.
    async fn send_message(&self, msg: DaemonMessage) -> Result<(), ConnectionError> {
        write_line(&self.writer, &msg).await
    }
}

/// Maps a registry failure onto the wire error reply.
fn registry_error_reply(err: &RegistryError) -> DaemonMessage {
    DaemonMessage::error(&err.to_string(), err.code())
}

/// Writes one JSON line to a shared writer, bounded by [`WRITE_TIMEOUT`].
pub(crate) async fn write_line(
    writer: &SubscriberWriter,
    msg: &DaemonMessage,
) -> Result<(), ConnectionError> {
    let json =
        serde_json::to_string(msg).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

    let mut writer = writer.lock().await;

    match timeout(WRITE_TIMEOUT, async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok::<(), std::io::Error>(())
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}
