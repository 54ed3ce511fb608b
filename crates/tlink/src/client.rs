//! Registry daemon client.
//!
//! This module provides the `RegistryClient` which handles:
//! - Connection to the daemon via Unix socket with the versioned handshake
//! - Request/reply calls for every registry operation
//! - Reconnection after a broken or timed-out exchange
//! - An `EventStream` for subscribers (a dedicated connection)
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::router::hooks::RegistryEffect;
use tlink_core::{
    RoutingKey, SessionId, SessionRecord, SessionRegistration, SessionStatus, SessionUpdate,
};
use tlink_protocol::{ClientMessage, DaemonMessage, ProtocolVersion};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the registry client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Path to the Unix socket where the daemon listens.
    pub socket_path: PathBuf,

    /// Bound on one request/reply exchange. Must exceed the daemon's SEND
    /// delivery timeout.
    pub request_timeout: Duration,

    /// Initial delay before first retry after connection failure.
    pub retry_initial_delay: Duration,

    /// Maximum delay between retry attempts.
    pub retry_max_delay: Duration,

    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each retry).
    pub retry_multiplier: f64,
}

impl ClientConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Self::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/threadlink/tlinkd.sock"),
            request_timeout: Duration::from_secs(10),
            retry_initial_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
            retry_multiplier: 2.0,
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// One handshaken connection.
struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    client_id: String,
}

impl Connection {
    async fn open(config: &ClientConfig, client_id: Option<String>) -> Result<Self> {
        let stream = UnixStream::connect(&config.socket_path)
            .await
            .map_err(|e| {
                ClientError::DaemonConnection(format!("{}: {e}", config.socket_path.display()))
            })?;
        let (reader, writer) = stream.into_split();
        let mut conn = Self {
            reader: BufReader::new(reader),
            writer,
            client_id: String::new(),
        };

        conn.send(&ClientMessage::connect(client_id)).await?;
        let reply = timeout(config.request_timeout, conn.recv())
            .await
            .map_err(|_| ClientError::Timeout(config.request_timeout))??;

        match reply {
            DaemonMessage::Connected {
                protocol_version,
                client_id,
            } => {
                if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    return Err(ClientError::VersionMismatch {
                        client_version: ProtocolVersion::CURRENT.to_string(),
                        daemon_version: protocol_version.to_string(),
                    });
                }
                debug!(client_id, protocol_version = %protocol_version, "Handshake complete");
                conn.client_id = client_id;
                Ok(conn)
            }
            DaemonMessage::Rejected {
                protocol_version, ..
            } => Err(ClientError::VersionMismatch {
                client_version: ProtocolVersion::CURRENT.to_string(),
                daemon_version: protocol_version.to_string(),
            }),
            other => Err(ClientError::ProtocolError(format!(
                "Unexpected response to connect: {other:?}"
            ))),
        }
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        debug!(message_type = ?message.message, "Sent message to daemon");
        Ok(())
    }

    async fn recv(&mut self) -> Result<DaemonMessage> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(ClientError::Closed);
        }
        Ok(serde_json::from_str(line.trim())?)
    }

    /// Sends a request and waits for its reply, skipping pushed events.
    async fn exchange(&mut self, message: &ClientMessage) -> Result<DaemonMessage> {
        self.send(message).await?;
        loop {
            let reply = self.recv().await?;
            if reply.is_event() {
                debug!("Skipping pushed event while awaiting reply");
                continue;
            }
            return Ok(reply);
        }
    }
}

// ============================================================================
// Registry Client
// ============================================================================

/// Request/reply client for the registry daemon.
///
/// Calls are serialized over one connection. A failed or timed-out exchange
/// drops the connection; the next call reconnects.
pub struct RegistryClient {
    config: ClientConfig,
    conn: Mutex<Option<Connection>>,
}

impl RegistryClient {
    /// Connects and performs the handshake.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let conn = Connection::open(&config, None).await?;
        info!(
            socket_path = %config.socket_path.display(),
            client_id = %conn.client_id,
            "Connected to registry daemon"
        );
        Ok(Self {
            config,
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Connects, retrying with exponential backoff until success or cancellation.
    pub async fn connect_with_retry(
        config: ClientConfig,
        cancel_token: &CancellationToken,
    ) -> Result<Self> {
        let mut delay = config.retry_initial_delay;
        let mut attempt = 0u32;

        loop {
            attempt = attempt.saturating_add(1);
            match Self::connect(config.clone()).await {
                Ok(client) => return Ok(client),
                Err(e @ ClientError::VersionMismatch { .. }) => return Err(e),
                Err(e) => {
                    if attempt == 1 {
                        warn!(error = %e, "Registry daemon not reachable, will retry");
                    } else {
                        debug!(attempt, error = %e, "Connection attempt failed");
                    }
                }
            }

            tokio::select! {
                _ = sleep(delay) => {
                    let next_delay_ms = (delay.as_millis() as f64 * config.retry_multiplier) as u64;
                    delay = Duration::from_millis(next_delay_ms).min(config.retry_max_delay);
                }
                _ = cancel_token.cancelled() => {
                    return Err(ClientError::DaemonConnection("cancelled".to_string()));
                }
            }
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Runs one exchange, reconnecting first if the last one failed.
    async fn request(&self, message: ClientMessage) -> Result<DaemonMessage> {
        let mut guard = self.conn.lock().await;
        let mut conn = match guard.take() {
            Some(conn) => conn,
            None => {
                debug!("Reconnecting to registry daemon");
                Connection::open(&self.config, None).await?
            }
        };

        let reply = match timeout(self.config.request_timeout, conn.exchange(&message)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(ClientError::Timeout(self.config.request_timeout)),
        };
        *guard = Some(conn);

        match reply {
            DaemonMessage::Error { message, code } => Err(ClientError::Daemon { code, message }),
            other => Ok(other),
        }
    }

    async fn request_session(&self, message: ClientMessage) -> Result<SessionRecord> {
        match self.request(message).await? {
            DaemonMessage::Session { session } => Ok(*session),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn register(&self, registration: SessionRegistration) -> Result<SessionRecord> {
        self.request_session(ClientMessage::register(registration)).await
    }

    /// Live session for a routing key.
    pub async fn lookup_by_thread(&self, routing: &RoutingKey) -> Result<SessionRecord> {
        self.request_session(ClientMessage::lookup_by_thread(
            routing.channel.clone(),
            routing.thread.clone(),
        ))
        .await
    }

    pub async fn lookup_by_id(&self, session_id: &SessionId) -> Result<SessionRecord> {
        self.request_session(ClientMessage::lookup_by_id(session_id.clone()))
            .await
    }

    /// Delivers `payload` to the session's process.
    pub async fn send(&self, session_id: &SessionId, payload: &str) -> Result<()> {
        match self
            .request(ClientMessage::send(session_id.clone(), payload))
            .await?
        {
            DaemonMessage::Delivered { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Lists sessions; `None` means every non-ended session.
    pub async fn list(&self, status: Option<SessionStatus>) -> Result<Vec<SessionRecord>> {
        match self.request(ClientMessage::list(status)).await? {
            DaemonMessage::SessionList { sessions } => Ok(sessions),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn heartbeat(&self, session_id: &SessionId) -> Result<SessionRecord> {
        self.request_session(ClientMessage::heartbeat(session_id.clone()))
            .await
    }

    pub async fn update(
        &self,
        session_id: &SessionId,
        changes: SessionUpdate,
    ) -> Result<SessionRecord> {
        self.request_session(ClientMessage::update(session_id.clone(), changes))
            .await
    }

    pub async fn mark_ended(&self, session_id: &SessionId) -> Result<()> {
        match self
            .request(ClientMessage::mark_ended(session_id.clone()))
            .await?
        {
            DaemonMessage::Ack => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Applies what a hook event means for the session's record.
    pub async fn apply_hook_effect(
        &self,
        session_id: &SessionId,
        effect: &RegistryEffect,
    ) -> Result<()> {
        match effect {
            RegistryEffect::Heartbeat => {
                self.heartbeat(session_id).await?;
            }
            RegistryEffect::Rebind(conversation) => {
                self.update(session_id, SessionUpdate::conversation(conversation.clone()))
                    .await?;
                self.heartbeat(session_id).await?;
            }
            RegistryEffect::End => self.mark_ended(session_id).await?,
        }
        debug!(session_id = %session_id, ?effect, "Hook effect applied");
        Ok(())
    }

    pub async fn ping(&self, seq: u64) -> Result<()> {
        match self.request(ClientMessage::ping(seq)).await? {
            DaemonMessage::Pong { seq: got } if got == seq => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Opens a dedicated subscriber connection.
    ///
    /// `filter` limits pushed events to one session.
    pub async fn subscribe(&self, filter: Option<SessionId>) -> Result<EventStream> {
        let mut conn = Connection::open(&self.config, None).await?;
        let reply = timeout(
            self.config.request_timeout,
            conn.exchange(&ClientMessage::subscribe(filter)),
        )
        .await
        .map_err(|_| ClientError::Timeout(self.config.request_timeout))??;

        match reply {
            DaemonMessage::SessionList { sessions } => {
                info!(client_id = %conn.client_id, live = sessions.len(), "Subscribed to registry events");
                Ok(EventStream {
                    conn,
                    initial: sessions,
                })
            }
            DaemonMessage::Error { message, code } => Err(ClientError::Daemon { code, message }),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(reply: &DaemonMessage) -> ClientError {
    ClientError::ProtocolError(format!("Unexpected reply: {reply:?}"))
}

// ============================================================================
// Event Stream
// ============================================================================

/// Session lifecycle event pushed by the daemon.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Updated(Box<SessionRecord>),
    Ended(SessionId),
}

/// Subscriber side of a registry connection.
pub struct EventStream {
    conn: Connection,
    initial: Vec<SessionRecord>,
}

impl EventStream {
    /// Live sessions at the moment of subscription.
    pub fn initial_sessions(&self) -> &[SessionRecord] {
        &self.initial
    }

    /// Next pushed event; `Ok(None)` once the daemon closes the connection.
    pub async fn next(&mut self) -> Result<Option<RegistryEvent>> {
        loop {
            let message = match self.conn.recv().await {
                Ok(message) => message,
                Err(ClientError::Closed) => return Ok(None),
                Err(e) => return Err(e),
            };
            match message {
                DaemonMessage::SessionUpdated { session } => {
                    return Ok(Some(RegistryEvent::Updated(session)))
                }
                DaemonMessage::SessionEnded { session_id } => {
                    return Ok(Some(RegistryEvent::Ended(session_id)))
                }
                other => {
                    debug!(message = ?other, "Ignoring non-event message on subscriber connection");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeout_exceeds_delivery_bound() {
        let config = ClientConfig::default();
        assert!(config.request_timeout > Duration::from_secs(5));
    }

    #[test]
    fn test_config_new_sets_socket() {
        let config = ClientConfig::new("/run/t.sock");
        assert_eq!(config.socket_path, PathBuf::from("/run/t.sock"));
        assert_eq!(config.retry_multiplier, 2.0);
    }

    #[tokio::test]
    async fn test_connect_to_missing_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::new(dir.path().join("absent.sock"));
        let err = RegistryClient::connect(config).await.err().unwrap();
        assert!(matches!(err, ClientError::DaemonConnection(_)));
    }

    #[tokio::test]
    async fn test_connect_with_retry_honours_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            retry_initial_delay: Duration::from_millis(10),
            ..ClientConfig::new(dir.path().join("absent.sock"))
        };
        let token = CancellationToken::new();
        token.cancel();
        let result = RegistryClient::connect_with_retry(config, &token).await;
        assert!(matches!(result, Err(ClientError::DaemonConnection(_))));
    }
}
