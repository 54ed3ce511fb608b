//! Client interface for interacting with the RegistryActor.
//!
//! The `RegistryHandle` provides a cheap-to-clone interface for sending commands
//! to the registry actor and subscribing to session events.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel errors are mapped to `RegistryError::ChannelClosed`

use std::path::PathBuf;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::info;

use tlink_core::{
    RoutingKey, SessionId, SessionRecord, SessionRegistration, SessionStatus, SessionUpdate,
};

use super::commands::{RegistryCommand, RegistryError, SessionEvent};
use crate::delivery::{probe_endpoint, PROBE_TIMEOUT};

// ============================================================================
// Registry Handle
// ============================================================================

/// Handle for interacting with the registry actor.
///
/// This is a cheap-to-clone handle that can be shared across tasks.
///
/// ```ignore
/// let record = handle.register(registration).await?;
/// handle.heartbeat(record.session_id.clone()).await?;
///
/// let mut rx = handle.subscribe();
/// while let Ok(event) = rx.recv().await {
///     // Handle event
/// }
/// ```
#[derive(Clone)]
pub struct RegistryHandle {
    /// Command sender to the actor
    sender: mpsc::Sender<RegistryCommand>,

    /// Event broadcaster for subscribing to updates
    event_sender: broadcast::Sender<SessionEvent>,
}

impl RegistryHandle {
    /// Create a new registry handle.
    pub fn new(
        sender: mpsc::Sender<RegistryCommand>,
        event_sender: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    /// Sends a command built around a fresh oneshot and awaits the reply.
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, RegistryError>>) -> RegistryCommand,
    ) -> Result<T, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(build(tx))
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Register a new session.
    ///
    /// If a live session already holds the routing key, its endpoint is
    /// probed. A holder that no longer accepts connections is ended and
    /// the new session takes over the key in the same transaction.
    ///
    /// # Errors
    ///
    /// - `RegistryError::DuplicateSession` if a session with this id exists
    /// - `RegistryError::RoutingKeyInUse` if a reachable session holds the key
    /// - `RegistryError::InvalidRequest` if mode and routing disagree
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn register(
        &self,
        registration: SessionRegistration,
    ) -> Result<SessionRecord, RegistryError> {
        let first = self
            .request(|tx| RegistryCommand::Register {
                registration: Box::new(registration.clone()),
                supersede: None,
                respond_to: tx,
            })
            .await;

        let (holder, endpoint) = match first {
            Err(RegistryError::RoutingKeyInUse {
                holder,
                holder_endpoint,
                ..
            }) if !holder.as_str().is_empty() => (holder, holder_endpoint),
            other => return other,
        };

        if probe_endpoint(&endpoint, PROBE_TIMEOUT).await {
            return Err(RegistryError::RoutingKeyInUse {
                routing: registration.routing,
                holder,
                holder_endpoint: endpoint,
            });
        }

        info!(
            holder = %holder,
            endpoint = %endpoint,
            "Routing key holder unreachable, superseding"
        );

        self.request(|tx| RegistryCommand::Register {
            registration: Box::new(registration),
            supersede: Some(holder),
            respond_to: tx,
        })
        .await
    }

    /// Get a single session by id, ended or not.
    pub async fn get_session(&self, session_id: SessionId) -> Result<SessionRecord, RegistryError> {
        self.request(|tx| RegistryCommand::GetSession {
            session_id,
            respond_to: tx,
        })
        .await
    }

    /// Get the live session bound to a routing key.
    pub async fn lookup(&self, routing: RoutingKey) -> Result<SessionRecord, RegistryError> {
        self.request(|tx| RegistryCommand::LookupByRoutingKey {
            routing,
            respond_to: tx,
        })
        .await
    }

    /// List sessions with `status`, or all live sessions when `None`.
    pub async fn list(
        &self,
        status: Option<SessionStatus>,
    ) -> Result<Vec<SessionRecord>, RegistryError> {
        self.request(|tx| RegistryCommand::List {
            status,
            respond_to: tx,
        })
        .await
    }

    /// Live sessions started from `dir`, newest first.
    pub async fn find_by_project_dir(
        &self,
        dir: PathBuf,
    ) -> Result<Vec<SessionRecord>, RegistryError> {
        self.request(|tx| RegistryCommand::FindByProjectDir {
            dir,
            respond_to: tx,
        })
        .await
    }

    /// Record a liveness signal. Promotes `Starting` to `Active`.
    pub async fn heartbeat(&self, session_id: SessionId) -> Result<SessionRecord, RegistryError> {
        self.request(|tx| RegistryCommand::Heartbeat {
            session_id,
            respond_to: tx,
        })
        .await
    }

    /// Bump last activity only.
    pub async fn touch(&self, session_id: SessionId) -> Result<SessionRecord, RegistryError> {
        self.request(|tx| RegistryCommand::Touch {
            session_id,
            respond_to: tx,
        })
        .await
    }

    /// Apply a partial update atomically.
    pub async fn update(
        &self,
        session_id: SessionId,
        changes: SessionUpdate,
    ) -> Result<SessionRecord, RegistryError> {
        self.request(|tx| RegistryCommand::Update {
            session_id,
            changes: Box::new(changes),
            respond_to: tx,
        })
        .await
    }

    /// Mark a session ended. Ending an ended session succeeds.
    pub async fn mark_ended(&self, session_id: SessionId) -> Result<(), RegistryError> {
        self.request(|tx| RegistryCommand::MarkEnded {
            session_id,
            respond_to: tx,
        })
        .await
    }

    /// Trigger cleanup of inactive and old sessions.
    ///
    /// This is a fire-and-forget operation.
    pub async fn cleanup(&self) {
        // Fire-and-forget: ignore send errors (actor may be shutting down)
        let _ = self.sender.send(RegistryCommand::Cleanup).await;
    }

    /// Subscribe to session events.
    ///
    /// This is a synchronous operation - it doesn't communicate with the actor.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_sender.subscribe()
    }

    /// Returns `true` if the command channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlink_core::{IpcEndpoint, SessionMode};

    fn create_test_handle() -> (RegistryHandle, mpsc::Receiver<RegistryCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, _event_rx) = broadcast::channel(16);
        let handle = RegistryHandle::new(cmd_tx, event_tx);
        (handle, cmd_rx)
    }

    fn registration(endpoint: &str) -> SessionRegistration {
        SessionRegistration::new(
            "/work/app",
            SessionMode::Thread,
            RoutingKey::thread("C1", "T1"),
            IpcEndpoint::new(endpoint),
        )
    }

    #[tokio::test]
    async fn test_register_channel_closed_error() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        let result = handle.register(registration("/tmp/x.sock")).await;
        assert!(matches!(result, Err(RegistryError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_get_session_channel_closed() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        let result = handle.get_session(SessionId::new("test-123")).await;
        assert!(matches!(result, Err(RegistryError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_register_supersedes_dead_holder() {
        let (handle, mut rx) = create_test_handle();
        let dir = tempfile::TempDir::new().unwrap();
        // Nobody listens here
        let dead = dir.path().join("dead.sock");
        let dead_endpoint = IpcEndpoint::new(&dead);

        let responder = tokio::spawn(async move {
            let mut supersede_seen = None;
            while let Some(cmd) = rx.recv().await {
                if let RegistryCommand::Register {
                    registration,
                    supersede,
                    respond_to,
                } = cmd
                {
                    match supersede {
                        None => {
                            let _ = respond_to.send(Err(RegistryError::RoutingKeyInUse {
                                routing: registration.routing.clone(),
                                holder: SessionId::new("old"),
                                holder_endpoint: dead_endpoint.clone(),
                            }));
                        }
                        Some(holder) => {
                            supersede_seen = Some(holder);
                            let record = SessionRecord::from_registration(
                                *registration,
                                chrono::Utc::now(),
                            )
                            .unwrap();
                            let _ = respond_to.send(Ok(record));
                            break;
                        }
                    }
                }
            }
            supersede_seen
        });

        let record = handle.register(registration("/tmp/new.sock")).await.unwrap();
        assert_eq!(record.endpoint, IpcEndpoint::new("/tmp/new.sock"));
        let seen = responder.await.unwrap();
        assert_eq!(seen, Some(SessionId::new("old")));
    }

    #[tokio::test]
    async fn test_register_keeps_live_holder() {
        let (handle, mut rx) = create_test_handle();
        let dir = tempfile::TempDir::new().unwrap();
        let live = dir.path().join("live.sock");
        let _listener = tokio::net::UnixListener::bind(&live).unwrap();
        let live_endpoint = IpcEndpoint::new(&live);

        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                if let RegistryCommand::Register {
                    registration,
                    supersede,
                    respond_to,
                } = cmd
                {
                    assert!(supersede.is_none(), "live holder must not be superseded");
                    let _ = respond_to.send(Err(RegistryError::RoutingKeyInUse {
                        routing: registration.routing.clone(),
                        holder: SessionId::new("old"),
                        holder_endpoint: live_endpoint.clone(),
                    }));
                }
            }
        });

        let result = handle.register(registration("/tmp/new.sock")).await;
        assert!(matches!(result, Err(RegistryError::RoutingKeyInUse { .. })));
    }

    #[tokio::test]
    async fn test_cleanup_fire_and_forget() {
        let (handle, mut rx) = create_test_handle();

        let cmd_handler = tokio::spawn(async move {
            matches!(rx.recv().await, Some(RegistryCommand::Cleanup))
        });

        handle.cleanup().await;
        assert!(cmd_handler.await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_ignores_closed_channel() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        // Should not panic or error
        handle.cleanup().await;
    }

    #[tokio::test]
    async fn test_is_connected() {
        let (handle, rx) = create_test_handle();
        assert!(handle.is_connected());

        drop(rx);
        let _ = handle.sender.send(RegistryCommand::Cleanup).await;
        assert!(!handle.is_connected());
    }

    #[tokio::test]
    async fn test_update_sends_changes() {
        let (handle, mut rx) = create_test_handle();

        let cmd_handler = tokio::spawn(async move {
            if let Some(RegistryCommand::Update {
                session_id,
                changes,
                respond_to,
            }) = rx.recv().await
            {
                assert_eq!(session_id.as_str(), "s1");
                assert_eq!(changes.status, Some(SessionStatus::Ended));
                drop(respond_to);
                return true;
            }
            false
        });

        // Responder dropped without replying
        let result = handle
            .update(SessionId::new("s1"), SessionUpdate::status(SessionStatus::Ended))
            .await;
        assert!(matches!(result, Err(RegistryError::ChannelClosed)));
        assert!(cmd_handler.await.unwrap());
    }
}
