//! Registry actor - owns the session store and processes commands.
//!
//! The RegistryActor is the single writer of session state. It receives
//! commands via an mpsc channel, applies them to the durable store and
//! publishes events via broadcast.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel send failures are logged but don't panic

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use tlink_core::{
    RoutingKey, SessionId, SessionRecord, SessionRegistration, SessionStatus, SessionUpdate,
};

use super::commands::{EndReason, RegistryCommand, RegistryError, SessionEvent};
use crate::store::SessionStore;

// ============================================================================
// Configuration
// ============================================================================

/// Default idle time after which a live session is ended.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Default age after which ended sessions are deleted.
pub const DEFAULT_PURGE_AFTER: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default cleanup ticker period.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Timing knobs for the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Live sessions idle longer than this are ended by cleanup.
    pub inactivity_timeout: Duration,
    /// Ended sessions older than this are deleted by cleanup.
    pub purge_after: Duration,
    /// How often cleanup runs.
    pub cleanup_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            purge_after: DEFAULT_PURGE_AFTER,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

// ============================================================================
// Registry Actor
// ============================================================================

/// The registry actor - owns the session store.
///
/// # Ownership
///
/// The actor owns the [`SessionStore`] write connection. Every mutation
/// is applied by this task, one command at a time, so read-modify-write
/// sequences cannot interleave.
pub struct RegistryActor {
    /// Command receiver
    receiver: mpsc::Receiver<RegistryCommand>,

    /// Durable session storage
    store: SessionStore,

    /// Cleanup thresholds
    config: RegistryConfig,

    /// Event publisher for subscribers (router clients, continuity service)
    event_publisher: broadcast::Sender<SessionEvent>,
}

impl RegistryActor {
    /// Creates a new registry actor.
    pub fn new(
        receiver: mpsc::Receiver<RegistryCommand>,
        store: SessionStore,
        config: RegistryConfig,
        event_publisher: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            receiver,
            store,
            config,
            event_publisher,
        }
    }

    /// Runs the actor loop until every sender is dropped.
    ///
    /// Store calls block, so this runs on its own thread rather than on
    /// the async runtime.
    pub fn run(mut self) {
        info!("Registry actor starting");

        while let Some(cmd) = self.receiver.blocking_recv() {
            self.handle_command(cmd);
        }

        info!("Registry actor stopped");
    }

    /// Dispatches a command to the appropriate handler.
    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Register {
                registration,
                supersede,
                respond_to,
            } => {
                let result = self.handle_register(*registration, supersede);
                // Ignore send error - client may have dropped the receiver
                let _ = respond_to.send(result);
            }
            RegistryCommand::GetSession {
                session_id,
                respond_to,
            } => {
                let result = self.store.get(&session_id).map_err(RegistryError::from);
                let _ = respond_to.send(result);
            }
            RegistryCommand::LookupByRoutingKey {
                routing,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_lookup(&routing));
            }
            RegistryCommand::List { status, respond_to } => {
                let result = match status {
                    Some(s) => self.store.list(Some(s)),
                    None => self.store.list_live(),
                };
                let _ = respond_to.send(result.map_err(RegistryError::from));
            }
            RegistryCommand::FindByProjectDir { dir, respond_to } => {
                let _ = respond_to.send(self.handle_find_by_project_dir(&dir));
            }
            RegistryCommand::Heartbeat {
                session_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_heartbeat(&session_id));
            }
            RegistryCommand::Touch {
                session_id,
                respond_to,
            } => {
                let result = self
                    .store
                    .update(&session_id, &SessionUpdate::activity(Utc::now()))
                    .map_err(RegistryError::from);
                let _ = respond_to.send(result);
            }
            RegistryCommand::Update {
                session_id,
                changes,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_update(&session_id, &changes));
            }
            RegistryCommand::MarkEnded {
                session_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_mark_ended(&session_id));
            }
            RegistryCommand::Cleanup => {
                self.handle_cleanup();
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn handle_register(
        &mut self,
        registration: SessionRegistration,
        supersede: Option<SessionId>,
    ) -> Result<SessionRecord, RegistryError> {
        let record = SessionRecord::from_registration(registration, Utc::now())
            .map_err(|e| RegistryError::InvalidRequest(e.to_string()))?;

        let superseded = match supersede {
            Some(holder) => {
                let ended = self.store.create_superseding(&record, &holder)?;
                ended.then_some(holder)
            }
            None => {
                self.store.create(&record)?;
                None
            }
        };

        if let Some(holder) = superseded {
            warn!(
                session_id = %holder,
                routing = %record.routing,
                reason = %EndReason::Superseded,
                "Session ended"
            );
            let _ = self.event_publisher.send(SessionEvent::Ended {
                session_id: holder,
                reason: EndReason::Superseded,
            });
        }

        info!(
            session_id = %record.session_id,
            project = %record.project,
            mode = %record.mode,
            routing = %record.routing,
            "Session registered"
        );

        let _ = self.event_publisher.send(SessionEvent::Registered {
            session: Box::new(record.clone()),
        });

        Ok(record)
    }

    fn handle_lookup(&self, routing: &RoutingKey) -> Result<SessionRecord, RegistryError> {
        let result = self.store.get_by_routing_key(routing);
        if result.is_err() {
            debug!(routing = %routing, "No live session for routing key");
        }
        Ok(result?)
    }

    fn handle_find_by_project_dir(&self, dir: &Path) -> Result<Vec<SessionRecord>, RegistryError> {
        Ok(self.store.find_by_project_dir(dir)?)
    }

    /// Bumps activity and promotes a `Starting` session to `Active`.
    fn handle_heartbeat(&mut self, session_id: &SessionId) -> Result<SessionRecord, RegistryError> {
        let current = self.store.get(session_id)?;
        let mut update = SessionUpdate::activity(Utc::now());
        match current.status {
            SessionStatus::Ended => {
                return Err(RegistryError::InvalidRequest(format!(
                    "session {session_id} has ended"
                )));
            }
            SessionStatus::Starting => update.status = Some(SessionStatus::Active),
            SessionStatus::Active => {}
        }

        let record = self.store.update(session_id, &update)?;
        if current.status != record.status {
            debug!(session_id = %session_id, status = %record.status, "Session promoted");
            let _ = self.event_publisher.send(SessionEvent::Updated {
                session: Box::new(record.clone()),
            });
        }
        Ok(record)
    }

    fn handle_update(
        &mut self,
        session_id: &SessionId,
        changes: &SessionUpdate,
    ) -> Result<SessionRecord, RegistryError> {
        if changes.is_empty() {
            return Ok(self.store.get(session_id)?);
        }

        let was_live = self.store.get(session_id)?.is_live();
        let record = self.store.update(session_id, changes)?;

        debug!(
            session_id = %session_id,
            status = %record.status,
            conversation_id = ?record.conversation_id.as_ref().map(|c| c.as_str()),
            "Session updated"
        );

        if was_live && !record.is_live() {
            info!(session_id = %session_id, reason = %EndReason::Explicit, "Session ended");
            let _ = self.event_publisher.send(SessionEvent::Ended {
                session_id: session_id.clone(),
                reason: EndReason::Explicit,
            });
        } else {
            let _ = self.event_publisher.send(SessionEvent::Updated {
                session: Box::new(record.clone()),
            });
        }
        Ok(record)
    }

    fn handle_mark_ended(&mut self, session_id: &SessionId) -> Result<(), RegistryError> {
        if self.store.mark_ended(session_id)? {
            info!(session_id = %session_id, reason = %EndReason::Explicit, "Session ended");
            let _ = self.event_publisher.send(SessionEvent::Ended {
                session_id: session_id.clone(),
                reason: EndReason::Explicit,
            });
        } else {
            debug!(session_id = %session_id, "Session already ended");
        }
        Ok(())
    }

    /// Ends idle sessions, then purges old ended ones.
    ///
    /// Store failures are logged; the next tick retries.
    fn handle_cleanup(&mut self) {
        match self
            .store
            .expire_inactive(to_chrono(self.config.inactivity_timeout))
        {
            Ok(expired) => {
                for session_id in expired {
                    // Use warn! so it shows up without RUST_LOG=debug
                    warn!(
                        session_id = %session_id,
                        reason = %EndReason::Inactive,
                        "Session ended by cleanup"
                    );
                    let _ = self.event_publisher.send(SessionEvent::Ended {
                        session_id,
                        reason: EndReason::Inactive,
                    });
                }
            }
            Err(e) => warn!(error = %e, "Inactivity sweep failed"),
        }

        match self.store.purge_stale(to_chrono(self.config.purge_after)) {
            Ok(0) => debug!("No ended sessions to purge"),
            Ok(count) => {
                info!(count, "Purged ended sessions");
                let _ = self.event_publisher.send(SessionEvent::Purged { count });
            }
            Err(e) => warn!(error = %e, "Purge failed"),
        }
    }
}
