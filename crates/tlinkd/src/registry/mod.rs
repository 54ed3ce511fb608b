//! Session registry using the Actor pattern.
//!
//! The registry is the single writer of the durable session store. It
//! receives commands via a tokio mpsc channel, applies them in order, and
//! publishes changes to subscribers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌──────────────────┐
//! │ Connection task │────▶│  RegistryActor  │────▶│ Broadcast Channel│
//! └─────────────────┘     └─────────────────┘     └──────────────────┘
//!         │                       │                       │
//!         │   RegistryCommand     │   SessionEvent        │
//!         │   (mpsc channel)      │   (broadcast)         │
//!         ▼                       ▼                       ▼
//!   Register/Update          SessionStore            Subscribed
//!   Heartbeat/End            (SQLite)                clients
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, error};

mod actor;
mod commands;
mod handle;

pub use actor::{
    RegistryActor, RegistryConfig, DEFAULT_CLEANUP_INTERVAL, DEFAULT_INACTIVITY_TIMEOUT,
    DEFAULT_PURGE_AFTER,
};
pub use commands::{EndReason, RegistryCommand, RegistryError, SessionEvent};
pub use handle::RegistryHandle;

use crate::store::SessionStore;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 100;
const EVENT_BUFFER: usize = 100;

/// Spawn the registry actor and return a handle for interaction.
///
/// This function:
/// 1. Creates command and event channels
/// 2. Starts the RegistryActor on a dedicated thread; it takes ownership
///    of `store`
/// 3. Spawns a background cleanup task
/// 4. Returns a RegistryHandle for client use
///
/// The actor stops once every handle is dropped. Must be called from
/// within a tokio runtime (the cleanup task is async).
///
/// # Example
///
/// ```no_run
/// use tlinkd::registry::{spawn_registry, RegistryConfig};
/// use tlinkd::store::SessionStore;
///
/// #[tokio::main]
/// async fn main() {
///     let store = SessionStore::in_memory().unwrap();
///     let handle = spawn_registry(store, RegistryConfig::default());
///     let sessions = handle.list(None).await;
/// }
/// ```
pub fn spawn_registry(store: SessionStore, config: RegistryConfig) -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let actor = RegistryActor::new(cmd_rx, store, config, event_tx.clone());
    if let Err(e) = std::thread::Builder::new()
        .name("tlink-registry".to_string())
        .spawn(move || actor.run())
    {
        // Every request on the handle will fail with ChannelClosed.
        error!(error = %e, "Failed to start registry thread");
    }

    spawn_cleanup_task(cmd_tx.downgrade(), config);

    RegistryHandle::new(cmd_tx, event_tx)
}

/// Spawn a background task that triggers periodic cleanup.
///
/// Holds only a weak sender, so it never keeps the actor alive.
fn spawn_cleanup_task(sender: mpsc::WeakSender<RegistryCommand>, config: RegistryConfig) {
    tokio::spawn(async move {
        let mut ticker = interval(config.cleanup_interval);

        loop {
            ticker.tick().await;

            let Some(sender) = sender.upgrade() else {
                debug!("Cleanup task stopping: registry handles dropped");
                break;
            };
            // Fire-and-forget cleanup command
            if sender.send(RegistryCommand::Cleanup).await.is_err() {
                debug!("Cleanup task stopping: registry channel closed");
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_actor_stops_when_handles_drop() {
        let store = SessionStore::in_memory().unwrap();
        let handle = spawn_registry(store, RegistryConfig::default());
        let mut events = handle.subscribe();
        let second = handle.clone();

        assert!(handle.list(None).await.unwrap().is_empty());
        drop(handle);
        assert!(second.list(None).await.unwrap().is_empty());
        drop(second);

        let closed = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("actor stops after the last handle drops");
        assert!(matches!(closed, Err(broadcast::error::RecvError::Closed)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_registry_serves_single_threaded_runtime() {
        let store = SessionStore::in_memory().unwrap();
        let handle = spawn_registry(store, RegistryConfig::default());

        // Another task keeps running while the actor handles requests.
        let ticker = tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            true
        });
        for _ in 0..20 {
            assert!(handle.list(None).await.unwrap().is_empty());
        }
        assert!(ticker.await.unwrap());
    }
}
