//! Integration tests for the continuity service.
//!
//! A registry with real sessions, a temporary transcripts root, and
//! `ContinuityService::poll_once` driven by hand.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tlink_core::{
    ConversationId, IpcEndpoint, RoutingKey, SessionId, SessionMode, SessionRegistration,
    SessionUpdate,
};
use tlinkd::continuity::{transcript_dir, ContinuityConfig, ContinuityService};
use tlinkd::registry::{spawn_registry, RegistryConfig, RegistryHandle, SessionEvent};
use tlinkd::store::SessionStore;

// ============================================================================
// Test Helpers
// ============================================================================

struct Fixture {
    dir: TempDir,
    registry: RegistryHandle,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let registry = spawn_registry(SessionStore::in_memory().unwrap(), RegistryConfig::default());
        Self { dir, registry }
    }

    fn root(&self) -> PathBuf {
        self.dir.path().join("transcripts")
    }

    fn project(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn service(&self) -> ContinuityService {
        let config = ContinuityConfig {
            quiet_period: Duration::ZERO,
            min_new_bytes: 512,
            transition_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            transcripts_root: self.root(),
        };
        ContinuityService::new(self.registry.clone(), config)
    }

    /// Writes `<root>/<slug(project)>/<conversation>.jsonl` of `size` bytes.
    fn write_stream(&self, project: &Path, conversation: &str, size: usize) {
        let dir = transcript_dir(&self.root(), project);
        fs::create_dir_all(&dir).unwrap();
        let line = "{\"type\":\"assistant\"}\n";
        let body = line.repeat(size / line.len() + 1);
        fs::write(dir.join(format!("{conversation}.jsonl")), body).unwrap();
    }

    async fn register(&self, id: &str, project: &Path, thread: &str, conversation: &str) {
        let reg = SessionRegistration::new(
            project,
            SessionMode::Thread,
            RoutingKey::thread("C1", thread),
            IpcEndpoint::new(self.dir.path().join(format!("{id}.sock"))),
        )
        .with_session_id(SessionId::new(id))
        .with_conversation(ConversationId::new(conversation));
        self.registry.register(reg).await.unwrap();
    }

    async fn conversation_of(&self, id: &str) -> Option<ConversationId> {
        self.registry
            .get_session(SessionId::new(id))
            .await
            .unwrap()
            .conversation_id
    }
}

// ============================================================================
// Rebind Tests
// ============================================================================

#[tokio::test]
async fn test_new_stream_rebinds_session() {
    let fx = Fixture::new();
    let project = fx.project("app");
    fx.write_stream(&project, "c1", 2000);
    fx.register("s1", &project, "100.0", "c1").await;

    let mut service = fx.service();
    assert_eq!(service.poll_once().await, 0);
    assert_eq!(service.tracked(), 1);

    let mut events = fx.registry.subscribe();
    fx.write_stream(&project, "c2", 600);
    assert_eq!(service.poll_once().await, 1);

    assert_eq!(fx.conversation_of("s1").await, Some(ConversationId::new("c2")));
    match events.recv().await.unwrap() {
        SessionEvent::Updated { session } => {
            assert_eq!(session.conversation_id, Some(ConversationId::new("c2")))
        }
        other => panic!("expected Updated, got {other:?}"),
    }

    // Routing key still resolves to the same session
    let found = fx
        .registry
        .lookup(RoutingKey::thread("C1", "100.0"))
        .await
        .unwrap();
    assert_eq!(found.session_id, SessionId::new("s1"));

    // Stable afterwards
    assert_eq!(service.poll_once().await, 0);
}

#[tokio::test]
async fn test_undersized_stream_does_not_rebind() {
    let fx = Fixture::new();
    let project = fx.project("app");
    fx.write_stream(&project, "c1", 2000);
    fx.register("s1", &project, "100.0", "c1").await;

    let mut service = fx.service();
    service.poll_once().await;

    fx.write_stream(&project, "c2", 10);
    assert_eq!(service.poll_once().await, 0);
    assert_eq!(fx.conversation_of("s1").await, Some(ConversationId::new("c1")));

    // Grows past the threshold while transitioning
    fx.write_stream(&project, "c2", 900);
    assert_eq!(service.poll_once().await, 1);
    assert_eq!(fx.conversation_of("s1").await, Some(ConversationId::new("c2")));
}

#[tokio::test]
async fn test_two_candidates_keep_old_binding() {
    let fx = Fixture::new();
    let project = fx.project("app");
    fx.write_stream(&project, "c1", 2000);
    fx.register("s1", &project, "100.0", "c1").await;

    let mut service = fx.service();
    service.poll_once().await;

    fx.write_stream(&project, "c2", 900);
    fx.write_stream(&project, "c3", 900);
    assert_eq!(service.poll_once().await, 0);
    assert_eq!(fx.conversation_of("s1").await, Some(ConversationId::new("c1")));
}

#[tokio::test]
async fn test_shared_new_stream_rebinds_neither_session() {
    let fx = Fixture::new();
    let project = fx.project("app");
    fx.write_stream(&project, "c1", 2000);
    fx.write_stream(&project, "c2", 2000);
    fx.register("s1", &project, "100.0", "c1").await;
    fx.register("s2", &project, "200.0", "c2").await;

    let mut service = fx.service();
    service.poll_once().await;
    assert_eq!(service.tracked(), 2);

    fx.write_stream(&project, "c3", 900);
    assert_eq!(service.poll_once().await, 0);
    assert_eq!(fx.conversation_of("s1").await, Some(ConversationId::new("c1")));
    assert_eq!(fx.conversation_of("s2").await, Some(ConversationId::new("c2")));

    // The contested stream stays rejected on later polls.
    assert_eq!(service.poll_once().await, 0);
    assert_eq!(fx.conversation_of("s1").await, Some(ConversationId::new("c1")));
}

#[tokio::test]
async fn test_stream_claimed_by_other_session_is_ignored() {
    let fx = Fixture::new();
    let project = fx.project("app");
    fx.write_stream(&project, "c1", 2000);
    fx.register("s1", &project, "100.0", "c1").await;

    let mut service = fx.service();
    service.poll_once().await;

    // A second session in the same project owns c2.
    fx.write_stream(&project, "c2", 900);
    fx.register("s2", &project, "200.0", "c2").await;

    service.poll_once().await;
    assert_eq!(fx.conversation_of("s1").await, Some(ConversationId::new("c1")));
    assert_eq!(fx.conversation_of("s2").await, Some(ConversationId::new("c2")));
}

#[tokio::test]
async fn test_external_rebind_resets_tracker() {
    let fx = Fixture::new();
    let project = fx.project("app");
    fx.write_stream(&project, "c1", 2000);
    fx.register("s1", &project, "100.0", "c1").await;

    let mut service = fx.service();
    service.poll_once().await;

    // A hook reported the new id before the poll noticed the stream.
    fx.write_stream(&project, "c2", 900);
    fx.registry
        .update(
            SessionId::new("s1"),
            SessionUpdate::conversation(ConversationId::new("c2")),
        )
        .await
        .unwrap();

    assert_eq!(service.poll_once().await, 0);
    assert_eq!(fx.conversation_of("s1").await, Some(ConversationId::new("c2")));
}

#[tokio::test]
async fn test_ended_sessions_are_dropped() {
    let fx = Fixture::new();
    let project = fx.project("app");
    fx.write_stream(&project, "c1", 2000);
    fx.register("s1", &project, "100.0", "c1").await;

    let mut service = fx.service();
    service.poll_once().await;
    assert_eq!(service.tracked(), 1);

    fx.registry.mark_ended(SessionId::new("s1")).await.unwrap();
    service.poll_once().await;
    assert_eq!(service.tracked(), 0);
}

#[tokio::test]
async fn test_session_without_conversation_is_skipped() {
    let fx = Fixture::new();
    let project = fx.project("app");
    let reg = SessionRegistration::new(
        &project,
        SessionMode::Thread,
        RoutingKey::thread("C1", "100.0"),
        IpcEndpoint::new(fx.dir.path().join("s1.sock")),
    );
    fx.registry.register(reg).await.unwrap();

    let mut service = fx.service();
    assert_eq!(service.poll_once().await, 0);
    assert_eq!(service.tracked(), 0);
}
