//! Conversation identity continuity.
//!
//! The wrapped tool switches to a fresh conversation id when it compacts or
//! resumes, and starts writing a new transcript stream. This module
//! notices the switch and rebinds the session's conversation id in place,
//! so the chat routing key keeps pointing at the same session.
//!
//! ```text
//!   Bound(old) ──(old idle + new stream, or /compact seen)──▶ Transitioning
//!        ▲                                                      │
//!        ├──────────(timeout, or several candidates)────────────┤
//!        │                                                      ▼
//!        └───────────────────────────────────────────── Bound(new)
//!                                          (one candidate ≥ min bytes)
//! ```
//!
//! [`ContinuityTracker`] is the pure state machine; it takes observations
//! and a clock value and never touches the filesystem. [`ContinuityService`]
//! polls transcript directories and applies rebinds through the registry.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use tlink_capture::transcript_dir;
use tlink_capture::read_snapshot;
use tlink_core::{ConversationId, SessionId, SessionRecord, SessionUpdate};

use crate::registry::RegistryHandle;

// ============================================================================
// Configuration
// ============================================================================

/// Thresholds for continuity detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuityConfig {
    /// How long the old stream must be idle before a new stream counts.
    pub quiet_period: Duration,
    /// Bytes a new stream must hold before the session is rebound to it.
    pub min_new_bytes: u64,
    /// How long to wait in `Transitioning` before giving up.
    pub transition_timeout: Duration,
    /// Service poll period.
    pub poll_interval: Duration,
    /// Root of the per-project transcript directories.
    pub transcripts_root: PathBuf,
}

impl Default for ContinuityConfig {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_secs(10),
            min_new_bytes: 512,
            transition_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
            transcripts_root: default_transcripts_root(),
        }
    }
}

/// `~/.claude/projects`, where the wrapped tool writes transcripts.
pub fn default_transcripts_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".claude")
        .join("projects")
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

// ============================================================================
// Observations
// ============================================================================

/// One transcript stream as seen on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamObservation {
    pub conversation_id: ConversationId,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Lists `<conversation_id>.jsonl` streams in `dir`.
///
/// Subagent transcripts (`agent-*`) are skipped. A missing directory
/// yields no streams.
pub fn scan_streams(dir: &Path) -> io::Result<Vec<StreamObservation>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut streams = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if stem.starts_with("agent-") {
            continue;
        }
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        streams.push(StreamObservation {
            conversation_id: ConversationId::new(stem),
            size: meta.len(),
            modified: meta.modified().map(DateTime::<Utc>::from)?,
        });
    }
    Ok(streams)
}

// ============================================================================
// State Machine
// ============================================================================

/// Binding state of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContinuityState {
    Bound(ConversationId),
    Transitioning {
        old: ConversationId,
        since: DateTime<Utc>,
    },
}

/// What one observation step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContinuityOutcome {
    Unchanged,
    TransitionStarted,
    /// Bound to a new conversation id; the registry must be updated.
    Rebound {
        old: ConversationId,
        new: ConversationId,
    },
    /// Timed out waiting for a new stream; old binding kept.
    Reverted,
    /// Several candidate streams; old binding kept.
    Ambiguous { candidates: Vec<ConversationId> },
}

/// Per-session continuity state machine.
#[derive(Debug, Clone)]
pub struct ContinuityTracker {
    state: ContinuityState,
    /// Streams that can never become the new binding (already present at
    /// start, previously bound, or rejected).
    known: HashSet<ConversationId>,
    /// Last value of the capture window's continuity-command flag.
    command_flag: bool,
    quiet_period: chrono::Duration,
    min_new_bytes: u64,
    transition_timeout: chrono::Duration,
}

impl ContinuityTracker {
    /// Starts bound to `current`. Every stream in `existing` predates the
    /// session's current conversation and is never a candidate.
    pub fn new(
        current: ConversationId,
        existing: &[StreamObservation],
        config: &ContinuityConfig,
    ) -> Self {
        Self {
            known: existing.iter().map(|s| s.conversation_id.clone()).collect(),
            state: ContinuityState::Bound(current),
            command_flag: false,
            quiet_period: to_chrono(config.quiet_period),
            min_new_bytes: config.min_new_bytes,
            transition_timeout: to_chrono(config.transition_timeout),
        }
    }

    pub fn state(&self) -> &ContinuityState {
        &self.state
    }

    /// Conversation id the session is bound to (the old one while
    /// transitioning).
    pub fn bound_id(&self) -> &ConversationId {
        match &self.state {
            ContinuityState::Bound(id) => id,
            ContinuityState::Transitioning { old, .. } => old,
        }
    }

    /// Feeds one round of observations.
    ///
    /// `command_seen` is the capture window's continuity-command flag; only
    /// a false-to-true edge starts a transition.
    pub fn observe(
        &mut self,
        streams: &[StreamObservation],
        command_seen: bool,
        now: DateTime<Utc>,
    ) -> ContinuityOutcome {
        let command_edge = command_seen && !self.command_flag;
        self.command_flag = command_seen;

        if let ContinuityState::Bound(old) = self.state.clone() {
            let old_idle = streams
                .iter()
                .find(|s| s.conversation_id == old)
                .map(|s| now.signed_duration_since(s.modified) >= self.quiet_period)
                .unwrap_or(true);
            let fresh = streams.iter().any(|s| self.is_fresh(&old, s));

            if !(command_edge || (old_idle && fresh)) {
                return ContinuityOutcome::Unchanged;
            }

            info!(
                conversation_id = %old,
                command = command_edge,
                "Conversation transition started"
            );
            self.state = ContinuityState::Transitioning { old, since: now };

            return match self.evaluate_transition(streams, now) {
                ContinuityOutcome::Unchanged => ContinuityOutcome::TransitionStarted,
                other => other,
            };
        }

        self.evaluate_transition(streams, now)
    }

    /// Takes back a rebind the caller could not apply. The tracker returns
    /// to `Bound(old)` and `new` is never offered again.
    pub fn withdraw_rebind(&mut self, old: ConversationId, new: &ConversationId) {
        self.known.insert(new.clone());
        self.state = ContinuityState::Bound(old);
    }

    fn is_fresh(&self, old: &ConversationId, stream: &StreamObservation) -> bool {
        &stream.conversation_id != old && !self.known.contains(&stream.conversation_id)
    }

    fn evaluate_transition(
        &mut self,
        streams: &[StreamObservation],
        now: DateTime<Utc>,
    ) -> ContinuityOutcome {
        let ContinuityState::Transitioning { old, since } = self.state.clone() else {
            return ContinuityOutcome::Unchanged;
        };

        let candidates: Vec<ConversationId> = streams
            .iter()
            .filter(|s| self.is_fresh(&old, s) && s.size >= self.min_new_bytes)
            .map(|s| s.conversation_id.clone())
            .collect();

        match candidates.as_slice() {
            [new] => {
                info!(old = %old, new = %new, "Conversation rebound");
                let new = new.clone();
                self.known.insert(old.clone());
                self.state = ContinuityState::Bound(new.clone());
                ContinuityOutcome::Rebound { old, new }
            }
            [] => {
                if now.signed_duration_since(since) < self.transition_timeout {
                    return ContinuityOutcome::Unchanged;
                }
                debug!(conversation_id = %old, "No new stream appeared, keeping binding");
                // Undersized newcomers would otherwise restart the cycle every poll.
                let stale: Vec<ConversationId> = streams
                    .iter()
                    .filter(|s| self.is_fresh(&old, s))
                    .map(|s| s.conversation_id.clone())
                    .collect();
                self.known.extend(stale);
                self.state = ContinuityState::Bound(old);
                ContinuityOutcome::Reverted
            }
            _ => {
                warn!(
                    conversation_id = %old,
                    candidates = candidates.len(),
                    "Ambiguous continuity, keeping old binding"
                );
                self.known.extend(candidates.iter().cloned());
                self.state = ContinuityState::Bound(old);
                ContinuityOutcome::Ambiguous { candidates }
            }
        }
    }
}

// ============================================================================
// Polling Service
// ============================================================================

/// What one poll found for one session.
struct SessionScan {
    session_id: SessionId,
    conversation_id: ConversationId,
    streams: Vec<StreamObservation>,
    command_seen: bool,
}

/// Polls transcript directories for every live session and applies
/// rebinds through the registry.
pub struct ContinuityService {
    registry: RegistryHandle,
    config: ContinuityConfig,
    trackers: HashMap<SessionId, ContinuityTracker>,
}

impl ContinuityService {
    pub fn new(registry: RegistryHandle, config: ContinuityConfig) -> Self {
        Self {
            registry,
            config,
            trackers: HashMap::new(),
        }
    }

    /// Polls until cancelled.
    pub async fn run(mut self, cancel_token: CancellationToken) {
        let mut ticker = interval(self.config.poll_interval);
        info!(
            root = %self.config.transcripts_root.display(),
            "Continuity service started"
        );

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Continuity service shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }
    }

    /// One poll. Returns the number of sessions rebound.
    pub async fn poll_once(&mut self) -> usize {
        let sessions = match self.registry.list(None).await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "Continuity poll could not list sessions");
                return 0;
            }
        };

        let live: HashSet<&SessionId> = sessions.iter().map(|s| &s.session_id).collect();
        self.trackers.retain(|id, _| live.contains(id));

        // Streams owned by another live session are never candidates.
        let claimed: HashSet<ConversationId> = sessions
            .iter()
            .filter_map(|s| s.conversation_id.clone())
            .collect();

        let root = self.config.transcripts_root.clone();
        let scans = match tokio::task::spawn_blocking(move || scan_sessions(&root, sessions)).await
        {
            Ok(scans) => scans,
            Err(e) => {
                warn!(error = %e, "Transcript scan task failed");
                return 0;
            }
        };

        let now = Utc::now();
        let mut proposals: Vec<(SessionId, ConversationId, ConversationId)> = Vec::new();
        for scan in scans {
            let streams: Vec<StreamObservation> = scan
                .streams
                .into_iter()
                .filter(|s| {
                    s.conversation_id == scan.conversation_id
                        || !claimed.contains(&s.conversation_id)
                })
                .collect();

            let tracker = match self.trackers.get_mut(&scan.session_id) {
                // Rebound elsewhere (hook update): start over from the new id.
                Some(t) if t.bound_id() == &scan.conversation_id => t,
                _ => {
                    let tracker =
                        ContinuityTracker::new(scan.conversation_id.clone(), &streams, &self.config);
                    self.trackers.insert(scan.session_id.clone(), tracker);
                    continue;
                }
            };

            if let ContinuityOutcome::Rebound { old, new } =
                tracker.observe(&streams, scan.command_seen, now)
            {
                proposals.push((scan.session_id, old, new));
            }
        }

        // A stream may rebind at most one session.
        let mut wanted: HashMap<ConversationId, usize> = HashMap::new();
        for (_, _, new) in &proposals {
            *wanted.entry(new.clone()).or_default() += 1;
        }

        let mut rebound = 0;
        for (session_id, old, new) in proposals {
            let contenders = wanted.get(&new).copied().unwrap_or(0);
            if contenders > 1 {
                warn!(
                    session_id = %session_id,
                    conversation_id = %new,
                    sessions = contenders,
                    "Ambiguous continuity, stream wanted by several sessions"
                );
                if let Some(tracker) = self.trackers.get_mut(&session_id) {
                    tracker.withdraw_rebind(old, &new);
                }
                continue;
            }

            match self
                .registry
                .update(session_id.clone(), SessionUpdate::conversation(new.clone()))
                .await
            {
                Ok(_) => {
                    info!(
                        session_id = %session_id,
                        conversation_id = %new,
                        "Session conversation rebound"
                    );
                    rebound += 1;
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Rebind update failed");
                    // Next poll sees the mismatch and starts a fresh tracker.
                }
            }
        }
        rebound
    }

    /// Number of sessions currently tracked.
    pub fn tracked(&self) -> usize {
        self.trackers.len()
    }
}

/// Blocking part of a poll: directory scans and capture snapshot reads.
fn scan_sessions(root: &Path, sessions: Vec<SessionRecord>) -> Vec<SessionScan> {
    sessions
        .into_iter()
        .filter_map(|s| {
            let conversation_id = s.conversation_id?;
            let dir = transcript_dir(root, &s.project_dir);
            let streams = match scan_streams(&dir) {
                Ok(streams) => streams,
                Err(e) => {
                    debug!(dir = %dir.display(), error = %e, "Transcript scan failed");
                    return None;
                }
            };
            let command_seen = s
                .capture_path
                .as_deref()
                .and_then(|p| read_snapshot(p).ok())
                .map(|snap| snap.session_change_pending)
                .unwrap_or(false);
            Some(SessionScan {
                session_id: s.session_id,
                conversation_id,
                streams,
                command_seen,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ContinuityConfig {
        ContinuityConfig {
            quiet_period: Duration::from_secs(10),
            min_new_bytes: 100,
            transition_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            transcripts_root: PathBuf::from("/nonexistent"),
        }
    }

    fn obs(id: &str, size: u64, modified: DateTime<Utc>) -> StreamObservation {
        StreamObservation {
            conversation_id: ConversationId::new(id),
            size,
            modified,
        }
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn test_transcript_dir_slug() {
        let dir = transcript_dir(Path::new("/home/u/.claude/projects"), Path::new("/work/my/app"));
        assert_eq!(dir, PathBuf::from("/home/u/.claude/projects/-work-my-app"));
    }

    #[test]
    fn test_active_old_stream_stays_bound() {
        let t0 = Utc::now();
        let mut tracker = ContinuityTracker::new(ConversationId::new("old"), &[], &config());

        // Old stream written 2s ago, new stream present: not idle yet.
        let streams = [obs("old", 5000, t0 - secs(2)), obs("new", 800, t0)];
        assert_eq!(tracker.observe(&streams, false, t0), ContinuityOutcome::Unchanged);
        assert_eq!(tracker.bound_id().as_str(), "old");
    }

    #[test]
    fn test_rebind_after_quiet_period() {
        let t0 = Utc::now();
        let mut tracker = ContinuityTracker::new(ConversationId::new("old"), &[], &config());

        let streams = [obs("old", 5000, t0 - secs(30)), obs("new", 800, t0)];
        assert_eq!(
            tracker.observe(&streams, false, t0),
            ContinuityOutcome::Rebound {
                old: ConversationId::new("old"),
                new: ConversationId::new("new"),
            }
        );
        assert_eq!(tracker.state(), &ContinuityState::Bound(ConversationId::new("new")));
    }

    #[test]
    fn test_waits_for_min_bytes() {
        let t0 = Utc::now();
        let mut tracker = ContinuityTracker::new(ConversationId::new("old"), &[], &config());

        let small = [obs("old", 5000, t0 - secs(30)), obs("new", 10, t0)];
        assert_eq!(tracker.observe(&small, false, t0), ContinuityOutcome::TransitionStarted);
        assert!(matches!(tracker.state(), ContinuityState::Transitioning { .. }));

        let grown = [obs("old", 5000, t0 - secs(30)), obs("new", 400, t0 + secs(5))];
        assert!(matches!(
            tracker.observe(&grown, false, t0 + secs(5)),
            ContinuityOutcome::Rebound { .. }
        ));
    }

    #[test]
    fn test_timeout_reverts_to_old() {
        let t0 = Utc::now();
        let mut tracker = ContinuityTracker::new(ConversationId::new("old"), &[], &config());

        let streams = [obs("old", 5000, t0 - secs(30)), obs("blip", 5, t0)];
        assert_eq!(tracker.observe(&streams, false, t0), ContinuityOutcome::TransitionStarted);
        assert_eq!(
            tracker.observe(&streams, false, t0 + secs(30)),
            ContinuityOutcome::Unchanged
        );
        assert_eq!(
            tracker.observe(&streams, false, t0 + secs(61)),
            ContinuityOutcome::Reverted
        );
        assert_eq!(tracker.state(), &ContinuityState::Bound(ConversationId::new("old")));

        // The undersized stream no longer restarts a transition.
        assert_eq!(
            tracker.observe(&streams, false, t0 + secs(70)),
            ContinuityOutcome::Unchanged
        );
    }

    #[test]
    fn test_ambiguous_candidates_keep_old() {
        let t0 = Utc::now();
        let mut tracker = ContinuityTracker::new(ConversationId::new("old"), &[], &config());

        let streams = [
            obs("old", 5000, t0 - secs(30)),
            obs("a", 800, t0),
            obs("b", 900, t0),
        ];
        match tracker.observe(&streams, false, t0) {
            ContinuityOutcome::Ambiguous { candidates } => assert_eq!(candidates.len(), 2),
            other => panic!("expected Ambiguous, got {other:?}"),
        }
        assert_eq!(tracker.bound_id().as_str(), "old");
    }

    #[test]
    fn test_preexisting_streams_ignored() {
        let t0 = Utc::now();
        let existing = [obs("old", 5000, t0 - secs(30)), obs("ancient", 9000, t0 - secs(9000))];
        let mut tracker =
            ContinuityTracker::new(ConversationId::new("old"), &existing, &config());

        assert_eq!(tracker.observe(&existing, false, t0), ContinuityOutcome::Unchanged);
    }

    #[test]
    fn test_continuity_command_starts_transition_while_active() {
        let t0 = Utc::now();
        let mut tracker = ContinuityTracker::new(ConversationId::new("old"), &[], &config());

        let before = [obs("old", 5000, t0)];
        assert_eq!(tracker.observe(&before, true, t0), ContinuityOutcome::TransitionStarted);

        // Flag still set on later polls is not a new edge
        let after = [obs("old", 5000, t0), obs("fresh", 700, t0 + secs(3))];
        assert!(matches!(
            tracker.observe(&after, true, t0 + secs(3)),
            ContinuityOutcome::Rebound { .. }
        ));
    }

    #[test]
    fn test_scan_streams_skips_agents_and_other_files() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join("conv-1.jsonl"), b"{}\n").unwrap();
        fs::write(dir.path().join("agent-7.jsonl"), b"{}\n").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let streams = scan_streams(dir.path()).unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].conversation_id.as_str(), "conv-1");
        assert_eq!(streams[0].size, 3);

        assert!(scan_streams(&dir.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_withdrawn_rebind_is_not_offered_again() {
        let t0 = Utc::now();
        let mut tracker = ContinuityTracker::new(ConversationId::new("old"), &[], &config());
        let streams = [obs("old", 5000, t0 - secs(30)), obs("new", 900, t0)];

        let ContinuityOutcome::Rebound { old, new } = tracker.observe(&streams, false, t0) else {
            panic!("expected rebind");
        };
        tracker.withdraw_rebind(old, &new);
        assert_eq!(tracker.bound_id(), &ConversationId::new("old"));

        assert_eq!(tracker.observe(&streams, false, t0 + secs(1)), ContinuityOutcome::Unchanged);
    }
}
