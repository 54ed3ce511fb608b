//! Session domain entities and value objects.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{DomainError, DomainResult};

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Locally generated identifier for one wrapped-process lifetime.
///
/// Assigned once at registration and never changed, even when the
/// underlying tool switches conversations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a new SessionId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random identifier (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a shortened display form (first 8 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The tool's own conversation identifier.
///
/// Changes mid-session after a compaction or resume; the session id
/// and routing key stay put when it does.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Path of the Unix socket a live wrapper listens on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IpcEndpoint(PathBuf);

impl IpcEndpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for IpcEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

// ============================================================================
// Routing
// ============================================================================

/// Where a session's messages are posted: a channel, plus a thread in
/// thread mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingKey {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
}

impl RoutingKey {
    /// Routing key for a dedicated channel (no thread).
    pub fn channel(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            thread: None,
        }
    }

    /// Routing key for a thread inside a channel.
    pub fn thread(channel: impl Into<String>, thread: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            thread: Some(thread.into()),
        }
    }

    /// Returns the thread id, if any.
    pub fn thread_id(&self) -> Option<&str> {
        self.thread.as_deref()
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.thread {
            Some(thread) => write!(f, "{}/{}", self.channel, thread),
            None => write!(f, "{}", self.channel),
        }
    }
}

/// How a session is laid out on the chat side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// One dedicated channel per session; messages are top-level.
    Channel,
    /// One thread per session inside a shared channel.
    Thread,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Channel => "channel",
            Self::Thread => "thread",
        }
    }

    /// Parses the stored representation.
    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "channel" => Ok(Self::Channel),
            "thread" => Ok(Self::Thread),
            other => Err(DomainError::invalid("mode", other, "channel or thread")),
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Status
// ============================================================================

/// Lifecycle status of a session.
///
/// ```text
/// Starting ──▶ Active ──▶ Ended
///     └───────────────────▲
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Registered, wrapper not yet confirmed ready.
    Starting,
    /// Live and routable.
    Active,
    /// Finished. Terminal state.
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Ended => "ended",
        }
    }

    /// Parses the stored representation.
    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "starting" => Ok(Self::Starting),
            "active" => Ok(Self::Active),
            "ended" => Ok(Self::Ended),
            other => Err(DomainError::invalid(
                "status",
                other,
                "starting, active or ended",
            )),
        }
    }

    /// Returns true if the session still occupies its routing key.
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Ended)
    }

    /// Returns true if moving to `next` is allowed.
    ///
    /// Same-state moves are accepted so repeated updates stay idempotent.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        match (self, next) {
            (a, b) if *a == b => true,
            (Self::Starting, _) => true,
            (Self::Active, Self::Ended) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Registration Input
// ============================================================================

/// Metadata a wrapper supplies when it registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRegistration {
    /// Caller-chosen id; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub project_dir: PathBuf,
    pub mode: SessionMode,
    pub routing: RoutingKey,
    pub endpoint: IpcEndpoint,
    /// Human-readable project name; defaults to the directory name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions_channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_path: Option<PathBuf>,
}

impl SessionRegistration {
    /// Creates a registration with the required fields only.
    pub fn new(
        project_dir: impl Into<PathBuf>,
        mode: SessionMode,
        routing: RoutingKey,
        endpoint: IpcEndpoint,
    ) -> Self {
        Self {
            session_id: None,
            conversation_id: None,
            project_dir: project_dir.into(),
            mode,
            routing,
            endpoint,
            project: None,
            terminal: None,
            user_id: None,
            permissions_channel: None,
            capture_path: None,
        }
    }

    /// Sets an explicit session id.
    #[must_use]
    pub fn with_session_id(mut self, id: SessionId) -> Self {
        self.session_id = Some(id);
        self
    }

    /// Sets the initial conversation id.
    #[must_use]
    pub fn with_conversation(mut self, id: ConversationId) -> Self {
        self.conversation_id = Some(id);
        self
    }

    /// Checks mode/routing consistency.
    ///
    /// Thread mode needs a thread id; channel mode must not carry one.
    pub fn validate(&self) -> DomainResult<()> {
        if self.routing.channel.trim().is_empty() {
            return Err(DomainError::invalid("channel", "", "non-empty channel id"));
        }
        match (self.mode, self.routing.thread.as_deref()) {
            (SessionMode::Thread, None) => Err(DomainError::invalid(
                "routing",
                self.routing.to_string(),
                "a thread id in thread mode",
            )),
            (SessionMode::Thread, Some(t)) if t.trim().is_empty() => Err(
                DomainError::invalid("routing", self.routing.to_string(), "non-empty thread id"),
            ),
            (SessionMode::Channel, Some(_)) => Err(DomainError::invalid(
                "routing",
                self.routing.to_string(),
                "no thread id in channel mode",
            )),
            _ => Ok(()),
        }
    }
}

// ============================================================================
// Session Record
// ============================================================================

/// One registered session as persisted by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub project_dir: PathBuf,
    pub project: String,
    pub mode: SessionMode,
    pub routing: RoutingKey,
    pub status: SessionStatus,
    pub endpoint: IpcEndpoint,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions_channel: Option<String>,
    /// Message the next outbound post should reply to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Message that is edited in place for progress updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub todo_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_path: Option<PathBuf>,
}

/// Timestamps on records carry microsecond precision, the precision they
/// are stored with.
pub fn record_time(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(6)
}

impl SessionRecord {
    /// Builds a new `Starting` record from registration metadata.
    ///
    /// Validates mode/routing consistency and generates a session id
    /// when the registration does not carry one.
    pub fn from_registration(reg: SessionRegistration, now: DateTime<Utc>) -> DomainResult<Self> {
        reg.validate()?;
        let now = record_time(now);

        let project = reg.project.unwrap_or_else(|| {
            reg.project_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| reg.project_dir.display().to_string())
        });

        Ok(Self {
            session_id: reg.session_id.unwrap_or_else(SessionId::generate),
            conversation_id: reg.conversation_id,
            project_dir: reg.project_dir,
            project,
            mode: reg.mode,
            routing: reg.routing,
            status: SessionStatus::Starting,
            endpoint: reg.endpoint,
            created_at: now,
            last_activity: now,
            ended_at: None,
            terminal: reg.terminal,
            user_id: reg.user_id,
            permissions_channel: reg.permissions_channel,
            reply_to: None,
            todo_message: None,
            capture_path: reg.capture_path,
        })
    }

    /// Returns true if the session has not ended.
    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }

    /// Applies a partial update in place.
    ///
    /// Only fields present in `update` change. Identity and routing
    /// fields are not part of `SessionUpdate` and cannot change here.
    pub fn apply(&mut self, update: &SessionUpdate, now: DateTime<Utc>) -> DomainResult<()> {
        let now = record_time(now);
        if let Some(status) = update.status {
            if !self.status.can_transition_to(status) {
                return Err(DomainError::InvalidTransition {
                    from: self.status,
                    to: status,
                });
            }
            if status == SessionStatus::Ended && self.ended_at.is_none() {
                self.ended_at = Some(now);
            }
            self.status = status;
        }
        if let Some(ref conversation) = update.conversation_id {
            self.conversation_id = Some(conversation.clone());
        }
        if let Some(at) = update.last_activity {
            self.last_activity = record_time(at);
        }
        if let Some(ref reply_to) = update.reply_to {
            self.reply_to = Some(reply_to.clone());
        }
        if let Some(ref todo) = update.todo_message {
            self.todo_message = Some(todo.clone());
        }
        if let Some(ref channel) = update.permissions_channel {
            self.permissions_channel = Some(channel.clone());
        }
        if let Some(ref path) = update.capture_path {
            self.capture_path = Some(path.clone());
        }
        Ok(())
    }
}

// ============================================================================
// Partial Update
// ============================================================================

/// Field changes for an atomic partial update. `None` means "unchanged".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub todo_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions_channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_path: Option<PathBuf>,
}

impl SessionUpdate {
    /// Update that only rebinds the conversation id.
    pub fn conversation(id: ConversationId) -> Self {
        Self {
            conversation_id: Some(id),
            ..Self::default()
        }
    }

    /// Update that only changes status.
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Update that only bumps last activity.
    pub fn activity(at: DateTime<Utc>) -> Self {
        Self {
            last_activity: Some(at),
            ..Self::default()
        }
    }

    /// Returns true if no field is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread_registration() -> SessionRegistration {
        SessionRegistration::new(
            "/home/dev/projects/widget",
            SessionMode::Thread,
            RoutingKey::thread("C123", "1700000000.000100"),
            IpcEndpoint::new("/tmp/tlink/widget.sock"),
        )
    }

    #[test]
    fn test_session_id_short() {
        let id = SessionId::new("8e11bfb5-7dc2-432b-9206-928fa5c35731");
        assert_eq!(id.short(), "8e11bfb5");
        assert_eq!(SessionId::new("abc").short(), "abc");
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }

    #[test]
    fn test_routing_key_display() {
        assert_eq!(RoutingKey::channel("C1").to_string(), "C1");
        assert_eq!(RoutingKey::thread("C1", "T9").to_string(), "C1/T9");
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            SessionStatus::Starting,
            SessionStatus::Active,
            SessionStatus::Ended,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(SessionStatus::parse("zombie").is_err());
    }

    #[test]
    fn test_status_transitions() {
        assert!(SessionStatus::Starting.can_transition_to(SessionStatus::Active));
        assert!(SessionStatus::Starting.can_transition_to(SessionStatus::Ended));
        assert!(SessionStatus::Active.can_transition_to(SessionStatus::Ended));
        assert!(SessionStatus::Ended.can_transition_to(SessionStatus::Ended));
        assert!(!SessionStatus::Ended.can_transition_to(SessionStatus::Active));
        assert!(!SessionStatus::Active.can_transition_to(SessionStatus::Starting));
    }

    #[test]
    fn test_registration_validation() {
        assert!(thread_registration().validate().is_ok());

        let mut reg = thread_registration();
        reg.routing.thread = None;
        assert!(reg.validate().is_err());

        let mut reg = thread_registration();
        reg.mode = SessionMode::Channel;
        assert!(reg.validate().is_err());

        reg.routing.thread = None;
        assert!(reg.validate().is_ok());

        reg.routing.channel = "  ".to_string();
        assert!(reg.validate().is_err());
    }

    #[test]
    fn test_record_from_registration() {
        let now = Utc::now();
        let record = SessionRecord::from_registration(
            thread_registration().with_session_id(SessionId::new("s-1")),
            now,
        )
        .unwrap();

        assert_eq!(record.session_id.as_str(), "s-1");
        assert_eq!(record.project, "widget");
        assert_eq!(record.status, SessionStatus::Starting);
        assert_eq!(record.created_at, record_time(now));
        assert_eq!(record.last_activity, record_time(now));
        assert_eq!(record.created_at.timestamp_subsec_nanos() % 1_000, 0);
        assert!(record.ended_at.is_none());
    }

    #[test]
    fn test_record_generates_id_when_absent() {
        let record = SessionRecord::from_registration(thread_registration(), Utc::now()).unwrap();
        assert!(!record.session_id.as_str().is_empty());
    }

    #[test]
    fn test_apply_update_keeps_identity() {
        let now = Utc::now();
        let mut record = SessionRecord::from_registration(
            thread_registration().with_conversation(ConversationId::new("conv-old")),
            now,
        )
        .unwrap();
        let id = record.session_id.clone();
        let routing = record.routing.clone();

        record
            .apply(&SessionUpdate::conversation(ConversationId::new("conv-new")), now)
            .unwrap();

        assert_eq!(record.session_id, id);
        assert_eq!(record.routing, routing);
        assert_eq!(record.conversation_id, Some(ConversationId::new("conv-new")));
    }

    #[test]
    fn test_apply_rejects_resurrection() {
        let now = Utc::now();
        let mut record = SessionRecord::from_registration(thread_registration(), now).unwrap();
        record.apply(&SessionUpdate::status(SessionStatus::Ended), now).unwrap();
        assert_eq!(record.ended_at, Some(record_time(now)));

        let err = record
            .apply(&SessionUpdate::status(SessionStatus::Active), now)
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition { .. }));
    }

    #[test]
    fn test_update_is_empty() {
        assert!(SessionUpdate::default().is_empty());
        assert!(!SessionUpdate::status(SessionStatus::Active).is_empty());
    }

    #[test]
    fn test_record_serialization_skips_absent_fields() {
        let record = SessionRecord::from_registration(thread_registration(), Utc::now()).unwrap();
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("conversation_id"));
        assert!(json.contains("\"mode\":\"thread\""));
        assert!(json.contains("\"status\":\"starting\""));

        let parsed: SessionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }
}
