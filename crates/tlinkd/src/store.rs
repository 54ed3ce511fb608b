//! Durable session store backed by SQLite.
//!
//! One write connection plus a read-only connection, both in WAL mode, so
//! readers never wait on the writer. The store is owned by the registry
//! actor; all writes go through it.
//!
//! Uniqueness of live routing keys is enforced by the database itself
//! through a partial unique index, not only by application checks.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, Transaction};
use thiserror::Error;
use tracing::{debug, info};

use tlink_core::{
    ConversationId, DomainError, IpcEndpoint, RoutingKey, SessionId, SessionMode, SessionRecord,
    SessionStatus, SessionUpdate,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
  session_id TEXT PRIMARY KEY,
  conversation_id TEXT,
  project_dir TEXT NOT NULL,
  project TEXT NOT NULL,
  mode TEXT NOT NULL,
  channel TEXT NOT NULL,
  thread_ts TEXT,
  status TEXT NOT NULL DEFAULT 'starting',
  endpoint TEXT NOT NULL,
  created_at TEXT NOT NULL,
  last_activity TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
CREATE INDEX IF NOT EXISTS idx_sessions_routing ON sessions(channel, thread_ts);
CREATE INDEX IF NOT EXISTS idx_sessions_project_dir ON sessions(project_dir);
-- At most one non-ended session per routing key
CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_live_routing
  ON sessions(channel, COALESCE(thread_ts, '')) WHERE status != 'ended';
"#;

/// Optional columns added after the first schema version.
const OPTIONAL_COLUMNS: &[(&str, &str)] = &[
    ("ended_at", "TEXT"),
    ("terminal", "TEXT"),
    ("user_id", "TEXT"),
    ("permissions_channel", "TEXT"),
    ("reply_to", "TEXT"),
    ("todo_message", "TEXT"),
    ("capture_path", "TEXT"),
];

const SELECT_COLUMNS: &str = "session_id, conversation_id, project_dir, project, mode, channel, \
     thread_ts, status, endpoint, created_at, last_activity, ended_at, terminal, user_id, \
     permissions_channel, reply_to, todo_message, capture_path";

/// Errors from the durable store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session already exists: {0}")]
    DuplicateSession(SessionId),

    #[error("Routing key {routing} is held by live session {holder}")]
    RoutingKeyInUse {
        routing: RoutingKey,
        holder: SessionId,
        holder_endpoint: IpcEndpoint,
    },

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("Storage unavailable: {0}")]
    Unavailable(#[from] rusqlite::Error),

    #[error("Corrupt row for session {session_id}: {reason}")]
    Corrupt { session_id: String, reason: String },
}

/// Formats timestamps with fixed width so stored strings sort chronologically.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(session_id: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            session_id: session_id.to_string(),
            reason: format!("bad timestamp {raw:?}: {e}"),
        })
}

/// Raw row as read from SQLite, before domain validation.
struct SessionRow {
    session_id: String,
    conversation_id: Option<String>,
    project_dir: String,
    project: String,
    mode: String,
    channel: String,
    thread_ts: Option<String>,
    status: String,
    endpoint: String,
    created_at: String,
    last_activity: String,
    ended_at: Option<String>,
    terminal: Option<String>,
    user_id: Option<String>,
    permissions_channel: Option<String>,
    reply_to: Option<String>,
    todo_message: Option<String>,
    capture_path: Option<String>,
}

impl SessionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            session_id: row.get("session_id")?,
            conversation_id: row.get("conversation_id")?,
            project_dir: row.get("project_dir")?,
            project: row.get("project")?,
            mode: row.get("mode")?,
            channel: row.get("channel")?,
            thread_ts: row.get("thread_ts")?,
            status: row.get("status")?,
            endpoint: row.get("endpoint")?,
            created_at: row.get("created_at")?,
            last_activity: row.get("last_activity")?,
            ended_at: row.get("ended_at")?,
            terminal: row.get("terminal")?,
            user_id: row.get("user_id")?,
            permissions_channel: row.get("permissions_channel")?,
            reply_to: row.get("reply_to")?,
            todo_message: row.get("todo_message")?,
            capture_path: row.get("capture_path")?,
        })
    }

    fn into_record(self) -> Result<SessionRecord, StoreError> {
        let id = self.session_id.as_str();
        let corrupt = |e: DomainError| StoreError::Corrupt {
            session_id: id.to_string(),
            reason: e.to_string(),
        };
        Ok(SessionRecord {
            mode: SessionMode::parse(&self.mode).map_err(corrupt)?,
            status: SessionStatus::parse(&self.status).map_err(corrupt)?,
            created_at: parse_ts(id, &self.created_at)?,
            last_activity: parse_ts(id, &self.last_activity)?,
            ended_at: self.ended_at.as_deref().map(|t| parse_ts(id, t)).transpose()?,
            conversation_id: self.conversation_id.map(ConversationId::new),
            project_dir: PathBuf::from(self.project_dir),
            project: self.project,
            routing: RoutingKey {
                channel: self.channel,
                thread: self.thread_ts,
            },
            endpoint: IpcEndpoint::new(self.endpoint),
            terminal: self.terminal,
            user_id: self.user_id,
            permissions_channel: self.permissions_channel,
            reply_to: self.reply_to,
            todo_message: self.todo_message,
            capture_path: self.capture_path.map(PathBuf::from),
            session_id: SessionId::new(self.session_id),
        })
    }
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// SQLite-backed session store.
pub struct SessionStore {
    conn: Connection,
    /// Separate reader; `None` for in-memory databases, which cannot be shared.
    read_conn: Option<Connection>,
}

impl SessionStore {
    /// Opens (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let store = Self {
            conn,
            read_conn: None,
        };
        store.init()?;

        // Reader opened after the schema exists.
        let read_conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        read_conn.busy_timeout(Duration::from_secs(2))?;

        info!(path = %path.display(), "Session store opened");
        Ok(Self {
            read_conn: Some(read_conn),
            ..store
        })
    }

    /// Creates an in-memory store (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Connection::open_in_memory()?,
            read_conn: None,
        };
        store.init()?;
        Ok(store)
    }

    fn reader(&self) -> &Connection {
        self.read_conn.as_ref().unwrap_or(&self.conn)
    }

    fn init(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(SCHEMA)?;
        self.migrate()
    }

    /// Adds optional columns missing from older databases.
    fn migrate(&self) -> Result<(), StoreError> {
        let columns: Vec<String> = self
            .conn
            .prepare("PRAGMA table_info(sessions)")?
            .query_map([], |row| row.get::<_, String>(1))?
            .filter_map(|r| r.ok())
            .collect();

        for (name, ty) in OPTIONAL_COLUMNS {
            if !columns.iter().any(|c| c == name) {
                debug!(column = name, "Adding column to sessions");
                self.conn
                    .execute_batch(&format!("ALTER TABLE sessions ADD COLUMN {name} {ty};"))?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Inserts a new session.
    ///
    /// Fails with `DuplicateSession` if the id exists and `RoutingKeyInUse`
    /// if a live session holds the routing key.
    pub fn create(&mut self, record: &SessionRecord) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        Self::insert_checked(&tx, record)?;
        tx.commit()?;
        Ok(())
    }

    /// Ends `holder` and inserts `record` in one transaction.
    ///
    /// Used when the current holder of the routing key is known to be dead.
    /// If `holder` already ended the insert proceeds normally. Returns true
    /// if `holder` was ended by this call.
    pub fn create_superseding(
        &mut self,
        record: &SessionRecord,
        holder: &SessionId,
    ) -> Result<bool, StoreError> {
        let now = ts(Utc::now());
        let tx = self.conn.transaction()?;
        let ended = tx.execute(
            "UPDATE sessions SET status = 'ended', ended_at = COALESCE(ended_at, ?2)
             WHERE session_id = ?1 AND status != 'ended'",
            params![holder.as_str(), now],
        )? > 0;
        Self::insert_checked(&tx, record)?;
        tx.commit()?;
        Ok(ended)
    }

    fn insert_checked(tx: &Transaction<'_>, record: &SessionRecord) -> Result<(), StoreError> {
        let exists: bool = tx.query_row(
            "SELECT COUNT(*) > 0 FROM sessions WHERE session_id = ?1",
            params![record.session_id.as_str()],
            |row| row.get(0),
        )?;
        if exists {
            return Err(StoreError::DuplicateSession(record.session_id.clone()));
        }

        if let Some(holder) = Self::live_holder(tx, &record.routing)? {
            return Err(StoreError::RoutingKeyInUse {
                routing: record.routing.clone(),
                holder: holder.session_id,
                holder_endpoint: holder.endpoint,
            });
        }

        let result = tx.execute(
            "INSERT INTO sessions (
                session_id, conversation_id, project_dir, project, mode, channel, thread_ts,
                status, endpoint, created_at, last_activity, ended_at, terminal, user_id,
                permissions_channel, reply_to, todo_message, capture_path
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                record.session_id.as_str(),
                record.conversation_id.as_ref().map(|c| c.as_str()),
                path_text(&record.project_dir),
                record.project,
                record.mode.as_str(),
                record.routing.channel,
                record.routing.thread,
                record.status.as_str(),
                path_text(record.endpoint.path()),
                ts(record.created_at),
                ts(record.last_activity),
                record.ended_at.map(ts),
                record.terminal,
                record.user_id,
                record.permissions_channel,
                record.reply_to,
                record.todo_message,
                record.capture_path.as_deref().map(path_text),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            // The partial index caught a holder the check above could not see.
            Err(e) if is_unique_violation(&e) => Err(StoreError::RoutingKeyInUse {
                routing: record.routing.clone(),
                holder: SessionId::default(),
                holder_endpoint: IpcEndpoint::new(""),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn live_holder(conn: &Connection, routing: &RoutingKey) -> Result<Option<SessionRecord>, StoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM sessions
             WHERE channel = ?1 AND COALESCE(thread_ts, '') = COALESCE(?2, '') AND status != 'ended'
             ORDER BY created_at DESC LIMIT 1"
        );
        conn.query_row(&sql, params![routing.channel, routing.thread], SessionRow::from_row)
            .optional()?
            .map(SessionRow::into_record)
            .transpose()
    }

    /// Applies a partial update atomically. Returns the updated record.
    pub fn update(
        &mut self,
        session_id: &SessionId,
        update: &SessionUpdate,
    ) -> Result<SessionRecord, StoreError> {
        let tx = self.conn.transaction()?;
        let sql = format!("SELECT {SELECT_COLUMNS} FROM sessions WHERE session_id = ?1");
        let mut record = tx
            .query_row(&sql, params![session_id.as_str()], SessionRow::from_row)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?
            .into_record()?;

        record.apply(update, Utc::now())?;

        tx.execute(
            "UPDATE sessions SET
                conversation_id = ?2, status = ?3, last_activity = ?4, ended_at = ?5,
                reply_to = ?6, todo_message = ?7, permissions_channel = ?8, capture_path = ?9
             WHERE session_id = ?1",
            params![
                record.session_id.as_str(),
                record.conversation_id.as_ref().map(|c| c.as_str()),
                record.status.as_str(),
                ts(record.last_activity),
                record.ended_at.map(ts),
                record.reply_to,
                record.todo_message,
                record.permissions_channel,
                record.capture_path.as_deref().map(path_text),
            ],
        )?;
        tx.commit()?;
        Ok(record)
    }

    /// Marks a session ended. Idempotent; returns true if the status changed.
    pub fn mark_ended(&mut self, session_id: &SessionId) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE sessions SET status = 'ended', ended_at = ?2
             WHERE session_id = ?1 AND status != 'ended'",
            params![session_id.as_str(), ts(Utc::now())],
        )?;
        if changed == 0 && !self.exists(session_id)? {
            return Err(StoreError::NotFound(session_id.to_string()));
        }
        Ok(changed > 0)
    }

    /// Ends live sessions idle for longer than `timeout`. Returns their ids.
    pub fn expire_inactive(&mut self, timeout: chrono::Duration) -> Result<Vec<SessionId>, StoreError> {
        let now = Utc::now();
        let cutoff = ts(now - timeout);
        let tx = self.conn.transaction()?;
        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT session_id FROM sessions WHERE status != 'ended' AND last_activity < ?1",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| row.get::<_, String>(0))?;
            let ids = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };
        tx.execute(
            "UPDATE sessions SET status = 'ended', ended_at = ?2
             WHERE status != 'ended' AND last_activity < ?1",
            params![cutoff, ts(now)],
        )?;
        tx.commit()?;
        Ok(ids.into_iter().map(SessionId::new).collect())
    }

    /// Deletes ended sessions that ended before `older_than` ago.
    pub fn purge_stale(&mut self, older_than: chrono::Duration) -> Result<usize, StoreError> {
        let cutoff = ts(Utc::now() - older_than);
        let removed = self.conn.execute(
            "DELETE FROM sessions
             WHERE status = 'ended' AND COALESCE(ended_at, last_activity) < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    fn exists(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) > 0 FROM sessions WHERE session_id = ?1",
            params![session_id.as_str()],
            |row| row.get(0),
        )?)
    }

    pub fn get(&self, session_id: &SessionId) -> Result<SessionRecord, StoreError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM sessions WHERE session_id = ?1");
        self.reader()
            .query_row(&sql, params![session_id.as_str()], SessionRow::from_row)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?
            .into_record()
    }

    /// Most recent live session for a routing key.
    pub fn get_by_routing_key(&self, routing: &RoutingKey) -> Result<SessionRecord, StoreError> {
        Self::live_holder(self.reader(), routing)?
            .ok_or_else(|| StoreError::NotFound(format!("routing key {routing}")))
    }

    /// All sessions, or only those with `status`.
    pub fn list(&self, status: Option<SessionStatus>) -> Result<Vec<SessionRecord>, StoreError> {
        match status {
            Some(s) => self.query_records(
                &format!("SELECT {SELECT_COLUMNS} FROM sessions WHERE status = ?1 ORDER BY created_at"),
                params![s.as_str()],
            ),
            None => self.query_records(
                &format!("SELECT {SELECT_COLUMNS} FROM sessions ORDER BY created_at"),
                params![],
            ),
        }
    }

    /// Non-ended sessions.
    pub fn list_live(&self) -> Result<Vec<SessionRecord>, StoreError> {
        self.query_records(
            &format!("SELECT {SELECT_COLUMNS} FROM sessions WHERE status != 'ended' ORDER BY created_at"),
            params![],
        )
    }

    /// Live sessions started from `dir`.
    pub fn find_by_project_dir(&self, dir: &Path) -> Result<Vec<SessionRecord>, StoreError> {
        let dir = path_text(dir);
        self.query_records(
            &format!(
                "SELECT {SELECT_COLUMNS} FROM sessions
                 WHERE project_dir = ?1 AND status != 'ended' ORDER BY created_at DESC"
            ),
            params![dir],
        )
    }

    fn query_records(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<SessionRecord>, StoreError> {
        let mut stmt = self.reader().prepare(sql)?;
        let rows = stmt.query_map(args, SessionRow::from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }
}
