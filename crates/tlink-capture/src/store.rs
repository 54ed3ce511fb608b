//! Per-process registry of capture windows and their snapshot files.
//!
//! A wrapper process owns one [`CaptureStore`]. Other processes (the hook
//! handler, the router) only ever read the snapshot files it persists,
//! through [`read_snapshot`]. Files are replaced by write-temp, fsync,
//! rename so a reader never observes a half-written snapshot.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use tlink_core::{ConversationId, IpcEndpoint, SessionId};

use crate::capture::{CaptureLimits, CaptureWindow};

/// Errors raised by capture persistence.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No capture window open for session {0}")]
    UnknownSession(SessionId),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Snapshot serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl CaptureError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Session metadata written alongside the captured lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureMeta {
    pub conversation_id: Option<ConversationId>,
    pub project_dir: Option<PathBuf>,
    pub endpoint: Option<IpcEndpoint>,
}

/// Immutable view of a capture window, as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSnapshot {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<IpcEndpoint>,
    pub lines: Vec<String>,
    pub bytes_written: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub session_change_pending: bool,
}

struct CaptureEntry {
    window: CaptureWindow,
    meta: CaptureMeta,
}

/// Capture windows keyed by session.
pub struct CaptureStore {
    dir: PathBuf,
    limits: CaptureLimits,
    entries: HashMap<SessionId, CaptureEntry>,
}

impl CaptureStore {
    /// Creates a store that persists snapshots under `dir`.
    pub fn new(dir: impl Into<PathBuf>, limits: CaptureLimits) -> Self {
        Self {
            dir: dir.into(),
            limits,
            entries: HashMap::new(),
        }
    }

    /// Snapshot file path for a session.
    pub fn snapshot_path(&self, session_id: &SessionId) -> PathBuf {
        self.dir.join(format!("{}.json", session_id.as_str()))
    }

    /// Opens a window for `session_id`, replacing any existing one.
    pub fn open(&mut self, session_id: SessionId, meta: CaptureMeta) {
        debug!(session_id = %session_id, "Capture window opened");
        self.entries.insert(
            session_id,
            CaptureEntry {
                window: CaptureWindow::new(self.limits),
                meta,
            },
        );
    }

    pub fn is_open(&self, session_id: &SessionId) -> bool {
        self.entries.contains_key(session_id)
    }

    /// Updates the conversation id written into future snapshots.
    pub fn set_conversation(&mut self, session_id: &SessionId, conversation_id: ConversationId) {
        if let Some(entry) = self.entries.get_mut(session_id) {
            entry.meta.conversation_id = Some(conversation_id);
        }
    }

    /// Appends output. Unknown sessions are logged and ignored so capture
    /// problems never reach the wrapped process.
    pub fn append(&mut self, session_id: &SessionId, fragment: &[u8]) -> usize {
        match self.entries.get_mut(session_id) {
            Some(entry) => entry.window.append_bytes(fragment),
            None => {
                warn!(session_id = %session_id, bytes = fragment.len(), "Append to unknown capture session ignored");
                0
            }
        }
    }

    /// Takes an immutable snapshot of the window.
    pub fn snapshot(&self, session_id: &SessionId) -> Option<CaptureSnapshot> {
        let entry = self.entries.get(session_id)?;
        Some(CaptureSnapshot {
            session_id: session_id.clone(),
            conversation_id: entry.meta.conversation_id.clone(),
            project_dir: entry.meta.project_dir.clone(),
            endpoint: entry.meta.endpoint.clone(),
            lines: entry.window.to_vec(),
            bytes_written: entry.window.bytes_written(),
            updated_at: entry.window.updated_at(),
            session_change_pending: entry.window.continuity_pending(),
        })
    }

    /// Writes the session's snapshot file atomically. Returns its path.
    pub fn persist(&self, session_id: &SessionId) -> Result<PathBuf, CaptureError> {
        let snapshot = self
            .snapshot(session_id)
            .ok_or_else(|| CaptureError::UnknownSession(session_id.clone()))?;
        let path = self.snapshot_path(session_id);
        write_snapshot(&path, &snapshot)?;
        Ok(path)
    }

    /// Clears the continuity-command flag, returning its previous value.
    pub fn acknowledge_continuity_command(&mut self, session_id: &SessionId) -> bool {
        self.entries
            .get_mut(session_id)
            .map(|e| e.window.acknowledge_continuity_command())
            .unwrap_or(false)
    }

    /// Discards the window and its snapshot file.
    pub fn close(&mut self, session_id: &SessionId) -> Result<(), CaptureError> {
        self.entries.remove(session_id);
        let path = self.snapshot_path(session_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CaptureError::io(&path, e)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Writes a snapshot via temp file, fsync and rename.
pub fn write_snapshot(path: &Path, snapshot: &CaptureSnapshot) -> Result<(), CaptureError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| CaptureError::io(parent, e))?;
    }

    let json = serde_json::to_vec_pretty(snapshot)?;
    let tmp_path = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp_path).map_err(|e| CaptureError::io(&tmp_path, e))?;
        file.write_all(&json).map_err(|e| CaptureError::io(&tmp_path, e))?;
        file.sync_all().map_err(|e| CaptureError::io(&tmp_path, e))?;
    }
    fs::rename(&tmp_path, path).map_err(|e| CaptureError::io(path, e))?;
    Ok(())
}

/// Reads a snapshot written by another process.
pub fn read_snapshot(path: &Path) -> Result<CaptureSnapshot, CaptureError> {
    let data = fs::read(path).map_err(|e| CaptureError::io(path, e))?;
    Ok(serde_json::from_slice(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> CaptureStore {
        CaptureStore::new(dir.path().join("captures"), CaptureLimits::default())
    }

    #[test]
    fn test_append_unknown_session_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        assert_eq!(store.append(&SessionId::new("ghost"), b"hello\n"), 0);
        assert!(store.snapshot(&SessionId::new("ghost")).is_none());
    }

    #[test]
    fn test_persist_and_read_back() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        let id = SessionId::new("s-1");
        store.open(
            id.clone(),
            CaptureMeta {
                conversation_id: Some(ConversationId::new("conv-1")),
                project_dir: Some(PathBuf::from("/work/app")),
                endpoint: None,
            },
        );
        store.append(&id, b"Allow this?\n1. Yes\n2. No\n");

        let path = store.persist(&id).unwrap();
        assert_eq!(path, store.snapshot_path(&id));
        assert!(!path.with_extension("json.tmp").exists());

        let snapshot = read_snapshot(&path).unwrap();
        assert_eq!(snapshot.lines, vec!["Allow this?", "1. Yes", "2. No"]);
        assert_eq!(snapshot.conversation_id, Some(ConversationId::new("conv-1")));
        assert_eq!(snapshot.bytes_written, 25);
        assert!(!snapshot.session_change_pending);
    }

    #[test]
    fn test_snapshot_is_immutable_copy() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        let id = SessionId::new("s-2");
        store.open(id.clone(), CaptureMeta::default());
        store.append(&id, b"first\n");
        let snapshot = store.snapshot(&id).unwrap();
        store.append(&id, b"second\n");
        assert_eq!(snapshot.lines, vec!["first"]);
        assert_eq!(store.snapshot(&id).unwrap().lines.len(), 2);
    }

    #[test]
    fn test_continuity_flag_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        let id = SessionId::new("s-3");
        store.open(id.clone(), CaptureMeta::default());
        store.append(&id, b"/compact\n");
        assert!(store.snapshot(&id).unwrap().session_change_pending);
        assert!(store.acknowledge_continuity_command(&id));
        assert!(!store.acknowledge_continuity_command(&id));
    }

    #[test]
    fn test_close_removes_window_and_file() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        let id = SessionId::new("s-4");
        store.open(id.clone(), CaptureMeta::default());
        store.append(&id, b"line\n");
        let path = store.persist(&id).unwrap();

        store.close(&id).unwrap();
        assert!(!path.exists());
        assert!(!store.is_open(&id));
        // Second close is fine.
        store.close(&id).unwrap();
    }

    #[test]
    fn test_persist_unknown_session_errors() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(matches!(
            store.persist(&SessionId::new("nope")),
            Err(CaptureError::UnknownSession(_))
        ));
    }
}
