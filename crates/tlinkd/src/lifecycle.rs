//! Daemon startup and shutdown bookkeeping.
//!
//! Startup order: create the state directory, open the store, make sure no
//! other daemon answers on the socket, clear stale files, then hand the
//! store to the registry and bind. A live daemon is detected by connecting
//! to its socket rather than by trusting the PID file alone.

use std::fs;
use std::io;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::process;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::store::{SessionStore, StoreError};

/// Fatal startup failures.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Failed to create state directory {}: {source}", .path.display())]
    StateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Session store unavailable: {0}")]
    StorageUnavailable(#[from] StoreError),

    #[error("Daemon already running on {}", .socket.display())]
    AlreadyRunning { socket: PathBuf, pid: Option<u32> },

    #[error("Failed to write PID file {}: {source}", .path.display())]
    PidFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to remove stale socket {}: {source}", .path.display())]
    StaleSocket {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result of the pre-bind checks.
pub struct Prepared {
    /// Opened store, to be moved into the registry actor.
    pub store: SessionStore,
}

/// Runs every startup step up to (not including) binding the socket.
pub fn prepare(config: &Config) -> Result<Prepared, StartupError> {
    fs::create_dir_all(&config.state_dir).map_err(|source| StartupError::StateDir {
        path: config.state_dir.clone(),
        source,
    })?;
    if let Some(parent) = config.db_path.parent() {
        fs::create_dir_all(parent).map_err(|source| StartupError::StateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    // A second daemon must not touch the database.
    ensure_single_instance(&config.socket_path, &config.pid_file())?;

    let store = SessionStore::open(&config.db_path)?;

    Ok(Prepared { store })
}

/// Fails if a daemon answers on `socket`; otherwise removes stale files.
pub fn ensure_single_instance(socket: &Path, pid_file: &Path) -> Result<(), StartupError> {
    if socket_is_live(socket) {
        return Err(StartupError::AlreadyRunning {
            socket: socket.to_path_buf(),
            pid: read_pid(pid_file),
        });
    }

    match fs::remove_file(socket) {
        Ok(()) => info!(socket = %socket.display(), "Removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(StartupError::StaleSocket {
                path: socket.to_path_buf(),
                source,
            })
        }
    }

    if let Some(pid) = read_pid(pid_file) {
        if !is_process_running(pid) {
            debug!(pid, "Removing stale PID file");
            remove_pid_file(pid_file);
        }
    }
    Ok(())
}

/// True if something accepts connections on `socket`.
pub fn socket_is_live(socket: &Path) -> bool {
    StdUnixStream::connect(socket).is_ok()
}

/// Reads the PID recorded in `path`.
pub fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Records the current process id.
pub fn write_pid(path: &Path) -> Result<(), StartupError> {
    let pid_err = |source| StartupError::PidFile {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(pid_err)?;
    }
    fs::write(path, process::id().to_string()).map_err(pid_err)
}

pub fn remove_pid_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }
}

/// Checks process existence with signal 0.
pub fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // SAFETY: kill with signal 0 performs only the existence and permission check.
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return true;
    }
    // EPERM: process exists but belongs to someone else.
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Sends SIGTERM to `pid`.
pub fn terminate(pid: u32) -> io::Result<()> {
    let pid = i32::try_from(pid).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    // SAFETY: plain signal delivery to a process id.
    let result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener as StdUnixListener;
    use tempfile::TempDir;

    #[test]
    fn test_stale_socket_is_removed() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("d.sock");
        {
            // Bound then dropped: the file stays but nobody listens.
            let _l = StdUnixListener::bind(&socket).unwrap();
        }
        assert!(socket.exists());
        ensure_single_instance(&socket, &dir.path().join("d.pid")).unwrap();
        assert!(!socket.exists());
    }

    #[test]
    fn test_live_socket_is_refused() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("d.sock");
        let pid_file = dir.path().join("d.pid");
        let _listener = StdUnixListener::bind(&socket).unwrap();
        write_pid(&pid_file).unwrap();

        let err = ensure_single_instance(&socket, &pid_file).unwrap_err();
        match err {
            StartupError::AlreadyRunning { pid, .. } => assert_eq!(pid, Some(process::id())),
            other => panic!("expected AlreadyRunning, got {other}"),
        }
    }

    #[test]
    fn test_pid_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("nested/d.pid");
        write_pid(&pid_file).unwrap();
        assert_eq!(read_pid(&pid_file), Some(process::id()));
        assert!(is_process_running(process::id()));
        remove_pid_file(&pid_file);
        assert_eq!(read_pid(&pid_file), None);
        // Removing twice is quiet
        remove_pid_file(&pid_file);
    }

    #[test]
    fn test_prepare_creates_state_and_store() {
        let dir = TempDir::new().unwrap();
        let config = Config::with_state_dir(dir.path().join("state"));
        let prepared = prepare(&config).unwrap();
        assert!(config.db_path.exists());
        assert!(prepared.store.list_live().unwrap().is_empty());
    }

    #[test]
    fn test_prepare_refuses_before_opening_store() {
        let dir = TempDir::new().unwrap();
        let config = Config::with_state_dir(dir.path().join("state"));
        fs::create_dir_all(&config.state_dir).unwrap();
        let _listener = StdUnixListener::bind(&config.socket_path).unwrap();

        let err = prepare(&config).err().expect("second daemon refused");
        assert!(matches!(err, StartupError::AlreadyRunning { .. }));
        assert!(!config.db_path.exists());
    }
}
