//! Daemon and router configuration.
//!
//! Values resolve in three layers: built-in defaults, then an optional
//! TOML file, then `TLINK_*` environment variables. Paths default under
//! the platform state directory.
//!
//! ```toml
//! # ~/.config/threadlink/config.toml
//! socket = "/run/user/1000/tlinkd.sock"
//! default_channel = "C0123456"
//! send_timeout_secs = 5
//!
//! [continuity]
//! quiet_secs = 10
//! min_bytes = 512
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::continuity::ContinuityConfig;
use crate::registry::RegistryConfig;

/// Name of the per-user state and config subdirectory.
pub const APP_DIR: &str = "threadlink";

/// Default bound on a prompt wait in the router.
pub const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnv { var: String, value: String },
}

/// Fully resolved configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Daemon socket
    pub socket_path: PathBuf,
    /// Directory for the PID file, log file and defaults below
    pub state_dir: PathBuf,
    /// SQLite database
    pub db_path: PathBuf,
    /// Capture snapshot files
    pub capture_dir: PathBuf,
    /// Channel new sessions post to when none is given
    pub default_channel: Option<String>,
    /// Bound on one SEND delivery
    pub send_timeout: Duration,
    /// Bound on one prompt wait
    pub prompt_timeout: Duration,
    pub registry: RegistryConfig,
    pub continuity: ContinuityConfig,
}

/// On-disk shape. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    socket: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    db: Option<PathBuf>,
    capture_dir: Option<PathBuf>,
    default_channel: Option<String>,
    send_timeout_secs: Option<u64>,
    prompt_timeout_secs: Option<u64>,
    inactivity_timeout_hours: Option<u64>,
    purge_after_days: Option<u64>,
    continuity: FileContinuity,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileContinuity {
    quiet_secs: Option<u64>,
    min_bytes: Option<u64>,
    wait_secs: Option<u64>,
    poll_secs: Option<u64>,
    transcripts_dir: Option<PathBuf>,
}

/// Default state directory, `$XDG_STATE_HOME/threadlink` or `/tmp/threadlink`.
pub fn default_state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(APP_DIR)
}

/// Default config file location.
pub fn default_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR).join("config.toml"))
}

impl Config {
    /// Built-in defaults rooted at `state_dir`.
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        Self {
            socket_path: state_dir.join("tlinkd.sock"),
            db_path: state_dir.join("sessions.db"),
            capture_dir: state_dir.join("captures"),
            state_dir,
            default_channel: None,
            send_timeout: crate::delivery::DELIVERY_TIMEOUT,
            prompt_timeout: DEFAULT_PROMPT_TIMEOUT,
            registry: RegistryConfig::default(),
            continuity: ContinuityConfig::default(),
        }
    }

    /// Loads defaults, the default config file if present, and the
    /// process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let file = std::env::var_os("TLINK_CONFIG")
            .map(PathBuf::from)
            .or_else(default_config_file);
        Self::load_from(file.as_deref(), |var| std::env::var(var).ok())
    }

    /// Loads with an explicit file and environment lookup.
    ///
    /// A missing file is not an error.
    pub fn load_from(
        file: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let file_config = match file {
            Some(path) => read_file(path)?,
            None => FileConfig::default(),
        };

        // State dir first: other path defaults hang off it.
        let state_dir = env("TLINK_STATE_DIR")
            .map(PathBuf::from)
            .or_else(|| file_config.state_dir.clone())
            .unwrap_or_else(default_state_dir);

        let mut config = Self::with_state_dir(state_dir);
        config.apply_file(file_config);
        config.apply_env(&env)?;
        Ok(config)
    }

    /// PID file path.
    pub fn pid_file(&self) -> PathBuf {
        self.state_dir.join("tlinkd.pid")
    }

    /// Daemon log file path (used in background mode).
    pub fn log_file(&self) -> PathBuf {
        self.state_dir.join("tlinkd.log")
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(p) = file.socket {
            self.socket_path = p;
        }
        if let Some(p) = file.db {
            self.db_path = p;
        }
        if let Some(p) = file.capture_dir {
            self.capture_dir = p;
        }
        if file.default_channel.is_some() {
            self.default_channel = file.default_channel;
        }
        if let Some(s) = file.send_timeout_secs {
            self.send_timeout = Duration::from_secs(s);
        }
        if let Some(s) = file.prompt_timeout_secs {
            self.prompt_timeout = Duration::from_secs(s);
        }
        if let Some(h) = file.inactivity_timeout_hours {
            self.registry.inactivity_timeout = hours(h);
        }
        if let Some(d) = file.purge_after_days {
            self.registry.purge_after = hours(d * 24);
        }

        let c = file.continuity;
        if let Some(s) = c.quiet_secs {
            self.continuity.quiet_period = Duration::from_secs(s);
        }
        if let Some(b) = c.min_bytes {
            self.continuity.min_new_bytes = b;
        }
        if let Some(s) = c.wait_secs {
            self.continuity.transition_timeout = Duration::from_secs(s);
        }
        if let Some(s) = c.poll_secs {
            self.continuity.poll_interval = Duration::from_secs(s);
        }
        if let Some(p) = c.transcripts_dir {
            self.continuity.transcripts_root = p;
        }
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(p) = env("TLINK_SOCKET") {
            self.socket_path = PathBuf::from(p);
        }
        if let Some(p) = env("TLINK_DB") {
            self.db_path = PathBuf::from(p);
        }
        if let Some(p) = env("TLINK_CAPTURE_DIR") {
            self.capture_dir = PathBuf::from(p);
        }
        if let Some(c) = env("TLINK_DEFAULT_CHANNEL") {
            self.default_channel = Some(c);
        }
        if let Some(s) = env_u64(env, "TLINK_SEND_TIMEOUT_SECS")? {
            self.send_timeout = Duration::from_secs(s);
        }
        if let Some(s) = env_u64(env, "TLINK_PROMPT_TIMEOUT_SECS")? {
            self.prompt_timeout = Duration::from_secs(s);
        }
        if let Some(h) = env_u64(env, "TLINK_INACTIVITY_TIMEOUT_HOURS")? {
            self.registry.inactivity_timeout = hours(h);
        }
        if let Some(d) = env_u64(env, "TLINK_PURGE_AFTER_DAYS")? {
            self.registry.purge_after = hours(d * 24);
        }
        if let Some(s) = env_u64(env, "TLINK_CONTINUITY_QUIET_SECS")? {
            self.continuity.quiet_period = Duration::from_secs(s);
        }
        if let Some(b) = env_u64(env, "TLINK_CONTINUITY_MIN_BYTES")? {
            self.continuity.min_new_bytes = b;
        }
        if let Some(s) = env_u64(env, "TLINK_CONTINUITY_WAIT_SECS")? {
            self.continuity.transition_timeout = Duration::from_secs(s);
        }
        if let Some(p) = env("TLINK_TRANSCRIPTS_DIR") {
            self.continuity.transcripts_root = PathBuf::from(p);
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::with_state_dir(default_state_dir())
    }
}

fn hours(h: u64) -> Duration {
    Duration::from_secs(h.saturating_mul(3600))
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(FileConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn env_u64(
    env: &impl Fn(&str) -> Option<String>,
    var: &str,
) -> Result<Option<u64>, ConfigError> {
    match env(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                var: var.to_string(),
                value,
            }),
    }
}
