//! Runtime paths and directory modes.
use std::{
    env, fs, io,
    path::{Path, PathBuf},
};

use crate::{
    constants::{
        CONF_DIR_NAME, CONTROL_SOCKET_NAME, LOG_DIR_NAME, PID_DIR_NAME,
        SUPERVISOR_LOCK_FILE, SUPERVISOR_PID_FILE,
    },
    service::ServiceKey,
};

/// Where to store state/logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    /// User home dir (~/.local/share/toolboxd).
    User,
    /// System dirs (/var/lib/toolboxd).
    System,
    /// Explicit root, usually from the config file or a test.
    Custom,
}

/// Directory layout shared by every component.
///
/// Unlike a process-wide context, the layout is a plain value handed to whoever
/// needs it, so independent supervisors (and tests) can run side by side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLayout {
    mode: RuntimeMode,
    state_dir: PathBuf,
    log_dir: PathBuf,
}

impl RuntimeLayout {
    /// Layout rooted in the invoking user's home directory.
    pub fn user() -> Self {
        let home = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));
        let state_dir = home.join(".local/share/toolboxd");
        Self {
            mode: RuntimeMode::User,
            log_dir: state_dir.join(LOG_DIR_NAME),
            state_dir,
        }
    }

    /// Layout using the system-wide FHS locations.
    pub fn system() -> Self {
        Self {
            mode: RuntimeMode::System,
            state_dir: PathBuf::from("/var/lib/toolboxd"),
            log_dir: PathBuf::from("/var/log/toolboxd"),
        }
    }

    /// Layout with every directory below `root`.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let state_dir = root.into();
        Self {
            mode: RuntimeMode::Custom,
            log_dir: state_dir.join(LOG_DIR_NAME),
            state_dir,
        }
    }

    /// Picks the default layout for the current user: system dirs for root.
    pub fn detect() -> Self {
        if nix::unistd::geteuid().is_root() {
            Self::system()
        } else {
            Self::user()
        }
    }

    pub fn mode(&self) -> RuntimeMode {
        self.mode
    }

    /// State dir (PIDs, configs, sockets).
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Log directory.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Root of the per-type PID directories.
    pub fn pid_root(&self) -> PathBuf {
        self.state_dir.join(PID_DIR_NAME)
    }

    /// Root of the per-type instance configuration directories.
    pub fn conf_root(&self) -> PathBuf {
        self.state_dir.join(CONF_DIR_NAME)
    }

    pub fn control_socket(&self) -> PathBuf {
        self.state_dir.join(CONTROL_SOCKET_NAME)
    }

    pub fn supervisor_pid_file(&self) -> PathBuf {
        self.state_dir.join(SUPERVISOR_PID_FILE)
    }

    pub fn supervisor_lock_file(&self) -> PathBuf {
        self.state_dir.join(SUPERVISOR_LOCK_FILE)
    }

    /// Default capture file for one stream of a service instance.
    pub fn stream_log(&self, key: &ServiceKey, stream: &str) -> PathBuf {
        self.log_dir.join(format!("{key}.{stream}.log"))
    }

    /// Creates every directory of the layout.
    pub fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(&self.state_dir)?;
        fs::create_dir_all(&self.log_dir)?;
        fs::create_dir_all(self.pid_root())?;
        fs::create_dir_all(self.conf_root())?;
        Ok(())
    }
}
