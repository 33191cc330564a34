//! Constants and tunables for the supervision core.
//!
//! This module centralizes the file names, tokens and timing values shared by the
//! adapters, the respawn supervisor, the watcher and the signal coordinator.

use std::time::Duration;

// ============================================================================
// File System Layout
// ============================================================================

/// Directory (under the state dir) holding one PID file per instance.
pub const PID_DIR_NAME: &str = "pid";

/// Directory (under the state dir) holding generated instance configuration.
pub const CONF_DIR_NAME: &str = "conf";

/// Directory (under the state dir) holding captured stdout/stderr.
pub const LOG_DIR_NAME: &str = "logs";

/// Extension used for PID files.
pub const PID_FILE_EXTENSION: &str = "pid";

/// Unix socket used by the CLI to talk to the resident supervisor.
pub const CONTROL_SOCKET_NAME: &str = "control.sock";

/// File recording the resident supervisor's own PID.
pub const SUPERVISOR_PID_FILE: &str = "toolboxd.pid";

/// Lock file guarding a single supervisor per state directory.
pub const SUPERVISOR_LOCK_FILE: &str = "toolboxd.lock";

/// Prefix for temp files written next to instance configs before the rename.
pub const TEMP_CONFIG_PREFIX: &str = ".toolboxd-";

/// Suffix for temp files written next to instance configs before the rename.
pub const TEMP_CONFIG_SUFFIX: &str = ".partial";

// ============================================================================
// Live Reload
// ============================================================================

/// Line written into a worker's stdin to request a configuration reload.
pub const RELOAD_TOKEN: &str = "reload";

// ============================================================================
// Process Management Timing
// ============================================================================

/// How long a process gets between SIGTERM and SIGKILL.
pub const TERM_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Polling interval used while waiting on foreign (non-child) PIDs.
pub const PROCESS_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Bounded wait for the OS to tear a process down after SIGKILL.
pub const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Respawn Supervisor Defaults
// ============================================================================

/// Pause between an unexpected exit and the relaunch.
pub const DEFAULT_RESPAWN_BACKOFF: Duration = Duration::from_secs(1);

/// Interval between health-check pings while a daemon is running.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);

/// How long pings may keep failing before the daemon is considered dead.
pub const DEFAULT_PING_GRACE: Duration = Duration::from_secs(30);

/// Per-request timeout for health-check pings.
pub const PING_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Watcher and Shutdown
// ============================================================================

/// Debounce window for configuration file events.
pub const WATCH_DEBOUNCE: Duration = Duration::from_millis(250);

/// Window between the graceful shutdown request and the forced exit.
pub const SHUTDOWN_ESCALATION_WINDOW: Duration = Duration::from_secs(5);

/// Exit code used for SIGINT/SIGTERM unless overridden.
pub const DEFAULT_SIGNAL_EXIT_CODE: i32 = 0;
