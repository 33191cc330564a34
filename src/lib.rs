//! toolboxd supervises the daemons of a single-host admin toolbox: reverse-proxy
//! servers and clients, an FTP server, a web front and user-defined commands.
//! It generates per-instance configuration files, keeps at most one process per
//! instance, respawns user commands within a budget, reacts to configuration
//! edits and coordinates OS signals.

/// Service adapters, one per wrapped daemon kind.
pub mod adapter;

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Shared constants and tunables.
pub mod constants;

/// Error handling.
pub mod error;

/// Generated per-instance configuration files.
pub mod instance;

/// IPC helpers for communicating with the resident supervisor.
pub mod ipc;

/// On-disk PID records.
pub mod pidfile;

/// Child process handles.
pub mod process;

/// Process table and service registry.
pub mod registry;

/// Respawn supervision of user-defined commands.
pub mod respawn;

/// Runtime directory layout.
pub mod runtime;

/// Service types and keys.
pub mod service;

/// OS signal coordination.
pub mod signals;

/// Supervisor runtime that powers daemonised deployments.
pub mod supervisor;

/// Configuration file watcher.
pub mod watcher;

/// Forked worker mode.
pub mod worker;

/// Shared helpers for tests.
pub mod test_utils;
