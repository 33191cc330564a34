//! Command-line interface for toolboxd.
use std::{path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::{registry::Action, service::ServiceType};

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for toolboxd.
///
/// With `--type` the binary runs as a forked worker for one service instance
/// and no subcommand is needed.
#[derive(Parser)]
#[command(name = "toolboxd", version)]
#[command(about = "Supervises the daemons of a single-host admin toolbox", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Path to the main configuration file (defaults to `toolboxd.yaml`).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// State directory override (PID files, generated configs, socket).
    #[arg(long, value_name = "DIR", global = true)]
    pub state_dir: Option<PathBuf>,

    /// Run as the worker for this service type.
    #[arg(long = "type", value_name = "SERVICE", requires = "subconfig")]
    pub service_type: Option<ServiceType>,

    /// Instance configuration file of the worker.
    #[arg(long, value_name = "FILE", requires = "service_type")]
    pub subconfig: Option<PathBuf>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands for toolboxd.
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Run the resident supervisor in the foreground.
    Run {
        /// Detach from the terminal first.
        #[arg(long)]
        daemonize: bool,
    },

    /// Start a target: `all`, a service type, a key such as `frpserver.2`, or a prefix such as `frpserver.`.
    Start {
        /// Target to start (defaults to every service).
        target: Option<String>,
    },

    /// Stop a target.
    Stop {
        /// Target to stop (defaults to every service).
        target: Option<String>,
    },

    /// Stop then start a target.
    Restart {
        /// Target to restart (defaults to every service).
        target: Option<String>,
    },

    /// Ask a target to re-read its configuration, restarting it when it cannot.
    Reload {
        /// Target to reload (defaults to every service).
        target: Option<String>,
    },

    /// Show the status of every configured or running instance.
    Status {
        /// Emit machine-readable JSON output instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Stop every service and the supervisor.
    Shutdown,
}

impl Commands {
    /// The lifecycle action and target of start/stop/restart/reload.
    pub fn action(&self) -> Option<(Action, Option<String>)> {
        match self {
            Commands::Start { target } => Some((Action::Start, target.clone())),
            Commands::Stop { target } => Some((Action::Stop, target.clone())),
            Commands::Restart { target } => Some((Action::Restart, target.clone())),
            Commands::Reload { target } => Some((Action::Reload, target.clone())),
            _ => None,
        }
    }
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
