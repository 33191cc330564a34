use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{self, BufRead, BufReader, Write},
    os::unix::net::UnixStream,
    path::Path,
};
use thiserror::Error;

use crate::{adapter::ServiceStatus, registry::Action, runtime::RuntimeLayout};

/// Message sent from CLI invocations to the resident supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCommand {
    Start { target: Option<String> },
    Stop { target: Option<String> },
    Restart { target: Option<String> },
    Reload { target: Option<String> },
    Status,
    Shutdown,
}

impl ControlCommand {
    /// Builds the command carrying `action` for `target`.
    pub fn for_action(action: Action, target: Option<String>) -> Self {
        match action {
            Action::Start => Self::Start { target },
            Action::Stop => Self::Stop { target },
            Action::Restart => Self::Restart { target },
            Action::Reload => Self::Reload { target },
        }
    }

    /// The lifecycle action and target, for commands that carry one.
    pub fn action(&self) -> Option<(Action, Option<&str>)> {
        match self {
            Self::Start { target } => Some((Action::Start, target.as_deref())),
            Self::Stop { target } => Some((Action::Stop, target.as_deref())),
            Self::Restart { target } => Some((Action::Restart, target.as_deref())),
            Self::Reload { target } => Some((Action::Reload, target.as_deref())),
            Self::Status | Self::Shutdown => None,
        }
    }
}

/// Response sent by the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlResponse {
    Ok,
    Message(String),
    Status(Vec<ServiceStatus>),
    Error(String),
}

/// Errors raised by the control channel helpers.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control socket I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to serialise control message: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("supervisor reported error: {0}")]
    Server(String),
    #[error("control socket not available")]
    NotAvailable,
}

/// Sends a command to the supervisor of `layout` and waits for a response.
pub fn send_command(
    layout: &RuntimeLayout,
    command: &ControlCommand,
) -> Result<ControlResponse, ControlError> {
    let path = layout.control_socket();
    if !path.exists() {
        return Err(ControlError::NotAvailable);
    }

    let mut stream = match UnixStream::connect(&path) {
        Ok(stream) => stream,
        Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
            return Err(ControlError::NotAvailable);
        }
        Err(err) => return Err(err.into()),
    };
    let payload = serde_json::to_vec(command)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    if response_line.trim().is_empty() {
        return Err(ControlError::NotAvailable);
    }

    let response: ControlResponse = serde_json::from_str(response_line.trim())?;
    if let ControlResponse::Error(message) = &response {
        return Err(ControlError::Server(message.clone()));
    }

    Ok(response)
}

/// Utility to read a command from a `UnixStream`. Used by the supervisor event loop.
pub fn read_command(stream: &mut UnixStream) -> Result<ControlCommand, ControlError> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    if line.trim().is_empty() {
        return Err(ControlError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "empty control command",
        )));
    }

    Ok(serde_json::from_str(line.trim())?)
}

/// Writes a response to the connected CLI client.
pub fn write_response(
    stream: &mut UnixStream,
    response: &ControlResponse,
) -> Result<(), ControlError> {
    let payload = serde_json::to_vec(response)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}

/// Persists the supervisor PID for later CLI detection.
pub fn write_supervisor_pid(layout: &RuntimeLayout, pid: u32) -> Result<(), ControlError> {
    fs::write(layout.supervisor_pid_file(), pid.to_string())?;
    Ok(())
}

/// Reads the supervisor PID if present.
pub fn read_supervisor_pid(layout: &RuntimeLayout) -> Result<Option<u32>, ControlError> {
    let path = layout.supervisor_pid_file();
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)?;
    contents
        .trim()
        .parse::<u32>()
        .map(Some)
        .map_err(|e| ControlError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
}

/// Clears the supervisor PID and removes the socket file.
pub fn cleanup_runtime(layout: &RuntimeLayout) {
    remove_if_present(&layout.control_socket());
    remove_if_present(&layout.supervisor_pid_file());
}

fn remove_if_present(path: &Path) {
    if path.exists() {
        let _ = fs::remove_file(path);
    }
}
