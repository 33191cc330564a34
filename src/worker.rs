//! Worker mode: the binary re-executed with `--type` to host one instance.
//!
//! The host loads its instance config, re-reads it whenever a reload token
//! arrives on stdin (or SIGQUIT is delivered) and exits on EOF or SIGTERM.
use std::{
    fs,
    io::{self, BufRead},
    os::{fd::AsFd, unix::fs::FileTypeExt},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
};

use nix::sys::signal::Signal;
use serde_json::Value;
use signal_hook::iterator::Signals;
use tracing::{debug, info, warn};

use crate::{
    constants::RELOAD_TOKEN,
    error::{InstanceError, ServiceError},
    service::ServiceType,
};

/// Parses an instance config by extension: `.json` as JSON, anything else as TOML.
pub fn load_subconfig(path: &Path) -> Result<Value, ServiceError> {
    let raw = fs::read_to_string(path)?;
    let value = if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
        serde_json::from_str(&raw).map_err(InstanceError::from)?
    } else {
        toml::from_str(&raw).map_err(InstanceError::from)?
    };
    Ok(value)
}

pub struct WorkerHost {
    service: ServiceType,
    subconfig: PathBuf,
    main_config: Option<PathBuf>,
    current: Value,
    reloads: usize,
}

impl WorkerHost {
    pub fn open(
        service: ServiceType,
        subconfig: impl Into<PathBuf>,
        main_config: Option<PathBuf>,
    ) -> Result<Self, ServiceError> {
        let subconfig = subconfig.into();
        let current = load_subconfig(&subconfig)?;
        info!(
            "Worker for '{service}' loaded {} ({} keys)",
            subconfig.display(),
            key_count(&current)
        );
        Ok(Self {
            service,
            subconfig,
            main_config,
            current,
            reloads: 0,
        })
    }

    pub fn service(&self) -> ServiceType {
        self.service
    }

    pub fn main_config(&self) -> Option<&Path> {
        self.main_config.as_deref()
    }

    pub fn current(&self) -> &Value {
        &self.current
    }

    pub fn reloads(&self) -> usize {
        self.reloads
    }

    /// Re-reads the instance config. A parse failure keeps the previous one.
    /// Returns whether the content changed.
    pub fn reload(&mut self) -> Result<bool, ServiceError> {
        let next = load_subconfig(&self.subconfig)?;
        self.reloads += 1;
        let changed = next != self.current;
        if changed {
            info!("Worker for '{}' applied new config", self.service);
            self.current = next;
        } else {
            debug!("Worker for '{}' config unchanged", self.service);
        }
        Ok(changed)
    }

    /// Applies one command line. Unknown lines are ignored.
    pub fn handle_line(&mut self, line: &str) {
        match line.trim() {
            RELOAD_TOKEN => {
                if let Err(err) = self.reload() {
                    warn!("Worker for '{}' failed to reload: {err}", self.service);
                }
            }
            "" => {}
            other => debug!("Worker ignoring command {other:?}"),
        }
    }

    /// Consumes command lines until EOF.
    pub fn serve<R: BufRead>(&mut self, input: R) -> Result<(), ServiceError> {
        for line in input.lines() {
            self.handle_line(&line?);
        }
        info!("Worker for '{}' reached end of input", self.service);
        Ok(())
    }
}

fn key_count(value: &Value) -> usize {
    value.as_object().map(|map| map.len()).unwrap_or(0)
}

fn stdin_is_pipe() -> bool {
    io::stdin()
        .as_fd()
        .try_clone_to_owned()
        .map(fs::File::from)
        .and_then(|file| file.metadata())
        .is_ok_and(|meta| meta.file_type().is_fifo())
}

/// Runs the worker until stdin closes or a terminating signal arrives.
pub fn run(
    service: ServiceType,
    subconfig: &Path,
    main_config: Option<PathBuf>,
) -> Result<(), ServiceError> {
    let host = Arc::new(Mutex::new(WorkerHost::open(service, subconfig, main_config)?));

    let mut signals = Signals::new([
        Signal::SIGTERM as i32,
        Signal::SIGINT as i32,
        Signal::SIGQUIT as i32,
    ])
    .map_err(ServiceError::SignalSetupError)?;
    let signal_host = Arc::clone(&host);
    let listener = thread::Builder::new()
        .name("worker-signals".into())
        .spawn(move || {
            for raw in signals.forever() {
                if raw == Signal::SIGQUIT as i32 {
                    let mut host = signal_host
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    if let Err(err) = host.reload() {
                        warn!("Worker for '{service}' failed to reload: {err}");
                    }
                    continue;
                }
                info!("Worker for '{service}' received signal {raw}; exiting");
                std::process::exit(0);
            }
        })
        .map_err(|source| ServiceError::ServiceStartError {
            service: service.to_string(),
            source,
        })?;

    if stdin_is_pipe() {
        for line in io::stdin().lock().lines() {
            host.lock()?.handle_line(&line?);
        }
        info!("Worker for '{service}' reached end of input");
        return Ok(());
    }

    let _ = listener.join();
    Ok(())
}
