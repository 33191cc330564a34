//! Reconciles running instances with edits to their generated config files.
use std::{
    collections::BTreeSet,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, mpsc},
    thread,
    time::Duration,
};

use notify::{RecursiveMode, Watcher};
use notify_debouncer_mini::{DebouncedEvent, Debouncer, new_debouncer};
use tracing::{debug, error, info, warn};

use crate::{
    constants::WATCH_DEBOUNCE,
    error::ServiceError,
    instance::{ConfigInstanceManager, content_digest},
    registry::ServiceRegistry,
    service::ServiceKey,
};

/// What a single file event led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// Not a config file, or not one owned by a known key.
    Ignored,
    /// The owning instance is not running.
    NotRunning(ServiceKey),
    /// Content matches what was last written or reconciled.
    Unchanged(ServiceKey),
    Reloaded(ServiceKey),
    Restarted(ServiceKey),
    Failed(ServiceKey),
}

/// Maps changed files to running instances and reloads or restarts them.
pub struct ConfigReconciler {
    registry: Arc<ServiceRegistry>,
    instances: ConfigInstanceManager,
}

impl ConfigReconciler {
    pub fn new(registry: Arc<ServiceRegistry>, instances: ConfigInstanceManager) -> Self {
        Self {
            registry,
            instances,
        }
    }

    /// Handles a change of `path`. Errors are logged, never returned.
    pub fn handle_path(&self, path: &Path) -> Reconciled {
        if !matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("json" | "toml")
        ) {
            return Reconciled::Ignored;
        }

        let Some(key) = self.instances.key_for_path(path) else {
            return Reconciled::Ignored;
        };
        let Ok(adapter) = self.registry.adapter(key.service) else {
            return Reconciled::Ignored;
        };
        if !adapter.is_running(key.instance) {
            debug!("Ignoring change to {} ('{key}' is not running)", path.display());
            return Reconciled::NotRunning(key);
        }

        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("Config of '{key}' was removed; leaving the process alone");
                return Reconciled::Ignored;
            }
            Err(err) => {
                warn!("Failed to read {}: {err}", path.display());
                return Reconciled::Failed(key);
            }
        };
        if self.instances.last_digest(&key).as_deref() == Some(content_digest(&bytes).as_str()) {
            return Reconciled::Unchanged(key);
        }

        info!("Config of '{key}' changed on disk; applying");
        let outcome = adapter.reconcile_instance(key.instance).map(|in_place| {
            if in_place {
                Reconciled::Reloaded(key)
            } else {
                Reconciled::Restarted(key)
            }
        });

        if let Err(err) = self.instances.mark_reconciled(&key) {
            warn!("Failed to record reconciled config of '{key}': {err}");
        }

        outcome.unwrap_or_else(|err| {
            error!("Failed to apply config change of '{key}': {err}");
            Reconciled::Failed(key)
        })
    }

    /// Handles one debounced batch, each path once.
    pub fn handle_events(&self, events: &[DebouncedEvent]) -> Vec<Reconciled> {
        let paths: BTreeSet<&PathBuf> = events.iter().map(|event| &event.path).collect();
        paths
            .into_iter()
            .map(|path| self.handle_path(path))
            .collect()
    }
}

/// Recursive, debounced watch of the configuration root.
///
/// Dropping the watcher stops it.
pub struct ConfigWatcher {
    debouncer: Option<Debouncer<notify::RecommendedWatcher>>,
    shutdown: Option<mpsc::Sender<()>>,
    join: Option<thread::JoinHandle<()>>,
}

impl ConfigWatcher {
    pub fn spawn(reconciler: ConfigReconciler) -> Result<Self, ServiceError> {
        Self::with_debounce(reconciler, WATCH_DEBOUNCE)
    }

    pub fn with_debounce(
        reconciler: ConfigReconciler,
        debounce: Duration,
    ) -> Result<Self, ServiceError> {
        let root = reconciler.instances.conf_root().to_path_buf();
        fs::create_dir_all(&root).map_err(ServiceError::ConfigReadError)?;

        let (event_tx, event_rx) = mpsc::channel();
        let mut debouncer = new_debouncer(debounce, event_tx)?;
        debouncer.watcher().watch(&root, RecursiveMode::Recursive)?;
        info!("Watching {} for config changes", root.display());

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name("config-watcher".into())
            .spawn(move || {
                loop {
                    if shutdown_rx.try_recv().is_ok() {
                        break;
                    }

                    match event_rx.recv_timeout(Duration::from_millis(200)) {
                        Ok(Ok(events)) => {
                            for outcome in reconciler.handle_events(&events) {
                                debug!("Config event handled: {outcome:?}");
                            }
                        }
                        Ok(Err(err)) => warn!("Config watcher error: {err}"),
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Config watcher stopped");
            })
            .map_err(|source| ServiceError::ServiceStartError {
                service: "config-watcher".into(),
                source,
            })?;

        Ok(Self {
            debouncer: Some(debouncer),
            shutdown: Some(shutdown_tx),
            join: Some(join),
        })
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.debouncer.take();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
