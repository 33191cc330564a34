//! Live-process table and the name -> adapter registry.
use std::{
    collections::{BTreeMap, HashMap},
    str::FromStr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    adapter::{ServiceAdapter, ServiceStatus},
    constants::TERM_GRACE_PERIOD,
    error::ServiceError,
    pidfile::PidFileStore,
    process::{ExitCallback, ExitInfo, OutputSinks, ProcessHandle, SpawnSpec},
    service::{ServiceKey, ServiceType},
};

/// Map of every process started through an adapter, keyed by [`ServiceKey`].
///
/// The table also owns the per-key operation locks. Any path that starts,
/// stops, restarts or reloads a key (admin, watcher, signals) holds that key's
/// lock for the whole operation, so a reload issued while a restart is in
/// flight waits and then applies to the new process.
#[derive(Debug)]
pub struct ProcessTable {
    pids: PidFileStore,
    grace: Duration,
    entries: Mutex<HashMap<ServiceKey, ProcessHandle>>,
    op_locks: Mutex<HashMap<ServiceKey, Arc<Mutex<()>>>>,
}

impl ProcessTable {
    pub fn new(pids: PidFileStore) -> Arc<Self> {
        Self::with_grace(pids, TERM_GRACE_PERIOD)
    }

    /// Table whose stops wait `grace` between SIGTERM and SIGKILL.
    pub fn with_grace(pids: PidFileStore, grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            pids,
            grace,
            entries: Mutex::new(HashMap::new()),
            op_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn pid_store(&self) -> &PidFileStore {
        &self.pids
    }

    /// Lock serializing every operation on `key`.
    pub fn op_lock(&self, key: &ServiceKey) -> Result<Arc<Mutex<()>>, ServiceError> {
        let mut locks = self.op_locks.lock()?;
        Ok(Arc::clone(locks.entry(*key).or_default()))
    }

    /// Spawns `spec` as the process for `key`.
    ///
    /// Fails when a live process is already tracked for the key. The check is
    /// repeated after the spawn, so concurrent callers never both win; callers
    /// that replace a process should still hold [`Self::op_lock`]. The PID
    /// file and the table entry are written together under the table lock;
    /// the exit bookkeeping only starts once both exist.
    pub fn spawn(self: &Arc<Self>, key: ServiceKey, spec: SpawnSpec) -> Result<u32, ServiceError> {
        {
            let entries = self.entries.lock()?;
            if let Some(existing) = entries.get(&key)
                && existing.is_alive()
            {
                return Err(ServiceError::AlreadyRunning {
                    service: key.to_string(),
                    pid: existing.pid(),
                });
            }
        }

        let spawned_pid = Arc::new(AtomicU32::new(0));
        let on_exit: ExitCallback = {
            let table = Arc::downgrade(self);
            let spawned_pid = Arc::clone(&spawned_pid);
            Box::new(move |info| {
                if let Some(table) = table.upgrade() {
                    table.reap(key, spawned_pid.load(Ordering::SeqCst), info);
                }
            })
        };

        let handle = ProcessHandle::spawn(spec, Some(on_exit)).map_err(|source| {
            error!("Failed to spawn '{key}': {source}");
            ServiceError::ServiceStartError {
                service: key.to_string(),
                source,
            }
        })?;
        let pid = handle.pid();
        spawned_pid.store(pid, Ordering::SeqCst);

        let mut entries = self.entries.lock()?;
        if let Some(existing) = entries.get(&key)
            && existing.is_alive()
        {
            let winner = existing.pid();
            drop(entries);
            debug!("Another start of '{key}' won (PID {winner}); discarding PID {pid}");
            let _ = handle.force_kill();
            return Err(ServiceError::AlreadyRunning {
                service: key.to_string(),
                pid: winner,
            });
        }
        if let Err(err) = self.pids.write(&key, pid) {
            drop(entries);
            let _ = handle.force_kill();
            return Err(err.into());
        }
        handle.arm();
        entries.insert(key, handle);
        info!("Started '{key}' with PID {pid}");
        Ok(pid)
    }

    fn reap(&self, key: ServiceKey, pid: u32, info: ExitInfo) {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        if entries.get(&key).map(ProcessHandle::pid) != Some(pid) {
            return;
        }
        entries.remove(&key);
        if let Err(err) = self.pids.remove(&key) {
            warn!("Failed to remove PID file of '{key}': {err}");
        }
        if info.success() {
            info!("'{key}' (PID {pid}) exited with {info}");
        } else {
            warn!("'{key}' (PID {pid}) exited unexpectedly with {info}");
        }
    }

    /// Stops the process of `key`, if any, and returns how it ended.
    ///
    /// The entry leaves the table before the kill so that no other path can
    /// act on a process that is being torn down.
    pub fn stop(&self, key: &ServiceKey) -> Result<Option<ExitInfo>, ServiceError> {
        let Some(handle) = self.entries.lock()?.remove(key) else {
            return Ok(None);
        };

        let info = handle
            .kill_with_grace(self.grace)
            .map_err(|source| ServiceError::ServiceStopError {
                service: key.to_string(),
                source,
            })?;
        self.pids.remove(key)?;
        info!("Stopped '{key}' (PID {}, {info})", handle.pid());
        Ok(Some(info))
    }

    /// Whether a live process is tracked for `key`.
    pub fn is_running(&self, key: &ServiceKey) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.get(key).is_some_and(ProcessHandle::is_alive))
            .unwrap_or(false)
    }

    pub fn pid(&self, key: &ServiceKey) -> Option<u32> {
        self.entries
            .lock()
            .ok()?
            .get(key)
            .filter(|handle| handle.is_alive())
            .map(ProcessHandle::pid)
    }

    /// Whether the live process of `key` accepts commands on stdin.
    pub fn has_pipe(&self, key: &ServiceKey) -> bool {
        self.entries
            .lock()
            .map(|entries| {
                entries
                    .get(key)
                    .is_some_and(|handle| handle.is_alive() && handle.has_pipe())
            })
            .unwrap_or(false)
    }

    /// Queues `line` on the stdin pipe of `key`. Returns whether it was queued.
    pub fn send(&self, key: &ServiceKey, line: &str) -> Result<bool, ServiceError> {
        Ok(self
            .entries
            .lock()?
            .get(key)
            .is_some_and(|handle| handle.send(line)))
    }

    /// Snapshot of the live keys with their PIDs.
    pub fn snapshot(&self) -> Result<Vec<(ServiceKey, u32)>, ServiceError> {
        let mut live: Vec<_> = self
            .entries
            .lock()?
            .iter()
            .filter(|(_, handle)| handle.is_alive())
            .map(|(key, handle)| (*key, handle.pid()))
            .collect();
        live.sort();
        Ok(live)
    }

    /// Live keys of one service type.
    pub fn keys_of(&self, service: ServiceType) -> Result<Vec<ServiceKey>, ServiceError> {
        Ok(self
            .snapshot()?
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| key.service == service)
            .collect())
    }

    /// Sends `sig` to every tracked child and returns how many were signalled.
    pub fn signal_all(&self, sig: Signal) -> Result<usize, ServiceError> {
        let entries = self.entries.lock()?;
        let mut signalled = 0;
        for (key, handle) in entries.iter().filter(|(_, handle)| handle.is_alive()) {
            match handle.signal(sig) {
                Ok(()) => {
                    debug!("Forwarded {sig} to '{key}' (PID {})", handle.pid());
                    signalled += 1;
                }
                Err(err) => warn!("Failed to forward {sig} to '{key}': {err}"),
            }
        }
        Ok(signalled)
    }
}

/// Operation requested for a target by an operator or a control client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Start,
    Stop,
    Restart,
    Reload,
}

/// Name -> adapter map, populated once at start-up.
pub struct ServiceRegistry {
    table: Arc<ProcessTable>,
    adapters: BTreeMap<ServiceType, Arc<dyn ServiceAdapter>>,
}

impl ServiceRegistry {
    pub fn new(table: Arc<ProcessTable>) -> Self {
        Self {
            table,
            adapters: BTreeMap::new(),
        }
    }

    /// Registers the adapter for its service type, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn ServiceAdapter>) {
        let service = adapter.service_type();
        if self.adapters.insert(service, adapter).is_some() {
            warn!("Replaced adapter registered for '{service}'");
        }
    }

    pub fn table(&self) -> &Arc<ProcessTable> {
        &self.table
    }

    /// Looks an adapter up by type name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ServiceAdapter>> {
        let service = ServiceType::from_str(name.trim()).ok()?;
        self.adapters.get(&service).cloned()
    }

    pub fn adapter(&self, service: ServiceType) -> Result<Arc<dyn ServiceAdapter>, ServiceError> {
        self.adapters
            .get(&service)
            .cloned()
            .ok_or_else(|| ServiceError::UnknownService(service.to_string()))
    }

    pub fn adapters(&self) -> impl Iterator<Item = &Arc<dyn ServiceAdapter>> {
        self.adapters.values()
    }

    /// Stops every live key whose name starts with `prefix`.
    ///
    /// Works on a snapshot, so keys removed concurrently are simply skipped.
    /// Every key is attempted; the first failure is returned at the end.
    pub fn stop_group(&self, prefix: &str) -> Result<usize, ServiceError> {
        let targets: Vec<ServiceKey> = self
            .status()
            .into_iter()
            .filter(|entry| entry.pid.is_some() && entry.key.matches_prefix(prefix))
            .map(|entry| entry.key)
            .collect();

        let mut stopped = 0;
        let mut failures = Vec::new();
        for key in targets {
            let result = self
                .adapter(key.service)
                .and_then(|adapter| adapter.stop_instance(key.instance));
            match result {
                Ok(()) => stopped += 1,
                Err(err) => {
                    error!("Failed to stop '{key}' in group '{prefix}': {err}");
                    failures.push(err.to_string());
                }
            }
        }

        partial_failure(prefix, failures)?;
        info!("Stopped {stopped} process(es) in group '{prefix}'");
        Ok(stopped)
    }

    /// Starts the type (or the single instance) that `prefix` names.
    pub fn start_group(&self, prefix: &str, sinks: &OutputSinks) -> Result<(), ServiceError> {
        let key = parse_target(prefix)?;
        let adapter = self.adapter(key.service)?;
        match key.instance {
            Some(id) => adapter.start_instance(Some(id), sinks),
            None => adapter.start(sinks),
        }
    }

    /// Applies `action` to a target: `None`/`"all"`, a type name or a key.
    pub fn apply(
        &self,
        action: Action,
        target: Option<&str>,
        sinks: &OutputSinks,
    ) -> Result<(), ServiceError> {
        let target = target.map(str::trim).filter(|t| !t.is_empty() && *t != "all");
        let Some(target) = target else {
            let mut failures = Vec::new();
            for adapter in self.adapters.values() {
                if let Err(err) = apply_to_type(adapter.as_ref(), action, sinks) {
                    error!("Failed to {action:?} '{}': {err}", adapter.service_type());
                    failures.push(err.to_string());
                }
            }
            return partial_failure("all", failures);
        };

        let key = parse_target(target)?;
        let adapter = self.adapter(key.service)?;
        if key.instance.is_none() && key.service.is_multi_instance() {
            return apply_to_type(adapter.as_ref(), action, sinks);
        }
        if key.instance.is_none() && matches!(action, Action::Start) {
            return adapter.start(sinks);
        }
        match action {
            Action::Start => adapter.start_instance(key.instance, sinks),
            Action::Stop => adapter.stop_instance(key.instance),
            Action::Restart => adapter.restart_instance(key.instance, sinks),
            Action::Reload => adapter.reload_instance(key.instance),
        }
    }

    /// Status of every adapter's instances.
    pub fn status(&self) -> Vec<ServiceStatus> {
        self.adapters
            .values()
            .flat_map(|adapter| adapter.status())
            .collect()
    }

    /// Stops every registered type. Failures are logged and the sweep goes on.
    pub fn stop_all(&self) -> Result<(), ServiceError> {
        let mut failures = Vec::new();
        for adapter in self.adapters.values() {
            if let Err(err) = adapter.stop() {
                error!("Failed to stop '{}': {err}", adapter.service_type());
                failures.push(err.to_string());
            }
        }
        partial_failure("all", failures)
    }
}

fn apply_to_type(
    adapter: &dyn ServiceAdapter,
    action: Action,
    sinks: &OutputSinks,
) -> Result<(), ServiceError> {
    match action {
        Action::Start => adapter.start(sinks),
        Action::Stop => adapter.stop(),
        Action::Restart => adapter.restart(sinks),
        Action::Reload => adapter.reload(),
    }
}

fn parse_target(raw: &str) -> Result<ServiceKey, ServiceError> {
    raw.trim()
        .trim_end_matches('.')
        .parse()
        .map_err(ServiceError::UnknownService)
}

fn partial_failure(scope: &str, failures: Vec<String>) -> Result<(), ServiceError> {
    match failures.first() {
        None => Ok(()),
        Some(first) => Err(ServiceError::PartialFailure {
            service: scope.to_string(),
            failed: failures.len(),
            first: first.clone(),
        }),
    }
}
