//! Respawn supervisor for user-defined long-running commands.
//!
//! Each descriptor gets a small state machine:
//!
//! ```text
//! idle -> started -> running -> { stopped | exited | killed | restarted }
//!                                                         restarted -> started
//! ```
//!
//! The machine is advanced from the exit callback of the process worker thread,
//! from a start-delay timer and from the health-check thread; nothing polls it.
//! Every transition is delivered, in order, to the registered [`TransitionHook`]s
//! on a dedicated dispatch thread.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock, Weak, mpsc},
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use tracing::{debug, error, info, warn};

use crate::{
    config::{DaemonDescriptor, HealthCheck},
    constants::{PING_REQUEST_TIMEOUT, TERM_GRACE_PERIOD},
    error::ServiceError,
    pidfile::PidFileStore,
    process::{ExitCallback, ExitInfo, OutputSink, OutputSinks, ProcessHandle, SpawnSpec},
    service::{InstanceId, ServiceKey, ServiceType},
};

/// Lifecycle status of one daemon descriptor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DaemonStatus {
    Idle,
    Started,
    Running,
    Stopped,
    Exited,
    Killed,
    Restarted,
}

/// One transition, as seen by hooks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonEvent {
    pub descriptor_id: InstanceId,
    pub status: DaemonStatus,
    pub pid: Option<u32>,
    pub last_error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Transient runtime state of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonRuntimeState {
    pub status: DaemonStatus,
    pub pid: Option<u32>,
    pub last_error: Option<String>,
    /// Automatic relaunches left in the current run.
    pub remaining: u32,
}

/// Receives every state transition.
///
/// Hooks run on the dispatch thread, one event at a time. They must be
/// idempotent and return quickly.
pub trait TransitionHook: Send + Sync {
    fn on_transition(&self, event: &DaemonEvent);
}

impl<F> TransitionHook for F
where
    F: Fn(&DaemonEvent) + Send + Sync,
{
    fn on_transition(&self, event: &DaemonEvent) {
        self(event)
    }
}

type HookList = Arc<RwLock<Vec<Arc<dyn TransitionHook>>>>;

struct DaemonRun {
    descriptor: DaemonDescriptor,
    sinks: OutputSinks,
    state: DaemonRuntimeState,
    /// Bumped on every launch and every operator stop; callbacks and timers
    /// that captured an older value are stale.
    generation: u64,
    handle: Option<Arc<ProcessHandle>>,
    health_failure: Option<String>,
}

impl DaemonRun {
    fn new(descriptor: DaemonDescriptor, sinks: OutputSinks) -> Self {
        Self {
            state: DaemonRuntimeState {
                status: DaemonStatus::Idle,
                pid: None,
                last_error: None,
                remaining: descriptor.respawn,
            },
            descriptor,
            sinks,
            generation: 0,
            handle: None,
            health_failure: None,
        }
    }

    fn key(&self) -> ServiceKey {
        ServiceKey::instance(ServiceType::Daemon, self.descriptor.id)
    }
}

struct Inner {
    pids: PidFileStore,
    grace: Duration,
    runs: Mutex<HashMap<InstanceId, DaemonRun>>,
    events: Mutex<mpsc::Sender<DaemonEvent>>,
}

impl Inner {
    fn emit(&self, run: &DaemonRun) {
        let event = DaemonEvent {
            descriptor_id: run.descriptor.id,
            status: run.state.status,
            pid: run.state.pid,
            last_error: run.state.last_error.clone(),
            at: Utc::now(),
        };
        info!(
            "Daemon '{}' ({}) is now {}",
            run.descriptor.name,
            run.key(),
            event.status
        );
        let sender = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let _ = sender.send(event);
    }

    fn lock_runs(&self) -> std::sync::MutexGuard<'_, HashMap<InstanceId, DaemonRun>> {
        self.runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Supervises user-defined commands with a respawn budget, start delay and
/// health-check ping.
pub struct RespawnSupervisor {
    inner: Arc<Inner>,
    hooks: HookList,
}

impl RespawnSupervisor {
    pub fn new(pids: PidFileStore) -> Self {
        Self::with_grace(pids, TERM_GRACE_PERIOD)
    }

    /// Supervisor whose graceful stops wait `grace` before SIGKILL.
    pub fn with_grace(pids: PidFileStore, grace: Duration) -> Self {
        let (tx, rx) = mpsc::channel::<DaemonEvent>();
        let hooks: HookList = Arc::new(RwLock::new(Vec::new()));

        let dispatch_hooks = Arc::clone(&hooks);
        let spawned = thread::Builder::new()
            .name("daemon-hooks".into())
            .spawn(move || {
                for event in rx {
                    let hooks = dispatch_hooks
                        .read()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .clone();
                    for hook in hooks {
                        hook.on_transition(&event);
                    }
                }
            });
        if let Err(err) = spawned {
            error!("Failed to start daemon hook dispatcher: {err}");
        }

        Self {
            inner: Arc::new(Inner {
                pids,
                grace,
                runs: Mutex::new(HashMap::new()),
                events: Mutex::new(tx),
            }),
            hooks,
        }
    }

    /// Registers a hook invoked on every subsequent transition.
    pub fn add_hook<H: TransitionHook + 'static>(&self, hook: H) {
        self.hooks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(hook));
    }

    /// Launches `descriptor` with a fresh respawn budget.
    pub fn start(
        &self,
        descriptor: DaemonDescriptor,
        sinks: OutputSinks,
    ) -> Result<u32, ServiceError> {
        let id = descriptor.id;
        let mut runs = self.inner.lock_runs();
        let run = runs
            .entry(id)
            .or_insert_with(|| DaemonRun::new(descriptor.clone(), sinks.clone()));

        if let Some(handle) = &run.handle
            && handle.is_alive()
        {
            return Err(ServiceError::AlreadyRunning {
                service: run.key().to_string(),
                pid: handle.pid(),
            });
        }

        run.state.remaining = descriptor.respawn;
        run.state.last_error = None;
        run.descriptor = descriptor;
        run.sinks = sinks;
        launch(&self.inner, run)
    }

    /// Graceful operator stop. Ends in `stopped` and keeps the budget intact.
    pub fn stop(&self, id: InstanceId) -> Result<(), ServiceError> {
        self.halt(id, false)
    }

    /// Immediate SIGKILL. Ends in `killed` and keeps the budget intact.
    pub fn kill(&self, id: InstanceId) -> Result<(), ServiceError> {
        self.halt(id, true)
    }

    /// Operator restart: stop, then start with a fresh budget.
    pub fn restart(
        &self,
        descriptor: DaemonDescriptor,
        sinks: OutputSinks,
    ) -> Result<u32, ServiceError> {
        match self.stop(descriptor.id) {
            Ok(()) | Err(ServiceError::UnknownInstance { .. }) => {}
            Err(err) => return Err(err),
        }
        self.start(descriptor, sinks)
    }

    fn halt(&self, id: InstanceId, force: bool) -> Result<(), ServiceError> {
        let (handle, key, generation) = {
            let mut runs = self.inner.lock_runs();
            let run = runs.get_mut(&id).ok_or(ServiceError::UnknownInstance {
                service: ServiceType::Daemon.to_string(),
                instance: id,
            })?;

            let handle = run.handle.take();
            let in_flight = handle.is_some()
                || matches!(
                    run.state.status,
                    DaemonStatus::Started | DaemonStatus::Running | DaemonStatus::Restarted
                );
            if !in_flight {
                return Ok(());
            }
            run.generation += 1;
            (handle, run.key(), run.generation)
        };

        let mut stopped_pid = None;
        if let Some(handle) = &handle {
            stopped_pid = Some(handle.pid());
            let result = if force {
                handle.force_kill()
            } else {
                handle.kill_with_grace(self.inner.grace)
            };
            result.map_err(|source| ServiceError::ServiceStopError {
                service: key.to_string(),
                source,
            })?;
        }

        let mut runs = self.inner.lock_runs();
        if let Some(run) = runs.get_mut(&id) {
            // A start that slipped in after the kill owns the state now.
            if run.generation != generation {
                debug!("Daemon {id} was relaunched while stopping; keeping its state");
                return Ok(());
            }
            self.inner.pids.remove(&key)?;
            run.state.status = if force {
                DaemonStatus::Killed
            } else {
                DaemonStatus::Stopped
            };
            run.state.pid = stopped_pid;
            self.inner.emit(run);
            run.state.pid = None;
        }
        Ok(())
    }

    /// Stops every supervised descriptor. Failures are logged.
    pub fn stop_all(&self) -> Result<(), ServiceError> {
        let mut first_error = None;
        for id in self.ids() {
            if let Err(err) = self.stop(id) {
                error!("Failed to stop daemon {id}: {err}");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Drops the runtime state of a descriptor after stopping it.
    pub fn forget(&self, id: InstanceId) -> Result<(), ServiceError> {
        match self.stop(id) {
            Ok(()) | Err(ServiceError::UnknownInstance { .. }) => {}
            Err(err) => return Err(err),
        }
        self.inner.lock_runs().remove(&id);
        Ok(())
    }

    pub fn status(&self, id: InstanceId) -> Option<DaemonRuntimeState> {
        self.inner
            .lock_runs()
            .get(&id)
            .map(|run| run.state.clone())
    }

    /// Every known descriptor id, sorted.
    pub fn ids(&self) -> Vec<InstanceId> {
        let mut ids: Vec<_> = self.inner.lock_runs().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Polls until `id` reaches `status` or `timeout` elapses.
    pub fn wait_for(&self, id: InstanceId, status: DaemonStatus, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.status(id).is_some_and(|state| state.status == status) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Drop for RespawnSupervisor {
    fn drop(&mut self) {
        let _ = self.stop_all();
    }
}

fn spawn_spec(run: &DaemonRun) -> SpawnSpec {
    let descriptor = &run.descriptor;
    let mut sinks = run.sinks.clone();
    if let Some(path) = &descriptor.log_file {
        sinks.stdout = OutputSink::File(path.clone());
    }
    if let Some(path) = &descriptor.err_file {
        sinks.stderr = OutputSink::File(path.clone());
    }

    SpawnSpec {
        label: run.key().to_string(),
        program: descriptor.command.clone(),
        args: descriptor.args.clone(),
        env: descriptor.env.clone(),
        workdir: descriptor.workdir.clone(),
        sinks,
        stdin_pipe: false,
    }
}

/// Spawns a new process for `run`. Must be called with the runs lock held.
fn launch(inner: &Arc<Inner>, run: &mut DaemonRun) -> Result<u32, ServiceError> {
    run.generation += 1;
    let generation = run.generation;
    let id = run.descriptor.id;
    let key = run.key();

    let on_exit: ExitCallback = {
        let inner = Arc::downgrade(inner);
        Box::new(move |info| {
            if let Some(inner) = inner.upgrade() {
                handle_exit(&inner, id, generation, info);
            }
        })
    };

    let handle = match ProcessHandle::spawn(spawn_spec(run), Some(on_exit)) {
        Ok(handle) => Arc::new(handle),
        Err(source) => {
            error!("Failed to launch daemon '{key}': {source}");
            run.handle = None;
            run.state.status = DaemonStatus::Exited;
            run.state.pid = None;
            run.state.last_error = Some(source.to_string());
            inner.emit(run);
            return Err(ServiceError::ServiceStartError {
                service: key.to_string(),
                source,
            });
        }
    };

    let pid = handle.pid();
    if let Err(err) = inner.pids.write(&key, pid) {
        warn!("Failed to record PID of '{key}': {err}");
    }
    run.handle = Some(Arc::clone(&handle));
    run.health_failure = None;
    run.state.pid = Some(pid);
    run.state.status = DaemonStatus::Started;
    inner.emit(run);

    let delay = run.descriptor.start_delay;
    if delay.is_zero() {
        mark_running(inner, run);
    } else {
        let weak = Arc::downgrade(inner);
        let _ = thread::Builder::new()
            .name(format!("delay-{key}"))
            .spawn(move || {
                thread::sleep(delay);
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let mut runs = inner.lock_runs();
                if let Some(run) = runs.get_mut(&id)
                    && run.generation == generation
                    && run.state.status == DaemonStatus::Started
                    && run.handle.as_ref().is_some_and(|h| h.is_alive())
                {
                    mark_running(&inner, run);
                }
            });
    }

    handle.arm();
    Ok(pid)
}

fn mark_running(inner: &Arc<Inner>, run: &mut DaemonRun) {
    run.state.status = DaemonStatus::Running;
    inner.emit(run);

    if let Some(check) = run.descriptor.ping.clone() {
        let weak = Arc::downgrade(inner);
        let id = run.descriptor.id;
        let generation = run.generation;
        let _ = thread::Builder::new()
            .name(format!("ping-{}", run.key()))
            .spawn(move || watch_health(weak, id, generation, check));
    }
}

fn watch_health(inner: Weak<Inner>, id: InstanceId, generation: u64, check: HealthCheck) {
    let client = match Client::builder().timeout(PING_REQUEST_TIMEOUT).build() {
        Ok(client) => client,
        Err(err) => {
            warn!("Health checks disabled for daemon {id}: {err}");
            return;
        }
    };

    let mut last_ok = Instant::now();
    loop {
        thread::sleep(check.interval);
        let Some(inner) = inner.upgrade() else {
            return;
        };

        let current = inner.lock_runs().get(&id).is_some_and(|run| {
            run.generation == generation && run.state.status == DaemonStatus::Running
        });
        if !current {
            return;
        }

        match client.get(&check.url).send() {
            Ok(response) if response.status().is_success() => {
                last_ok = Instant::now();
                continue;
            }
            Ok(response) => debug!(
                "Health check for daemon {id} returned {}",
                response.status()
            ),
            Err(err) => debug!("Health check for daemon {id} failed: {err}"),
        }

        if last_ok.elapsed() <= check.grace {
            continue;
        }

        let handle = {
            let mut runs = inner.lock_runs();
            match runs.get_mut(&id) {
                Some(run) if run.generation == generation => {
                    run.health_failure = Some(format!(
                        "health check {} failing for more than {:?}",
                        check.url, check.grace
                    ));
                    run.handle.clone()
                }
                _ => None,
            }
        };

        if let Some(handle) = handle {
            warn!(
                "Daemon {id} (PID {}) failed its health check; killing it",
                handle.pid()
            );
            if let Err(err) = handle.kill_with_grace(inner.grace) {
                error!("Failed to kill unhealthy daemon {id}: {err}");
            }
        }
        return;
    }
}

fn handle_exit(inner: &Arc<Inner>, id: InstanceId, generation: u64, info: ExitInfo) {
    let mut backoff = {
        let mut runs = inner.lock_runs();
        let Some(run) = runs.get_mut(&id) else {
            return;
        };
        if run.generation != generation {
            return;
        }

        let key = run.key();
        run.handle = None;
        if let Err(err) = inner.pids.remove(&key) {
            warn!("Failed to remove PID file of '{key}': {err}");
        }

        run.state.last_error = match run.health_failure.take() {
            Some(reason) => Some(reason),
            None if info.success() => None,
            None => Some(format!("exited with {info}")),
        };
        run.state.status = DaemonStatus::Exited;
        inner.emit(run);
        run.state.pid = None;

        match schedule_respawn(inner, run) {
            Some(backoff) => backoff,
            None => return,
        }
    };

    let mut generation = generation;
    loop {
        thread::sleep(backoff);

        let mut runs = inner.lock_runs();
        let Some(run) = runs.get_mut(&id) else {
            return;
        };
        if run.generation != generation || run.state.status != DaemonStatus::Restarted {
            return;
        }
        match launch(inner, run) {
            Ok(_) => return,
            Err(err) => {
                // A relaunch that cannot spawn counts as one more unexpected exit.
                error!("Failed to relaunch daemon {id}: {err}");
                generation = run.generation;
                backoff = match schedule_respawn(inner, run) {
                    Some(backoff) => backoff,
                    None => return,
                };
            }
        }
    }
}

/// Spends one relaunch from the budget and moves `run` to `restarted`.
/// Returns the backoff to wait, or `None` once the budget is exhausted.
fn schedule_respawn(inner: &Arc<Inner>, run: &mut DaemonRun) -> Option<Duration> {
    if run.state.remaining == 0 {
        if run.descriptor.respawn > 0 {
            warn!(
                "Daemon '{}' exhausted its respawn budget of {}",
                run.descriptor.name, run.descriptor.respawn
            );
        }
        return None;
    }

    run.state.remaining -= 1;
    run.state.status = DaemonStatus::Restarted;
    inner.emit(run);
    Some(run.descriptor.backoff)
}
