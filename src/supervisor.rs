use std::{
    fs::{self, File, OpenOptions},
    io,
    os::unix::net::{UnixListener, UnixStream},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use fs2::FileExt;
use nix::sys::signal::Signal;
use strum::IntoEnumIterator;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    adapter::{AdapterContext, default_adapters},
    config::{ConfigStore, YamlStore},
    constants::DEFAULT_SIGNAL_EXIT_CODE,
    error::ServiceError,
    instance::ConfigInstanceManager,
    ipc::{self, ControlCommand, ControlResponse},
    pidfile::PidFileStore,
    process::OutputSinks,
    registry::{Action, ProcessTable, ServiceRegistry},
    respawn::{DaemonEvent, RespawnSupervisor},
    runtime::RuntimeLayout,
    service::ServiceType,
    signals::{SignalCoordinator, SignalListener},
    watcher::{ConfigReconciler, ConfigWatcher},
};

/// Errors emitted by the resident supervisor runtime.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Control(#[from] ipc::ControlError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("another supervisor holds {0}")]
    Locked(PathBuf),
}

/// Picks the runtime layout: explicit override, then the config's
/// `state_dir`, then the per-user or system default.
pub fn resolve_layout(state_dir: Option<&Path>, config_state_dir: Option<&Path>) -> RuntimeLayout {
    state_dir
        .or(config_state_dir)
        .map(RuntimeLayout::rooted_at)
        .unwrap_or_else(RuntimeLayout::detect)
}

/// Long-lived process that owns every supervised service and serves the
/// control socket.
pub struct Supervisor {
    layout: RuntimeLayout,
    store: Arc<YamlStore>,
    registry: Arc<ServiceRegistry>,
    instances: ConfigInstanceManager,
    respawn: Arc<RespawnSupervisor>,
    accepting: Arc<AtomicBool>,
    _lock: File,
}

impl Supervisor {
    /// Loads the configuration and wires every component. Takes the
    /// per-state-dir lock, so a second supervisor fails here.
    pub fn new(config_path: PathBuf, state_dir: Option<PathBuf>) -> Result<Self, SupervisorError> {
        let config_path = fs::canonicalize(&config_path).unwrap_or(config_path);
        let store = Arc::new(YamlStore::open(&config_path)?);
        let config = store.snapshot()?;

        let layout = resolve_layout(state_dir.as_deref(), config.state_dir.as_deref());
        layout.ensure()?;
        let lock = acquire_lock(&layout)?;

        let pids = PidFileStore::new(layout.pid_root());
        let table = ProcessTable::new(pids.clone());
        let instances = ConfigInstanceManager::new(layout.conf_root(), pids.clone());

        let respawn = Arc::new(RespawnSupervisor::new(pids));
        respawn.add_hook(|event: &DaemonEvent| match &event.last_error {
            Some(reason) => info!(
                "Daemon {} is now {} ({reason})",
                event.descriptor_id, event.status
            ),
            None => info!("Daemon {} is now {}", event.descriptor_id, event.status),
        });

        let ctx = AdapterContext {
            store: Arc::clone(&store) as Arc<dyn ConfigStore>,
            instances: instances.clone(),
            table: Arc::clone(&table),
            layout: layout.clone(),
            main_config: Some(config_path),
        };
        let mut registry = ServiceRegistry::new(table);
        for adapter in default_adapters(&ctx, Arc::clone(&respawn)) {
            registry.register(adapter);
        }

        Ok(Self {
            layout,
            store,
            registry: Arc::new(registry),
            instances,
            respawn,
            accepting: Arc::new(AtomicBool::new(true)),
            _lock: lock,
        })
    }

    pub fn layout(&self) -> &RuntimeLayout {
        &self.layout
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Terminates every process recorded by a previous run.
    pub fn kill_leftovers(&self) {
        let pids = self.registry.table().pid_store();
        for service in ServiceType::iter() {
            match pids.kill_all_under(service) {
                Ok(0) => {}
                Ok(killed) => info!("Terminated {killed} leftover '{service}' process(es)"),
                Err(err) => warn!("Failed to clean up leftover '{service}' processes: {err}"),
            }
        }
    }

    /// Starts every enabled service. Individual failures are logged.
    pub fn boot(&self) {
        self.kill_leftovers();
        if let Err(err) = self
            .registry
            .apply(Action::Start, None, &OutputSinks::default())
        {
            warn!("Boot sweep finished with errors: {err}");
        }
    }

    /// Signal table of the resident process. SIGINT/SIGTERM close the control
    /// listener, stop everything and exit; SIGHUP re-reads the configuration,
    /// regenerates instance files and forwards SIGQUIT to children.
    pub fn signal_coordinator(&self) -> SignalCoordinator {
        let coordinator = SignalCoordinator::new();
        coordinator.terminal(Signal::SIGINT, DEFAULT_SIGNAL_EXIT_CODE);
        coordinator.terminal(Signal::SIGTERM, DEFAULT_SIGNAL_EXIT_CODE);

        let store = Arc::clone(&self.store);
        coordinator.bind(Signal::SIGHUP, "reload config", move || store.reload());

        let store = Arc::clone(&self.store);
        let instances = self.instances.clone();
        coordinator.bind(Signal::SIGHUP, "regenerate instance configs", move || {
            for service in ServiceType::with_config_files() {
                if let Some(config) = store.service(service)? {
                    instances.sync(service, &config)?;
                }
            }
            Ok(())
        });

        let table = Arc::clone(self.registry.table());
        coordinator.bind(Signal::SIGHUP, "forward SIGQUIT", move || {
            let delivered = table.signal_all(Signal::SIGQUIT)?;
            debug!("Forwarded SIGQUIT to {delivered} process(es)");
            Ok(())
        });

        let accepting = Arc::clone(&self.accepting);
        let socket_path = self.layout.control_socket();
        coordinator.on_drain("stop accepting", move || {
            accepting.store(false, Ordering::SeqCst);
            // Wakes a blocked accept so the listener notices.
            let _ = UnixStream::connect(&socket_path);
            Ok(())
        });
        let registry = Arc::clone(&self.registry);
        coordinator.on_drain("stop services", move || registry.stop_all());
        let respawn = Arc::clone(&self.respawn);
        coordinator.on_drain("stop daemons", move || respawn.stop_all());
        let layout = self.layout.clone();
        coordinator.on_drain("clean up runtime", move || {
            ipc::cleanup_runtime(&layout);
            Ok(())
        });

        coordinator
    }

    /// Runs the supervisor until a `Shutdown` command or a terminal signal.
    pub fn run(&mut self) -> Result<(), SupervisorError> {
        ipc::cleanup_runtime(&self.layout);
        let socket_path = self.layout.control_socket();
        let listener = UnixListener::bind(&socket_path)?;
        ipc::write_supervisor_pid(&self.layout, std::process::id())?;

        self.boot();

        let _watcher = match ConfigWatcher::spawn(ConfigReconciler::new(
            Arc::clone(&self.registry),
            self.instances.clone(),
        )) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                warn!("Config watcher unavailable: {err}");
                None
            }
        };
        let coordinator = Arc::new(self.signal_coordinator());
        let _signals: SignalListener = coordinator.listen()?;

        info!("toolboxd supervisor listening on {:?}", socket_path);

        let mut shutdown_requested = false;
        while !shutdown_requested {
            match listener.accept() {
                Ok((_, _)) if !self.accepting.load(Ordering::SeqCst) => break,
                Ok((mut stream, _addr)) => match ipc::read_command(&mut stream) {
                    Ok(command) => {
                        let should_shutdown = matches!(command, ControlCommand::Shutdown);
                        debug!("Supervisor received command: {:?}", command);
                        let response = match self.handle_command(command) {
                            Ok(response) => response,
                            Err(err) => {
                                error!("Supervisor command failed: {err}");
                                ControlResponse::Error(err.to_string())
                            }
                        };
                        let _ = ipc::write_response(&mut stream, &response);
                        shutdown_requested = should_shutdown;
                    }
                    Err(err) => {
                        warn!("Invalid supervisor command: {err}");
                        let _ = ipc::write_response(
                            &mut stream,
                            &ControlResponse::Error(err.to_string()),
                        );
                    }
                },
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("Supervisor listener error: {err}");
                    shutdown_requested = true;
                }
            }
        }

        if !self.accepting.load(Ordering::SeqCst) {
            drop(listener);
            info!("Control listener closed; waiting for the shutdown to finish");
            loop {
                thread::park();
            }
        }
        self.shutdown_runtime()
    }

    /// Executes one control command against the registry.
    pub fn handle_command(
        &self,
        command: ControlCommand,
    ) -> Result<ControlResponse, SupervisorError> {
        if let Some((action, target)) = command.action() {
            if action != Action::Stop
                && let Err(err) = self.store.reload()
            {
                warn!("Keeping previous configuration: {err}");
            }
            self.registry
                .apply(action, target, &OutputSinks::default())?;
            let target = target.unwrap_or("all");
            return Ok(ControlResponse::Message(format!(
                "{} '{target}' done",
                action_label(action)
            )));
        }

        match command {
            ControlCommand::Status => Ok(ControlResponse::Status(self.registry.status())),
            ControlCommand::Shutdown => {
                self.registry.stop_all()?;
                Ok(ControlResponse::Message("Supervisor shutting down".into()))
            }
            _ => Ok(ControlResponse::Ok),
        }
    }

    fn shutdown_runtime(&mut self) -> Result<(), SupervisorError> {
        let stopped = self.registry.stop_all();
        self.respawn.stop_all()?;
        ipc::cleanup_runtime(&self.layout);
        stopped?;
        info!("toolboxd supervisor stopped");
        Ok(())
    }
}

fn action_label(action: Action) -> &'static str {
    match action {
        Action::Start => "start",
        Action::Stop => "stop",
        Action::Restart => "restart",
        Action::Reload => "reload",
    }
}

fn acquire_lock(layout: &RuntimeLayout) -> Result<File, SupervisorError> {
    let path = layout.supervisor_lock_file();
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&path)?;
    if file.try_lock_exclusive().is_err() {
        return Err(SupervisorError::Locked(path));
    }
    Ok(file)
}
