//! One adapter per wrapped daemon kind.
//!
//! The four config-file driven kinds share [`InstanceRunner`]; they differ in
//! their service type and in whether they reload through a stdin pipe by
//! default. User daemons go through [`DaemonAdapter`], a bridge to the
//! [`RespawnSupervisor`].
use std::{
    env,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::{
    config::{ConfigStore, DaemonDescriptor, ServiceTypeConfig, Settings},
    constants::RELOAD_TOKEN,
    error::ServiceError,
    instance::{ConfigInstanceManager, settings_for},
    process::{OutputSinks, SpawnSpec},
    registry::ProcessTable,
    respawn::RespawnSupervisor,
    runtime::RuntimeLayout,
    service::{InstanceId, ServiceKey, ServiceType},
};

/// Runtime status of one configured or live key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub key: ServiceKey,
    pub pid: Option<u32>,
    pub state: String,
}

/// Lifecycle contract shared by every wrapped daemon kind.
///
/// Per-instance operations take `None` for singleton services.
pub trait ServiceAdapter: Send + Sync {
    fn service_type(&self) -> ServiceType;

    /// Whether reloads go through the stdin pipe instead of a restart.
    fn supports_live_reload(&self) -> bool;

    /// Kills what previous runs left behind. An empty `ids` means every
    /// instance of the type, live or recorded.
    fn stop_history(&self, ids: &[InstanceId]) -> Result<(), ServiceError>;

    /// Fresh start of every enabled instance. Tolerates per-instance failures
    /// and reports the first one at the end.
    fn start(&self, sinks: &OutputSinks) -> Result<(), ServiceError>;

    fn stop(&self) -> Result<(), ServiceError>;

    fn restart(&self, sinks: &OutputSinks) -> Result<(), ServiceError> {
        self.stop()?;
        self.start(sinks)
    }

    fn reload(&self) -> Result<(), ServiceError>;

    fn start_instance(&self, id: Option<InstanceId>, sinks: &OutputSinks)
    -> Result<(), ServiceError>;

    fn stop_instance(&self, id: Option<InstanceId>) -> Result<(), ServiceError>;

    fn restart_instance(
        &self,
        id: Option<InstanceId>,
        sinks: &OutputSinks,
    ) -> Result<(), ServiceError>;

    fn reload_instance(&self, id: Option<InstanceId>) -> Result<(), ServiceError>;

    /// Applies an edit of the instance's config file as found on disk.
    /// Returns whether the process reloaded in place.
    fn reconcile_instance(&self, id: Option<InstanceId>) -> Result<bool, ServiceError> {
        if self.supports_live_reload() {
            self.reload_instance(id).map(|_| true)
        } else {
            self.restart_instance(id, &OutputSinks::default())
                .map(|_| false)
        }
    }

    fn is_running(&self, id: Option<InstanceId>) -> bool;

    fn status(&self) -> Vec<ServiceStatus>;
}

/// Collaborators injected into every adapter.
#[derive(Clone)]
pub struct AdapterContext {
    pub store: Arc<dyn ConfigStore>,
    pub instances: ConfigInstanceManager,
    pub table: Arc<ProcessTable>,
    pub layout: RuntimeLayout,
    /// Main configuration handed to forked workers as `--config`.
    pub main_config: Option<PathBuf>,
}

/// Start/stop/reload logic for config-file driven services.
///
/// The launched command is `program args...`. When no program is configured
/// the supervisor binary itself runs in worker mode and receives
/// `--type <type> --subconfig <file> [--config <main>]`. In `args`, `{config}`
/// is replaced by the instance file and `{key}` by the service key.
pub struct InstanceRunner {
    service: ServiceType,
    live_reload: bool,
    ctx: AdapterContext,
}

impl InstanceRunner {
    pub fn new(service: ServiceType, live_reload: bool, ctx: AdapterContext) -> Self {
        Self {
            service,
            live_reload,
            ctx,
        }
    }

    fn config(&self) -> Result<ServiceTypeConfig, ServiceError> {
        Ok(self
            .ctx
            .store
            .service(self.service)?
            .unwrap_or_else(|| ServiceTypeConfig {
                enabled: false,
                ..ServiceTypeConfig::default()
            }))
    }

    fn key(&self, id: Option<InstanceId>) -> Result<ServiceKey, ServiceError> {
        key_for(self.service, id)
    }

    fn locked<T>(
        &self,
        key: &ServiceKey,
        op: impl FnOnce() -> Result<T, ServiceError>,
    ) -> Result<T, ServiceError> {
        let lock = self.ctx.table.op_lock(key)?;
        let _guard = lock.lock()?;
        op()
    }

    fn live_reload_for(&self, config: &ServiceTypeConfig) -> bool {
        config.live_reload.unwrap_or(self.live_reload)
    }

    fn spawn_spec(
        &self,
        key: &ServiceKey,
        config: &ServiceTypeConfig,
        config_path: &Path,
        sinks: &OutputSinks,
    ) -> Result<SpawnSpec, ServiceError> {
        let config_arg = config_path.to_string_lossy();
        let key_arg = key.to_string();
        let mut args: Vec<String> = config
            .args
            .iter()
            .map(|arg| {
                arg.replace("{config}", &config_arg)
                    .replace("{key}", &key_arg)
            })
            .collect();

        let program = match &config.program {
            Some(program) => program.clone(),
            None => {
                let exe = env::current_exe().map_err(|source| {
                    ServiceError::ServiceStartError {
                        service: key_arg.clone(),
                        source,
                    }
                })?;
                args.extend([
                    "--type".to_string(),
                    self.service.to_string(),
                    "--subconfig".to_string(),
                    config_arg.to_string(),
                ]);
                if let Some(main) = &self.ctx.main_config {
                    args.extend(["--config".to_string(), main.to_string_lossy().to_string()]);
                }
                exe.to_string_lossy().to_string()
            }
        };

        Ok(SpawnSpec {
            label: key_arg,
            program,
            args,
            env: config.env.clone(),
            workdir: None,
            sinks: default_sinks(&self.ctx.layout, key, sinks),
            stdin_pipe: self.live_reload_for(config),
        })
    }

    fn stop_locked(&self, key: &ServiceKey) -> Result<(), ServiceError> {
        self.ctx.table.stop(key)?;
        if let Some(pid) = self.ctx.table.pid_store().kill_recorded(key)? {
            info!("Terminated leftover process {pid} recorded for '{key}'");
        }
        Ok(())
    }

    /// Settings of `key` when it is enabled. A disabled key loses its file.
    fn enabled_settings<'a>(
        &self,
        key: &ServiceKey,
        config: &'a ServiceTypeConfig,
    ) -> Result<&'a Settings, ServiceError> {
        let settings = match key.instance {
            None if config.enabled => &config.settings,
            Some(id) => match config.instance(id) {
                Some(row) if config.enabled && !row.disabled => &row.settings,
                _ => {
                    self.ctx.instances.remove(key)?;
                    return Err(ServiceError::UnknownInstance {
                        service: self.service.to_string(),
                        instance: id,
                    });
                }
            },
            None => {
                self.ctx.instances.remove(key)?;
                return Err(ServiceError::InvalidConfig(format!(
                    "'{}' is disabled",
                    self.service
                )));
            }
        };
        Ok(settings)
    }

    fn start_locked(
        &self,
        key: &ServiceKey,
        config: &ServiceTypeConfig,
        sinks: &OutputSinks,
    ) -> Result<u32, ServiceError> {
        let settings = self.enabled_settings(key, config)?;
        let path = self.ctx.instances.write(key, settings, &config.extra)?;
        self.spawn_locked(key, config, &path, sinks)
    }

    fn spawn_locked(
        &self,
        key: &ServiceKey,
        config: &ServiceTypeConfig,
        path: &Path,
        sinks: &OutputSinks,
    ) -> Result<u32, ServiceError> {
        let spec = self.spawn_spec(key, config, path, sinks)?;
        self.ctx.table.spawn(*key, spec)
    }

    pub fn service_type(&self) -> ServiceType {
        self.service
    }

    pub fn supports_live_reload(&self) -> bool {
        self.config()
            .map(|config| self.live_reload_for(&config))
            .unwrap_or(self.live_reload)
    }

    pub fn stop_history(&self, ids: &[InstanceId]) -> Result<(), ServiceError> {
        if ids.is_empty() {
            for key in self.ctx.table.keys_of(self.service)? {
                self.locked(&key, || self.stop_locked(&key))?;
            }
            let killed = self
                .ctx
                .table
                .pid_store()
                .kill_all_under(self.service)?;
            if killed > 0 {
                info!("Cleared {killed} leftover '{}' process(es)", self.service);
            }
            return Ok(());
        }

        for id in ids {
            let key = self.key(Some(*id))?;
            self.locked(&key, || self.stop_locked(&key))?;
        }
        Ok(())
    }

    pub fn start(&self, sinks: &OutputSinks) -> Result<(), ServiceError> {
        self.stop_history(&[])?;

        let config = self.config()?;
        let keys = self.ctx.instances.prune(self.service, &config)?;
        if keys.is_empty() {
            debug!("No enabled instances of '{}'", self.service);
            return Ok(());
        }

        let mut failures = Vec::new();
        for key in keys {
            if let Err(err) = self.locked(&key, || self.start_locked(&key, &config, sinks)) {
                error!("Failed to start '{key}': {err}");
                failures.push(err.to_string());
            }
        }
        bulk_result(self.service, failures)
    }

    pub fn stop(&self) -> Result<(), ServiceError> {
        self.stop_history(&[])
    }

    pub fn reload(&self) -> Result<(), ServiceError> {
        let mut failures = Vec::new();
        for key in self.ctx.table.keys_of(self.service)? {
            if let Err(err) = self.reload_instance(key.instance) {
                error!("Failed to reload '{key}': {err}");
                failures.push(err.to_string());
            }
        }
        bulk_result(self.service, failures)
    }

    pub fn start_instance(
        &self,
        id: Option<InstanceId>,
        sinks: &OutputSinks,
    ) -> Result<(), ServiceError> {
        let key = self.key(id)?;
        let config = self.config()?;
        self.locked(&key, || {
            self.stop_locked(&key)?;
            self.start_locked(&key, &config, sinks).map(|_| ())
        })
    }

    pub fn stop_instance(&self, id: Option<InstanceId>) -> Result<(), ServiceError> {
        let key = self.key(id)?;
        self.locked(&key, || self.stop_locked(&key))
    }

    /// Stop fully completes, including the wait for teardown, before the new
    /// process starts.
    pub fn restart_instance(
        &self,
        id: Option<InstanceId>,
        sinks: &OutputSinks,
    ) -> Result<(), ServiceError> {
        self.start_instance(id, sinks)
    }

    /// Regenerates the instance file and asks the process to re-read it. Falls
    /// back to stop-then-start when the process has no pipe.
    pub fn reload_instance(&self, id: Option<InstanceId>) -> Result<(), ServiceError> {
        let key = self.key(id)?;
        let config = self.config()?;
        self.locked(&key, || {
            if self.live_reload_for(&config) && self.ctx.table.has_pipe(&key) {
                if let Some(settings) = settings_for(&key, &config) {
                    self.ctx.instances.write(&key, settings, &config.extra)?;
                }
                if self.ctx.table.send(&key, RELOAD_TOKEN)? {
                    info!("Queued reload for '{key}'");
                    return Ok(());
                }
            }

            debug!("'{key}' cannot reload in place; restarting");
            self.stop_locked(&key)?;
            self.start_locked(&key, &config, &OutputSinks::default())
                .map(|_| ())
        })
    }

    /// Applies the instance file as it is on disk, without regenerating it.
    /// A missing file is regenerated from the store.
    pub fn reconcile_instance(&self, id: Option<InstanceId>) -> Result<bool, ServiceError> {
        let key = self.key(id)?;
        let config = self.config()?;
        self.locked(&key, || {
            self.enabled_settings(&key, &config)?;
            if self.live_reload_for(&config)
                && self.ctx.table.has_pipe(&key)
                && self.ctx.table.send(&key, RELOAD_TOKEN)?
            {
                info!("Queued reload of edited config for '{key}'");
                return Ok(true);
            }

            self.stop_locked(&key)?;
            let path = self.ctx.instances.config_path(&key);
            let started = if path.exists() {
                self.spawn_locked(&key, &config, &path, &OutputSinks::default())
            } else {
                self.start_locked(&key, &config, &OutputSinks::default())
            };
            started.map(|_| false)
        })
    }

    pub fn is_running(&self, id: Option<InstanceId>) -> bool {
        self.key(id)
            .map(|key| self.ctx.table.is_running(&key))
            .unwrap_or(false)
    }

    pub fn status(&self) -> Vec<ServiceStatus> {
        let mut keys: Vec<ServiceKey> = match self.config() {
            Ok(config) if config.enabled && self.service.is_multi_instance() => config
                .instances
                .iter()
                .filter(|row| !row.disabled)
                .map(|row| ServiceKey::instance(self.service, row.id))
                .collect(),
            Ok(config) if config.enabled => vec![ServiceKey::singleton(self.service)],
            _ => Vec::new(),
        };
        keys.extend(self.ctx.table.keys_of(self.service).unwrap_or_default());
        keys.sort();
        keys.dedup();

        keys.into_iter()
            .map(|key| {
                let pid = self.ctx.table.pid(&key);
                ServiceStatus {
                    key,
                    pid,
                    state: if pid.is_some() { "running" } else { "stopped" }.to_string(),
                }
            })
            .collect()
    }
}

macro_rules! instance_adapter {
    ($(#[$doc:meta])* $name:ident, $service:expr, live_reload = $live:expr) => {
        $(#[$doc])*
        pub struct $name(InstanceRunner);

        impl $name {
            pub fn new(ctx: AdapterContext) -> Self {
                Self(InstanceRunner::new($service, $live, ctx))
            }
        }

        impl ServiceAdapter for $name {
            fn service_type(&self) -> ServiceType {
                self.0.service_type()
            }

            fn supports_live_reload(&self) -> bool {
                self.0.supports_live_reload()
            }

            fn stop_history(&self, ids: &[InstanceId]) -> Result<(), ServiceError> {
                self.0.stop_history(ids)
            }

            fn start(&self, sinks: &OutputSinks) -> Result<(), ServiceError> {
                self.0.start(sinks)
            }

            fn stop(&self) -> Result<(), ServiceError> {
                self.0.stop()
            }

            fn reload(&self) -> Result<(), ServiceError> {
                self.0.reload()
            }

            fn start_instance(
                &self,
                id: Option<InstanceId>,
                sinks: &OutputSinks,
            ) -> Result<(), ServiceError> {
                self.0.start_instance(id, sinks)
            }

            fn stop_instance(&self, id: Option<InstanceId>) -> Result<(), ServiceError> {
                self.0.stop_instance(id)
            }

            fn restart_instance(
                &self,
                id: Option<InstanceId>,
                sinks: &OutputSinks,
            ) -> Result<(), ServiceError> {
                self.0.restart_instance(id, sinks)
            }

            fn reload_instance(&self, id: Option<InstanceId>) -> Result<(), ServiceError> {
                self.0.reload_instance(id)
            }

            fn reconcile_instance(&self, id: Option<InstanceId>) -> Result<bool, ServiceError> {
                self.0.reconcile_instance(id)
            }

            fn is_running(&self, id: Option<InstanceId>) -> bool {
                self.0.is_running(id)
            }

            fn status(&self) -> Vec<ServiceStatus> {
                self.0.status()
            }
        }
    };
}

instance_adapter!(
    /// Reverse-proxy server instances. Reloads by restarting.
    FrpServerAdapter,
    ServiceType::FrpServer,
    live_reload = false
);

instance_adapter!(
    /// Reverse-proxy client instances. Reloads through the stdin pipe.
    FrpClientAdapter,
    ServiceType::FrpClient,
    live_reload = true
);

instance_adapter!(
    /// FTP server singleton. Reloads by restarting.
    FtpServerAdapter,
    ServiceType::FtpServer,
    live_reload = false
);

instance_adapter!(
    /// Web/TLS front singleton. Reloads through the stdin pipe.
    WebFrontAdapter,
    ServiceType::WebFront,
    live_reload = true
);

/// Bridges user daemons to the [`RespawnSupervisor`].
pub struct DaemonAdapter {
    store: Arc<dyn ConfigStore>,
    table: Arc<ProcessTable>,
    layout: RuntimeLayout,
    supervisor: Arc<RespawnSupervisor>,
}

impl DaemonAdapter {
    pub fn new(ctx: &AdapterContext, supervisor: Arc<RespawnSupervisor>) -> Self {
        Self {
            store: Arc::clone(&ctx.store),
            table: Arc::clone(&ctx.table),
            layout: ctx.layout.clone(),
            supervisor,
        }
    }

    pub fn supervisor(&self) -> &Arc<RespawnSupervisor> {
        &self.supervisor
    }

    fn descriptor(&self, id: InstanceId) -> Result<DaemonDescriptor, ServiceError> {
        self.store
            .daemons()?
            .into_iter()
            .find(|descriptor| descriptor.id == id && !descriptor.disabled)
            .ok_or_else(|| ServiceError::UnknownInstance {
                service: ServiceType::Daemon.to_string(),
                instance: id,
            })
    }

    fn locked<T>(
        &self,
        key: &ServiceKey,
        op: impl FnOnce() -> Result<T, ServiceError>,
    ) -> Result<T, ServiceError> {
        let lock = self.table.op_lock(key)?;
        let _guard = lock.lock()?;
        op()
    }

    fn launch(&self, id: InstanceId, sinks: &OutputSinks) -> Result<(), ServiceError> {
        let descriptor = self.descriptor(id)?;
        let key = ServiceKey::instance(ServiceType::Daemon, id);
        let sinks = default_sinks(&self.layout, &key, sinks);
        self.supervisor.restart(descriptor, sinks).map(|_| ())
    }

    fn halt(&self, id: InstanceId) -> Result<(), ServiceError> {
        match self.supervisor.stop(id) {
            Ok(()) | Err(ServiceError::UnknownInstance { .. }) => {}
            Err(err) => return Err(err),
        }
        let key = ServiceKey::instance(ServiceType::Daemon, id);
        self.table.pid_store().kill_recorded(&key)?;
        Ok(())
    }
}

impl ServiceAdapter for DaemonAdapter {
    fn service_type(&self) -> ServiceType {
        ServiceType::Daemon
    }

    fn supports_live_reload(&self) -> bool {
        false
    }

    fn stop_history(&self, ids: &[InstanceId]) -> Result<(), ServiceError> {
        if ids.is_empty() {
            let mut failures = Vec::new();
            for id in self.supervisor.ids() {
                let key = ServiceKey::instance(ServiceType::Daemon, id);
                if let Err(err) = self.locked(&key, || self.halt(id)) {
                    error!("Failed to stop '{key}': {err}");
                    failures.push(err.to_string());
                }
            }
            bulk_result(ServiceType::Daemon, failures)?;
            let killed = self
                .table
                .pid_store()
                .kill_all_under(ServiceType::Daemon)?;
            if killed > 0 {
                info!("Cleared {killed} leftover daemon process(es)");
            }
            return Ok(());
        }

        for id in ids {
            let key = ServiceKey::instance(ServiceType::Daemon, *id);
            self.locked(&key, || self.halt(*id))?;
        }
        Ok(())
    }

    fn start(&self, sinks: &OutputSinks) -> Result<(), ServiceError> {
        self.stop_history(&[])?;

        let mut failures = Vec::new();
        for descriptor in self.store.daemons()? {
            let id = descriptor.id;
            let key = ServiceKey::instance(ServiceType::Daemon, id);
            let result = if descriptor.disabled {
                self.supervisor.forget(id)
            } else {
                self.locked(&key, || self.launch(id, sinks))
            };
            if let Err(err) = result {
                error!("Failed to start daemon '{}' ({key}): {err}", descriptor.name);
                failures.push(err.to_string());
            }
        }
        bulk_result(ServiceType::Daemon, failures)
    }

    fn stop(&self) -> Result<(), ServiceError> {
        self.stop_history(&[])
    }

    /// Daemons have no pipe; reload restarts every live one.
    fn reload(&self) -> Result<(), ServiceError> {
        let mut failures = Vec::new();
        for entry in self.status().into_iter().filter(|entry| entry.pid.is_some()) {
            if let Err(err) = self.reload_instance(entry.key.instance) {
                error!("Failed to reload '{}': {err}", entry.key);
                failures.push(err.to_string());
            }
        }
        bulk_result(ServiceType::Daemon, failures)
    }

    fn start_instance(
        &self,
        id: Option<InstanceId>,
        sinks: &OutputSinks,
    ) -> Result<(), ServiceError> {
        let key = key_for(ServiceType::Daemon, id)?;
        let id = key.instance.unwrap_or_default();
        self.locked(&key, || self.launch(id, sinks))
    }

    fn stop_instance(&self, id: Option<InstanceId>) -> Result<(), ServiceError> {
        let key = key_for(ServiceType::Daemon, id)?;
        let id = key.instance.unwrap_or_default();
        self.locked(&key, || self.halt(id))
    }

    fn restart_instance(
        &self,
        id: Option<InstanceId>,
        sinks: &OutputSinks,
    ) -> Result<(), ServiceError> {
        self.start_instance(id, sinks)
    }

    fn reload_instance(&self, id: Option<InstanceId>) -> Result<(), ServiceError> {
        self.restart_instance(id, &OutputSinks::default())
    }

    fn is_running(&self, id: Option<InstanceId>) -> bool {
        id.and_then(|id| self.supervisor.status(id))
            .is_some_and(|state| state.pid.is_some())
    }

    fn status(&self) -> Vec<ServiceStatus> {
        self.supervisor
            .ids()
            .into_iter()
            .filter_map(|id| {
                let state = self.supervisor.status(id)?;
                Some(ServiceStatus {
                    key: ServiceKey::instance(ServiceType::Daemon, id),
                    pid: state.pid,
                    state: state.status.to_string(),
                })
            })
            .collect()
    }
}

/// Builds the adapter set for every service type.
pub fn default_adapters(
    ctx: &AdapterContext,
    supervisor: Arc<RespawnSupervisor>,
) -> Vec<Arc<dyn ServiceAdapter>> {
    vec![
        Arc::new(FrpServerAdapter::new(ctx.clone())),
        Arc::new(FrpClientAdapter::new(ctx.clone())),
        Arc::new(FtpServerAdapter::new(ctx.clone())),
        Arc::new(WebFrontAdapter::new(ctx.clone())),
        Arc::new(DaemonAdapter::new(ctx, supervisor)),
    ]
}

fn key_for(service: ServiceType, id: Option<InstanceId>) -> Result<ServiceKey, ServiceError> {
    if !service.is_multi_instance() {
        return Ok(ServiceKey::singleton(service));
    }
    id.map(|id| ServiceKey::instance(service, id))
        .ok_or_else(|| ServiceError::InvalidConfig(format!("'{service}' needs an instance id")))
}

/// Unset sinks fall back to `<logs>/<key>.<stream>.log`.
fn default_sinks(layout: &RuntimeLayout, key: &ServiceKey, sinks: &OutputSinks) -> OutputSinks {
    if sinks.is_unset() {
        OutputSinks::files(
            layout.stream_log(key, "stdout"),
            layout.stream_log(key, "stderr"),
        )
    } else {
        sinks.clone()
    }
}

fn bulk_result(service: ServiceType, failures: Vec<String>) -> Result<(), ServiceError> {
    match failures.first() {
        None => Ok(()),
        Some(first) => Err(ServiceError::PartialFailure {
            service: service.to_string(),
            failed: failures.len(),
            first: first.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, thread, time::Duration};

    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::{
        config::{Config, InstanceRow, MemoryStore},
        pidfile::PidFileStore,
        process::pid_is_alive,
    };

    struct Fixture {
        _dir: TempDir,
        ctx: AdapterContext,
        store: Arc<MemoryStore>,
    }

    fn fixture(services: Vec<(ServiceType, ServiceTypeConfig)>) -> Fixture {
        let dir = tempdir().unwrap();
        let layout = RuntimeLayout::rooted_at(dir.path());
        let pids = PidFileStore::new(layout.pid_root()).with_grace(Duration::from_secs(1));

        let mut config = Config::default();
        config.services = services.into_iter().collect();
        let store = Arc::new(MemoryStore::new(config));

        let ctx = AdapterContext {
            store: store.clone(),
            instances: ConfigInstanceManager::new(layout.conf_root(), pids.clone()),
            table: ProcessTable::with_grace(pids, Duration::from_secs(1)),
            layout,
            main_config: None,
        };
        Fixture {
            _dir: dir,
            ctx,
            store,
        }
    }

    fn sleeper_config(ids: &[InstanceId]) -> ServiceTypeConfig {
        ServiceTypeConfig {
            program: Some("sleep".into()),
            args: vec!["30".into()],
            instances: ids.iter().map(|id| InstanceRow::new(*id)).collect(),
            ..ServiceTypeConfig::default()
        }
    }

    #[test]
    fn start_writes_configs_and_tracks_every_instance() {
        let fx = fixture(vec![(ServiceType::FrpServer, sleeper_config(&[1, 2]))]);
        let adapter = FrpServerAdapter::new(fx.ctx.clone());

        adapter.start(&OutputSinks::default()).unwrap();
        let live = fx.ctx.table.snapshot().unwrap();
        assert_eq!(live.len(), 2);
        for (key, pid) in &live {
            assert!(fx.ctx.instances.config_path(key).exists());
            assert_eq!(fx.ctx.table.pid_store().read(key).unwrap(), Some(*pid));
        }

        adapter.stop().unwrap();
        assert!(fx.ctx.table.snapshot().unwrap().is_empty());
        for (_, pid) in live {
            assert!(!pid_is_alive(pid));
        }
    }

    #[test]
    fn start_twice_never_leaves_two_processes() {
        let fx = fixture(vec![(ServiceType::FrpClient, sleeper_config(&[1]))]);
        let adapter = FrpClientAdapter::new(fx.ctx.clone());
        let key = ServiceKey::instance(ServiceType::FrpClient, 1);

        adapter.start_instance(Some(1), &OutputSinks::default()).unwrap();
        let first = fx.ctx.table.pid(&key).unwrap();
        adapter.start_instance(Some(1), &OutputSinks::default()).unwrap();
        let second = fx.ctx.table.pid(&key).unwrap();

        assert_ne!(first, second);
        assert!(!pid_is_alive(first));
        assert_eq!(fx.ctx.table.snapshot().unwrap().len(), 1);
        adapter.stop().unwrap();
    }

    #[test]
    fn bulk_start_tolerates_single_failures() {
        let mut config = sleeper_config(&[1, 2]);
        // TOML has no null, so instance 2 cannot get a config file.
        config.instances[1]
            .settings
            .insert("broken".into(), serde_json::Value::Null);
        let fx = fixture(vec![(ServiceType::FrpServer, config)]);
        let adapter = FrpServerAdapter::new(fx.ctx.clone());

        match adapter.start(&OutputSinks::default()) {
            Err(ServiceError::PartialFailure { failed, .. }) => assert_eq!(failed, 1),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(adapter.is_running(Some(1)));
        assert!(!adapter.is_running(Some(2)));
        adapter.stop().unwrap();
    }

    #[test]
    fn missing_program_is_reported_for_every_instance() {
        let mut config = sleeper_config(&[1, 2]);
        config.program = Some("/no/such/frps".into());
        let fx = fixture(vec![(ServiceType::FrpServer, config)]);
        let adapter = FrpServerAdapter::new(fx.ctx.clone());

        match adapter.start(&OutputSinks::default()) {
            Err(ServiceError::PartialFailure { failed, .. }) => assert_eq!(failed, 2),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(fx.ctx.table.snapshot().unwrap().is_empty());
    }

    #[test]
    fn disabled_instances_are_not_started_and_lose_their_file() {
        let mut config = sleeper_config(&[1, 2]);
        config.instances[1].disabled = true;
        let fx = fixture(vec![(ServiceType::FrpServer, config)]);
        let adapter = FrpServerAdapter::new(fx.ctx.clone());

        let stale = ServiceKey::instance(ServiceType::FrpServer, 2);
        let stale_path = fx.ctx.instances.config_path(&stale);
        fs::create_dir_all(stale_path.parent().unwrap()).unwrap();
        fs::write(&stale_path, "bindPort = 1\n").unwrap();

        adapter.start(&OutputSinks::default()).unwrap();
        assert!(!stale_path.exists());
        assert!(!adapter.is_running(Some(2)));
        assert!(adapter.is_running(Some(1)));
        assert!(matches!(
            adapter.start_instance(Some(2), &OutputSinks::default()),
            Err(ServiceError::UnknownInstance { .. })
        ));
        adapter.stop().unwrap();
    }

    #[test]
    fn reload_without_pipe_restarts() {
        let config = ServiceTypeConfig {
            program: Some("sleep".into()),
            args: vec!["30".into()],
            ..ServiceTypeConfig::default()
        };
        let fx = fixture(vec![(ServiceType::FtpServer, config)]);
        let adapter = FtpServerAdapter::new(fx.ctx.clone());
        let key = ServiceKey::singleton(ServiceType::FtpServer);

        adapter.start(&OutputSinks::default()).unwrap();
        let before = fx.ctx.table.pid(&key).unwrap();
        assert!(!adapter.supports_live_reload());

        adapter.reload_instance(None).unwrap();
        let after = fx.ctx.table.pid(&key).unwrap();
        assert_ne!(before, after);
        assert!(!pid_is_alive(before));
        adapter.stop().unwrap();
    }

    #[test]
    fn reload_with_pipe_keeps_the_process() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("reloaded");
        let config = ServiceTypeConfig {
            program: Some("sh".into()),
            args: vec![
                "-c".into(),
                format!(
                    "while read line; do echo \"$line\" >> '{}'; done",
                    marker.display()
                ),
            ],
            ..ServiceTypeConfig::default()
        };
        let fx = fixture(vec![(ServiceType::WebFront, config)]);
        let adapter = WebFrontAdapter::new(fx.ctx.clone());
        let key = ServiceKey::singleton(ServiceType::WebFront);

        adapter.start(&OutputSinks::default()).unwrap();
        let before = fx.ctx.table.pid(&key).unwrap();
        assert!(adapter.supports_live_reload());

        adapter.reload_instance(None).unwrap();
        let mut seen = String::new();
        for _ in 0..100 {
            seen = fs::read_to_string(&marker).unwrap_or_default();
            if !seen.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(seen.trim(), RELOAD_TOKEN);
        assert_eq!(fx.ctx.table.pid(&key), Some(before));
        adapter.stop().unwrap();
    }

    #[test]
    fn args_placeholders_are_substituted() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("args.txt");
        let config = ServiceTypeConfig {
            program: Some("sh".into()),
            args: vec![
                "-c".into(),
                format!("echo \"$0 $1\" > '{}'", out.display()),
                "{key}".into(),
                "{config}".into(),
            ],
            instances: vec![InstanceRow::new(9)],
            ..ServiceTypeConfig::default()
        };
        let fx = fixture(vec![(ServiceType::FrpClient, config)]);
        let adapter = FrpClientAdapter::new(fx.ctx.clone());

        adapter.start_instance(Some(9), &OutputSinks::default()).unwrap();
        let key = ServiceKey::instance(ServiceType::FrpClient, 9);
        let expected = format!("frpclient.9 {}", fx.ctx.instances.config_path(&key).display());
        let mut seen = String::new();
        for _ in 0..100 {
            seen = fs::read_to_string(&out).unwrap_or_default();
            if !seen.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(seen.trim(), expected);
    }

    #[test]
    fn daemon_adapter_starts_enabled_descriptors() {
        let fx = fixture(Vec::new());
        fx.store
            .update(|cfg| {
                let mut on = DaemonDescriptor::new(1, "on", "sleep");
                on.args = vec!["30".into()];
                let mut off = DaemonDescriptor::new(2, "off", "sleep");
                off.args = vec!["30".into()];
                off.disabled = true;
                cfg.daemons = vec![on, off];
            })
            .unwrap();

        let supervisor = Arc::new(RespawnSupervisor::with_grace(
            fx.ctx.table.pid_store().clone(),
            Duration::from_secs(1),
        ));
        let adapter = DaemonAdapter::new(&fx.ctx, supervisor);

        adapter.start(&OutputSinks::default()).unwrap();
        assert!(adapter.is_running(Some(1)));
        assert!(!adapter.is_running(Some(2)));
        assert!(matches!(
            adapter.start_instance(Some(2), &OutputSinks::default()),
            Err(ServiceError::UnknownInstance { .. })
        ));

        let status = adapter.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].state, "running");

        adapter.stop().unwrap();
        assert!(!adapter.is_running(Some(1)));
    }
}
