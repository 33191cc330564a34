#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use sysinfo::{Pid, ProcessesToUpdate, System};
use tempfile::TempDir;
use toolboxd::{
    adapter::{AdapterContext, default_adapters},
    config::{Config, ConfigStore, InstanceRow, MemoryStore, ServiceTypeConfig},
    instance::ConfigInstanceManager,
    pidfile::PidFileStore,
    registry::{ProcessTable, ServiceRegistry},
    respawn::RespawnSupervisor,
    runtime::RuntimeLayout,
    service::ServiceType,
};

/// Short stop grace so tests don't wait on TERM -> KILL escalation.
pub const TEST_GRACE: Duration = Duration::from_millis(500);

/// Fully wired registry over a temporary state directory and an in-memory store.
pub struct Harness {
    pub temp: TempDir,
    pub layout: RuntimeLayout,
    pub store: Arc<MemoryStore>,
    pub instances: ConfigInstanceManager,
    pub table: Arc<ProcessTable>,
    pub respawn: Arc<RespawnSupervisor>,
    pub registry: Arc<ServiceRegistry>,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = RuntimeLayout::rooted_at(temp.path().join("state"));
        layout.ensure().expect("layout");

        let pids = PidFileStore::new(layout.pid_root()).with_grace(TEST_GRACE);
        let table = ProcessTable::with_grace(pids.clone(), TEST_GRACE);
        let instances = ConfigInstanceManager::new(layout.conf_root(), pids.clone());
        let respawn = Arc::new(RespawnSupervisor::with_grace(pids, TEST_GRACE));
        let store = Arc::new(MemoryStore::new(config));

        let ctx = AdapterContext {
            store: Arc::clone(&store) as Arc<dyn ConfigStore>,
            instances: instances.clone(),
            table: Arc::clone(&table),
            layout: layout.clone(),
            main_config: None,
        };
        let mut registry = ServiceRegistry::new(Arc::clone(&table));
        for adapter in default_adapters(&ctx, Arc::clone(&respawn)) {
            registry.register(adapter);
        }

        Self {
            temp,
            layout,
            store,
            instances,
            table,
            respawn,
            registry: Arc::new(registry),
        }
    }

    pub fn dir(&self) -> &Path {
        self.temp.path()
    }

    pub fn conf_file(&self, relative: &str) -> PathBuf {
        self.layout.conf_root().join(relative)
    }

    pub fn pid_file(&self, relative: &str) -> PathBuf {
        self.layout.pid_root().join(relative)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.registry.stop_all();
    }
}

/// Service config running `sh -c <script>` for each listed instance id.
pub fn shell_service(script: &str, ids: &[u64]) -> ServiceTypeConfig {
    ServiceTypeConfig {
        program: Some("sh".into()),
        args: vec!["-c".into(), script.into()],
        instances: ids
            .iter()
            .map(|id| InstanceRow::new(*id).with_setting("bindPort", 7000 + *id))
            .collect(),
        ..ServiceTypeConfig::default()
    }
}

pub fn config_with(services: Vec<(ServiceType, ServiceTypeConfig)>) -> Config {
    Config {
        services: services.into_iter().collect(),
        ..Config::default()
    }
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

pub fn wait_for_lines(path: &Path, expected: usize) -> Vec<String> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(content) = fs::read_to_string(path) {
            let lines: Vec<_> = content.lines().map(|line| line.to_string()).collect();
            if lines.len() >= expected {
                return lines;
            }
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for {expected} lines in {:?}", path);
        }

        thread::sleep(Duration::from_millis(100));
    }
}

pub fn wait_for_path(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if path.exists() {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("Timed out waiting for {:?} to exist", path);
}

#[cfg(target_os = "linux")]
pub fn wait_for_process_exit(pid: u32) {
    let deadline = Instant::now() + Duration::from_secs(10);
    let proc_path = PathBuf::from(format!("/proc/{}", pid));
    let stat_path = PathBuf::from(format!("/proc/{}/stat", pid));

    while Instant::now() < deadline {
        if !proc_path.exists() {
            return;
        }

        // Third field of /proc/<pid>/stat: Z = zombie, X = dead.
        if let Ok(stat) = fs::read_to_string(&stat_path)
            && let Some(state_start) = stat.rfind(')')
            && let Some(state_char) = stat[state_start + 1..].trim().chars().next()
            && (state_char == 'Z' || state_char == 'X')
        {
            return;
        }

        thread::sleep(Duration::from_millis(100));
    }

    panic!("Timed out waiting for PID {} to exit", pid);
}

pub fn is_process_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system
        .process(Pid::from_u32(pid))
        .is_some_and(|process| process.status() != sysinfo::ProcessStatus::Zombie)
}
