//! Configuration management for toolboxd.
//!
//! The main configuration is a YAML file. It stands in for the admin database:
//! per-type service settings, the instance rows of multi-instance services and the
//! user daemon descriptors. Components read it through the [`ConfigStore`] trait.
use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::{
    collections::{BTreeMap, HashMap},
    env, fs,
    path::{Path, PathBuf},
    sync::RwLock,
    time::Duration,
};

use crate::{
    constants::{DEFAULT_PING_GRACE, DEFAULT_PING_INTERVAL, DEFAULT_RESPAWN_BACKOFF},
    error::ServiceError,
    service::{InstanceId, ServiceType},
};

/// Settings of one instance, serialized verbatim into its config file.
pub type Settings = Map<String, Value>;

/// Represents the structure of the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Configuration version.
    #[serde(default = "default_version")]
    pub version: String,
    /// State directory override; defaults to the runtime layout.
    pub state_dir: Option<PathBuf>,
    /// Optional `.env` file loaded before `${VAR}` expansion.
    pub env_file: Option<String>,
    /// Per-type settings of the wrapped daemons.
    #[serde(default)]
    pub services: BTreeMap<ServiceType, ServiceTypeConfig>,
    /// User-defined long-running commands.
    #[serde(default)]
    pub daemons: Vec<DaemonDescriptor>,
    /// Directory the config file was loaded from.
    #[serde(skip)]
    pub project_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            state_dir: None,
            env_file: None,
            services: BTreeMap::new(),
            daemons: Vec::new(),
            project_dir: None,
        }
    }
}

fn default_version() -> String {
    "1".into()
}

fn default_true() -> bool {
    true
}

/// Configuration for one wrapped daemon type.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceTypeConfig {
    /// Disabled types are never started by the boot sweep.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Executable to launch; defaults to this binary in worker mode.
    pub program: Option<String>,
    /// Arguments placed before the generated `--type/--config/--subconfig` flags.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for every instance of the type.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Keep a stdin pipe open and reload through it instead of restarting.
    pub live_reload: Option<bool>,
    /// Parameters merged into every generated instance file.
    #[serde(default)]
    pub extra: Settings,
    /// Settings of a singleton service.
    #[serde(default)]
    pub settings: Settings,
    /// Rows of a multi-instance service.
    #[serde(default)]
    pub instances: Vec<InstanceRow>,
}

impl Default for ServiceTypeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: None,
            args: Vec::new(),
            env: HashMap::new(),
            live_reload: None,
            extra: Settings::new(),
            settings: Settings::new(),
            instances: Vec::new(),
        }
    }
}

impl ServiceTypeConfig {
    /// Looks up an instance row by id.
    pub fn instance(&self, id: InstanceId) -> Option<&InstanceRow> {
        self.instances.iter().find(|row| row.id == id)
    }
}

/// One configured instance (one row of the admin database).
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct InstanceRow {
    pub id: InstanceId,
    /// Soft-delete flag. Disabled rows get their config file removed.
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub settings: Settings,
}

impl InstanceRow {
    pub fn new(id: InstanceId) -> Self {
        Self {
            id,
            disabled: false,
            settings: Settings::new(),
        }
    }

    pub fn with_setting(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.settings.insert(key.to_string(), value.into());
        self
    }
}

/// Health-check target polled while a daemon is running.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HealthCheck {
    pub url: String,
    #[serde(default = "default_ping_interval", deserialize_with = "de_duration")]
    pub interval: Duration,
    #[serde(default = "default_ping_grace", deserialize_with = "de_duration")]
    pub grace: Duration,
}

fn default_ping_interval() -> Duration {
    DEFAULT_PING_INTERVAL
}

fn default_ping_grace() -> Duration {
    DEFAULT_PING_GRACE
}

fn default_backoff() -> Duration {
    DEFAULT_RESPAWN_BACKOFF
}

/// Persisted description of a user-defined long-running command.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DaemonDescriptor {
    pub id: InstanceId,
    pub name: String,
    /// Program to execute (looked up in `PATH`).
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub workdir: Option<PathBuf>,
    /// Maximum number of automatic relaunches.
    #[serde(default)]
    pub respawn: u32,
    /// How long the process must survive before it counts as running.
    #[serde(default, deserialize_with = "de_duration")]
    pub start_delay: Duration,
    /// Pause between an unexpected exit and the relaunch.
    #[serde(default = "default_backoff", deserialize_with = "de_duration")]
    pub backoff: Duration,
    pub ping: Option<HealthCheck>,
    pub log_file: Option<PathBuf>,
    pub err_file: Option<PathBuf>,
    #[serde(default)]
    pub disabled: bool,
}

impl DaemonDescriptor {
    /// Minimal descriptor, mostly useful for tests and embedding.
    pub fn new(id: InstanceId, name: &str, command: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            command: command.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            workdir: None,
            respawn: 0,
            start_delay: Duration::ZERO,
            backoff: DEFAULT_RESPAWN_BACKOFF,
            ping: None,
            log_file: None,
            err_file: None,
            disabled: false,
        }
    }
}

fn de_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

/// Parses a user-facing duration string in the format `<number>[ms|s|m|h]`.
pub fn parse_duration(raw: &str) -> Result<Duration, ServiceError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(ServiceError::InvalidConfig(
            "Duration value cannot be empty".into(),
        ));
    }

    let invalid = || ServiceError::InvalidConfig(format!("Invalid duration value: '{raw}'"));

    if let Some(stripped) = value.strip_suffix("ms") {
        let amount: u64 = stripped.trim().parse().map_err(|_| invalid())?;
        return Ok(Duration::from_millis(amount));
    }

    let (amount_str, multiplier) = if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3600)
    } else {
        (value, 1)
    };

    let amount: u64 = amount_str.parse().map_err(|_| invalid())?;
    Ok(Duration::from_secs(amount.saturating_mul(multiplier)))
}

/// Expands `${VAR}` / `$VAR` references within a string.
///
/// `overrides` (the `.env` file) win over the process environment.
fn expand_env_vars(input: &str, overrides: &HashMap<String, String>) -> Result<String, ServiceError> {
    let re = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?")
        .map_err(|err| ServiceError::InvalidConfig(err.to_string()))?;

    let mut missing = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match overrides.get(var_name).cloned().map_or_else(|| env::var(var_name), Ok) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(var_name) => Err(ServiceError::InvalidConfig(format!(
            "Missing environment variable: {var_name}"
        ))),
        None => Ok(result.into_owned()),
    }
}

/// Reads an `.env` file into a map. The process environment is left alone.
fn read_env_file(path: &Path) -> Result<HashMap<String, String>, ServiceError> {
    let content = fs::read_to_string(path).map_err(ServiceError::ConfigReadError)?;
    let mut vars = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let mut value = value.trim();

            if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
                value = &value[1..value.len() - 1];
            }

            vars.insert(key.to_string(), value.to_string());
        }
    }
    Ok(vars)
}

/// Parses configuration text, expanding environment variables first.
pub fn parse_config(content: &str) -> Result<Config, ServiceError> {
    parse_config_with(content, &HashMap::new())
}

fn parse_config_with(
    content: &str,
    overrides: &HashMap<String, String>,
) -> Result<Config, ServiceError> {
    let expanded = expand_env_vars(content, overrides)?;
    let mut config: Config = serde_yaml::from_str(&expanded)?;

    // Children see the `.env` values unless their own env sets the key.
    for service in config.services.values_mut() {
        for (key, value) in overrides {
            service.env.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    for daemon in &mut config.daemons {
        for (key, value) in overrides {
            daemon.env.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    Ok(config)
}

/// Config file used when none is given: `toolboxd.yaml`, else `toolbox.yaml`.
pub fn default_config_path() -> PathBuf {
    if Path::new("toolboxd.yaml").exists() {
        PathBuf::from("toolboxd.yaml")
    } else {
        PathBuf::from("toolbox.yaml")
    }
}

/// Loads and parses the configuration file, expanding environment variables.
pub fn load_config(config_path: Option<&str>) -> Result<Config, ServiceError> {
    let default_path = default_config_path();
    let config_path = config_path.map(Path::new).unwrap_or(&default_path);

    let content = fs::read_to_string(config_path).map_err(|e| {
        ServiceError::ConfigReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let base_path = config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    // The env file must be loaded before expansion, so peek at it unexpanded.
    #[derive(Deserialize)]
    struct EnvOnly {
        env_file: Option<String>,
    }
    let mut env_vars = HashMap::new();
    if let Ok(EnvOnly {
        env_file: Some(file),
    }) = serde_yaml::from_str::<EnvOnly>(&content)
    {
        let path = Path::new(&file);
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_path.join(path)
        };
        env_vars = read_env_file(&resolved)?;
    }

    let mut config = parse_config_with(&content, &env_vars)?;
    config.project_dir = Some(base_path.clone());
    if let Some(state_dir) = &config.state_dir
        && state_dir.is_relative()
    {
        config.state_dir = Some(base_path.join(state_dir));
    }
    Ok(config)
}

/// Read access to the configuration that the admin layer maintains.
pub trait ConfigStore: Send + Sync {
    /// Settings of one service type; `None` when the type is not configured.
    fn service(&self, service: ServiceType) -> Result<Option<ServiceTypeConfig>, ServiceError>;

    /// Every daemon descriptor, enabled or not.
    fn daemons(&self) -> Result<Vec<DaemonDescriptor>, ServiceError>;

    /// Re-reads the backing storage.
    fn reload(&self) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// [`ConfigStore`] backed by the YAML file on disk.
#[derive(Debug)]
pub struct YamlStore {
    path: PathBuf,
    current: RwLock<Config>,
}

impl YamlStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ServiceError> {
        let path = path.into();
        let config = load_config(Some(path.to_string_lossy().as_ref()))?;
        Ok(Self {
            path,
            current: RwLock::new(config),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the last successfully loaded configuration.
    pub fn snapshot(&self) -> Result<Config, ServiceError> {
        Ok(self.current.read()?.clone())
    }
}

impl ConfigStore for YamlStore {
    fn service(&self, service: ServiceType) -> Result<Option<ServiceTypeConfig>, ServiceError> {
        Ok(self.current.read()?.services.get(&service).cloned())
    }

    fn daemons(&self) -> Result<Vec<DaemonDescriptor>, ServiceError> {
        Ok(self.current.read()?.daemons.clone())
    }

    fn reload(&self) -> Result<(), ServiceError> {
        let config = load_config(Some(self.path.to_string_lossy().as_ref()))?;
        *self.current.write()? = config;
        Ok(())
    }
}

/// In-memory [`ConfigStore`], used when embedding the core without a file.
#[derive(Debug, Default)]
pub struct MemoryStore {
    config: RwLock<Config>,
}

impl MemoryStore {
    pub fn new(config: Config) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    /// Applies an edit, as the admin layer would after a database write.
    pub fn update<F: FnOnce(&mut Config)>(&self, edit: F) -> Result<(), ServiceError> {
        edit(&mut *self.config.write()?);
        Ok(())
    }
}

impl ConfigStore for MemoryStore {
    fn service(&self, service: ServiceType) -> Result<Option<ServiceTypeConfig>, ServiceError> {
        Ok(self.config.read()?.services.get(&service).cloned())
    }

    fn daemons(&self) -> Result<Vec<DaemonDescriptor>, ServiceError> {
        Ok(self.config.read()?.daemons.clone())
    }
}
