//! Error handling for toolboxd.
use thiserror::Error;

/// Defines all possible errors raised by the supervision core.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// A configuration value was syntactically valid YAML but semantically wrong.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Error spawning a service process.
    #[error("Failed to start service '{service}': {source}")]
    ServiceStartError {
        /// The service key that failed to start.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error stopping a service process.
    #[error("Failed to stop service '{service}': {source}")]
    ServiceStopError {
        /// The service key that failed to stop.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// A live process is already tracked for the key.
    #[error("Service '{service}' is already running with PID {pid}")]
    AlreadyRunning {
        /// The service key.
        service: String,
        /// PID of the live process.
        pid: u32,
    },

    /// No adapter is registered for the requested service type.
    #[error("Unknown service '{0}'")]
    UnknownService(String),

    /// The requested instance does not exist or is disabled.
    #[error("Service '{service}' has no enabled instance {instance}")]
    UnknownInstance {
        /// Service type name.
        service: String,
        /// Requested instance id.
        instance: u64,
    },

    /// The adapter does not support the requested operation.
    #[error("Operation '{operation}' is not supported by '{service}'")]
    Unsupported {
        /// Service type name.
        service: String,
        /// Operation name.
        operation: &'static str,
    },

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisonError(String),

    /// Error for PID file.
    #[error("PID file error: {0}")]
    PidFileError(#[from] PidFileError),

    /// Error writing or removing an instance configuration file.
    #[error("Instance config error: {0}")]
    InstanceError(#[from] InstanceError),

    /// Raw OS error from a signal or wait call.
    #[error("OS error: {0}")]
    ErrNo(#[from] nix::errno::Errno),

    /// OS signal handlers could not be installed.
    #[error("Failed to install signal handlers: {0}")]
    SignalSetupError(#[source] std::io::Error),

    /// Error setting up the configuration watcher.
    #[error("Watcher error: {0}")]
    WatchError(#[from] notify::Error),

    /// Multiple instances failed during a bulk operation; carries the first failure.
    #[error("{failed} instance(s) of '{service}' failed; first error: {first}")]
    PartialFailure {
        /// Service type name.
        service: String,
        /// Number of failed instances.
        failed: usize,
        /// Message of the first failure.
        first: String,
    },
}

/// Implement the `From` trait to convert a `std::sync::PoisonError` into a `ServiceError`.
impl<T> From<std::sync::PoisonError<T>> for ServiceError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ServiceError::MutexPoisonError(err.to_string())
    }
}

/// Error type for PID file operations.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// Error reading or writing a PID file.
    #[error("Failed to access PID file: {0}")]
    IoError(#[from] std::io::Error),

    /// The PID file did not contain a bare decimal integer.
    #[error("Malformed PID file {path}: {contents:?}")]
    ParseError {
        /// Path of the offending file.
        path: String,
        /// Raw contents.
        contents: String,
    },
}

/// Error type for instance configuration files.
#[derive(Debug, Error)]
pub enum InstanceError {
    /// Filesystem failure while writing, renaming or deleting a config file.
    #[error("Failed to write instance config: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization failed.
    #[error("Failed to serialise JSON config: {0}")]
    JsonError(#[from] serde_json::Error),

    /// TOML serialization failed.
    #[error("Failed to serialise TOML config: {0}")]
    TomlError(#[from] toml::ser::Error),

    /// An instance config could not be parsed back.
    #[error("Failed to parse TOML config: {0}")]
    TomlParseError(#[from] toml::de::Error),

    /// The temp file could not be moved into place.
    #[error("Failed to persist instance config: {0}")]
    PersistError(#[from] tempfile::PersistError),
}
