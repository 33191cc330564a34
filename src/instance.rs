//! Generated per-instance configuration files.
use std::{
    collections::{BTreeSet, HashMap},
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, Mutex},
};

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::{
    config::{ServiceTypeConfig, Settings},
    constants::{TEMP_CONFIG_PREFIX, TEMP_CONFIG_SUFFIX},
    error::InstanceError,
    pidfile::PidFileStore,
    service::{InstanceId, ServiceKey, ServiceType},
};

/// Where one instance keeps its generated config and its PID record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstancePaths {
    pub config: PathBuf,
    pub pid: PathBuf,
}

/// Turns configured instance rows into the files the wrapped daemons read.
///
/// Clones share the record of the last reconciled content digest per key,
/// which the config watcher uses to skip events caused by our own writes.
#[derive(Debug, Clone)]
pub struct ConfigInstanceManager {
    conf_root: PathBuf,
    pids: PidFileStore,
    digests: Arc<Mutex<HashMap<ServiceKey, String>>>,
}

impl ConfigInstanceManager {
    pub fn new(conf_root: impl Into<PathBuf>, pids: PidFileStore) -> Self {
        Self {
            conf_root: conf_root.into(),
            pids,
            digests: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn conf_root(&self) -> &Path {
        &self.conf_root
    }

    pub fn pid_store(&self) -> &PidFileStore {
        &self.pids
    }

    /// `<conf>/<type>/<id>.<ext>` for numbered instances, `<conf>/<type>.<ext>`
    /// for singletons. The server and client roles live in separate type
    /// directories, so one id never maps to two files.
    pub fn config_path(&self, key: &ServiceKey) -> PathBuf {
        let ext = key.service.config_extension();
        match key.instance {
            Some(id) => self
                .conf_root
                .join(key.service.as_ref())
                .join(format!("{id}.{ext}")),
            None => self.conf_root.join(format!("{}.{ext}", key.service)),
        }
    }

    pub fn paths(&self, key: &ServiceKey) -> InstancePaths {
        InstancePaths {
            config: self.config_path(key),
            pid: self.pids.path(key),
        }
    }

    /// Writes the config file for `key` from the row settings merged with
    /// `extra`. Row settings win on conflicting keys. An identical file is left
    /// untouched.
    ///
    /// The content goes to a temp file in the target directory which is synced
    /// and then renamed over the final path, so a starting process never sees
    /// a partial file.
    pub fn write(
        &self,
        key: &ServiceKey,
        settings: &Settings,
        extra: &Settings,
    ) -> Result<PathBuf, InstanceError> {
        let path = self.config_path(key);
        let mut merged = extra.clone();
        merged.extend(settings.iter().map(|(k, v)| (k.clone(), v.clone())));

        let bytes = serialize_for(&path, merged)?;
        if fs::read(&path).is_ok_and(|current| current == bytes) {
            self.record_digest(key, &bytes);
            return Ok(path);
        }

        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.conf_root.clone());
        fs::create_dir_all(&dir)?;

        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_CONFIG_PREFIX)
            .suffix(TEMP_CONFIG_SUFFIX)
            .tempfile_in(&dir)?;
        temp.write_all(&bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(&path)?;
        self.record_digest(key, &bytes);

        debug!("Wrote config for '{key}' to {}", path.display());
        Ok(path)
    }

    /// Deletes the config file of `key`. A missing file is not an error.
    pub fn remove(&self, key: &ServiceKey) -> Result<(), InstanceError> {
        self.lock_digests().remove(key);
        let path = self.config_path(key);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("Removed config for '{key}' ({})", path.display());
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Digest of the content last written or reconciled for `key`.
    pub fn last_digest(&self, key: &ServiceKey) -> Option<String> {
        self.lock_digests().get(key).cloned()
    }

    /// Marks the current file content of `key` as reconciled.
    pub fn mark_reconciled(&self, key: &ServiceKey) -> Result<(), InstanceError> {
        match fs::read(self.config_path(key)) {
            Ok(bytes) => {
                self.record_digest(key, &bytes);
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.lock_digests().remove(key);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn record_digest(&self, key: &ServiceKey, bytes: &[u8]) {
        self.lock_digests().insert(*key, content_digest(bytes));
    }

    fn lock_digests(&self) -> std::sync::MutexGuard<'_, HashMap<ServiceKey, String>> {
        self.digests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Brings the files of one type in line with its configuration and returns
    /// the keys that should be running.
    pub fn sync(
        &self,
        service: ServiceType,
        config: &ServiceTypeConfig,
    ) -> Result<Vec<ServiceKey>, InstanceError> {
        let keys = self.prune(service, config)?;
        for key in &keys {
            if let Some(settings) = settings_for(key, config) {
                self.write(key, settings, &config.extra)?;
            }
        }
        Ok(keys)
    }

    /// Deletes the files that must not exist and returns the enabled keys.
    ///
    /// Disabled rows, rows that no longer exist and disabled types all lose
    /// their files, so an indiscriminate bulk start cannot pick them up.
    pub fn prune(
        &self,
        service: ServiceType,
        config: &ServiceTypeConfig,
    ) -> Result<Vec<ServiceKey>, InstanceError> {
        if !service.is_multi_instance() {
            let key = ServiceKey::singleton(service);
            if config.enabled {
                return Ok(vec![key]);
            }
            self.remove(&key)?;
            return Ok(Vec::new());
        }

        let mut enabled = Vec::new();
        for row in &config.instances {
            let key = ServiceKey::instance(service, row.id);
            if config.enabled && !row.disabled {
                enabled.push(key);
            } else {
                self.remove(&key)?;
            }
        }

        let keep: BTreeSet<InstanceId> = enabled.iter().filter_map(|key| key.instance).collect();
        for id in self.existing_ids(service)? {
            if !keep.contains(&id) {
                self.remove(&ServiceKey::instance(service, id))?;
            }
        }

        Ok(enabled)
    }

    /// Ids of every config file currently present for a multi-instance type.
    pub fn existing_ids(&self, service: ServiceType) -> Result<Vec<InstanceId>, InstanceError> {
        let dir = self.conf_root.join(service.as_ref());
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if has_extension(&path, service.config_extension())
                && let Some(id) = id_from_file_name(&path)
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Maps a config file path back to the key that owns it.
    pub fn key_for_path(&self, path: &Path) -> Option<ServiceKey> {
        let parent = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|name| name.to_str())
            .and_then(|name| ServiceType::from_str(name).ok());

        if let Some(service) = parent
            && service.is_multi_instance()
        {
            return (has_extension(path, service.config_extension()))
                .then(|| id_from_file_name(path))
                .flatten()
                .map(|id| ServiceKey::instance(service, id));
        }

        let service = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| ServiceType::from_str(stem).ok())?;
        (!service.is_multi_instance() && has_extension(path, service.config_extension()))
            .then(|| ServiceKey::singleton(service))
    }
}

/// Hex SHA-256 of a config file's content.
pub fn content_digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Settings row backing `key`, if the configuration has one.
pub fn settings_for<'a>(key: &ServiceKey, config: &'a ServiceTypeConfig) -> Option<&'a Settings> {
    match key.instance {
        Some(id) => config.instance(id).map(|row| &row.settings),
        None => Some(&config.settings),
    }
}

/// Parses the numeric stem of an instance config file (`/conf/frpserver/3.toml` -> 3).
pub fn id_from_file_name(path: &Path) -> Option<InstanceId> {
    path.file_stem()?.to_str()?.parse().ok()
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ext)
}

fn serialize_for(path: &Path, settings: Settings) -> Result<Vec<u8>, InstanceError> {
    if has_extension(path, "json") {
        let mut bytes = serde_json::to_vec_pretty(&Value::Object(settings))?;
        bytes.push(b'\n');
        Ok(bytes)
    } else {
        Ok(toml::to_string(&Value::Object(settings))?.into_bytes())
    }
}
