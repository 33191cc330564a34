//! Durable `ServiceKey -> PID` records, one bare-integer file per instance.
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::{
    constants::{PID_FILE_EXTENSION, TEMP_CONFIG_PREFIX, TEMP_CONFIG_SUFFIX, TERM_GRACE_PERIOD},
    error::PidFileError,
    process::terminate_pid,
    service::{ServiceKey, ServiceType},
};

/// PID files live at `<root>/<type>/<id>.pid`, or `<root>/<type>.pid` for
/// singletons.
#[derive(Debug, Clone)]
pub struct PidFileStore {
    root: PathBuf,
    grace: Duration,
}

impl PidFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            grace: TERM_GRACE_PERIOD,
        }
    }

    /// Overrides how long orphans get between SIGTERM and SIGKILL.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the PID files of a multi-instance type.
    pub fn type_dir(&self, service: ServiceType) -> PathBuf {
        self.root.join(service.as_ref())
    }

    /// Location of the PID file for `key`.
    pub fn path(&self, key: &ServiceKey) -> PathBuf {
        match key.instance {
            Some(id) => self
                .type_dir(key.service)
                .join(format!("{id}.{PID_FILE_EXTENSION}")),
            None => self
                .root
                .join(format!("{}.{PID_FILE_EXTENSION}", key.service)),
        }
    }

    /// Records `pid` for `key`, replacing any previous record.
    ///
    /// The record is renamed into place, so a crash never leaves a truncated
    /// file behind.
    pub fn write(&self, key: &ServiceKey, pid: u32) -> Result<(), PidFileError> {
        let path = self.path(key);
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&dir)?;

        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_CONFIG_PREFIX)
            .suffix(TEMP_CONFIG_SUFFIX)
            .tempfile_in(&dir)?;
        temp.write_all(pid.to_string().as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|err| PidFileError::IoError(err.error))?;
        debug!("Recorded PID {pid} for '{key}' at {}", path.display());
        Ok(())
    }

    /// Reads the PID recorded for `key`, if any.
    pub fn read(&self, key: &ServiceKey) -> Result<Option<u32>, PidFileError> {
        read_pid_file(&self.path(key))
    }

    /// Deletes the record for `key`. Removing a missing record is not an error.
    pub fn remove(&self, key: &ServiceKey) -> Result<(), PidFileError> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Lists every recorded key of `service` with its PID.
    pub fn list(&self, service: ServiceType) -> Result<Vec<(ServiceKey, u32)>, PidFileError> {
        let mut records = Vec::new();

        let singleton = ServiceKey::singleton(service);
        match self.read(&singleton) {
            Ok(Some(pid)) => records.push((singleton, pid)),
            Ok(None) => {}
            Err(PidFileError::ParseError { path, contents }) => {
                warn!("Discarding malformed PID file {path}: {contents:?}");
                self.remove(&singleton)?;
            }
            Err(err) => return Err(err),
        }

        let dir = self.type_dir(service);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(records),
            Err(err) => return Err(err.into()),
        };

        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(PID_FILE_EXTENSION) {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse().ok())
            else {
                warn!("Ignoring unexpected PID file {}", path.display());
                continue;
            };

            match read_pid_file(&path) {
                Ok(Some(pid)) => records.push((ServiceKey::instance(service, id), pid)),
                Ok(None) => {}
                Err(err) => warn!("Ignoring unreadable PID file {}: {err}", path.display()),
            }
        }

        records.sort();
        Ok(records)
    }

    /// Terminates the process recorded for `key` (if still alive) and deletes
    /// the record.
    pub fn kill_recorded(&self, key: &ServiceKey) -> Result<Option<u32>, PidFileError> {
        let pid = match self.read(key) {
            Ok(pid) => pid,
            Err(PidFileError::ParseError { path, contents }) => {
                warn!("Discarding malformed PID file {path}: {contents:?}");
                None
            }
            Err(err) => return Err(err),
        };

        if let Some(pid) = pid {
            terminate_pid(pid, &key.to_string(), self.grace)?;
        }
        self.remove(key)?;
        Ok(pid)
    }

    /// Kills every process recorded under `service` and deletes the records.
    ///
    /// Must run before a type's fresh start so that processes orphaned by an
    /// unclean shutdown cannot coexist with new ones. Already-exited processes
    /// are tolerated; a failure on one record does not stop the sweep.
    pub fn kill_all_under(&self, service: ServiceType) -> Result<usize, PidFileError> {
        let mut killed = 0;
        for (key, pid) in self.list(service)? {
            match terminate_pid(pid, &key.to_string(), self.grace) {
                Ok(()) => {
                    info!("Cleared leftover process for '{key}' (PID {pid})");
                    killed += 1;
                }
                Err(err) => warn!("Failed to terminate leftover '{key}' (PID {pid}): {err}"),
            }
            self.remove(&key)?;
        }

        // Malformed files are not listed; drop them so they cannot linger.
        if let Ok(entries) = fs::read_dir(self.type_dir(service)) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|ext| ext.to_str()) == Some(PID_FILE_EXTENSION) {
                    let _ = fs::remove_file(path);
                }
            }
        }

        Ok(killed)
    }
}

fn read_pid_file(path: &Path) -> Result<Option<u32>, PidFileError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    contents
        .trim()
        .parse::<u32>()
        .map(Some)
        .map_err(|_| PidFileError::ParseError {
            path: path.display().to_string(),
            contents,
        })
}

#[cfg(test)]
mod tests {
    use std::process::{Command, Stdio};

    use tempfile::tempdir;

    use super::*;
    use crate::process::pid_is_alive;

    #[test]
    fn write_read_remove_round_trip() {
        let dir = tempdir().unwrap();
        let store = PidFileStore::new(dir.path());
        let key = ServiceKey::instance(ServiceType::FrpClient, 7);

        assert_eq!(store.read(&key).unwrap(), None);
        store.write(&key, 4242).unwrap();
        assert_eq!(store.read(&key).unwrap(), Some(4242));
        assert_eq!(
            fs::read_to_string(dir.path().join("frpclient/7.pid")).unwrap(),
            "4242"
        );

        store.remove(&key).unwrap();
        store.remove(&key).unwrap();
        assert_eq!(store.read(&key).unwrap(), None);
    }

    #[test]
    fn singleton_uses_well_known_path() {
        let dir = tempdir().unwrap();
        let store = PidFileStore::new(dir.path());
        let key = ServiceKey::singleton(ServiceType::WebFront);
        assert_eq!(store.path(&key), dir.path().join("webfront.pid"));
    }

    #[test]
    fn malformed_pid_file_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let store = PidFileStore::new(dir.path());
        let key = ServiceKey::singleton(ServiceType::FtpServer);
        fs::write(store.path(&key), "not-a-pid").unwrap();

        assert!(matches!(
            store.read(&key),
            Err(PidFileError::ParseError { .. })
        ));
        assert_eq!(store.kill_recorded(&key).unwrap(), None);
        assert!(!store.path(&key).exists());
    }

    #[test]
    fn truncated_singleton_record_does_not_block_the_sweep() {
        let dir = tempdir().unwrap();
        let store = PidFileStore::new(dir.path());
        let key = ServiceKey::singleton(ServiceType::WebFront);
        fs::write(store.path(&key), "").unwrap();

        assert_eq!(store.kill_all_under(ServiceType::WebFront).unwrap(), 0);
        assert!(!store.path(&key).exists());

        store.write(&key, 4242).unwrap();
        assert_eq!(store.list(ServiceType::WebFront).unwrap(), vec![(key, 4242)]);
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(TEMP_CONFIG_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn kill_all_under_terminates_orphans_and_tolerates_stale_records() {
        let dir = tempdir().unwrap();
        let store = PidFileStore::new(dir.path()).with_grace(Duration::from_secs(1));

        let mut orphan = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let live = ServiceKey::instance(ServiceType::FrpServer, 1);
        let stale = ServiceKey::instance(ServiceType::FrpServer, 2);
        store.write(&live, orphan.id()).unwrap();
        store.write(&stale, 999_999).unwrap();

        let killed = store.kill_all_under(ServiceType::FrpServer).unwrap();
        assert_eq!(killed, 2);
        let status = orphan.wait().unwrap();
        assert!(!status.success());
        assert!(!pid_is_alive(orphan.id()));
        assert!(store.list(ServiceType::FrpServer).unwrap().is_empty());
        assert!(!store.path(&live).exists());
        assert!(!store.path(&stale).exists());
    }
}
