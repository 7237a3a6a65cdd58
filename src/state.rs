//! Per-container on-disk state.
//!
//! Every container owns `<root>/containers/<id>/` with its immutable
//! `config.json`, the mutable OCI-shaped `state.json`, a `lock` file and
//! the log directory. All `state.json` writes happen under an exclusive
//! `flock` on the lock file and are atomically replaced, so readers in
//! other processes never see torn state.

use crate::{
    atomic,
    container::ContainerConfig,
    error::{Error, ResourceKind},
    network::NetworkState,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, trace, warn};
use nix::{
    errno::Errno,
    fcntl::{flock, FlockArg},
    sys::signal::kill,
    unistd::Pid,
};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File, OpenOptions},
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
};

/// OCI runtime state version reported in `state.json`.
const OCI_VERSION: &str = "1.0.2";

/// Minimum length for a short ID lookup.
const MIN_PREFIX_LEN: usize = 3;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
/// Lifecycle status of a container.
pub enum ContainerStatus {
    Creating,
    Running,
    Stopped,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
/// The mutable, OCI-shaped container state (`state.json`).
pub struct ContainerState {
    pub oci_version: String,
    pub id: String,
    pub status: ContainerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    pub bundle: PathBuf,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgroup_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_state: Option<NetworkState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
}

impl ContainerState {
    fn initial(id: &str, bundle: PathBuf, image_ref: Option<String>) -> Self {
        Self {
            oci_version: OCI_VERSION.into(),
            id: id.into(),
            status: ContainerStatus::Creating,
            pid: None,
            bundle,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            cgroup_path: None,
            network_state: None,
            snapshot_path: None,
            image_ref,
        }
    }
}

/// Exclusive advisory lock on a container directory; released on drop.
#[derive(Debug)]
pub struct StateLock {
    _file: File,
}

#[derive(Clone, Debug)]
/// Store over the per-container state directories.
pub struct StateStore {
    containers_dir: PathBuf,
}

impl StateStore {
    /// Open the store, creating the containers directory if missing.
    pub fn new<P: AsRef<Path>>(containers_dir: P) -> Result<Self> {
        fs::create_dir_all(&containers_dir).context("create containers directory")?;
        Ok(Self {
            containers_dir: containers_dir.as_ref().into(),
        })
    }

    /// Directory of a single container.
    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.containers_dir.join(id)
    }

    /// Path of the stdout log file.
    pub fn stdout_log(&self, id: &str) -> PathBuf {
        self.container_dir(id).join("logs").join("stdout.log")
    }

    /// Path of the stderr log file.
    pub fn stderr_log(&self, id: &str) -> PathBuf {
        self.container_dir(id).join("logs").join("stderr.log")
    }

    /// Create the container directory tree and write the initial config
    /// and state. Fails when the ID already exists.
    pub fn create(&self, config: &ContainerConfig) -> Result<PathBuf> {
        let dir = self.container_dir(config.id());
        if dir.exists() {
            return Err(Error::already_exists(ResourceKind::Container, config.id()).into());
        }

        fs::create_dir_all(dir.join("logs")).context("create container directories")?;
        File::create(dir.join("lock")).context("create lock file")?;
        File::create(self.stdout_log(config.id())).context("create stdout log")?;
        File::create(self.stderr_log(config.id())).context("create stderr log")?;

        atomic::write_json(dir.join("config.json"), config).context("write config.json")?;
        let state = ContainerState::initial(
            config.id(),
            dir.clone(),
            config.image_ref().clone(),
        );
        atomic::write_json(dir.join("state.json"), &state).context("write state.json")?;

        debug!("Created container directory {}", dir.display());
        Ok(dir)
    }

    /// Take the container's exclusive flock.
    pub fn lock(&self, id: &str) -> Result<StateLock> {
        let path = self.container_dir(id).join("lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("open lock file {}", path.display()))?;
        flock(file.as_raw_fd(), FlockArg::LockExclusive).context("acquire container lock")?;
        trace!("Locked container {}", id);
        Ok(StateLock { _file: file })
    }

    /// Resolve a full ID or a unique prefix (>= 3 characters) to the full
    /// container ID.
    pub fn resolve_id(&self, id_or_prefix: &str) -> Result<String> {
        if id_or_prefix.len() < MIN_PREFIX_LEN {
            return Err(Error::InvalidConfig(format!(
                "container ID prefix too short: {}",
                id_or_prefix
            ))
            .into());
        }

        let mut matches = vec![];
        for entry in
            fs::read_dir(&self.containers_dir).context("read containers directory")?
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == id_or_prefix {
                return Ok(name);
            }
            if name.starts_with(id_or_prefix) {
                matches.push(name);
            }
        }

        match matches.len() {
            0 => Err(Error::not_found(ResourceKind::Container, id_or_prefix).into()),
            1 => Ok(matches.remove(0)),
            _ => Err(Error::Ambiguous(id_or_prefix.into()).into()),
        }
    }

    /// Load the state of a container (by ID or prefix), running orphan
    /// detection before returning.
    pub fn get(&self, id_or_prefix: &str) -> Result<ContainerState> {
        let id = self.resolve_id(id_or_prefix)?;
        let mut state = self.load_state(&id)?;
        self.detect_orphan(&mut state)?;
        Ok(state)
    }

    /// Load the immutable configuration of a container.
    pub fn config(&self, id: &str) -> Result<ContainerConfig> {
        let path = self.container_dir(id).join("config.json");
        let bytes = fs::read(&path)
            .map_err(|_| Error::not_found(ResourceKind::Container, id))?;
        serde_json::from_slice(&bytes).context("parse config.json")
    }

    fn load_state(&self, id: &str) -> Result<ContainerState> {
        let path = self.container_dir(id).join("state.json");
        let bytes = fs::read(&path)
            .map_err(|_| Error::not_found(ResourceKind::Container, id))?;
        serde_json::from_slice(&bytes).context("parse state.json")
    }

    /// Persist a container state under its flock.
    pub fn save(&self, state: &ContainerState) -> Result<()> {
        let _lock = self.lock(&state.id)?;
        atomic::write_json(
            self.container_dir(&state.id).join("state.json"),
            state,
        )
        .context("write state.json")
    }

    /// Load, mutate and persist a container state in one locked step.
    pub fn update<F: FnOnce(&mut ContainerState)>(&self, id: &str, f: F) -> Result<ContainerState> {
        let _lock = self.lock(id)?;
        let mut state = self.load_state(id)?;
        f(&mut state);
        atomic::write_json(self.container_dir(id).join("state.json"), &state)
            .context("write state.json")?;
        Ok(state)
    }

    /// Whether the container is running, self-healing stale `running`
    /// records whose PID is gone.
    pub fn is_running(&self, id: &str) -> Result<bool> {
        let mut state = self.load_state(id)?;
        self.detect_orphan(&mut state)?;
        Ok(state.status == ContainerStatus::Running)
    }

    /// Rewrite a `running` record whose process no longer exists.
    fn detect_orphan(&self, state: &mut ContainerState) -> Result<()> {
        if state.status != ContainerStatus::Running {
            return Ok(());
        }
        let pid = match state.pid {
            Some(pid) if pid > 0 => pid,
            _ => return Ok(()),
        };

        match kill(Pid::from_raw(pid), None) {
            Err(Errno::ESRCH) => {
                warn!(
                    "Container {} marked running but PID {} is gone, healing state",
                    state.id, pid
                );
                let healed = self.update(&state.id.clone(), |s| {
                    s.status = ContainerStatus::Stopped;
                    s.exit_code = Some(-1);
                    s.finished_at = Some(Utc::now());
                })?;
                *state = healed;
                Ok(())
            }
            // Anything else (alive, or EPERM) counts as running.
            _ => Ok(()),
        }
    }

    /// All containers. Unreadable entries are skipped; non-running
    /// containers are filtered out unless `all` is set.
    pub fn list(&self, all: bool) -> Result<Vec<ContainerState>> {
        let mut result = vec![];
        for entry in
            fs::read_dir(&self.containers_dir).context("read containers directory")?
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            let id = entry.file_name().to_string_lossy().into_owned();
            let mut state = match self.load_state(&id) {
                Ok(state) => state,
                Err(e) => {
                    trace!("Skipping unreadable container {}: {:#}", id, e);
                    continue;
                }
            };
            if self.detect_orphan(&mut state).is_err() {
                continue;
            }
            if all || state.status == ContainerStatus::Running {
                result.push(state);
            }
        }
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(result)
    }

    /// Delete a stopped container. Unknown IDs succeed; running
    /// containers are refused.
    pub fn delete(&self, id: &str) -> Result<()> {
        let dir = self.container_dir(id);
        if !dir.exists() {
            return Ok(());
        }
        if self.is_running(id)? {
            return Err(Error::InvalidState(format!(
                "container {} is running, stop it first or use force",
                id
            ))
            .into());
        }
        fs::remove_dir_all(&dir).context("remove container directory")?;
        debug!("Deleted container {}", id);
        Ok(())
    }

    /// Delete a container directory unconditionally. Idempotent.
    pub fn force_delete(&self, id: &str) -> Result<()> {
        let dir = self.container_dir(id);
        if !dir.exists() {
            return Ok(());
        }
        fs::remove_dir_all(&dir).context("remove container directory")?;
        debug!("Force deleted container {}", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{generate_id, ContainerConfigBuilder};
    use tempfile::TempDir;

    fn store() -> Result<(TempDir, StateStore)> {
        let dir = TempDir::new()?;
        let store = StateStore::new(dir.path())?;
        Ok((dir, store))
    }

    fn config(id: &str) -> ContainerConfig {
        ContainerConfigBuilder::default()
            .id(id)
            .command("/bin/true")
            .hostname(&id[..12.min(id.len())])
            .build()
            .expect("build config")
    }

    #[test]
    fn create_writes_layout() -> Result<()> {
        let (_dir, store) = store()?;
        let id = generate_id();
        let dir = store.create(&config(&id))?;

        assert!(dir.join("config.json").exists());
        assert!(dir.join("state.json").exists());
        assert!(dir.join("lock").exists());
        assert!(dir.join("logs/stdout.log").exists());
        assert!(dir.join("logs/stderr.log").exists());

        let state = store.get(&id)?;
        assert_eq!(state.status, ContainerStatus::Creating);
        assert_eq!(state.oci_version, OCI_VERSION);
        assert_eq!(state.bundle, dir);
        Ok(())
    }

    #[test]
    fn create_twice_fails() -> Result<()> {
        let (_dir, store) = store()?;
        let id = generate_id();
        store.create(&config(&id))?;
        let err = store.create(&config(&id)).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        Ok(())
    }

    #[test]
    fn state_json_is_oci_shaped() -> Result<()> {
        let (_dir, store) = store()?;
        let id = generate_id();
        let dir = store.create(&config(&id))?;

        let raw = fs::read_to_string(dir.join("state.json"))?;
        assert!(raw.contains("\"ociVersion\": \"1.0.2\""));
        assert!(raw.contains("\"status\": \"creating\""));
        assert!(raw.contains("\"createdAt\""));
        Ok(())
    }

    #[test]
    fn prefix_resolution() -> Result<()> {
        let (_dir, store) = store()?;
        let id = generate_id();
        store.create(&config(&id))?;

        assert_eq!(store.resolve_id(&id)?, id);
        assert_eq!(store.resolve_id(&id[..12])?, id);
        assert_eq!(store.resolve_id(&id[..3])?, id);

        let err = store.resolve_id(&id[..2]).unwrap_err();
        assert!(err.to_string().contains("too short"));

        let err = store.resolve_id("ffffff").unwrap_err();
        assert!(Error::is_not_found(&err));
        Ok(())
    }

    #[test]
    fn ambiguous_shared_prefix() -> Result<()> {
        let (_dir, store) = store()?;
        let id_a = format!("abc1{}", &generate_id()[4..]);
        let id_b = format!("abc2{}", &generate_id()[4..]);
        store.create(&config(&id_a))?;
        store.create(&config(&id_b))?;

        let err = store.resolve_id("abc").unwrap_err();
        assert!(err.to_string().contains("ambiguous"));
        Ok(())
    }

    #[test]
    fn update_round_trip() -> Result<()> {
        let (_dir, store) = store()?;
        let id = generate_id();
        store.create(&config(&id))?;

        store.update(&id, |s| {
            s.status = ContainerStatus::Running;
            s.pid = Some(std::process::id() as i32);
            s.started_at = Some(Utc::now());
        })?;

        let state = store.get(&id)?;
        assert_eq!(state.status, ContainerStatus::Running);
        assert!(store.is_running(&id)?);
        Ok(())
    }

    #[test]
    fn orphan_detection_heals_state() -> Result<()> {
        let (_dir, store) = store()?;
        let id = generate_id();
        store.create(&config(&id))?;

        // A PID that can not exist: pid_max on Linux caps at 2^22.
        store.update(&id, |s| {
            s.status = ContainerStatus::Running;
            s.pid = Some(i32::MAX - 1);
        })?;

        let state = store.get(&id)?;
        assert_eq!(state.status, ContainerStatus::Stopped);
        assert_eq!(state.exit_code, Some(-1));
        assert!(state.finished_at.is_some());
        assert!(!store.is_running(&id)?);
        Ok(())
    }

    #[test]
    fn list_filters_non_running() -> Result<()> {
        let (_dir, store) = store()?;
        let stopped = generate_id();
        let running = generate_id();
        store.create(&config(&stopped))?;
        store.create(&config(&running))?;

        store.update(&stopped, |s| s.status = ContainerStatus::Stopped)?;
        store.update(&running, |s| {
            s.status = ContainerStatus::Running;
            s.pid = Some(std::process::id() as i32);
        })?;

        let only_running = store.list(false)?;
        assert_eq!(only_running.len(), 1);
        assert_eq!(only_running[0].id, running);

        let all = store.list(true)?;
        assert_eq!(all.len(), 2);
        Ok(())
    }

    #[test]
    fn delete_rules() -> Result<()> {
        let (_dir, store) = store()?;
        let id = generate_id();
        store.create(&config(&id))?;

        store.update(&id, |s| {
            s.status = ContainerStatus::Running;
            s.pid = Some(std::process::id() as i32);
        })?;
        let err = store.delete(&id).unwrap_err();
        assert!(err.to_string().contains("running"));

        store.update(&id, |s| s.status = ContainerStatus::Stopped)?;
        store.delete(&id)?;
        store.delete(&id)?; // idempotent
        assert!(!store.container_dir(&id).exists());

        store.force_delete("0000000000")?; // unknown, still fine
        Ok(())
    }
}
