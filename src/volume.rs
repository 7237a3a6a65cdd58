//! Named volumes and the container mount planner.
//!
//! Volumes live at `<root>/volumes/<name>/_data` with a JSON registry in
//! `volumes.json`. The planner resolves a container's mount list into the
//! bind mount actions applied inside the container's mount namespace.

use crate::{
    atomic,
    error::{Error, ResourceKind},
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use getset::{CopyGetters, Getters};
use log::debug;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use strum::{AsRefStr, EnumString};
use tokio::sync::RwLock;

/// Data directory below each volume.
const DATA_DIR: &str = "_data";

/// Maximum volume name length.
const MAX_NAME_LEN: usize = 64;

#[derive(
    AsRefStr, Clone, Copy, Debug, Deserialize, EnumString, Eq, PartialEq, Serialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
/// The kind of a container mount.
pub enum MountType {
    Bind,
    Volume,
}

#[derive(Clone, CopyGetters, Debug, Deserialize, Eq, Getters, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
/// A mount requested for a container.
pub struct Mount {
    #[get_copy = "pub"]
    #[serde(rename = "type")]
    mount_type: MountType,

    #[get = "pub"]
    /// Host path (bind) or volume name (volume).
    source: String,

    #[get = "pub"]
    /// Absolute target path inside the container.
    target: String,

    #[get_copy = "pub"]
    #[serde(default)]
    read_only: bool,
}

impl Mount {
    /// Parse the CLI `SRC:DST[:ro]` form; an absolute source is a bind
    /// mount, everything else a named volume.
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = || Error::InvalidConfig(format!("invalid mount: {}", spec));

        let parts: Vec<&str> = spec.split(':').collect();
        let (source, target, read_only) = match parts.as_slice() {
            [source, target] => (*source, *target, false),
            [source, target, "ro"] => (*source, *target, true),
            [source, target, "rw"] => (*source, *target, false),
            _ => return Err(invalid().into()),
        };

        if source.is_empty() || !target.starts_with('/') {
            return Err(invalid().into());
        }

        let mount_type = if source.starts_with('/') {
            MountType::Bind
        } else {
            validate_name(source)?;
            MountType::Volume
        };

        Ok(Self {
            mount_type,
            source: source.into(),
            target: target.into(),
            read_only,
        })
    }
}

/// Check a volume name against `^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$`.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_alphanumeric())
            .unwrap_or(false)
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidConfig(format!("invalid volume name: {}", name)).into())
    }
}

#[derive(Clone, Debug, Deserialize, Getters, Serialize)]
#[serde(rename_all = "camelCase")]
/// A registered named volume.
pub struct Volume {
    #[get = "pub"]
    name: String,

    #[get = "pub"]
    created_at: DateTime<Utc>,
}

#[derive(Debug)]
/// Store for named volumes, registry writes serialized by an in-process
/// lock.
pub struct VolumeStore {
    volumes_dir: PathBuf,
    containers_dir: PathBuf,
    lock: RwLock<()>,
}

impl VolumeStore {
    /// Open the store; `containers_dir` is consulted for in-use checks.
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(volumes_dir: P, containers_dir: Q) -> Result<Self> {
        fs::create_dir_all(&volumes_dir).context("create volumes directory")?;
        Ok(Self {
            volumes_dir: volumes_dir.as_ref().into(),
            containers_dir: containers_dir.as_ref().into(),
            lock: RwLock::new(()),
        })
    }

    fn registry_path(&self) -> PathBuf {
        self.volumes_dir.join("volumes.json")
    }

    /// Path of a volume's data directory.
    pub fn data_path(&self, name: &str) -> PathBuf {
        self.volumes_dir.join(name).join(DATA_DIR)
    }

    fn load(&self) -> Result<BTreeMap<String, Volume>> {
        match fs::read(self.registry_path()) {
            Ok(bytes) => serde_json::from_slice(&bytes).context("parse volumes.json"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e).context("read volumes.json"),
        }
    }

    fn save(&self, registry: &BTreeMap<String, Volume>) -> Result<()> {
        atomic::write_json(self.registry_path(), registry).context("persist volumes.json")
    }

    /// Create a volume. Fails when the name is taken.
    pub async fn create(&self, name: &str) -> Result<Volume> {
        validate_name(name)?;
        let _guard = self.lock.write().await;

        let mut registry = self.load()?;
        if registry.contains_key(name) {
            return Err(Error::already_exists(ResourceKind::Volume, name).into());
        }

        fs::create_dir_all(self.data_path(name)).context("create volume data directory")?;
        let volume = Volume {
            name: name.into(),
            created_at: Utc::now(),
        };
        registry.insert(name.into(), volume.clone());
        self.save(&registry)?;
        debug!("Created volume {}", name);
        Ok(volume)
    }

    /// Create the volume unless it exists, returning its data path either
    /// way. Used by the mount planner for auto-created volumes.
    pub async fn ensure(&self, name: &str) -> Result<PathBuf> {
        match self.create(name).await {
            Ok(_) => {}
            Err(e) if e.downcast_ref::<Error>().map_or(false, |e| {
                matches!(e, Error::AlreadyExists { .. })
            }) => {}
            Err(e) => return Err(e),
        }
        Ok(self.data_path(name))
    }

    /// Look up a volume by name.
    pub async fn get(&self, name: &str) -> Result<Volume> {
        let _guard = self.lock.read().await;
        self.load()?
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(ResourceKind::Volume, name).into())
    }

    /// Whether a volume exists.
    pub async fn exists(&self, name: &str) -> Result<bool> {
        let _guard = self.lock.read().await;
        Ok(self.load()?.contains_key(name))
    }

    /// All volumes, sorted by name.
    pub async fn list(&self) -> Result<Vec<Volume>> {
        let _guard = self.lock.read().await;
        Ok(self.load()?.into_iter().map(|(_, v)| v).collect())
    }

    /// Delete a volume. Deleting an unknown volume succeeds; deleting one
    /// referenced by any container configuration (stopped included) is
    /// refused.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let _guard = self.lock.write().await;
        let mut registry = self.load()?;
        if !registry.contains_key(name) {
            return Ok(());
        }

        if let Some(container) = self.referencing_container(name)? {
            return Err(Error::InvalidState(format!(
                "volume {} is in use by container {}",
                name, container
            ))
            .into());
        }

        registry.remove(name);
        self.save(&registry)?;
        fs::remove_dir_all(self.volumes_dir.join(name)).context("remove volume directory")?;
        debug!("Deleted volume {}", name);
        Ok(())
    }

    /// Scan container configurations for a reference to the volume.
    fn referencing_container(&self, name: &str) -> Result<Option<String>> {
        let entries = match fs::read_dir(&self.containers_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("read containers directory"),
        };

        for entry in entries.flatten() {
            let config_path = entry.path().join("config.json");
            let bytes = match fs::read(&config_path) {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
            // Only the mount list matters here.
            #[derive(Deserialize)]
            struct PartialConfig {
                #[serde(default)]
                mounts: Vec<Mount>,
            }
            let config: PartialConfig = match serde_json::from_slice(&bytes) {
                Ok(config) => config,
                Err(_) => continue,
            };

            let used = config.mounts.iter().any(|m| {
                m.mount_type() == MountType::Volume && m.source() == name
            });
            if used {
                return Ok(Some(entry.file_name().to_string_lossy().into_owned()));
            }
        }
        Ok(None)
    }
}

#[derive(Clone, CopyGetters, Debug, Deserialize, Eq, Getters, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
/// A fully resolved bind mount ready to be applied below the rootfs.
pub struct ResolvedMount {
    #[get = "pub"]
    /// Absolute source path on the host.
    source: PathBuf,

    #[get = "pub"]
    /// Target path inside the container (absolute).
    target: String,

    #[get_copy = "pub"]
    read_only: bool,
}

/// Resolve the container's mount list: volume names become their data
/// paths (auto-created), bind sources are validated to be absolute.
pub async fn plan_mounts(store: &VolumeStore, mounts: &[Mount]) -> Result<Vec<ResolvedMount>> {
    let mut resolved = Vec::with_capacity(mounts.len());
    for mount in mounts {
        let source = match mount.mount_type() {
            MountType::Bind => {
                let path = PathBuf::from(mount.source());
                if !path.is_absolute() {
                    return Err(Error::InvalidConfig(format!(
                        "bind source must be absolute: {}",
                        mount.source()
                    ))
                    .into());
                }
                path
            }
            MountType::Volume => store
                .ensure(mount.source())
                .await
                .with_context(|| format!("ensure volume {}", mount.source()))?,
        };
        resolved.push(ResolvedMount {
            source,
            target: mount.target().clone(),
            read_only: mount.read_only(),
        });
    }
    Ok(resolved)
}
