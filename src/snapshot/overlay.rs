//! Per-container overlay snapshots.
//!
//! A snapshot overlays the container's extracted layers (read only) with a
//! fresh upper and work directory; the merged mount point becomes the
//! container rootfs. The layer cache is never modified or removed here.

use anyhow::{bail, Context, Result};
use getset::Getters;
use log::{debug, trace, warn};
use nix::{
    errno::Errno,
    mount::{mount, umount, umount2, MntFlags, MsFlags},
};
use std::{
    fs,
    path::{Path, PathBuf},
};

#[derive(Clone, Debug, Getters)]
/// Assembles and removes per-container overlay mounts.
pub struct Snapshotter {
    #[get = "pub"]
    /// Directory holding one snapshot per container.
    containers_dir: PathBuf,
}

#[derive(Clone, Debug, Getters)]
/// A prepared snapshot; `rootfs` is the merged overlay mount point.
pub struct Snapshot {
    #[get = "pub"]
    upper: PathBuf,

    #[get = "pub"]
    work: PathBuf,

    #[get = "pub"]
    rootfs: PathBuf,

    #[get = "pub"]
    lower_layers: Vec<PathBuf>,
}

impl Snapshotter {
    /// Open the snapshotter below the snapshots directory.
    pub fn new<P: AsRef<Path>>(snapshots_dir: P) -> Result<Self> {
        let containers_dir = snapshots_dir.as_ref().join("containers");
        fs::create_dir_all(&containers_dir).context("create snapshot containers directory")?;
        Ok(Self { containers_dir })
    }

    /// Directory of a single container snapshot.
    pub fn snapshot_dir(&self, container_id: &str) -> PathBuf {
        self.containers_dir.join(container_id)
    }

    /// Create upper/work/rootfs for the container and overlay-mount the
    /// given lower layers (bottom first) underneath. Unwinds the snapshot
    /// directory when the mount fails.
    pub fn prepare(&self, container_id: &str, lower_layers: &[PathBuf]) -> Result<Snapshot> {
        if lower_layers.is_empty() {
            bail!("no lower layers for container {}", container_id);
        }

        let dir = self.snapshot_dir(container_id);
        let snapshot = Snapshot {
            upper: dir.join("upper"),
            work: dir.join("work"),
            rootfs: dir.join("rootfs"),
            lower_layers: lower_layers.to_vec(),
        };

        let result = self.mount_snapshot(&snapshot);
        if result.is_err() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                warn!("Unwind of snapshot {} failed: {}", dir.display(), e);
            }
        }
        result.map(|_| snapshot)
    }

    fn mount_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        for dir in [snapshot.upper(), snapshot.work(), snapshot.rootfs()].iter() {
            fs::create_dir_all(dir)
                .with_context(|| format!("create snapshot directory {}", dir.display()))?;
        }

        let options = overlay_options(snapshot.lower_layers(), snapshot.upper(), snapshot.work());
        trace!("Mounting overlay with options: {}", options);

        mount(
            Some("overlay"),
            snapshot.rootfs(),
            Some("overlay"),
            MsFlags::empty(),
            Some(options.as_str()),
        )
        .with_context(|| format!("mount overlay at {}", snapshot.rootfs().display()))?;

        debug!("Mounted overlay rootfs {}", snapshot.rootfs().display());
        Ok(())
    }

    /// Unmount and delete a container snapshot. Removal is idempotent; a
    /// busy mount is lazily detached.
    pub fn remove(&self, container_id: &str) -> Result<()> {
        let dir = self.snapshot_dir(container_id);
        if !dir.exists() {
            return Ok(());
        }

        let rootfs = dir.join("rootfs");
        if rootfs.exists() {
            match umount(&rootfs) {
                Ok(()) => trace!("Unmounted {}", rootfs.display()),
                Err(Errno::EBUSY) => {
                    debug!("Overlay busy, detaching lazily: {}", rootfs.display());
                    umount2(&rootfs, MntFlags::MNT_DETACH)
                        .with_context(|| format!("lazy detach {}", rootfs.display()))?;
                }
                // Not mounted (already torn down) is success.
                Err(Errno::EINVAL) | Err(Errno::ENOENT) => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("unmount {}", rootfs.display()));
                }
            }
        }

        fs::remove_dir_all(&dir)
            .with_context(|| format!("remove snapshot directory {}", dir.display()))?;
        debug!("Removed snapshot {}", container_id);
        Ok(())
    }
}

/// Overlayfs option string; lowerdir lists the topmost layer first.
fn overlay_options(lower_layers: &[PathBuf], upper: &Path, work: &Path) -> String {
    let lowers = lower_layers
        .iter()
        .rev()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":");
    format!(
        "lowerdir={},upperdir={},workdir={}",
        lowers,
        upper.display(),
        work.display()
    )
}
