//! Cgroup v2 resource limits.
//!
//! Containers with any limit configured get their own cgroup below
//! `<cgroup root>/vessel/<container id>`; the init PID is placed into it
//! before the sync pipe releases the child, so user code never runs
//! without its limits.

use crate::error::Error;
use anyhow::{Context, Result};
use derive_builder::Builder;
use getset::CopyGetters;
use log::{debug, trace};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Mount point of the unified cgroup hierarchy.
const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Subtree below the cgroup root owned by this runtime.
const CGROUP_SUBTREE: &str = "vessel";

/// Controllers that must be enabled for containers with limits.
const REQUIRED_CONTROLLERS: &[&str] = &["cpu", "memory", "pids"];

#[derive(Builder, Clone, Copy, CopyGetters, Debug)]
#[builder(default, pattern = "owned")]
/// Resource limits lowered into cgroup v2 controller files.
pub struct CgroupLimits {
    #[get_copy = "pub"]
    #[builder(setter(strip_option))]
    /// Memory limit in bytes (`memory.max`).
    memory_bytes: Option<i64>,

    #[get_copy = "pub"]
    #[builder(setter(strip_option))]
    /// Memory plus swap limit in bytes; negative means unlimited swap.
    memory_swap_bytes: Option<i64>,

    #[get_copy = "pub"]
    #[builder(setter(strip_option))]
    /// CPU quota in microseconds per period (`cpu.max`).
    cpu_quota_us: Option<i64>,

    #[get_copy = "pub"]
    /// CPU period in microseconds.
    cpu_period_us: i64,

    #[get_copy = "pub"]
    #[builder(setter(strip_option))]
    /// Maximum number of PIDs (`pids.max`).
    pids_limit: Option<i64>,
}

impl Default for CgroupLimits {
    fn default() -> Self {
        Self {
            memory_bytes: None,
            memory_swap_bytes: None,
            cpu_quota_us: None,
            cpu_period_us: 100_000,
            pids_limit: None,
        }
    }
}

impl CgroupLimits {
    /// Assemble limits from raw configuration values.
    pub fn from_parts(
        memory_bytes: Option<i64>,
        memory_swap_bytes: Option<i64>,
        cpu_quota_us: Option<i64>,
        cpu_period_us: i64,
        pids_limit: Option<i64>,
    ) -> Self {
        Self {
            memory_bytes,
            memory_swap_bytes,
            cpu_quota_us,
            cpu_period_us,
            pids_limit,
        }
    }

    /// Whether any limit is configured at all.
    pub fn any(&self) -> bool {
        self.memory_bytes.is_some() || self.cpu_quota_us.is_some() || self.pids_limit.is_some()
    }

    /// The `memory.swap.max` value: swap is what remains after the memory
    /// limit, a negative configuration means unlimited.
    fn swap_max(&self) -> Option<String> {
        let swap = self.memory_swap_bytes?;
        if swap < 0 {
            return Some("max".into());
        }
        let memory = self.memory_bytes.unwrap_or(0);
        Some((swap - memory).max(0).to_string())
    }
}

#[derive(Clone, Debug)]
/// Manager for the runtime's cgroup subtree.
pub struct CgroupManager {
    root: PathBuf,
}

impl Default for CgroupManager {
    fn default() -> Self {
        Self::with_root(DEFAULT_CGROUP_ROOT)
    }
}

impl CgroupManager {
    /// Use an alternative cgroup root, mainly for tests.
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().into(),
        }
    }

    /// Whether the unified cgroup v2 hierarchy is mounted.
    pub fn supported(&self) -> bool {
        self.root.join("cgroup.controllers").exists()
    }

    /// Verify that all required controllers are available.
    pub fn validate_controllers(&self) -> Result<()> {
        let path = self.root.join("cgroup.controllers");
        let controllers = fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        let available: Vec<&str> = controllers.split_whitespace().collect();

        for required in REQUIRED_CONTROLLERS {
            if !available.contains(required) {
                return Err(Error::ResourceUnavailable(format!(
                    "cgroup controller {} not enabled",
                    required
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Create the container cgroup and apply the limits. Returns the path
    /// of the created cgroup.
    pub fn create(&self, container_id: &str, limits: &CgroupLimits) -> Result<PathBuf> {
        self.validate_controllers()?;

        let path = self.root.join(CGROUP_SUBTREE).join(container_id);
        fs::create_dir_all(&path)
            .with_context(|| format!("create cgroup {}", path.display()))?;

        if let Some(memory) = limits.memory_bytes() {
            write_control(&path, "memory.max", &memory.to_string())?;
        }
        if let Some(swap_max) = limits.swap_max() {
            write_control(&path, "memory.swap.max", &swap_max)?;
        }
        if let Some(quota) = limits.cpu_quota_us() {
            write_control(
                &path,
                "cpu.max",
                &format!("{} {}", quota, limits.cpu_period_us()),
            )?;
        }
        if let Some(pids) = limits.pids_limit() {
            write_control(&path, "pids.max", &pids.to_string())?;
        }

        debug!("Created cgroup {}", path.display());
        Ok(path)
    }

    /// Place a PID into the cgroup.
    pub fn add_process(&self, cgroup_path: &Path, pid: i32) -> Result<()> {
        trace!("Placing PID {} into {}", pid, cgroup_path.display());
        write_control(cgroup_path, "cgroup.procs", &pid.to_string())
    }

    /// Remove the cgroup directory. Absence is success.
    pub fn destroy(&self, cgroup_path: &Path) -> Result<()> {
        match fs::remove_dir(cgroup_path) {
            Ok(()) => {
                debug!("Removed cgroup {}", cgroup_path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove cgroup {}", cgroup_path.display())),
        }
    }
}

fn write_control(cgroup: &Path, file: &str, value: &str) -> Result<()> {
    let path = cgroup.join(file);
    trace!("Writing {} to {}", value, path.display());
    fs::write(&path, value).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager_with_controllers(controllers: &str) -> Result<(TempDir, CgroupManager)> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("cgroup.controllers"), controllers)?;
        let manager = CgroupManager::with_root(dir.path());
        Ok((dir, manager))
    }

    #[test]
    fn unsupported_root_detected() -> Result<()> {
        let dir = TempDir::new()?;
        let manager = CgroupManager::with_root(dir.path());
        assert!(!manager.supported());
        Ok(())
    }

    #[test]
    fn missing_controller_is_unavailable() -> Result<()> {
        let (_dir, manager) = manager_with_controllers("cpu io")?;
        let err = manager.validate_controllers().unwrap_err();
        assert!(err.to_string().contains("memory"));
        Ok(())
    }

    #[test]
    fn create_writes_limit_files() -> Result<()> {
        let (dir, manager) = manager_with_controllers("cpuset cpu io memory pids")?;

        let limits = CgroupLimitsBuilder::default()
            .memory_bytes(512 * 1024 * 1024)
            .memory_swap_bytes(768 * 1024 * 1024)
            .cpu_quota_us(50_000)
            .pids_limit(64)
            .build()?;
        let path = manager.create("abc123", &limits)?;

        assert_eq!(path, dir.path().join("vessel/abc123"));
        assert_eq!(fs::read_to_string(path.join("memory.max"))?, "536870912");
        assert_eq!(
            fs::read_to_string(path.join("memory.swap.max"))?,
            (256 * 1024 * 1024).to_string()
        );
        assert_eq!(fs::read_to_string(path.join("cpu.max"))?, "50000 100000");
        assert_eq!(fs::read_to_string(path.join("pids.max"))?, "64");
        Ok(())
    }

    #[test]
    fn negative_swap_is_unlimited() -> Result<()> {
        let (_dir, manager) = manager_with_controllers("cpu memory pids")?;

        let limits = CgroupLimitsBuilder::default()
            .memory_bytes(1024)
            .memory_swap_bytes(-1)
            .build()?;
        let path = manager.create("abc", &limits)?;
        assert_eq!(fs::read_to_string(path.join("memory.swap.max"))?, "max");
        Ok(())
    }

    #[test]
    fn swap_below_memory_clamps_to_zero() {
        let limits = CgroupLimitsBuilder::default()
            .memory_bytes(1024)
            .memory_swap_bytes(512)
            .build()
            .expect("build limits");
        assert_eq!(limits.swap_max(), Some("0".into()));
    }

    #[test]
    fn add_process_appends_pid() -> Result<()> {
        let (_dir, manager) = manager_with_controllers("cpu memory pids")?;
        let limits = CgroupLimitsBuilder::default().pids_limit(8).build()?;
        let path = manager.create("abc", &limits)?;

        manager.add_process(&path, 4242)?;
        assert_eq!(fs::read_to_string(path.join("cgroup.procs"))?, "4242");
        Ok(())
    }

    #[test]
    fn destroy_is_idempotent() -> Result<()> {
        let (_dir, manager) = manager_with_controllers("cpu memory pids")?;
        let limits = CgroupLimitsBuilder::default().pids_limit(8).build()?;
        let path = manager.create("abc", &limits)?;

        // cgroupfs directories are removed with rmdir; mimic an empty one.
        for entry in fs::read_dir(&path)? {
            fs::remove_file(entry?.path())?;
        }
        manager.destroy(&path)?;
        manager.destroy(&path)?;
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn no_limits_means_no_cgroup() {
        let limits = CgroupLimits::default();
        assert!(!limits.any());

        let some = CgroupLimitsBuilder::default()
            .pids_limit(1)
            .build()
            .expect("build limits");
        assert!(some.any());
    }
}
