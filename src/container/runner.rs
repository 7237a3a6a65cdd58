//! Parent side of the container lifecycle.
//!
//! `run` creates the container directory, prepares rootfs, cgroup and
//! network, clones the re-exec'ed init child behind a sync pipe, promotes
//! the state to `running` and pumps the child's stdio into the log files.
//! Resources acquired before the container reaches `running` are released
//! in reverse order on any failure, so a container that never ran leaves
//! nothing behind.

use crate::{
    cgroup::CgroupManager,
    config::Config,
    container::{init, ContainerConfig},
    error::Error,
    network::{NetworkManager, NetworkMode, NetworkState},
    snapshot::Snapshots,
    state::{ContainerStatus, StateStore},
    volume::{self, VolumeStore},
};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use log::{debug, info, warn};
use nix::{
    fcntl::{open, OFlag},
    sched::CloneFlags,
    sys::{
        signal::{kill, Signal},
        stat::Mode,
        wait::{waitpid, WaitStatus},
    },
    unistd::{close, execve, pipe, write, Pid},
};
use std::{
    ffi::CString,
    fs::File,
    io::{Read, Write as IoWrite},
    os::unix::io::{FromRawFd, RawFd},
    path::PathBuf,
};
use tokio::task;

/// Exit code reported when the user command could not be executed.
pub const EXIT_EXEC_FAILURE: i32 = 127;

/// Size of the stack handed to the cloned child.
const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// Resources acquired during setup, released in reverse order on error.
#[derive(Default)]
struct Acquired {
    snapshot: bool,
    cgroup_path: Option<PathBuf>,
    network_state: Option<NetworkState>,
    child: Option<Pid>,
}

/// Drives the lifecycle of containers for one runtime root.
pub struct Runner {
    config: Config,
    store: StateStore,
    snapshots: Snapshots,
    cgroups: CgroupManager,
}

impl Runner {
    /// Create a runner rooted at the global configuration.
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self {
            store: StateStore::new(config.containers_dir())?,
            snapshots: Snapshots::new(config.snapshots_dir())?,
            cgroups: CgroupManager::default(),
            config,
        })
    }

    /// The state store of this runner.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Create the container directory and run it. Returns the user
    /// command's exit code.
    pub async fn run(&self, container: &ContainerConfig, foreground: bool) -> Result<i32> {
        self.store.create(container).context("create container")?;
        self.execute(container, foreground).await
    }

    /// Run an already created container to completion.
    pub async fn execute(&self, container: &ContainerConfig, foreground: bool) -> Result<i32> {
        let mut acquired = Acquired::default();
        let network = NetworkManager::new(self.config.network_dir())
            .await
            .context("create network manager")?;

        match self
            .setup_and_wait(container, foreground, &network, &mut acquired)
            .await
        {
            Ok(exit_code) => Ok(exit_code),
            Err(e) => {
                self.unwind(container, &network, acquired).await;
                self.store
                    .force_delete(container.id())
                    .unwrap_or_else(|e| warn!("Removing container directory failed: {:#}", e));
                Err(e)
            }
        }
    }

    async fn setup_and_wait(
        &self,
        container: &ContainerConfig,
        foreground: bool,
        network: &NetworkManager,
        acquired: &mut Acquired,
    ) -> Result<i32> {
        let id = container.id().clone();
        let container_dir = self.store.container_dir(&id);

        // Rootfs: either the prepared directory or an overlay snapshot.
        let (rootfs, snapshot_path) = match container.rootfs_path() {
            Some(path) => {
                if !path.is_absolute() || !path.is_dir() {
                    return Err(Error::InvalidConfig(format!(
                        "rootfs is not an absolute directory: {}",
                        path.display()
                    ))
                    .into());
                }
                (path.clone(), None)
            }
            None => {
                let image_ref = container
                    .image_ref()
                    .as_ref()
                    .context("neither rootfs path nor image reference configured")?;
                let images = crate::image::store::ImageStore::new(self.config.images_dir())?;
                let snapshot = self
                    .snapshots
                    .prepare_for_image(&images, &id, image_ref)
                    .context("prepare rootfs snapshot")?;
                acquired.snapshot = true;
                (
                    snapshot.rootfs().clone(),
                    Some(self.snapshots.container_dir(&id)),
                )
            }
        };

        // Resolve volume/bind mounts; init consumes the resolved plan.
        let volumes = VolumeStore::new(self.config.volumes_dir(), self.config.containers_dir())?;
        let resolved = volume::plan_mounts(&volumes, container.mounts())
            .await
            .context("plan container mounts")?;
        crate::atomic::write_json(container_dir.join("mounts.json"), &resolved)
            .context("write resolved mounts")?;
        crate::atomic::write_json(container_dir.join("rootfs.json"), &rootfs)
            .context("write rootfs path")?;

        // Cgroup before the child starts so limits apply from the first
        // instruction of user code.
        if let Some(limits) = container.limits() {
            let path = self
                .cgroups
                .create(&id, &limits)
                .context("create container cgroup")?;
            acquired.cgroup_path = Some(path);
        }

        if container.network() == NetworkMode::Bridge {
            network.ensure_bridge().await.context("ensure bridge")?;
        }

        // Pipes: sync gate plus captured stdio.
        let (sync_read, sync_write) = pipe().context("create sync pipe")?;
        let (stdout_read, stdout_write) = pipe().context("create stdout pipe")?;
        let (stderr_read, stderr_write) = pipe().context("create stderr pipe")?;
        let stdin_fds = if foreground && container.interactive() {
            Some(pipe().context("create stdin pipe")?)
        } else {
            None
        };

        let child = spawn_init(
            &container_dir,
            container.network(),
            sync_read,
            stdout_write,
            stderr_write,
            stdin_fds.map(|(r, _)| r),
        )
        .context("spawn container init")?;
        acquired.child = Some(child);
        info!("Spawned init process {} for container {}", child, id);

        // Parent side of the child-only fds.
        close_quietly(sync_read);
        close_quietly(stdout_write);
        close_quietly(stderr_write);
        if let Some((r, _)) = stdin_fds {
            close_quietly(r);
        }

        // a. Resource limits take effect before the child continues.
        if let Some(path) = &acquired.cgroup_path {
            self.cgroups
                .add_process(path, child.as_raw())
                .context("place child into cgroup")?;
        }

        // b/c. Network endpoint and port mappings exist before the child
        // observes its namespace.
        let network_state = network
            .setup(&id, child.as_raw(), container.network(), container.port_mappings())
            .await
            .context("setup container network")?;
        acquired.network_state = Some(network_state.clone());

        // d. Promote to running.
        self.store.update(&id, |s| {
            s.status = ContainerStatus::Running;
            s.pid = Some(child.as_raw());
            s.started_at = Some(Utc::now());
            s.network_state = Some(network_state.clone());
            s.snapshot_path = snapshot_path.clone();
            s.cgroup_path = acquired.cgroup_path.clone();
        })?;

        // e. Release the child.
        write(sync_write, b"g").context("write to sync pipe")?;
        close_quietly(sync_write);

        // Stream the child's output into the log files.
        let stdout_log = self.store.stdout_log(&id);
        let stderr_log = self.store.stderr_log(&id);
        let out_pump = spawn_pump(stdout_read, stdout_log, foreground, false);
        let err_pump = spawn_pump(stderr_read, stderr_log, foreground, true);
        if let Some((_, w)) = stdin_fds {
            spawn_stdin_pump(w);
        }

        let status = task::spawn_blocking(move || loop {
            match waitpid(child, None) {
                Err(nix::errno::Errno::EINTR) => continue,
                other => break other,
            }
        })
        .await
        .context("join wait task")?
        .context("wait for init process")?;
        acquired.child = None;

        let exit_code = match status {
            WaitStatus::Exited(_, code) => code,
            WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
            other => bail!("unexpected wait status: {:?}", other),
        };
        debug!("Container {} exited with code {}", id, exit_code);

        let _ = out_pump.await;
        let _ = err_pump.await;

        self.store.update(&id, |s| {
            s.status = ContainerStatus::Stopped;
            s.finished_at = Some(Utc::now());
            s.exit_code = Some(exit_code);
        })?;

        // Teardown in reverse acquisition order; failures are logged but
        // never mask the exit code.
        self.teardown(container, network, &network_state).await;

        Ok(exit_code)
    }

    /// Release rootfs snapshot, network and cgroup of an exited container.
    pub async fn teardown(
        &self,
        container: &ContainerConfig,
        network: &NetworkManager,
        network_state: &NetworkState,
    ) {
        let id = container.id();
        if container.image_ref().is_some() {
            if let Err(e) = self.snapshots.remove(id) {
                warn!("Snapshot teardown failed: {:#}", e);
            }
        }
        if let Err(e) = network.teardown(id, network_state).await {
            warn!("Network teardown failed: {:#}", e);
        }
        if let Some(path) = self.store.get(id).ok().and_then(|s| s.cgroup_path) {
            if let Err(e) = self.cgroups.destroy(&path) {
                warn!("Cgroup teardown failed: {:#}", e);
            }
        }
    }

    /// Undo partially acquired resources after a setup failure, newest
    /// first.
    async fn unwind(&self, container: &ContainerConfig, network: &NetworkManager, acquired: Acquired) {
        let id = container.id();
        warn!("Unwinding failed setup of container {}", id);

        if let Some(child) = acquired.child {
            let _ = kill(child, Signal::SIGKILL);
            let _ = waitpid(child, None);
        }
        if let Some(state) = &acquired.network_state {
            if let Err(e) = network.teardown(id, state).await {
                warn!("Network unwind failed: {:#}", e);
            }
        }
        if let Some(path) = &acquired.cgroup_path {
            if let Err(e) = self.cgroups.destroy(path) {
                warn!("Cgroup unwind failed: {:#}", e);
            }
        }
        if acquired.snapshot {
            if let Err(e) = self.snapshots.remove(id) {
                warn!("Snapshot unwind failed: {:#}", e);
            }
        }
    }
}

/// Clone the init child: fresh namespaces, stdio wired to the provided
/// pipe ends, re-exec of the own binary behind the init sentinel.
fn spawn_init(
    container_dir: &std::path::Path,
    mode: NetworkMode,
    sync_read: RawFd,
    stdout_write: RawFd,
    stderr_write: RawFd,
    stdin_read: Option<RawFd>,
) -> Result<Pid> {
    let mut flags = CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWIPC;
    if mode != NetworkMode::Host {
        flags |= CloneFlags::CLONE_NEWNET;
    }

    // Everything the child needs is prepared before the clone; the
    // callback itself only duplicates descriptors and execs.
    let exe = CString::new("/proc/self/exe").expect("static string");
    let argv = vec![CString::new("vessel-init").expect("static string")];
    let mut envp: Vec<CString> = std::env::vars()
        .filter(|(k, _)| !k.starts_with(init::ENV_PREFIX))
        .map(|(k, v)| CString::new(format!("{}={}", k, v)))
        .collect::<std::result::Result<_, _>>()
        .context("build child environment")?;
    envp.push(
        CString::new(format!("{}=1", init::ENV_INIT)).expect("static sentinel"),
    );
    envp.push(
        CString::new(format!(
            "{}={}",
            init::ENV_CONTAINER_DIR,
            container_dir.display()
        ))
        .context("container dir env")?,
    );
    envp.push(
        CString::new(format!("{}={}", init::ENV_SYNC_FD, init::SYNC_FD))
            .expect("static sync fd"),
    );

    let stdin_fd = match stdin_read {
        Some(fd) => fd,
        None => open("/dev/null", OFlag::O_RDONLY, Mode::empty()).context("open /dev/null")?,
    };

    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    let cb = Box::new(|| -> isize {
        // Child context: only async-signal-safe calls until exec.
        if nix::unistd::dup2(stdin_fd, 0).is_err()
            || nix::unistd::dup2(stdout_write, 1).is_err()
            || nix::unistd::dup2(stderr_write, 2).is_err()
            || nix::unistd::dup2(sync_read, init::SYNC_FD).is_err()
        {
            return EXIT_EXEC_FAILURE as isize;
        }
        let _ = execve(&exe, &argv, &envp);
        EXIT_EXEC_FAILURE as isize
    });

    let child = nix::sched::clone(cb, &mut stack, flags, Some(libc::SIGCHLD))
        .context("clone init child")?;

    if stdin_read.is_none() {
        close_quietly(stdin_fd);
    }
    Ok(child)
}

/// Copy a pipe into the log file, optionally mirroring to the runtime's
/// own stdio in foreground mode.
fn spawn_pump(
    read_fd: RawFd,
    log_path: PathBuf,
    mirror: bool,
    is_stderr: bool,
) -> task::JoinHandle<()> {
    task::spawn_blocking(move || {
        // The fd was created by us and is exclusively owned here.
        let mut source = unsafe { File::from_raw_fd(read_fd) };
        let mut log = match std::fs::OpenOptions::new().append(true).open(&log_path) {
            Ok(log) => log,
            Err(e) => {
                warn!("Opening log file {} failed: {}", log_path.display(), e);
                return;
            }
        };

        let mut buf = [0u8; 8192];
        loop {
            match source.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let _ = log.write_all(&buf[..n]);
                    if mirror {
                        if is_stderr {
                            let _ = std::io::stderr().write_all(&buf[..n]);
                        } else {
                            let _ = std::io::stdout().write_all(&buf[..n]);
                            let _ = std::io::stdout().flush();
                        }
                    }
                }
            }
        }
    })
}

/// Forward the runtime's stdin to the container in interactive mode.
fn spawn_stdin_pump(write_fd: RawFd) {
    task::spawn_blocking(move || {
        let mut sink = unsafe { File::from_raw_fd(write_fd) };
        let mut buf = [0u8; 8192];
        let mut stdin = std::io::stdin();
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if sink.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

fn close_quietly(fd: RawFd) {
    let _ = close(fd);
}
