//! Network namespace helpers and structures.
//!
//! Namespace switches are pinned to a dedicated blocking thread: the
//! thread enters the target namespace, drives the provided future on its
//! own current-thread runtime (so no task migrates off while switched),
//! and restores the original namespace on every exit path.

use anyhow::{Context, Result};
use log::trace;
use nix::sched::{setns, CloneFlags};
use std::{
    fs::{self, File},
    future::Future,
    os::unix::io::{AsRawFd, RawFd},
    path::{Path, PathBuf},
};
use tokio::task;

#[derive(Debug)]
/// A basic network namespace abstraction.
pub struct Namespace {
    /// The current namespace as File.
    current: File,

    /// The target namespace as File.
    target: File,
}

impl Namespace {
    /// Open the network namespace of the given process.
    pub fn of_pid(pid: i32) -> Result<Self> {
        Self::new(format!("/proc/{}/ns/net", pid))
    }

    /// Create a new namespace handle from a namespace file path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let current = File::open(Self::current_thread_namespace_path())
            .context("open current thread namespace file")?;

        let target = File::open(&path).with_context(|| {
            format!("open target namespace file {}", path.as_ref().display())
        })?;

        Ok(Self { current, target })
    }

    /// Run a future inside this network namespace.
    ///
    /// `fun` is invoked on the pinned thread after the switch, so resources
    /// it creates (netlink sockets in particular) belong to the target
    /// namespace.
    pub async fn run<F, Fut, T>(&self, fun: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>>,
        T: Send + 'static,
    {
        let current_fd = self.current.as_raw_fd();
        let target_fd = self.target.as_raw_fd();

        task::spawn_blocking(move || {
            trace!("Switching to target namespace");
            Self::switch_namespace(target_fd)?;

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("build namespace runtime")?;
            let result = runtime.block_on(fun());

            // Switch back before the thread returns to the blocking pool.
            trace!("Switching back to host network namespace");
            Self::switch_namespace(current_fd).context("restore host network namespace")?;

            result
        })
        .await
        .context("spawn namespace thread")?
    }

    /// Switch the network namespace to the provided raw file descriptor.
    fn switch_namespace(fd: RawFd) -> Result<()> {
        setns(fd, CloneFlags::CLONE_NEWNET).context("switch to network namespace")?;
        Ok(())
    }

    /// Returns the current threads network namespace identifier.
    pub fn current_thread_namespace() -> Result<PathBuf> {
        fs::read_link(Self::current_thread_namespace_path())
            .context("get current thread network namespace")
    }

    /// Retrieve the current network namespace path of the thread.
    pub fn current_thread_namespace_path() -> &'static str {
        "/proc/thread-self/ns/net"
    }
}
