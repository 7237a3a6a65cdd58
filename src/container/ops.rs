//! Container operations: stop, kill and remove.

use crate::{
    cgroup::CgroupManager,
    config::Config,
    error::Error,
    network::NetworkManager,
    snapshot::Snapshots,
    state::{ContainerStatus, StateStore},
};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use std::{convert::TryFrom, str::FromStr, time::Duration};
use tokio::time::sleep;

/// Default grace period for `stop` before escalating to SIGKILL.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting for a signalled container to exit.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace period after SIGKILL during a forced removal.
const FORCE_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Parse a signal given by name (`SIGTERM`, `TERM`) or number (`15`).
pub fn parse_signal(signal: &str) -> Result<Signal> {
    if let Ok(number) = signal.parse::<i32>() {
        return Signal::try_from(number)
            .map_err(|_| Error::Signal(signal.into()).into());
    }
    let name = signal.to_uppercase();
    let name = if name.starts_with("SIG") {
        name
    } else {
        format!("SIG{}", name)
    };
    Signal::from_str(&name).map_err(|_| Error::Signal(signal.into()).into())
}

/// Send a signal to a container's init process.
pub fn kill_container(store: &StateStore, id_or_prefix: &str, signal: Signal) -> Result<()> {
    let state = store.get(id_or_prefix)?;
    if state.status != ContainerStatus::Running {
        return Err(Error::InvalidState(format!(
            "container {} is not running",
            state.id
        ))
        .into());
    }
    let pid = state
        .pid
        .ok_or_else(|| Error::InvalidState("running container without PID".into()))?;

    debug!("Sending {} to container {} (PID {})", signal, state.id, pid);
    kill(Pid::from_raw(pid), signal).context("send signal")?;
    Ok(())
}

/// Stop a container: SIGTERM, poll until gone or the timeout expires,
/// then SIGKILL. Stopping a stopped container is a no-op.
pub async fn stop(store: &StateStore, id_or_prefix: &str, timeout: Duration) -> Result<()> {
    let state = store.get(id_or_prefix)?;
    if state.status != ContainerStatus::Running {
        debug!("Container {} already stopped", state.id);
        return Ok(());
    }
    let pid = match state.pid {
        Some(pid) => Pid::from_raw(pid),
        None => return Ok(()),
    };

    info!("Stopping container {} (PID {})", state.id, pid);
    match kill(pid, Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => return Err(e).context("send SIGTERM"),
    }

    if wait_for_exit(pid, timeout).await {
        finalize_if_orphaned(store, &state.id)?;
        return Ok(());
    }

    info!("Container {} ignored SIGTERM, killing", state.id);
    match kill(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => return Err(e).context("send SIGKILL"),
    }
    wait_for_exit(pid, FORCE_KILL_TIMEOUT).await;
    finalize_if_orphaned(store, &state.id)?;
    Ok(())
}

/// Remove a container. Without `force` a running container is refused;
/// with `force` it is killed first. Unknown containers succeed.
pub async fn remove(
    config: &Config,
    store: &StateStore,
    id_or_prefix: &str,
    force: bool,
) -> Result<()> {
    let state = match store.get(id_or_prefix) {
        Ok(state) => state,
        Err(e) if Error::is_not_found(&e) => return Ok(()),
        Err(e) => return Err(e),
    };
    let id = state.id.clone();

    if state.status == ContainerStatus::Running {
        if !force {
            return Err(Error::InvalidState(format!(
                "container {} is running, stop it first or use force",
                id
            ))
            .into());
        }
        if let Some(pid) = state.pid {
            let pid = Pid::from_raw(pid);
            match kill(pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!("SIGKILL failed: {}", e),
            }
            wait_for_exit(pid, FORCE_KILL_TIMEOUT).await;
        }
    }

    // Clean up resources a dead supervisor may have leaked.
    release_leftovers(config, store, &id).await;
    store.force_delete(&id)?;
    Ok(())
}

/// Best-effort release of snapshot, network and cgroup referenced by a
/// container's final state.
async fn release_leftovers(config: &Config, store: &StateStore, id: &str) {
    let state = match store.get(id) {
        Ok(state) => state,
        Err(_) => return,
    };

    if state.snapshot_path.is_some() {
        match Snapshots::new(config.snapshots_dir()) {
            Ok(snapshots) => {
                if let Err(e) = snapshots.remove(id) {
                    warn!("Snapshot cleanup failed: {:#}", e);
                }
            }
            Err(e) => warn!("Opening snapshotter failed: {:#}", e),
        }
    }

    if let Some(network_state) = &state.network_state {
        match NetworkManager::new(config.network_dir()).await {
            Ok(network) => {
                if let Err(e) = network.teardown(id, network_state).await {
                    warn!("Network cleanup failed: {:#}", e);
                }
            }
            Err(e) => warn!("Opening network manager failed: {:#}", e),
        }
    }

    if let Some(path) = &state.cgroup_path {
        if let Err(e) = CgroupManager::default().destroy(path) {
            warn!("Cgroup cleanup failed: {:#}", e);
        }
    }
}

/// Poll for process exit; true when the PID disappeared within the
/// timeout.
async fn wait_for_exit(pid: Pid, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if kill(pid, None) == Err(Errno::ESRCH) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Reload the state so orphan detection records the exit if the
/// supervisor is no longer around to do it.
fn finalize_if_orphaned(store: &StateStore, id: &str) -> Result<()> {
    let _ = store.get(id)?;
    Ok(())
}
