//! Exec engine: run an additional command inside a running container.
//!
//! `setns` into a mount namespace requires a single threaded process, so
//! the async CLI never switches itself. It re-executes the own binary
//! behind the `__VESSEL_EXEC_PID` sentinel; that helper (still single
//! threaded, before any runtime starts) enters the target namespaces,
//! forks and execs the command, and forwards the exit code.

use crate::{
    container::{init, runner::EXIT_EXEC_FAILURE},
    error::Error,
    state::{ContainerStatus, StateStore},
};
use anyhow::{bail, Context, Result};
use log::debug;
use nix::{
    fcntl::{open, OFlag},
    pty::openpty,
    sched::{setns, CloneFlags},
    sys::{
        stat::Mode,
        wait::{waitpid, WaitStatus},
    },
    unistd::{chdir, close, dup2, execvpe, fork, setsid, ForkResult},
};
use std::{
    collections::BTreeMap,
    env,
    ffi::CString,
    fs::File,
    io::{Read, Write},
    os::unix::io::{FromRawFd, RawFd},
    process::Stdio,
};

/// PID of the container init whose namespaces the helper enters.
pub const ENV_EXEC_PID: &str = "__VESSEL_EXEC_PID";

/// Set when the exec helper should allocate a PTY.
pub const ENV_EXEC_TTY: &str = "__VESSEL_EXEC_TTY";

/// Namespaces entered by the helper. The mount namespace switches last
/// because `/proc` paths of the target become unreachable afterwards; the
/// PID namespace only affects children, which is why the helper forks.
const NAMESPACES: &[(&str, CloneFlags)] = &[
    ("ipc", CloneFlags::CLONE_NEWIPC),
    ("uts", CloneFlags::CLONE_NEWUTS),
    ("net", CloneFlags::CLONE_NEWNET),
    ("pid", CloneFlags::CLONE_NEWPID),
    ("cgroup", CloneFlags::CLONE_NEWCGROUP),
    ("mnt", CloneFlags::CLONE_NEWNS),
];

/// CLI side: validate the container and run the helper process, wiring
/// through the caller's stdio. Returns the command's exit code.
pub async fn exec(
    store: &StateStore,
    id_or_prefix: &str,
    command: &[String],
    tty: bool,
    interactive: bool,
) -> Result<i32> {
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
    if command.is_empty() {
        return Err(Error::InvalidConfig("no command to execute".into()).into());
    }

    debug!("Executing {:?} in container {}", command, state.id);
    let mut child = tokio::process::Command::new("/proc/self/exe")
        .args(command)
        .env(ENV_EXEC_PID, pid.to_string())
        .env(ENV_EXEC_TTY, if tty { "1" } else { "0" })
        .stdin(if interactive {
            Stdio::inherit()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .context("spawn exec helper")?;

    let status = child.wait().await.context("wait for exec helper")?;
    Ok(status.code().unwrap_or(EXIT_EXEC_FAILURE))
}

/// Helper entry point, dispatched from `main` before any runtime starts.
pub fn run() -> i32 {
    match run_inner() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            EXIT_EXEC_FAILURE
        }
    }
}

fn run_inner() -> Result<i32> {
    let pid: i32 = env::var(ENV_EXEC_PID)
        .context("missing exec PID variable")?
        .parse()
        .context("parse exec PID")?;
    let tty = env::var(ENV_EXEC_TTY).map(|v| v == "1").unwrap_or(false);

    let command: Vec<String> = env::args().skip(1).collect();
    if command.is_empty() {
        bail!("no command to execute");
    }

    enter_namespaces(pid).context("enter container namespaces")?;

    let argv: Vec<CString> = command
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<std::result::Result<_, _>>()
        .context("command contains NUL byte")?;
    let env = filtered_environment();

    let pty = if tty {
        Some(openpty(None, None).context("allocate pty")?)
    } else {
        None
    };

    // The fork is what actually lands in the entered PID namespace.
    let child = match unsafe { fork() }.context("fork exec child")? {
        ForkResult::Child => {
            let code = exec_child(&argv, &env, pty.as_ref());
            std::process::exit(code);
        }
        ForkResult::Parent { child } => child,
    };

    if let Some(pty) = &pty {
        close(pty.slave).ok();
        proxy_pty(pty.master);
    }

    let status = loop {
        match waitpid(child, None) {
            Err(nix::errno::Errno::EINTR) => continue,
            other => break other.context("wait for exec child")?,
        }
    };
    Ok(match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        _ => EXIT_EXEC_FAILURE,
    })
}

/// Open all namespace files first, then switch one by one.
fn enter_namespaces(pid: i32) -> Result<()> {
    let mut handles: Vec<(RawFd, CloneFlags)> = vec![];
    for (name, flag) in NAMESPACES {
        let path = format!("/proc/{}/ns/{}", pid, name);
        let fd = open(
            path.as_str(),
            OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .with_context(|| format!("open namespace file {}", path))?;
        handles.push((fd, *flag));
    }

    for (fd, flag) in &handles {
        setns(*fd, *flag).with_context(|| format!("enter namespace {:?}", flag))?;
    }
    for (fd, _) in handles {
        close(fd).ok();
    }
    Ok(())
}

fn filtered_environment() -> Vec<CString> {
    let merged: BTreeMap<String, String> = env::vars()
        .filter(|(k, _)| !k.starts_with(init::ENV_PREFIX))
        .collect();
    merged
        .into_iter()
        .filter_map(|(k, v)| CString::new(format!("{}={}", k, v)).ok())
        .collect()
}

fn exec_child(argv: &[CString], env: &[CString], pty: Option<&nix::pty::OpenptyResult>) -> i32 {
    if chdir("/").is_err() {
        return EXIT_EXEC_FAILURE;
    }
    if let Some(pty) = pty {
        if setsid().is_err() {
            return EXIT_EXEC_FAILURE;
        }
        let slave = pty.slave;
        unsafe {
            if libc::ioctl(slave, libc::TIOCSCTTY as _, 0) < 0 {
                return EXIT_EXEC_FAILURE;
            }
        }
        if dup2(slave, 0).is_err() || dup2(slave, 1).is_err() || dup2(slave, 2).is_err() {
            return EXIT_EXEC_FAILURE;
        }
        close(pty.master).ok();
        if slave > 2 {
            close(slave).ok();
        }
    }

    let _ = execvpe(&argv[0], argv, env);
    EXIT_EXEC_FAILURE
}

/// Copy between the helper's stdio and the PTY master.
fn proxy_pty(master: RawFd) {
    let reader = unsafe { File::from_raw_fd(master) };
    let writer = reader.try_clone();

    std::thread::spawn(move || {
        let mut reader = reader;
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if std::io::stdout().write_all(&buf[..n]).is_err() {
                        break;
                    }
                    let _ = std::io::stdout().flush();
                }
            }
        }
    });

    if let Ok(mut writer) = writer {
        std::thread::spawn(move || {
            let mut buf = [0u8; 8192];
            let mut stdin = std::io::stdin();
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if writer.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{generate_id, ContainerConfigBuilder};
    use tempfile::TempDir;

    #[tokio::test]
    async fn exec_refuses_non_running_container() -> Result<()> {
        let dir = TempDir::new()?;
        let store = StateStore::new(dir.path())?;
        let id = generate_id();
        store.create(
            &ContainerConfigBuilder::default()
                .id(id.clone())
                .command("/bin/sh")
                .hostname("test")
                .build()?,
        )?;

        let err = exec(&store, &id, &["/bin/true".to_string()], false, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not running"));
        Ok(())
    }

    #[tokio::test]
    async fn exec_unknown_container_is_not_found() -> Result<()> {
        let dir = TempDir::new()?;
        let store = StateStore::new(dir.path())?;

        let err = exec(&store, "abcdef", &["/bin/true".to_string()], false, false)
            .await
            .unwrap_err();
        assert!(Error::is_not_found(&err));
        Ok(())
    }

    #[test]
    fn namespace_order_switches_mount_last() {
        assert_eq!(NAMESPACES.last().unwrap().0, "mnt");
        let pid_index = NAMESPACES.iter().position(|(n, _)| *n == "pid").unwrap();
        let mnt_index = NAMESPACES.iter().position(|(n, _)| *n == "mnt").unwrap();
        assert!(pid_index < mnt_index);
    }
}
