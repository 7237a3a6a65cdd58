//! Init side of the container lifecycle.
//!
//! The runtime binary re-executes itself behind the `__VESSEL_INIT`
//! sentinel inside the fresh namespaces. This module is that process: it
//! waits for the parent's "go" byte, pivots into the prepared rootfs,
//! mounts the pseudo filesystems and device nodes, then forks the user
//! command and stays behind as PID 1, reaping zombies and forwarding
//! signals until the command exits.
//!
//! Everything in here is synchronous; the init process never starts an
//! async runtime.

use crate::{
    container::ContainerConfig,
    container::runner::EXIT_EXEC_FAILURE,
    volume::ResolvedMount,
};
use anyhow::{bail, Context, Result};
use nix::{
    errno::Errno,
    mount::{mount, umount2, MntFlags, MsFlags},
    pty::openpty,
    sys::{
        signal::{kill, Signal},
        stat::{makedev, mknod, Mode, SFlag},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{chdir, close, dup2, execvpe, fork, read, sethostname, setsid, ForkResult, Pid},
};
use signal_hook::iterator::Signals;
use std::{
    collections::BTreeMap,
    convert::TryFrom,
    env,
    ffi::CString,
    fs,
    io::{Read as IoRead, Write as IoWrite},
    os::unix::{fs::symlink, io::{FromRawFd, RawFd}},
    path::{Path, PathBuf},
};

/// Prefix shared by all internal coordination variables; everything with
/// this prefix is stripped from the user command's environment.
pub const ENV_PREFIX: &str = "__VESSEL";

/// Sentinel marking the process as container init.
pub const ENV_INIT: &str = "__VESSEL_INIT";

/// Sentinel marking the process as a detached supervisor shim.
pub const ENV_SHIM_DIR: &str = "__VESSEL_SHIM_DIR";

/// Container directory handed to the init process.
pub const ENV_CONTAINER_DIR: &str = "__VESSEL_CONTAINER_DIR";

/// Number of the sync pipe descriptor.
pub const ENV_SYNC_FD: &str = "__VESSEL_SYNC_FD";

/// Fixed descriptor the sync pipe is duplicated onto before exec.
pub const SYNC_FD: RawFd = 3;

/// Default PATH for the user command when the environment has none.
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Signals forwarded to the user command: the whole standard set. As
/// PID 1 of its namespace, init receives no default signal handling from
/// the kernel, so every signal without a handler would be silently
/// dropped instead of reaching the command. SIGCHLD drives the reaper
/// and is handled separately; SIGKILL/SIGSTOP can not be caught, and the
/// synchronous fault signals (SIGILL/SIGFPE/SIGSEGV) must keep their
/// default behavior.
fn forwarded_signals() -> Vec<i32> {
    Signal::iterator()
        .map(|signal| signal as i32)
        .filter(|signal| {
            *signal != signal_hook::consts::SIGCHLD
                && !signal_hook::consts::FORBIDDEN.contains(signal)
        })
        .collect()
}

/// Entry point for the init sentinel; returns the process exit code.
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
    let container_dir = PathBuf::from(
        env::var(ENV_CONTAINER_DIR).context("missing container directory variable")?,
    );
    let config: ContainerConfig = load_json(&container_dir.join("config.json"))?;
    let rootfs: PathBuf = load_json(&container_dir.join("rootfs.json"))?;
    let mounts: Vec<ResolvedMount> = load_json(&container_dir.join("mounts.json"))?;

    // Gate on the parent: cgroup and network must be in place first.
    wait_for_go()?;

    sethostname(config.hostname()).context("set hostname")?;
    setup_rootfs(&rootfs, &mounts).context("setup rootfs")?;

    let env = build_environment(config.env());
    let argv: Vec<CString> = config
        .argv()
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<std::result::Result<_, _>>()
        .context("user command contains NUL byte")?;
    if argv.is_empty() {
        bail!("no command configured");
    }

    // Handlers must exist before the fork so no signal is lost.
    let mut signals = Signals::new(
        forwarded_signals()
            .into_iter()
            .chain(std::iter::once(signal_hook::consts::SIGCHLD)),
    )
    .context("install signal handlers")?;

    let pty = if config.tty() {
        Some(openpty(None, None).context("allocate pty")?)
    } else {
        None
    };

    let child = match unsafe { fork() }.context("fork user command")? {
        ForkResult::Child => {
            let code = exec_user_command(&argv, &env, pty.as_ref());
            std::process::exit(code);
        }
        ForkResult::Parent { child } => child,
    };

    if let Some(pty) = &pty {
        close(pty.slave).ok();
        spawn_pty_proxy(pty.master);
    }

    supervise(child, &mut signals)
}

/// Read the single go byte from the sync pipe; anything else aborts.
fn wait_for_go() -> Result<()> {
    let mut buf = [0u8; 1];
    let n = read(SYNC_FD, &mut buf).context("read sync pipe")?;
    close(SYNC_FD).ok();
    if n != 1 || buf[0] != b'g' {
        bail!("parent aborted before start");
    }
    Ok(())
}

/// Pivot into the prepared rootfs and mount the standard pseudo
/// filesystems and device nodes.
fn setup_rootfs(rootfs: &Path, mounts: &[ResolvedMount]) -> Result<()> {
    // Stop mount events from propagating back to the host.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .context("make / private")?;

    // pivot_root needs the new root to be a mount point.
    mount(
        Some(rootfs),
        rootfs,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .context("bind rootfs onto itself")?;

    // Planner mounts target the new root and survive the pivot as part
    // of its mount tree.
    for resolved in mounts {
        apply_mount(rootfs, resolved)
            .with_context(|| format!("mount {} ", resolved.target()))?;
    }

    let old_root = rootfs.join(".pivot_old");
    fs::create_dir_all(&old_root).context("create pivot_root staging directory")?;
    nix::unistd::pivot_root(rootfs, &old_root).context("pivot_root")?;
    chdir("/").context("chdir to new root")?;
    umount2("/.pivot_old", MntFlags::MNT_DETACH).context("detach old root")?;
    fs::remove_dir("/.pivot_old").context("remove old root staging directory")?;

    mount_pseudo_filesystems()?;
    populate_dev()?;
    Ok(())
}

fn apply_mount(rootfs: &Path, resolved: &ResolvedMount) -> Result<()> {
    let target = rootfs.join(resolved.target().trim_start_matches('/'));
    if resolved.source().is_dir() {
        fs::create_dir_all(&target).context("create mount target")?;
    } else {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).context("create mount target parent")?;
        }
        if !target.exists() {
            fs::File::create(&target).context("create mount target file")?;
        }
    }

    mount(
        Some(resolved.source()),
        &target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .context("bind mount")?;

    if resolved.read_only() {
        mount(
            None::<&str>,
            &target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .context("remount read only")?;
    }
    Ok(())
}

fn mount_pseudo_filesystems() -> Result<()> {
    fs::create_dir_all("/proc").context("create /proc")?;
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .context("mount /proc")?;

    fs::create_dir_all("/sys").context("create /sys")?;
    mount(
        Some("sysfs"),
        "/sys",
        Some("sysfs"),
        MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .context("mount /sys")?;

    fs::create_dir_all("/dev").context("create /dev")?;
    mount(
        Some("tmpfs"),
        "/dev",
        Some("tmpfs"),
        MsFlags::MS_NOSUID,
        Some("mode=755"),
    )
    .context("mount /dev")?;
    Ok(())
}

/// The standard device nodes and stdio symlinks below a fresh /dev.
fn populate_dev() -> Result<()> {
    let devices: &[(&str, u64, u64)] = &[
        ("/dev/null", 1, 3),
        ("/dev/zero", 1, 5),
        ("/dev/full", 1, 7),
        ("/dev/random", 1, 8),
        ("/dev/urandom", 1, 9),
        ("/dev/tty", 5, 0),
    ];
    for (path, major, minor) in devices {
        mknod(
            *path,
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(0o666),
            makedev(*major, *minor),
        )
        .with_context(|| format!("create device node {}", path))?;
    }

    fs::create_dir_all("/dev/pts").context("create /dev/pts")?;
    mount(
        Some("devpts"),
        "/dev/pts",
        Some("devpts"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        Some("newinstance,ptmxmode=0666,mode=0620"),
    )
    .context("mount /dev/pts")?;

    let links = &[
        ("/proc/self/fd/0", "/dev/stdin"),
        ("/proc/self/fd/1", "/dev/stdout"),
        ("/proc/self/fd/2", "/dev/stderr"),
        ("/proc/self/fd", "/dev/fd"),
        ("pts/ptmx", "/dev/ptmx"),
    ];
    for (source, target) in links {
        symlink(source, target).with_context(|| format!("create symlink {}", target))?;
    }
    Ok(())
}

/// Filter internal variables out, keep everything else and overlay the
/// configured `KEY=VALUE` entries.
fn build_environment(extra: &[String]) -> Vec<CString> {
    let mut merged: BTreeMap<String, String> = env::vars()
        .filter(|(k, _)| !k.starts_with(ENV_PREFIX))
        .collect();
    merged
        .entry("PATH".into())
        .or_insert_with(|| DEFAULT_PATH.into());

    for entry in extra {
        if let Some((key, value)) = entry.split_once('=') {
            merged.insert(key.into(), value.into());
        }
    }

    merged
        .into_iter()
        .filter_map(|(k, v)| CString::new(format!("{}={}", k, v)).ok())
        .collect()
}

/// Child half of the fork: attach stdio (to the PTY slave when one was
/// allocated) and exec the user command.
fn exec_user_command(
    argv: &[CString],
    env: &[CString],
    pty: Option<&nix::pty::OpenptyResult>,
) -> i32 {
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
    // Reached only when exec failed.
    EXIT_EXEC_FAILURE
}

/// Copy PTY master output to our stdout and our stdin to the master.
fn spawn_pty_proxy(master: RawFd) {
    let reader = unsafe { fs::File::from_raw_fd(master) };
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

/// PID 1 duty: forward signals to the user command and reap everything
/// until no children remain, then report the user command's exit code.
fn supervise(user: Pid, signals: &mut Signals) -> Result<i32> {
    let mut user_exit: Option<i32> = None;

    'outer: for signal in signals.forever() {
        if signal == signal_hook::consts::SIGCHLD {
            loop {
                match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::Exited(pid, code)) => {
                        if pid == user {
                            user_exit = Some(code);
                        }
                    }
                    Ok(WaitStatus::Signaled(pid, signal, _)) => {
                        if pid == user {
                            user_exit = Some(128 + signal as i32);
                        }
                    }
                    Ok(WaitStatus::StillAlive) => break,
                    Ok(_) => continue,
                    Err(Errno::ECHILD) => {
                        if user_exit.is_some() {
                            break 'outer;
                        }
                        break;
                    }
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(e).context("reap children"),
                }
            }
        } else if let Ok(converted) = Signal::try_from(signal) {
            // Forward everything else to the user command.
            let _ = kill(user, converted);
        }
    }

    Ok(user_exit.unwrap_or(EXIT_EXEC_FAILURE))
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))
}
