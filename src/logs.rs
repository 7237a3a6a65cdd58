//! Log retrieval: plain reads, tail windows and `--follow` streaming.
//!
//! The follower is a select loop over three event sources: filesystem
//! watcher notifications for the log files, a 250 ms ticker that also
//! polls the container state, and the user's interrupt signals. It exits
//! once the container stops (draining any remaining bytes first) or on
//! SIGINT/SIGTERM.

use crate::state::{ContainerStatus, StateStore};
use anyhow::{Context, Result};
use crossbeam_channel::{tick, unbounded};
use log::{debug, trace};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::{
    collections::VecDeque,
    fs::File,
    io::{BufRead, BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::Duration,
};

/// Poll cadence for container state while following.
const STATE_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Clone, Copy, Debug)]
/// Options for a `logs` invocation.
pub struct LogOptions {
    /// Keep streaming until the container stops.
    pub follow: bool,
    /// Only the last N lines; `None` emits everything.
    pub tail: Option<usize>,
    /// Include stdout.
    pub stdout: bool,
    /// Include stderr.
    pub stderr: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            follow: false,
            tail: None,
            stdout: true,
            stderr: true,
        }
    }
}

/// Print the logs of a container to `writer` according to the options.
/// Blocking; the caller moves this off the async runtime.
pub fn logs<W: Write>(
    store: &StateStore,
    id_or_prefix: &str,
    options: LogOptions,
    writer: &mut W,
) -> Result<()> {
    let state = store.get(id_or_prefix)?;
    let files = selected_files(store, &state.id, options);

    if !options.follow {
        for path in &files {
            emit_tail(path, options.tail, writer)
                .with_context(|| format!("read log {}", path.display()))?;
        }
        return Ok(());
    }

    follow(store, &state.id, &files, options, writer)
}

fn selected_files(store: &StateStore, id: &str, options: LogOptions) -> Vec<PathBuf> {
    let mut files = vec![];
    if options.stdout {
        files.push(store.stdout_log(id));
    }
    if options.stderr {
        files.push(store.stderr_log(id));
    }
    files
}

/// Emit a file's content, optionally restricted to the last `tail`
/// lines, and return the end offset.
fn emit_tail<W: Write>(path: &Path, tail: Option<usize>, writer: &mut W) -> Result<u64> {
    let file = match File::open(path) {
        Ok(file) => file,
        // A container created but never started has empty logs; a
        // missing file behaves the same.
        Err(_) => return Ok(0),
    };
    let size = file.metadata().context("stat log file")?.len();

    match tail {
        None => {
            let mut reader = BufReader::new(file);
            std::io::copy(&mut reader, writer).context("copy log file")?;
        }
        Some(limit) => {
            // Single pass with a fixed size ring over lines.
            let mut ring: VecDeque<Vec<u8>> = VecDeque::with_capacity(limit);
            let mut reader = BufReader::new(file);
            loop {
                let mut line = vec![];
                let n = reader.read_until(b'\n', &mut line).context("read log line")?;
                if n == 0 {
                    break;
                }
                if ring.len() == limit {
                    ring.pop_front();
                }
                if limit > 0 {
                    ring.push_back(line);
                }
            }
            for line in ring {
                writer.write_all(&line).context("write log line")?;
            }
        }
    }
    Ok(size)
}

/// Read anything past `offset` and return the new offset. A shrunken
/// file (truncation) restarts from zero.
fn emit_new_bytes<W: Write>(path: &Path, offset: u64, writer: &mut W) -> Result<u64> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(_) => return Ok(offset),
    };
    let size = file.metadata().context("stat log file")?.len();

    let start = if size < offset { 0 } else { offset };
    if size == start {
        return Ok(start);
    }

    file.seek(SeekFrom::Start(start)).context("seek log file")?;
    let mut remaining = file.take(size - start);
    std::io::copy(&mut remaining, writer).context("copy log delta")?;
    Ok(size)
}

fn follow<W: Write>(
    store: &StateStore,
    id: &str,
    files: &[PathBuf],
    options: LogOptions,
    writer: &mut W,
) -> Result<()> {
    // Initial window, remembering per file offsets.
    let mut offsets: Vec<u64> = vec![];
    for path in files {
        offsets.push(emit_tail(path, options.tail, writer)?);
    }

    let (watch_tx, watch_rx) = unbounded();
    let mut watcher = RecommendedWatcher::new(move |event: notify::Result<notify::Event>| {
        let _ = watch_tx.send(event);
    })
    .context("create filesystem watcher")?;
    for path in files {
        // Files exist from container creation on.
        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .with_context(|| format!("watch log file {}", path.display()))?;
    }

    let (signal_tx, signal_rx) = unbounded();
    let mut signals = signal_hook::iterator::Signals::new(&[
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ])
    .context("install signal handlers")?;
    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            let _ = signal_tx.send(());
        }
    });

    let ticker = tick(STATE_POLL_INTERVAL);
    debug!("Following logs of container {}", id);

    loop {
        crossbeam_channel::select! {
            recv(watch_rx) -> event => {
                trace!("Watcher event: {:?}", event);
                drain(files, &mut offsets, writer)?;
            }
            recv(ticker) -> _ => {
                drain(files, &mut offsets, writer)?;

                // Orphan detection runs inside get; a vanished supervisor
                // flips the state to stopped here as well.
                let stopped = match store.get(id) {
                    Ok(state) => state.status == ContainerStatus::Stopped,
                    Err(_) => true,
                };
                if stopped {
                    drain(files, &mut offsets, writer)?;
                    debug!("Container {} stopped, ending follow", id);
                    return Ok(());
                }
            }
            recv(signal_rx) -> _ => {
                debug!("Interrupted, ending follow");
                return Ok(());
            }
        }
    }
}

fn drain<W: Write>(files: &[PathBuf], offsets: &mut [u64], writer: &mut W) -> Result<()> {
    for (path, offset) in files.iter().zip(offsets.iter_mut()) {
        *offset = emit_new_bytes(path, *offset, writer)?;
    }
    writer.flush().context("flush log output")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{generate_id, ContainerConfigBuilder};
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> Result<(TempDir, StateStore, String)> {
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
        Ok((dir, store, id))
    }

    #[test]
    fn reads_all_logs() -> Result<()> {
        let (_dir, store, id) = setup()?;
        fs::write(store.stdout_log(&id), "out line\n")?;
        fs::write(store.stderr_log(&id), "err line\n")?;

        let mut buf = vec![];
        logs(&store, &id, LogOptions::default(), &mut buf)?;
        let output = String::from_utf8(buf)?;
        assert!(output.contains("out line"));
        assert!(output.contains("err line"));
        Ok(())
    }

    #[test]
    fn stream_selection() -> Result<()> {
        let (_dir, store, id) = setup()?;
        fs::write(store.stdout_log(&id), "out\n")?;
        fs::write(store.stderr_log(&id), "err\n")?;

        let mut buf = vec![];
        logs(
            &store,
            &id,
            LogOptions {
                stderr: false,
                ..Default::default()
            },
            &mut buf,
        )?;
        let output = String::from_utf8(buf)?;
        assert!(output.contains("out"));
        assert!(!output.contains("err"));
        Ok(())
    }

    #[test]
    fn tail_limits_lines() -> Result<()> {
        let (_dir, store, id) = setup()?;
        fs::write(store.stdout_log(&id), "1\n2\n3\n4\n5\n")?;

        let mut buf = vec![];
        logs(
            &store,
            &id,
            LogOptions {
                tail: Some(2),
                stderr: false,
                ..Default::default()
            },
            &mut buf,
        )?;
        assert_eq!(String::from_utf8(buf)?, "4\n5\n");
        Ok(())
    }

    #[test]
    fn tail_zero_is_empty() -> Result<()> {
        let (_dir, store, id) = setup()?;
        fs::write(store.stdout_log(&id), "1\n2\n")?;

        let mut buf = vec![];
        logs(
            &store,
            &id,
            LogOptions {
                tail: Some(0),
                stderr: false,
                ..Default::default()
            },
            &mut buf,
        )?;
        assert!(buf.is_empty());
        Ok(())
    }

    #[test]
    fn new_bytes_and_truncation() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("log");
        fs::write(&path, "abcdef")?;

        let mut buf = vec![];
        let offset = emit_new_bytes(&path, 0, &mut buf)?;
        assert_eq!(offset, 6);
        assert_eq!(buf, b"abcdef");

        // Nothing new.
        buf.clear();
        let offset = emit_new_bytes(&path, offset, &mut buf)?;
        assert_eq!(offset, 6);
        assert!(buf.is_empty());

        // Appended data is picked up from the old offset.
        fs::OpenOptions::new()
            .append(true)
            .open(&path)?
            .write_all(b"XYZ")?;
        buf.clear();
        let offset = emit_new_bytes(&path, offset, &mut buf)?;
        assert_eq!(offset, 9);
        assert_eq!(buf, b"XYZ");

        // Truncation resets to the file start.
        fs::write(&path, "ab")?;
        buf.clear();
        let offset = emit_new_bytes(&path, offset, &mut buf)?;
        assert_eq!(offset, 2);
        assert_eq!(buf, b"ab");
        Ok(())
    }

    #[test]
    fn follow_exits_when_container_is_stopped() -> Result<()> {
        let (_dir, store, id) = setup()?;
        fs::write(store.stdout_log(&id), "final words\n")?;
        store.update(&id, |s| s.status = ContainerStatus::Stopped)?;

        let mut buf = vec![];
        logs(
            &store,
            &id,
            LogOptions {
                follow: true,
                ..Default::default()
            },
            &mut buf,
        )?;
        assert!(String::from_utf8(buf)?.contains("final words"));
        Ok(())
    }
}
