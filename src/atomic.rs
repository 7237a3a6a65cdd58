//! Atomic file replacement for shared metadata.
//!
//! Every persisted JSON artifact (`state.json`, `index.json`, `ipam.json`,
//! `volumes.json`, ...) is written to a temp file in the destination
//! directory and renamed into place, so readers never observe a partial
//! write and concurrent writers converge on a complete file.

use anyhow::{Context, Result};
use serde::Serialize;
use std::{fs, io::Write, path::Path};
use tempfile::NamedTempFile;

/// Replace `path` with `bytes` via a same-directory temp file and rename.
pub fn write_atomic<P: AsRef<Path>>(path: P, bytes: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let dir = path
        .parent()
        .with_context(|| format!("no parent directory for {}", path.display()))?;
    fs::create_dir_all(dir)
        .with_context(|| format!("create directory {}", dir.display()))?;

    let mut temp = NamedTempFile::new_in(dir).context("create temp file")?;
    temp.write_all(bytes).context("write temp file")?;
    temp.as_file().sync_all().context("sync temp file")?;
    temp.persist(path)
        .with_context(|| format!("rename temp file to {}", path.display()))?;
    Ok(())
}

/// Serialize `value` as pretty-printed JSON and replace `path` atomically.
pub fn write_json<P: AsRef<Path>, T: Serialize>(path: P, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value).context("serialize to JSON")?;
    write_atomic(path, &json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Deserialize, PartialEq, Serialize)]
    struct Value {
        name: String,
        count: u32,
    }

    #[test]
    fn write_and_replace() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("file");

        write_atomic(&path, b"first")?;
        assert_eq!(fs::read(&path)?, b"first");

        write_atomic(&path, b"second")?;
        assert_eq!(fs::read(&path)?, b"second");
        Ok(())
    }

    #[test]
    fn write_creates_parent() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("a/b/file");

        write_atomic(&path, b"data")?;
        assert_eq!(fs::read(&path)?, b"data");
        Ok(())
    }

    #[test]
    fn json_round_trip() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("value.json");
        let value = Value {
            name: "x".into(),
            count: 3,
        };

        write_json(&path, &value)?;

        let loaded: Value = serde_json::from_slice(&fs::read(&path)?)?;
        assert_eq!(loaded, value);

        // Pretty printed with two space indent.
        let raw = fs::read_to_string(&path)?;
        assert!(raw.contains("\n  \"name\""));
        Ok(())
    }

    #[test]
    fn no_temp_files_left_behind() -> Result<()> {
        let dir = TempDir::new()?;
        write_atomic(dir.path().join("file"), b"data")?;
        let count = fs::read_dir(dir.path())?.count();
        assert_eq!(count, 1);
        Ok(())
    }
}
