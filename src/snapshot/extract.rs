//! OCI layer extraction into the shared layer cache.
//!
//! Layers are extracted into a sibling `.extracting-*` temp directory and
//! renamed to their final `layers/sha256/<diff_id>` path, so a committed
//! layer directory is always complete and the cache stays append only.
//! OCI whiteout markers are lowered to the overlayfs on-disk conventions
//! (0:0 char device, `trusted.overlay.opaque` xattr) during the walk.

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use log::{debug, trace, warn};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use std::{
    fs::{self, File},
    io::{self, Read},
    os::unix::fs::{symlink, PermissionsExt},
    path::{Component, Path, PathBuf},
};
use tar::{Archive, EntryType};

/// OCI whiteout filename prefix.
const WHITEOUT_PREFIX: &str = ".wh.";

/// OCI opaque directory marker filename.
const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// Overlayfs xattr marking a directory as opaque.
const OPAQUE_XATTR: &str = "trusted.overlay.opaque";

#[derive(Clone, Debug)]
/// The shared cache of extracted layers, keyed by diff ID.
pub struct LayerCache {
    layers_dir: PathBuf,
}

impl LayerCache {
    /// Open the cache below the snapshots directory.
    pub fn new<P: AsRef<Path>>(snapshots_dir: P) -> Result<Self> {
        let layers_dir = snapshots_dir.as_ref().join("layers").join("sha256");
        fs::create_dir_all(&layers_dir).context("create layers directory")?;
        Ok(Self { layers_dir })
    }

    /// Final path of an extracted layer.
    pub fn layer_path(&self, diff_id: &str) -> PathBuf {
        self.layers_dir
            .join(diff_id.strip_prefix("sha256:").unwrap_or(diff_id))
    }

    /// Whether the layer for `diff_id` has been extracted already.
    pub fn has_layer(&self, diff_id: &str) -> bool {
        self.layer_path(diff_id).is_dir()
    }

    /// Extract a (possibly gzipped) layer tar stream into the cache.
    ///
    /// Extraction is idempotent per diff ID; when the layer is already
    /// present the reader is drained and the existing path returned, so
    /// upstream pipes never stall on an unread body.
    pub fn extract<R: Read + 'static>(&self, reader: R, diff_id: &str) -> Result<PathBuf> {
        let target = self.layer_path(diff_id);
        if target.is_dir() {
            trace!("Layer {} already extracted, draining stream", diff_id);
            io::copy(&mut sniff_gzip(reader)?, &mut io::sink()).context("drain layer stream")?;
            return Ok(target);
        }

        let temp = tempfile::Builder::new()
            .prefix(".extracting-")
            .tempdir_in(&self.layers_dir)
            .context("create extraction temp directory")?;

        extract_tar(sniff_gzip(reader)?, temp.path())
            .with_context(|| format!("extract layer {}", diff_id))?;

        // Commit by rename; losing the race to another extractor is fine,
        // the temp copy is simply discarded.
        match fs::rename(temp.path(), &target) {
            Ok(()) => {
                // Keep TempDir from removing the renamed directory.
                std::mem::forget(temp);
                debug!("Extracted layer {}", diff_id);
            }
            Err(_) if target.is_dir() => {
                trace!("Layer {} extracted concurrently", diff_id);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("commit layer {}", diff_id));
            }
        }
        Ok(target)
    }
}

/// Wrap `reader` in a gzip decoder when the stream starts with the gzip
/// magic, pass it through otherwise.
pub(crate) fn sniff_gzip<R: Read>(mut reader: R) -> Result<Box<dyn Read>>
where
    R: 'static,
{
    let mut magic = [0u8; 2];
    let mut filled = 0;
    while filled < 2 {
        let n = reader
            .read(&mut magic[filled..])
            .context("sniff layer stream")?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    let head = io::Cursor::new(magic[..filled].to_vec());
    let chained = head.chain(reader);
    if filled == 2 && magic == [0x1f, 0x8b] {
        Ok(Box::new(GzDecoder::new(chained)))
    } else {
        Ok(Box::new(chained))
    }
}

/// Walk the tar entries into `dest`, honoring whiteouts.
fn extract_tar<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = Archive::new(reader);

    for entry in archive.entries().context("read tar entries")? {
        let mut entry = entry.context("read tar entry")?;
        let raw_path = entry.path().context("read entry path")?.into_owned();

        let relative = sanitize(&raw_path)
            .with_context(|| format!("unsafe path in layer: {}", raw_path.display()))?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(&relative);

        let name = relative
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if name == OPAQUE_MARKER {
            let dir = target.parent().context("opaque marker without parent")?;
            fs::create_dir_all(dir).context("create opaque directory")?;
            xattr::set(dir, OPAQUE_XATTR, b"y")
                .with_context(|| format!("set opaque xattr on {}", dir.display()))?;
            continue;
        }

        if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
            let victim = target
                .parent()
                .context("whiteout without parent")?
                .join(hidden);
            remove_any(&victim)?;
            if let Some(parent) = victim.parent() {
                fs::create_dir_all(parent).context("create whiteout parent")?;
            }
            mknod(
                &victim,
                SFlag::S_IFCHR,
                Mode::from_bits_truncate(0o600),
                makedev(0, 0),
            )
            .with_context(|| format!("create whiteout device {}", victim.display()))?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).context("create entry parent")?;
        }

        let header = entry.header().clone();
        match header.entry_type() {
            EntryType::Regular | EntryType::GNUSparse => {
                let mut file = File::create(&target)
                    .with_context(|| format!("create file {}", target.display()))?;
                io::copy(&mut entry, &mut file).context("write file contents")?;
                if let Ok(mode) = header.mode() {
                    fs::set_permissions(&target, fs::Permissions::from_mode(mode))
                        .context("set file permissions")?;
                }
            }
            EntryType::Directory => {
                fs::create_dir_all(&target)
                    .with_context(|| format!("create directory {}", target.display()))?;
                if let Ok(mode) = header.mode() {
                    fs::set_permissions(&target, fs::Permissions::from_mode(mode))
                        .context("set directory permissions")?;
                }
            }
            EntryType::Symlink => {
                let link = header
                    .link_name()
                    .context("read symlink target")?
                    .context("symlink without target")?;
                remove_any(&target)?;
                symlink(&link, &target)
                    .with_context(|| format!("create symlink {}", target.display()))?;
            }
            EntryType::Link => {
                let link = header
                    .link_name()
                    .context("read hard link target")?
                    .context("hard link without target")?;
                let source = dest.join(
                    sanitize(&link)
                        .with_context(|| format!("unsafe link target: {}", link.display()))?,
                );
                remove_any(&target)?;
                fs::hard_link(&source, &target)
                    .with_context(|| format!("create hard link {}", target.display()))?;
            }
            EntryType::Fifo => {
                remove_any(&target)?;
                nix::unistd::mkfifo(&target, Mode::from_bits_truncate(header.mode().unwrap_or(0o644)))
                    .with_context(|| format!("create fifo {}", target.display()))?;
            }
            EntryType::Char | EntryType::Block => {
                trace!("Skipping device node {}", target.display());
            }
            other => {
                warn!("Skipping unsupported tar entry type {:?}", other);
            }
        }
    }
    Ok(())
}

/// Reduce a tar path to a safe, relative form. Fails when the cleaned
/// path would escape the destination.
fn sanitize(path: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(c) => clean.push(c),
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                // Absolute entries are re-rooted at the destination.
            }
            Component::ParentDir => {
                if !clean.pop() {
                    bail!("path escapes extraction root");
                }
            }
        }
    }
    Ok(clean)
}

/// Remove a path of any type, ignoring absence.
fn remove_any(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("stat {}", path.display())),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path).with_context(|| format!("remove directory {}", path.display()))
    } else {
        fs::remove_file(path).with_context(|| format!("remove file {}", path.display()))
    }
}
