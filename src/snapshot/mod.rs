//! Rootfs assembly: layer cache plus overlay snapshots.

pub mod extract;
pub mod overlay;

pub use extract::LayerCache;
pub use overlay::{Snapshot, Snapshotter};

use crate::image::store::ImageStore;
use anyhow::{bail, Context, Result};
use log::debug;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
/// Facade over the layer cache and the snapshotter: turns an image
/// reference into a mounted per-container rootfs.
pub struct Snapshots {
    cache: LayerCache,
    snapshotter: Snapshotter,
}

impl Snapshots {
    /// Open both halves below the snapshots directory.
    pub fn new<P: AsRef<Path>>(snapshots_dir: P) -> Result<Self> {
        Ok(Self {
            cache: LayerCache::new(&snapshots_dir).context("open layer cache")?,
            snapshotter: Snapshotter::new(&snapshots_dir).context("open snapshotter")?,
        })
    }

    /// The layer cache.
    pub fn cache(&self) -> &LayerCache {
        &self.cache
    }

    /// Directory of a container's snapshot.
    pub fn container_dir(&self, container_id: &str) -> std::path::PathBuf {
        self.snapshotter.snapshot_dir(container_id)
    }

    /// Extract all layers of the image (if not cached yet) and overlay
    /// mount them for the container. Returns the prepared snapshot whose
    /// `rootfs()` is the container root.
    pub fn prepare_for_image(
        &self,
        store: &ImageStore,
        container_id: &str,
        image_ref: &str,
    ) -> Result<Snapshot> {
        let manifest_digest = store.resolve(image_ref).context("resolve image")?;
        let manifest = store.manifest(&manifest_digest).context("load manifest")?;
        let config = store.image_config(&manifest).context("load image config")?;

        let diff_ids = &config.rootfs.diff_ids;
        if diff_ids.len() != manifest.layers.len() {
            bail!(
                "layer count mismatch: {} diff IDs for {} layers",
                diff_ids.len(),
                manifest.layers.len()
            );
        }

        let mut lowers: Vec<PathBuf> = Vec::with_capacity(diff_ids.len());
        for (descriptor, diff_id) in manifest.layers.iter().zip(diff_ids) {
            if self.cache.has_layer(diff_id) {
                lowers.push(self.cache.layer_path(diff_id));
                continue;
            }
            let blob = store
                .get_blob(&descriptor.digest)
                .with_context(|| format!("open layer blob {}", descriptor.digest))?;
            lowers.push(
                self.cache
                    .extract(blob, diff_id)
                    .with_context(|| format!("extract layer {}", diff_id))?,
            );
        }

        debug!(
            "Prepared {} lower layers for container {}",
            lowers.len(),
            container_id
        );
        self.snapshotter
            .prepare(container_id, &lowers)
            .context("mount overlay snapshot")
    }

    /// Remove the container's snapshot; the layer cache is left intact.
    pub fn remove(&self, container_id: &str) -> Result<()> {
        self.snapshotter.remove(container_id)
    }
}
