//! Content addressable image store.
//!
//! On-disk layout below the images directory:
//!
//! ```text
//! oci-layout         version marker
//! index.json         OCI image index over all stored manifests
//! repositories.json  reference -> manifest digest
//! blobs/sha256/<hex> content addressed blobs
//! ```
//!
//! Blob writes stream into a temp file in the blobs directory while
//! hashing and rename into place on success, so concurrent writers of the
//! same content converge on a single file and no reader ever observes a
//! partial blob.

use crate::{
    atomic,
    error::{Error, ResourceKind},
    image::reference,
    oci::{self, ContentDescriptor, ImageConfig, ImageIndex, ImageManifest, ManifestDescriptor},
};
use anyhow::{Context, Result};
use getset::Getters;
use log::{debug, trace};
use sha2::{Digest as _, Sha256};
use std::{
    collections::{BTreeMap, HashSet},
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;

/// Outcome of an image removal, for user facing reporting.
#[derive(Debug, Default, Getters)]
pub struct RemovedImage {
    #[get = "pub"]
    /// References that were untagged.
    untagged: Vec<String>,

    #[get = "pub"]
    /// Manifest digest, if the manifest itself was deleted.
    deleted: Option<String>,
}

#[derive(Clone, Debug, Getters)]
/// The content addressable image store rooted at a single directory.
pub struct ImageStore {
    #[get = "pub"]
    /// Base directory of the store.
    root: PathBuf,
}

impl ImageStore {
    /// Open the store, creating the on-disk layout if missing.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let store = Self {
            root: root.as_ref().into(),
        };
        fs::create_dir_all(store.blobs_dir()).context("create blobs directory")?;

        let layout = store.root.join("oci-layout");
        if !layout.exists() {
            atomic::write_json(&layout, &oci::ImageLayout::default())
                .context("write oci-layout")?;
        }
        if !store.index_path().exists() {
            atomic::write_json(store.index_path(), &ImageIndex::default())
                .context("write empty index")?;
        }
        if !store.repositories_path().exists() {
            atomic::write_json(store.repositories_path(), &BTreeMap::<String, String>::new())
                .context("write empty repositories")?;
        }
        Ok(store)
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs").join("sha256")
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    fn repositories_path(&self) -> PathBuf {
        self.root.join("repositories.json")
    }

    /// Path of a blob for the given `sha256:<hex>` digest.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        self.blobs_dir().join(hex_of(digest))
    }

    /// Stream `reader` into the store, returning the computed digest and
    /// the number of bytes written.
    pub fn put_blob<R: Read>(&self, reader: R) -> Result<(String, i64)> {
        self.write_blob(reader, None, 0)
    }

    /// Stream `reader` into the store and refuse to commit unless the
    /// computed digest matches `expected` (and size, when positive).
    pub fn put_blob_with_digest<R: Read>(
        &self,
        reader: R,
        expected: &str,
        expected_size: i64,
    ) -> Result<(String, i64)> {
        self.write_blob(reader, Some(expected), expected_size)
    }

    fn write_blob<R: Read>(
        &self,
        mut reader: R,
        expected: Option<&str>,
        expected_size: i64,
    ) -> Result<(String, i64)> {
        let mut temp = NamedTempFile::new_in(self.blobs_dir()).context("create blob temp file")?;
        let mut hasher = Sha256::new();
        let mut size: i64 = 0;
        let mut buf = [0u8; 32 * 1024];

        loop {
            let n = reader.read(&mut buf).context("read blob stream")?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            temp.write_all(&buf[..n]).context("write blob temp file")?;
            size += n as i64;
        }

        let digest = format!("sha256:{}", hex::encode(hasher.finalize()));

        if let Some(expected) = expected {
            if digest != expected {
                return Err(Error::DigestMismatch {
                    expected: expected.into(),
                    actual: digest,
                }
                .into());
            }
            if expected_size > 0 && size != expected_size {
                return Err(Error::SizeMismatch {
                    expected: expected_size,
                    actual: size,
                }
                .into());
            }
        }

        let path = self.blob_path(&digest);
        if path.exists() {
            trace!("Blob {} already present, discarding temp copy", digest);
        } else {
            temp.as_file().sync_all().context("sync blob temp file")?;
            temp.persist(&path)
                .with_context(|| format!("rename blob into {}", path.display()))?;
            debug!("Stored blob {} ({} bytes)", digest, size);
        }

        Ok((digest, size))
    }

    /// Whether a blob for `digest` is present.
    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).exists()
    }

    /// Open a blob for reading.
    pub fn get_blob(&self, digest: &str) -> Result<File> {
        File::open(self.blob_path(digest))
            .map_err(|_| Error::not_found(ResourceKind::Blob, digest).into())
    }

    /// Read a blob fully into memory.
    pub fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let mut bytes = vec![];
        self.get_blob(digest)?
            .read_to_end(&mut bytes)
            .with_context(|| format!("read blob {}", digest))?;
        Ok(bytes)
    }

    /// Delete a blob. Missing blobs are ignored.
    pub fn delete_blob(&self, digest: &str) -> Result<()> {
        match fs::remove_file(self.blob_path(digest)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("delete blob {}", digest)),
        }
    }

    /// Verify and store manifest bytes, register them in the index and
    /// optionally tag them with `reference`.
    pub fn add_manifest(
        &self,
        bytes: &[u8],
        digest: &str,
        reference: Option<&str>,
    ) -> Result<()> {
        let computed = format!("sha256:{}", hex::encode(Sha256::digest(bytes)));
        if computed != digest {
            return Err(Error::DigestMismatch {
                expected: digest.into(),
                actual: computed,
            }
            .into());
        }

        // Parse before committing anything so a corrupt manifest never
        // lands in the index.
        let _: ImageManifest =
            serde_json::from_slice(bytes).context("parse image manifest")?;

        self.put_blob_with_digest(bytes, digest, bytes.len() as i64)
            .context("store manifest blob")?;

        let mut index = self.index()?;
        if !index.manifests.iter().any(|m| m.digest == digest) {
            index.manifests.push(ManifestDescriptor {
                annotations: None,
                digest: digest.into(),
                media_type: oci::MEDIA_TYPE_MANIFEST.into(),
                platform: None,
                size: bytes.len() as i64,
            });
            atomic::write_json(self.index_path(), &index).context("update index")?;
        }

        if let Some(reference) = reference {
            let key = reference::normalize(reference);
            let mut repositories = self.repositories()?;
            repositories.insert(key.clone(), digest.into());
            atomic::write_json(self.repositories_path(), &repositories)
                .context("update repositories")?;
            debug!("Tagged {} as {}", digest, key);
        }

        Ok(())
    }

    /// The current image index.
    pub fn index(&self) -> Result<ImageIndex> {
        let bytes = fs::read(self.index_path()).context("read index.json")?;
        serde_json::from_slice(&bytes).context("parse index.json")
    }

    /// The current reference to digest mapping.
    pub fn repositories(&self) -> Result<BTreeMap<String, String>> {
        let bytes = fs::read(self.repositories_path()).context("read repositories.json")?;
        serde_json::from_slice(&bytes).context("parse repositories.json")
    }

    /// Resolve a reference (tag, short name or digest) to a manifest
    /// digest.
    pub fn resolve(&self, image_ref: &str) -> Result<String> {
        if let Some(digest) = reference::digest_of(image_ref) {
            let index = self.index()?;
            if index.manifests.iter().any(|m| m.digest == digest) {
                return Ok(digest.into());
            }
            return Err(Error::not_found(ResourceKind::Image, image_ref).into());
        }

        let repositories = self.repositories()?;
        for candidate in reference::candidates(image_ref) {
            if let Some(digest) = repositories.get(&candidate) {
                trace!("Resolved {} via {} to {}", image_ref, candidate, digest);
                return Ok(digest.clone());
            }
        }
        Err(Error::not_found(ResourceKind::Image, image_ref).into())
    }

    /// Load the manifest stored under `digest`.
    pub fn manifest(&self, digest: &str) -> Result<ImageManifest> {
        let bytes = self.read_blob(digest)?;
        serde_json::from_slice(&bytes).with_context(|| format!("parse manifest {}", digest))
    }

    /// Load the image configuration a manifest points at.
    pub fn image_config(&self, manifest: &ImageManifest) -> Result<ImageConfig> {
        let bytes = self.read_blob(&manifest.config.digest)?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parse image config {}", manifest.config.digest))
    }

    /// All tags of the given manifest digest.
    pub fn tags_of(&self, digest: &str) -> Result<Vec<String>> {
        Ok(self
            .repositories()?
            .into_iter()
            .filter(|(_, d)| d == digest)
            .map(|(r, _)| r)
            .collect())
    }

    /// Remove an image by tag or digest reference; see the deletion rules
    /// in the module documentation.
    pub fn remove(&self, image_ref: &str) -> Result<RemovedImage> {
        let mut removed = RemovedImage::default();
        let mut repositories = self.repositories()?;

        if let Some(digest) = reference::digest_of(image_ref) {
            // Digest removal untags every reference first.
            let tags: Vec<_> = repositories
                .iter()
                .filter(|(_, d)| d.as_str() == digest)
                .map(|(r, _)| r.clone())
                .collect();
            for tag in tags {
                repositories.remove(&tag);
                removed.untagged.push(tag);
            }
            atomic::write_json(self.repositories_path(), &repositories)
                .context("update repositories")?;
            self.remove_manifest(digest)?;
            removed.deleted = Some(digest.into());
            return Ok(removed);
        }

        let key = reference::candidates(image_ref)
            .into_iter()
            .find(|c| repositories.contains_key(c))
            .ok_or_else(|| Error::not_found(ResourceKind::Image, image_ref))?;
        let digest = repositories
            .remove(&key)
            .expect("checked key must be present");
        removed.untagged.push(key);
        atomic::write_json(self.repositories_path(), &repositories)
            .context("update repositories")?;

        // Drop the manifest itself only when the last tag is gone.
        if !repositories.values().any(|d| *d == digest) {
            self.remove_manifest(&digest)?;
            removed.deleted = Some(digest);
        }
        Ok(removed)
    }

    /// Remove a manifest from the index and delete its exclusively owned
    /// blobs. Blobs still referenced by another manifest are preserved.
    fn remove_manifest(&self, digest: &str) -> Result<()> {
        let mut index = self.index()?;
        if !index.manifests.iter().any(|m| m.digest == digest) {
            return Err(Error::not_found(ResourceKind::Image, digest).into());
        }

        let manifest = self.manifest(digest)?;
        index.manifests.retain(|m| m.digest != digest);

        let mut shared = HashSet::new();
        for descriptor in &index.manifests {
            if let Ok(other) = self.manifest(&descriptor.digest) {
                shared.insert(other.config.digest.clone());
                shared.extend(other.layers.iter().map(|l| l.digest.clone()));
            }
        }

        atomic::write_json(self.index_path(), &index).context("update index")?;

        let mut candidates = vec![manifest.config.clone()];
        candidates.extend(manifest.layers.iter().cloned());
        for ContentDescriptor { digest: d, .. } in candidates {
            if !shared.contains(&d) {
                self.delete_blob(&d)?;
            }
        }
        self.delete_blob(digest)?;
        debug!("Removed manifest {}", digest);
        Ok(())
    }
}

fn hex_of(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn store() -> Result<(TempDir, ImageStore)> {
        let dir = TempDir::new()?;
        let store = ImageStore::new(dir.path())?;
        Ok((dir, store))
    }

    fn digest_for(bytes: &[u8]) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
    }

    /// A minimal but valid manifest whose blobs exist in the store.
    fn add_test_manifest(
        store: &ImageStore,
        layer: &[u8],
        reference: Option<&str>,
    ) -> Result<(String, String)> {
        let (layer_digest, layer_size) = store.put_blob(Cursor::new(layer.to_vec()))?;

        let config = br#"{"architecture":"amd64","os":"linux","rootfs":{"type":"layers","diff_ids":["sha256:x"]}}"#.to_vec();
        let (config_digest, config_size) = store.put_blob(Cursor::new(config))?;

        let manifest = ImageManifest {
            annotations: None,
            config: ContentDescriptor::new(
                oci::MEDIA_TYPE_IMAGE_CONFIG,
                config_digest,
                config_size,
            ),
            layers: vec![ContentDescriptor::new(
                oci::MEDIA_TYPE_LAYER_GZIP,
                layer_digest.clone(),
                layer_size,
            )],
            media_type: Some(oci::MEDIA_TYPE_MANIFEST.into()),
            schema_version: 2,
        };
        let bytes = serde_json::to_vec(&manifest)?;
        let digest = digest_for(&bytes);
        store.add_manifest(&bytes, &digest, reference)?;
        Ok((digest, layer_digest))
    }

    #[test]
    fn put_blob_round_trip() -> Result<()> {
        let (_dir, store) = store()?;
        let (digest, size) = store.put_blob(Cursor::new(b"hello world".to_vec()))?;

        assert_eq!(size, 11);
        assert!(store.has_blob(&digest));
        assert_eq!(store.read_blob(&digest)?, b"hello world");
        assert_eq!(digest, digest_for(b"hello world"));
        Ok(())
    }

    #[test]
    fn put_blob_with_digest_verifies() -> Result<()> {
        let (_dir, store) = store()?;
        let digest = digest_for(b"data");

        let (stored, size) = store.put_blob_with_digest(Cursor::new(b"data".to_vec()), &digest, 4)?;
        assert_eq!(stored, digest);
        assert_eq!(size, 4);
        Ok(())
    }

    #[test]
    fn digest_mismatch_leaves_no_blob() -> Result<()> {
        let (_dir, store) = store()?;
        let wrong = digest_for(b"other");

        let err = store
            .put_blob_with_digest(Cursor::new(b"data".to_vec()), &wrong, 4)
            .unwrap_err();
        assert!(err.to_string().contains("digest mismatch"));
        assert!(!store.has_blob(&wrong));
        assert!(!store.has_blob(&digest_for(b"data")));

        // The blobs directory only ever contains committed blobs.
        let count = fs::read_dir(store.blobs_dir())?.count();
        assert_eq!(count, 0);
        Ok(())
    }

    #[test]
    fn size_mismatch_fails() -> Result<()> {
        let (_dir, store) = store()?;
        let digest = digest_for(b"data");

        let err = store
            .put_blob_with_digest(Cursor::new(b"data".to_vec()), &digest, 3)
            .unwrap_err();
        assert!(err.to_string().contains("size mismatch"));
        Ok(())
    }

    #[test]
    fn existing_blob_is_not_rewritten() -> Result<()> {
        let (_dir, store) = store()?;
        let (first, _) = store.put_blob(Cursor::new(b"same".to_vec()))?;
        let (second, _) = store.put_blob(Cursor::new(b"same".to_vec()))?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn add_manifest_updates_index_and_tags() -> Result<()> {
        let (_dir, store) = store()?;
        let (digest, _) = add_test_manifest(&store, b"layer", Some("alpine"))?;

        let index = store.index()?;
        assert_eq!(index.manifests.len(), 1);
        assert_eq!(index.manifests[0].digest, digest);

        // Tag was normalized with :latest.
        assert_eq!(store.repositories()?.get("alpine:latest"), Some(&digest));
        Ok(())
    }

    #[test]
    fn add_manifest_rejects_wrong_digest() -> Result<()> {
        let (_dir, store) = store()?;
        let err = store
            .add_manifest(b"{}", &digest_for(b"not it"), None)
            .unwrap_err();
        assert!(err.to_string().contains("digest mismatch"));
        Ok(())
    }

    #[test]
    fn add_manifest_twice_dedups() -> Result<()> {
        let (_dir, store) = store()?;
        add_test_manifest(&store, b"layer", Some("a"))?;
        add_test_manifest(&store, b"layer", Some("b"))?;
        assert_eq!(store.index()?.manifests.len(), 1);
        Ok(())
    }

    #[test]
    fn resolve_through_aliases() -> Result<()> {
        let (_dir, store) = store()?;
        let (digest, _) = add_test_manifest(&store, b"layer", Some("library/alpine"))?;

        assert_eq!(store.resolve("alpine")?, digest);
        assert_eq!(store.resolve("library/alpine:latest")?, digest);
        assert_eq!(store.resolve("docker.io/library/alpine")?, digest);
        assert_eq!(store.resolve(&digest)?, digest);
        Ok(())
    }

    #[test]
    fn resolve_unknown_is_not_found() -> Result<()> {
        let (_dir, store) = store()?;
        let err = store.resolve("ghost").unwrap_err();
        assert!(Error::is_not_found(&err));
        Ok(())
    }

    #[test]
    fn remove_by_tag_keeps_other_tags() -> Result<()> {
        let (_dir, store) = store()?;
        let (digest, _) = add_test_manifest(&store, b"layer", Some("one"))?;
        store.add_manifest(&store.read_blob(&digest)?, &digest, Some("two"))?;

        let removed = store.remove("one")?;
        assert_eq!(removed.untagged(), &vec!["one:latest".to_string()]);
        assert!(removed.deleted().is_none());
        assert_eq!(store.resolve("two")?, digest);
        Ok(())
    }

    #[test]
    fn remove_last_tag_deletes_manifest() -> Result<()> {
        let (_dir, store) = store()?;
        let (digest, layer_digest) = add_test_manifest(&store, b"layer", Some("only"))?;

        let removed = store.remove("only")?;
        assert_eq!(removed.deleted(), &Some(digest.clone()));
        assert!(!store.has_blob(&digest));
        assert!(!store.has_blob(&layer_digest));
        assert!(store.index()?.manifests.is_empty());
        Ok(())
    }

    #[test]
    fn remove_by_digest_untags_all() -> Result<()> {
        let (_dir, store) = store()?;
        let (digest, _) = add_test_manifest(&store, b"layer", Some("one"))?;
        store.add_manifest(&store.read_blob(&digest)?, &digest, Some("two"))?;

        let removed = store.remove(&digest)?;
        assert_eq!(removed.untagged().len(), 2);
        assert_eq!(removed.deleted(), &Some(digest));
        assert!(store.repositories()?.is_empty());
        Ok(())
    }

    #[test]
    fn shared_blobs_are_preserved() -> Result<()> {
        let (_dir, store) = store()?;
        // Two manifests sharing the same layer blob but with distinct
        // configs (the config content differs by architecture).
        let (digest_a, layer) = add_test_manifest(&store, b"shared layer", Some("a"))?;

        let config = br#"{"architecture":"arm64","os":"linux","rootfs":{"type":"layers","diff_ids":["sha256:y"]}}"#.to_vec();
        let (config_digest, config_size) = store.put_blob(Cursor::new(config))?;
        let manifest_b = ImageManifest {
            annotations: None,
            config: ContentDescriptor::new(
                oci::MEDIA_TYPE_IMAGE_CONFIG,
                config_digest,
                config_size,
            ),
            layers: vec![ContentDescriptor::new(
                oci::MEDIA_TYPE_LAYER_GZIP,
                layer.clone(),
                12,
            )],
            media_type: Some(oci::MEDIA_TYPE_MANIFEST.into()),
            schema_version: 2,
        };
        let bytes_b = serde_json::to_vec(&manifest_b)?;
        let digest_b = digest_for(&bytes_b);
        store.add_manifest(&bytes_b, &digest_b, Some("b"))?;

        store.remove("a")?;
        assert!(store.has_blob(&layer), "shared layer must survive");
        assert!(!store.has_blob(&digest_a));
        Ok(())
    }
}
