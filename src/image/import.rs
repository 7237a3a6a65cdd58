//! OCI layout tar import (`load -i`).

use crate::{
    error::Error,
    image::store::ImageStore,
    oci::{self, ImageIndex, ImageLayout},
    snapshot::extract::sniff_gzip,
};
use anyhow::{bail, Context, Result};
use log::{debug, trace};
use std::io::Read;
use tar::Archive;

/// Import an OCI image layout tar (optionally gzipped) into the store and
/// return the digest of the selected manifest. The manifest is tagged
/// with `tag` when given.
pub fn import<R: Read + 'static>(
    store: &ImageStore,
    reader: R,
    tag: Option<&str>,
) -> Result<String> {
    let mut archive = Archive::new(sniff_gzip(reader)?);

    let mut layout: Option<ImageLayout> = None;
    let mut index: Option<ImageIndex> = None;

    for entry in archive.entries().context("read archive entries")? {
        let mut entry = entry.context("read archive entry")?;
        let path = entry.path().context("read entry path")?.into_owned();
        let name = path.to_string_lossy().into_owned();

        match name.trim_start_matches("./") {
            "oci-layout" => {
                let mut bytes = vec![];
                entry.read_to_end(&mut bytes).context("read oci-layout")?;
                layout = Some(serde_json::from_slice(&bytes).context("parse oci-layout")?);
            }
            "index.json" => {
                let mut bytes = vec![];
                entry.read_to_end(&mut bytes).context("read index.json")?;
                index = Some(serde_json::from_slice(&bytes).context("parse index.json")?);
            }
            other => {
                if let Some(digest) = blob_digest(other) {
                    let size = entry.size() as i64;
                    trace!("Importing blob {} ({} bytes)", digest, size);
                    store
                        .put_blob_with_digest(&mut entry, &digest, size)
                        .with_context(|| format!("import blob {}", digest))?;
                }
            }
        }
    }

    let layout = layout.context("archive contains no oci-layout file")?;
    if !layout.image_layout_version.starts_with("1.") {
        bail!(
            "unsupported OCI layout version: {}",
            layout.image_layout_version
        );
    }
    let index = index.context("archive contains no index.json")?;

    let descriptor = index
        .select_manifest("linux", "amd64")
        .context("multi-platform image without a linux/amd64 manifest")?;
    let digest = descriptor.digest.clone();

    let manifest_bytes = store
        .read_blob(&digest)
        .context("archive does not contain the indexed manifest blob")?;

    // All referenced blobs must have made it into the store.
    let manifest: crate::oci::ImageManifest =
        serde_json::from_slice(&manifest_bytes).context("parse selected manifest")?;
    for descriptor in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
        if !store.has_blob(&descriptor.digest) {
            return Err(Error::not_found(
                crate::error::ResourceKind::Blob,
                descriptor.digest.clone(),
            )
            .into());
        }
    }

    store
        .add_manifest(&manifest_bytes, &digest, tag)
        .context("register imported manifest")?;
    debug!("Imported image {} as {:?}", digest, tag);
    Ok(digest)
}

/// Parse `blobs/<alg>/<hex>` into an `<alg>:<hex>` digest.
fn blob_digest(path: &str) -> Option<String> {
    let mut parts = path.split('/');
    if parts.next()? != "blobs" {
        return None;
    }
    let alg = parts.next()?;
    let hex = parts.next()?;
    if parts.next().is_some() || alg != "sha256" || hex.len() != 64 {
        return None;
    }
    Some(format!("{}:{}", alg, hex))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::oci::{ContentDescriptor, ImageManifest, ManifestDescriptor, Platform};
    use sha2::{Digest as _, Sha256};
    use std::io::Cursor;
    use tar::{Builder, Header};
    use tempfile::TempDir;

    fn digest_for(bytes: &[u8]) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
    }

    fn append(builder: &mut Builder<Vec<u8>>, path: &str, bytes: &[u8]) {
        let mut header = Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, Cursor::new(bytes.to_vec()))
            .unwrap();
    }

    /// Build a minimal single-image OCI layout tar; returns the archive
    /// and the manifest digest.
    pub(crate) fn build_archive() -> (Vec<u8>, String) {
        let layer = b"layer-bytes".to_vec();
        let layer_digest = digest_for(&layer);

        let config = br#"{"architecture":"amd64","os":"linux","rootfs":{"type":"layers","diff_ids":["sha256:feed"]}}"#.to_vec();
        let config_digest = digest_for(&config);

        let manifest = ImageManifest {
            annotations: None,
            config: ContentDescriptor::new(
                crate::oci::MEDIA_TYPE_IMAGE_CONFIG,
                config_digest.clone(),
                config.len() as i64,
            ),
            layers: vec![ContentDescriptor::new(
                crate::oci::MEDIA_TYPE_LAYER,
                layer_digest.clone(),
                layer.len() as i64,
            )],
            media_type: Some(crate::oci::MEDIA_TYPE_MANIFEST.into()),
            schema_version: 2,
        };
        let manifest_bytes = serde_json::to_vec(&manifest).unwrap();
        let manifest_digest = digest_for(&manifest_bytes);

        let index = ImageIndex {
            annotations: None,
            manifests: vec![ManifestDescriptor {
                annotations: None,
                digest: manifest_digest.clone(),
                media_type: crate::oci::MEDIA_TYPE_MANIFEST.into(),
                platform: Some(Platform {
                    architecture: "amd64".into(),
                    os: "linux".into(),
                    os_features: None,
                    os_version: None,
                    variant: None,
                }),
                size: manifest_bytes.len() as i64,
            }],
            schema_version: 2,
        };

        let mut builder = Builder::new(Vec::new());
        append(
            &mut builder,
            "oci-layout",
            br#"{"imageLayoutVersion":"1.0.0"}"#,
        );
        append(
            &mut builder,
            "index.json",
            &serde_json::to_vec(&index).unwrap(),
        );
        append(
            &mut builder,
            &format!("blobs/sha256/{}", &layer_digest[7..]),
            &layer,
        );
        append(
            &mut builder,
            &format!("blobs/sha256/{}", &config_digest[7..]),
            &config,
        );
        append(
            &mut builder,
            &format!("blobs/sha256/{}", &manifest_digest[7..]),
            &manifest_bytes,
        );
        (builder.into_inner().unwrap(), manifest_digest)
    }

    #[test]
    fn import_round_trip() -> Result<()> {
        let dir = TempDir::new()?;
        let store = ImageStore::new(dir.path())?;
        let (archive, expected) = build_archive();

        let digest = import(&store, Cursor::new(archive), Some("busybox"))?;
        assert_eq!(digest, expected);
        assert_eq!(store.resolve("busybox")?, digest);

        let manifest = store.manifest(&digest)?;
        assert_eq!(manifest.layers.len(), 1);
        Ok(())
    }

    #[test]
    fn import_twice_is_stable() -> Result<()> {
        let dir = TempDir::new()?;
        let store = ImageStore::new(dir.path())?;
        let (archive, _) = build_archive();

        import(&store, Cursor::new(archive.clone()), Some("busybox"))?;
        import(&store, Cursor::new(archive), Some("busybox"))?;

        assert_eq!(store.index()?.manifests.len(), 1);
        Ok(())
    }

    #[test]
    fn gzipped_archive_imports() -> Result<()> {
        let dir = TempDir::new()?;
        let store = ImageStore::new(dir.path())?;
        let (archive, expected) = build_archive();

        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        std::io::Write::write_all(&mut encoder, &archive)?;
        let gz = encoder.finish()?;

        let digest = import(&store, Cursor::new(gz), None)?;
        assert_eq!(digest, expected);
        Ok(())
    }

    #[test]
    fn missing_layout_fails() -> Result<()> {
        let dir = TempDir::new()?;
        let store = ImageStore::new(dir.path())?;

        let mut builder = Builder::new(Vec::new());
        append(&mut builder, "index.json", b"{\"schemaVersion\":2,\"manifests\":[]}");
        let archive = builder.into_inner()?;

        let err = import(&store, Cursor::new(archive), None).unwrap_err();
        assert!(err.to_string().contains("oci-layout"));
        Ok(())
    }

    #[test]
    fn unsupported_layout_version_fails() -> Result<()> {
        let dir = TempDir::new()?;
        let store = ImageStore::new(dir.path())?;

        let mut builder = Builder::new(Vec::new());
        append(
            &mut builder,
            "oci-layout",
            br#"{"imageLayoutVersion":"2.0.0"}"#,
        );
        append(&mut builder, "index.json", b"{\"schemaVersion\":2,\"manifests\":[]}");
        let archive = builder.into_inner()?;

        let err = import(&store, Cursor::new(archive), None).unwrap_err();
        assert!(err.to_string().contains("unsupported OCI layout version"));
        Ok(())
    }

    #[test]
    fn corrupted_blob_fails_import() -> Result<()> {
        let dir = TempDir::new()?;
        let store = ImageStore::new(dir.path())?;

        let mut builder = Builder::new(Vec::new());
        append(
            &mut builder,
            "oci-layout",
            br#"{"imageLayoutVersion":"1.0.0"}"#,
        );
        // Content does not match the path digest.
        append(
            &mut builder,
            &format!("blobs/sha256/{}", "0".repeat(64)),
            b"not matching",
        );
        let archive = builder.into_inner()?;

        let err = import(&store, Cursor::new(archive), None).unwrap_err();
        assert!(err.to_string().contains("digest mismatch"));
        assert!(!store.has_blob(&format!("sha256:{}", "0".repeat(64))));
        Ok(())
    }

    #[test]
    fn blob_path_parsing() {
        assert_eq!(
            blob_digest(&format!("blobs/sha256/{}", "a".repeat(64))),
            Some(format!("sha256:{}", "a".repeat(64)))
        );
        assert!(blob_digest("blobs/md5/abc").is_none());
        assert!(blob_digest("blobs/sha256/short").is_none());
        assert!(blob_digest("other/sha256/abc").is_none());
    }
}
