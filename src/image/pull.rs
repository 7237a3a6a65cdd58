//! Registry pull glue.
//!
//! The transport is delegated to an external client behind the
//! [`RegistryClient`] trait; this module converts what it yields into
//! canonical OCI form, stores the blobs and registers the manifest under
//! the requested reference.

use crate::{
    image::store::ImageStore,
    oci::{self, ContentDescriptor, ImageManifest},
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use dyn_clone::{clone_trait_object, DynClone};
use log::{debug, info};
use sha2::{Digest as _, Sha256};
use std::io::Cursor;

/// One fetched image layer.
#[derive(Clone, Debug)]
pub struct FetchedLayer {
    /// Media type as reported by the registry (Docker or OCI).
    pub media_type: String,
    /// Raw (still compressed) layer bytes.
    pub data: Vec<u8>,
}

/// Everything a registry fetch yields for a single-platform image.
#[derive(Clone, Debug)]
pub struct FetchedImage {
    /// Raw image configuration blob.
    pub config: Vec<u8>,
    /// Media type of the configuration blob.
    pub config_media_type: String,
    /// Ordered layers, bottom first.
    pub layers: Vec<FetchedLayer>,
}

#[async_trait]
/// Registry transport behavior trait.
pub trait RegistryClient: DynClone + Send + Sync {
    /// Fetch the image for `reference`, resolving multi-platform indexes
    /// to `os`/`arch`.
    async fn fetch(&self, reference: &str, os: &str, arch: &str) -> Result<FetchedImage>;
}

clone_trait_object!(RegistryClient);

#[derive(Clone, Debug, Default)]
/// Registry client backed by `oci-distribution`.
pub struct DefaultRegistryClient;

#[async_trait]
impl RegistryClient for DefaultRegistryClient {
    async fn fetch(&self, reference: &str, os: &str, arch: &str) -> Result<FetchedImage> {
        use oci_distribution::{
            client::{Client, ClientConfig},
            manifest,
            secrets::RegistryAuth,
            Reference,
        };

        let reference: Reference = reference
            .parse()
            .with_context(|| format!("parse image reference {}", reference))?;

        let (os, arch) = (os.to_string(), arch.to_string());
        let config = ClientConfig {
            platform_resolver: Some(Box::new(move |entries| {
                entries
                    .iter()
                    .find(|entry| {
                        entry
                            .platform
                            .as_ref()
                            .map(|p| p.os == os && p.architecture == arch)
                            .unwrap_or(false)
                    })
                    .map(|entry| entry.digest.clone())
            })),
            ..Default::default()
        };
        let mut client = Client::new(config);

        let image = client
            .pull(
                &reference,
                &RegistryAuth::Anonymous,
                vec![
                    manifest::IMAGE_LAYER_MEDIA_TYPE,
                    manifest::IMAGE_LAYER_GZIP_MEDIA_TYPE,
                    manifest::IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE,
                    manifest::IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
                ],
            )
            .await
            .context("pull image from registry")?;

        Ok(FetchedImage {
            config: image.config.data,
            config_media_type: image.config.media_type,
            layers: image
                .layers
                .into_iter()
                .map(|layer| FetchedLayer {
                    media_type: layer.media_type,
                    data: layer.data,
                })
                .collect(),
        })
    }
}

/// Pull `reference` through `client` into the store and tag it. Docker
/// media types are converted to their OCI equivalents before the
/// canonical manifest bytes and digest are computed. Returns the manifest
/// digest.
pub async fn pull(
    store: &ImageStore,
    client: &dyn RegistryClient,
    reference: &str,
    os: &str,
    arch: &str,
) -> Result<String> {
    info!("Pulling {} for {}/{}", reference, os, arch);
    let fetched = client
        .fetch(reference, os, arch)
        .await
        .context("fetch image")?;

    let (config_digest, config_size) = store
        .put_blob(Cursor::new(fetched.config))
        .context("store config blob")?;

    let mut layers = Vec::with_capacity(fetched.layers.len());
    for layer in fetched.layers {
        let media_type = oci::docker_to_oci_media_type(&layer.media_type).to_string();
        let (digest, size) = store
            .put_blob(Cursor::new(layer.data))
            .context("store layer blob")?;
        debug!("Stored layer {} ({})", digest, media_type);
        layers.push(ContentDescriptor::new(media_type, digest, size));
    }

    let manifest = ImageManifest {
        annotations: None,
        config: ContentDescriptor::new(oci::MEDIA_TYPE_IMAGE_CONFIG, config_digest, config_size),
        layers,
        media_type: Some(oci::MEDIA_TYPE_MANIFEST.into()),
        schema_version: 2,
    };
    let manifest_bytes = serde_json::to_vec(&manifest).context("serialize manifest")?;
    let digest = format!("sha256:{}", hex::encode(Sha256::digest(&manifest_bytes)));

    store
        .add_manifest(&manifest_bytes, &digest, Some(reference))
        .context("register pulled manifest")?;
    info!("Pulled {} as {}", reference, digest);
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Clone)]
    struct RegistryClientMock {
        result: Option<FetchedImage>,
    }

    #[async_trait]
    impl RegistryClient for RegistryClientMock {
        async fn fetch(&self, _: &str, _: &str, _: &str) -> Result<FetchedImage> {
            self.result.clone().context("no image configured")
        }
    }

    fn fetched_image() -> FetchedImage {
        FetchedImage {
            config: br#"{"architecture":"amd64","os":"linux","rootfs":{"type":"layers","diff_ids":["sha256:d1"]}}"#.to_vec(),
            config_media_type: "application/vnd.docker.container.image.v1+json".into(),
            layers: vec![FetchedLayer {
                media_type: "application/vnd.docker.image.rootfs.diff.tar.gzip".into(),
                data: b"compressed layer".to_vec(),
            }],
        }
    }

    #[tokio::test]
    async fn pull_stores_and_tags() -> Result<()> {
        let dir = TempDir::new()?;
        let store = ImageStore::new(dir.path())?;
        let client = RegistryClientMock {
            result: Some(fetched_image()),
        };

        let digest = pull(&store, &client, "alpine", "linux", "amd64").await?;
        assert_eq!(store.resolve("alpine")?, digest);

        let manifest = store.manifest(&digest)?;
        assert_eq!(manifest.layers.len(), 1);
        // Docker media types were converted to OCI.
        assert_eq!(manifest.layers[0].media_type, oci::MEDIA_TYPE_LAYER_GZIP);
        assert_eq!(manifest.config.media_type, oci::MEDIA_TYPE_IMAGE_CONFIG);
        assert!(store.has_blob(&manifest.config.digest));
        assert!(store.has_blob(&manifest.layers[0].digest));
        Ok(())
    }

    #[tokio::test]
    async fn pull_twice_converges() -> Result<()> {
        let dir = TempDir::new()?;
        let store = ImageStore::new(dir.path())?;
        let client = RegistryClientMock {
            result: Some(fetched_image()),
        };

        let first = pull(&store, &client, "alpine", "linux", "amd64").await?;
        let second = pull(&store, &client, "alpine", "linux", "amd64").await?;
        assert_eq!(first, second);
        assert_eq!(store.index()?.manifests.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn failed_fetch_propagates() -> Result<()> {
        let dir = TempDir::new()?;
        let store = ImageStore::new(dir.path())?;
        let client = RegistryClientMock { result: None };

        assert!(pull(&store, &client, "alpine", "linux", "amd64")
            .await
            .is_err());
        assert!(store.repositories()?.is_empty());
        Ok(())
    }
}
