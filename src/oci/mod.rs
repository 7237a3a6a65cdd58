//! OCI image specification structures.
//!
//! Only the subset of the image spec this runtime persists and parses:
//! descriptors, manifests, image indexes, image configurations and the
//! `oci-layout` marker.

mod content_descriptor;
mod defs;
mod image_config;
mod image_index;
mod image_layout;
mod image_manifest;

pub use content_descriptor::ContentDescriptor;
pub use defs::{Annotations, Digest, MediaType};
pub use image_config::{ImageConfig, ImageRootfs, RuntimeConfig};
pub use image_index::{ImageIndex, ManifestDescriptor, Platform};
pub use image_layout::ImageLayout;
pub use image_manifest::ImageManifest;

/// Media type of an OCI image manifest.
pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// Media type of an OCI image index.
pub const MEDIA_TYPE_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Media type of an OCI image configuration blob.
pub const MEDIA_TYPE_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

/// Media type of a gzip compressed image layer.
pub const MEDIA_TYPE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Media type of an uncompressed image layer.
pub const MEDIA_TYPE_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";

/// Supported version in the `oci-layout` marker file.
pub const IMAGE_LAYOUT_VERSION: &str = "1.0.0";

/// Map Docker distribution media types onto their OCI equivalents. Unknown
/// media types pass through unchanged.
pub fn docker_to_oci_media_type(media_type: &str) -> &str {
    match media_type {
        "application/vnd.docker.distribution.manifest.v2+json" => MEDIA_TYPE_MANIFEST,
        "application/vnd.docker.distribution.manifest.list.v2+json" => MEDIA_TYPE_IMAGE_INDEX,
        "application/vnd.docker.container.image.v1+json" => MEDIA_TYPE_IMAGE_CONFIG,
        "application/vnd.docker.image.rootfs.diff.tar.gzip" => MEDIA_TYPE_LAYER_GZIP,
        "application/vnd.docker.image.rootfs.diff.tar" => MEDIA_TYPE_LAYER,
        other => other,
    }
}
