use crate::oci::defs::{Annotations, Digest, MediaType};
use serde::{Deserialize, Serialize};

#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(rename = "os.features", skip_serializing_if = "Option::is_none")]
    pub os_features: Option<Vec<String>>,
    #[serde(rename = "os.version", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct ManifestDescriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
    /// the cryptographic checksum digest of the object, in the pattern '<algorithm>:<encoded>'
    pub digest: Digest,
    /// the mediatype of the referenced object
    #[serde(rename = "mediaType")]
    pub media_type: MediaType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    /// the size in bytes of the referenced object
    pub size: i64,
}

#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct ImageIndex {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
    pub manifests: Vec<ManifestDescriptor>,
    /// This field specifies the image index schema version as an integer
    #[serde(rename = "schemaVersion")]
    pub schema_version: i64,
}

impl Default for ImageIndex {
    fn default() -> Self {
        Self {
            annotations: None,
            manifests: vec![],
            schema_version: 2,
        }
    }
}

impl ImageIndex {
    /// Select a manifest from the index: a single entry wins outright,
    /// otherwise the entry matching `os`/`arch` is chosen.
    pub fn select_manifest(&self, os: &str, arch: &str) -> Option<&ManifestDescriptor> {
        if self.manifests.len() == 1 {
            return self.manifests.first();
        }
        self.manifests.iter().find(|m| {
            m.platform
                .as_ref()
                .map(|p| p.os == os && p.architecture == arch)
                .unwrap_or(false)
        })
    }
}
