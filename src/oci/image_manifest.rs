use crate::oci::{content_descriptor::ContentDescriptor, defs::Annotations};
use serde::{Deserialize, Serialize};

#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct ImageManifest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
    pub config: ContentDescriptor,
    pub layers: Vec<ContentDescriptor>,
    #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// This field specifies the image manifest schema version as an integer
    #[serde(rename = "schemaVersion")]
    pub schema_version: i64,
}

impl ImageManifest {
    /// Total size of all referenced blobs (config plus layers).
    pub fn blob_size(&self) -> i64 {
        self.config.size + self.layers.iter().map(|l| l.size).sum::<i64>()
    }
}
