use crate::oci::defs::{Annotations, Digest, MediaType};
use serde::{Deserialize, Serialize};

#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct ContentDescriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
    /// the cryptographic checksum digest of the object, in the pattern '<algorithm>:<encoded>'
    pub digest: Digest,
    /// the mediatype of the referenced object
    #[serde(rename = "mediaType")]
    pub media_type: MediaType,
    /// the size in bytes of the referenced object
    pub size: i64,
}

impl ContentDescriptor {
    /// Create a new descriptor without annotations.
    pub fn new(media_type: impl Into<MediaType>, digest: impl Into<Digest>, size: i64) -> Self {
        Self {
            annotations: None,
            digest: digest.into(),
            media_type: media_type.into(),
            size,
        }
    }

    /// The hex part of the digest, without the algorithm prefix.
    pub fn encoded(&self) -> &str {
        self.digest
            .split_once(':')
            .map(|(_, hex)| hex)
            .unwrap_or(&self.digest)
    }

    /// The algorithm part of the digest, `sha256` if unprefixed.
    pub fn algorithm(&self) -> &str {
        self.digest
            .split_once(':')
            .map(|(alg, _)| alg)
            .unwrap_or("sha256")
    }
}
