use std::collections::HashMap;

pub type Annotations = HashMap<String, String>;
/// The cryptographic checksum digest of an object, in the pattern
/// `<algorithm>:<encoded>`.
pub type Digest = String;
/// https://opencontainers.org/schema/image/descriptor/mediaType
pub type MediaType = String;
