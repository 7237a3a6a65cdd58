//! Image reference normalization.
//!
//! References resolve the Docker way: a missing tag after the last path
//! segment implies `:latest`, and short names for the default registry are
//! aliased through `library/`, so `alpine`, `library/alpine` and
//! `docker.io/library/alpine` all name the same repository entry.

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_NAMESPACE: &str = "library";

/// Extract the digest a reference pins, if any. Accepts a pure digest
/// (`sha256:<hex>`) or a `name@sha256:<hex>` reference.
pub fn digest_of(reference: &str) -> Option<&str> {
    if let Some((_, digest)) = reference.split_once('@') {
        return Some(digest);
    }
    let hex = reference.strip_prefix("sha256:")?;
    if hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(reference)
    } else {
        None
    }
}

/// Normalize a tag reference: append `:latest` when the final path segment
/// carries no tag. Digest references pass through unchanged.
pub fn normalize(reference: &str) -> String {
    if digest_of(reference).is_some() {
        return reference.into();
    }
    let last_segment = reference.rsplit('/').next().unwrap_or(reference);
    if last_segment.contains(':') {
        reference.into()
    } else {
        format!("{}:latest", reference)
    }
}

/// All repository keys a reference may be stored under, most specific
/// last. Lookups try these in order; stores use the first.
pub fn candidates(reference: &str) -> Vec<String> {
    let normalized = normalize(reference);
    let mut result = vec![normalized.clone()];

    // Walk the short-name alias chain in both directions.
    if let Some(rest) = normalized.strip_prefix(&format!("{}/", DEFAULT_REGISTRY)) {
        result.push(rest.into());
        if let Some(short) = rest.strip_prefix(&format!("{}/", DEFAULT_NAMESPACE)) {
            result.push(short.into());
        }
    } else if normalized.contains('/') {
        result.push(format!("{}/{}", DEFAULT_REGISTRY, normalized));
        if let Some(short) = normalized.strip_prefix(&format!("{}/", DEFAULT_NAMESPACE)) {
            result.push(short.into());
        }
    } else {
        result.push(format!("{}/{}", DEFAULT_NAMESPACE, normalized));
        result.push(format!(
            "{}/{}/{}",
            DEFAULT_REGISTRY, DEFAULT_NAMESPACE, normalized
        ));
    }

    result
}
