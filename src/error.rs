//! User visible error taxonomy.
//!
//! Internal plumbing uses `anyhow` throughout; the variants here mark the
//! conditions the CLI has to distinguish, either for messaging or for the
//! documented idempotency rules. They are attached as the source of an
//! `anyhow::Error`, so `?` and `.context(...)` compose as usual and the CLI
//! boundary downcasts to recover them.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no such {kind}: {name}")]
    NotFound { kind: ResourceKind, name: String },

    #[error("ambiguous container ID prefix {0}: multiple matches")]
    Ambiguous(String),

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: ResourceKind, name: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: i64, actual: i64 },

    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("invalid signal: {0}")]
    Signal(String),

    #[error("system error: {0}")]
    System(#[from] nix::Error),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResourceKind {
    Container,
    Image,
    Blob,
    Volume,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceKind::Container => "container",
            ResourceKind::Image => "image",
            ResourceKind::Blob => "blob",
            ResourceKind::Volume => "volume",
        };
        f.write_str(s)
    }
}

impl Error {
    /// Build a `NotFound` for the given resource kind.
    pub fn not_found(kind: ResourceKind, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Build an `AlreadyExists` for the given resource kind.
    pub fn already_exists(kind: ResourceKind, name: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    /// True if the error (or any cause in `err`s chain) is a `NotFound`.
    pub fn is_not_found(err: &anyhow::Error) -> bool {
        err.chain()
            .filter_map(|e| e.downcast_ref::<Error>())
            .any(|e| matches!(e, Error::NotFound { .. }))
    }
}
