//! Image handling: content addressable store, reference resolution,
//! tar import and registry pull.

pub mod import;
pub mod pull;
pub mod reference;
pub mod store;
