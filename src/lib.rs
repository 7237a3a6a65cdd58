//! This is the main library interface for this project

pub mod atomic;
pub mod cgroup;
pub mod cli;
pub mod config;
pub mod container;
pub mod error;
pub mod image;
pub mod logs;
pub mod network;
pub mod oci;
pub mod snapshot;
pub mod state;
pub mod volume;

pub use cli::Cli;
pub use config::Config;
