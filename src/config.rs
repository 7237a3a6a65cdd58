//! Configuration related structures
use clap::Parser;
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default root directory for all persisted runtime data.
pub const DEFAULT_ROOT: &str = "/var/lib/vessel";

#[derive(Builder, Clone, CopyGetters, Debug, Getters, Parser, Deserialize, Serialize)]
#[builder(default, pattern = "owned", setter(into))]
#[serde(rename_all = "kebab-case")]
/// Global runtime configuration, shared by every subcommand.
pub struct Config {
    #[get_copy = "pub"]
    #[clap(
        default_value("info"),
        env("VESSEL_LOG_LEVEL"),
        long("log-level"),
        possible_values(&["trace", "debug", "info", "warn", "error", "off"]),
        short('l'),
        value_name("LEVEL")
    )]
    /// The logging level of the application
    log_level: LevelFilter,

    #[get = "pub"]
    #[clap(
        default_value(DEFAULT_ROOT),
        env("VESSEL_ROOT"),
        long("root"),
        value_name("PATH")
    )]
    /// The root directory for containers, images, snapshots and volumes
    root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LevelFilter::Info,
            root: DEFAULT_ROOT.into(),
        }
    }
}

impl Config {
    /// Per-container state directories.
    pub fn containers_dir(&self) -> PathBuf {
        self.root().join("containers")
    }

    /// OCI image store (blobs, index, repositories).
    pub fn images_dir(&self) -> PathBuf {
        self.root().join("images")
    }

    /// Extracted layers and per-container overlay snapshots.
    pub fn snapshots_dir(&self) -> PathBuf {
        self.root().join("snapshots")
    }

    /// Named volumes and their registry.
    pub fn volumes_dir(&self) -> PathBuf {
        self.root().join("volumes")
    }

    /// Network state (IPAM allocations).
    pub fn network_dir(&self) -> PathBuf {
        self.root().join("network")
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn default_config() {
        let c = Config::default();
        assert_eq!(c.log_level(), LevelFilter::Info);
        assert_eq!(c.root(), &PathBuf::from(DEFAULT_ROOT));
    }

    #[test]
    fn build_config() -> Result<()> {
        let c = ConfigBuilder::default()
            .log_level(LevelFilter::Warn)
            .root("/some/path")
            .build()?;

        assert_eq!(c.log_level(), LevelFilter::Warn);
        assert_eq!(c.containers_dir(), PathBuf::from("/some/path/containers"));
        assert_eq!(c.images_dir(), PathBuf::from("/some/path/images"));
        assert_eq!(c.snapshots_dir(), PathBuf::from("/some/path/snapshots"));
        assert_eq!(c.volumes_dir(), PathBuf::from("/some/path/volumes"));
        assert_eq!(c.network_dir(), PathBuf::from("/some/path/network"));
        Ok(())
    }
}
