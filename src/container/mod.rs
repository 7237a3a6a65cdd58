//! Container configuration and lifecycle.

pub mod exec;
pub mod init;
pub mod ops;
pub mod runner;

use crate::{cgroup::CgroupLimits, network::NetworkMode, network::port::PortMapping, volume::Mount};
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Length of the full container ID in hex characters.
pub const ID_LEN: usize = 64;

/// Length of the short (display) form of a container ID.
pub const SHORT_ID_LEN: usize = 12;

/// Generate a fresh 64 hex character container ID.
pub fn generate_id() -> String {
    let bytes: [u8; ID_LEN / 2] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// The short display form of an ID.
pub fn short_id(id: &str) -> &str {
    &id[..SHORT_ID_LEN.min(id.len())]
}

#[derive(Builder, Clone, CopyGetters, Debug, Deserialize, Getters, Serialize)]
#[builder(default, pattern = "owned", setter(into))]
#[serde(rename_all = "camelCase")]
/// The immutable per-container configuration, written once at create time.
pub struct ContainerConfig {
    #[get = "pub"]
    /// The 64 hex character container ID.
    id: String,

    #[get = "pub"]
    /// Binary to execute inside the container.
    command: String,

    #[get = "pub"]
    #[serde(default)]
    /// Arguments for the command.
    args: Vec<String>,

    #[get = "pub"]
    /// Hostname inside the UTS namespace, the short ID by default.
    hostname: String,

    #[get = "pub"]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Prepared root directory; mutually exclusive with `image_ref`.
    rootfs_path: Option<PathBuf>,

    #[get = "pub"]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Image reference to assemble the rootfs from.
    image_ref: Option<String>,

    #[get_copy = "pub"]
    #[serde(default)]
    /// Allocate a PTY for the container process.
    tty: bool,

    #[get_copy = "pub"]
    #[serde(default)]
    /// Keep stdin open (interactive mode).
    interactive: bool,

    #[get_copy = "pub"]
    #[serde(default)]
    /// Run detached from the invoking terminal.
    detached: bool,

    #[get_copy = "pub"]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Memory limit in bytes.
    memory_bytes: Option<i64>,

    #[get_copy = "pub"]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Memory plus swap limit in bytes; -1 means unlimited swap.
    memory_swap_bytes: Option<i64>,

    #[get_copy = "pub"]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// CPU quota in microseconds per period.
    cpu_quota_us: Option<i64>,

    #[get_copy = "pub"]
    #[serde(default = "default_cpu_period")]
    /// CPU period in microseconds.
    cpu_period_us: i64,

    #[get_copy = "pub"]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// PID limit.
    pids_limit: Option<i64>,

    #[get_copy = "pub"]
    #[serde(default)]
    /// Network attachment mode.
    network: NetworkMode,

    #[get = "pub"]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    /// Host to container port mappings (bridge mode only).
    port_mappings: Vec<PortMapping>,

    #[get = "pub"]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    /// Bind and volume mounts.
    mounts: Vec<Mount>,

    #[get = "pub"]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    /// Additional `KEY=VALUE` environment entries for the command.
    env: Vec<String>,
}

fn default_cpu_period() -> i64 {
    100_000
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            command: String::new(),
            args: vec![],
            hostname: String::new(),
            rootfs_path: None,
            image_ref: None,
            tty: false,
            interactive: false,
            detached: false,
            memory_bytes: None,
            memory_swap_bytes: None,
            cpu_quota_us: None,
            cpu_period_us: default_cpu_period(),
            pids_limit: None,
            network: NetworkMode::default(),
            port_mappings: vec![],
            mounts: vec![],
            env: vec![],
        }
    }
}

impl ContainerConfig {
    /// The resource limits configured for this container, if any.
    pub fn limits(&self) -> Option<CgroupLimits> {
        let limits = CgroupLimits::from_parts(
            self.memory_bytes(),
            self.memory_swap_bytes(),
            self.cpu_quota_us(),
            self.cpu_period_us(),
            self.pids_limit(),
        );
        if limits.any() {
            Some(limits)
        } else {
            None
        }
    }

    /// The full argv of the user command.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![self.command().clone()];
        argv.extend(self.args().iter().cloned());
        argv
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn generated_ids_are_64_hex() {
        let id = generate_id();
        assert_eq!(id.len(), ID_LEN);
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(id, generate_id());
    }

    #[test]
    fn short_id_is_12_chars() {
        let id = generate_id();
        assert_eq!(short_id(&id).len(), SHORT_ID_LEN);
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn limits_only_when_configured() -> Result<()> {
        let config = ContainerConfigBuilder::default()
            .id(generate_id())
            .command("/bin/sh")
            .build()?;
        assert!(config.limits().is_none());

        let config = ContainerConfigBuilder::default()
            .id(generate_id())
            .command("/bin/sh")
            .memory_bytes(Some(1024))
            .build()?;
        let limits = config.limits().expect("limits configured");
        assert_eq!(limits.memory_bytes(), Some(1024));
        assert_eq!(limits.cpu_period_us(), 100_000);
        Ok(())
    }

    #[test]
    fn argv_joins_command_and_args() -> Result<()> {
        let config = ContainerConfigBuilder::default()
            .id(generate_id())
            .command("/bin/echo")
            .args(vec!["hello".to_string(), "world".to_string()])
            .build()?;
        assert_eq!(config.argv(), vec!["/bin/echo", "hello", "world"]);
        Ok(())
    }

    #[test]
    fn config_serializes_camel_case() -> Result<()> {
        let config = ContainerConfigBuilder::default()
            .id("abc")
            .command("/bin/true")
            .image_ref(Some("alpine:latest".to_string()))
            .build()?;
        let json = serde_json::to_string(&config)?;
        assert!(json.contains("\"imageRef\":\"alpine:latest\""));
        assert!(json.contains("\"cpuPeriodUs\":100000"));
        assert!(!json.contains("rootfsPath"));
        Ok(())
    }
}
