//! Persisted IP address management over the container subnet.

use crate::{atomic, error::Error};
use anyhow::{Context, Result};
use ipnetwork::Ipv4Network;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    net::Ipv4Addr,
    path::{Path, PathBuf},
};
use tokio::sync::Mutex;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
/// The persisted allocator state (`ipam.json`).
struct IpamState {
    subnet: Ipv4Network,
    gateway: Ipv4Addr,
    allocated: BTreeMap<String, Ipv4Addr>,
    last_allocated_host_part: u32,
}

#[derive(Debug)]
/// IP allocator for a fixed subnet, persisted as JSON and serialized by an
/// in-process lock held across load-mutate-save.
pub struct Ipam {
    path: PathBuf,
    subnet: Ipv4Network,
    gateway: Ipv4Addr,
    lock: Mutex<()>,
}

impl Ipam {
    /// Open the allocator; state is created lazily on first allocation.
    pub fn new<P: AsRef<Path>>(network_dir: P, subnet: Ipv4Network, gateway: Ipv4Addr) -> Self {
        Self {
            path: network_dir.as_ref().join("ipam.json"),
            subnet,
            gateway,
            lock: Mutex::new(()),
        }
    }

    /// The configured gateway address.
    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    /// The configured subnet.
    pub fn subnet(&self) -> Ipv4Network {
        self.subnet
    }

    /// Allocate an address for the container; a repeated call for the same
    /// container returns its existing assignment.
    pub async fn allocate(&self, container_id: &str) -> Result<Ipv4Addr> {
        let _guard = self.lock.lock().await;
        let mut state = self.load()?;

        if let Some(ip) = state.allocated.get(container_id) {
            trace!("Container {} already holds {}", container_id, ip);
            return Ok(*ip);
        }

        let base = u32::from(self.subnet.network());
        let gateway_part = u32::from(self.gateway) - base;
        let host_bits = 32 - u32::from(self.subnet.prefix());
        // Host parts walk [2, 2^host_bits - 2), skipping network, gateway
        // and broadcast.
        let lower = 2u32;
        let upper = (1u32 << host_bits) - 2;
        let span = upper - lower;

        let start = state.last_allocated_host_part.max(lower - 1) + 1;
        for offset in 0..span {
            let part = lower + (start - lower + offset) % span;
            if part == gateway_part {
                continue;
            }
            let candidate = Ipv4Addr::from(base + part);
            if state.allocated.values().any(|ip| *ip == candidate) {
                continue;
            }

            state.allocated.insert(container_id.into(), candidate);
            state.last_allocated_host_part = part;
            self.save(&state)?;
            debug!("Allocated {} for container {}", candidate, container_id);
            return Ok(candidate);
        }

        Err(Error::ResourceUnavailable(format!(
            "no free addresses in subnet {}",
            self.subnet
        ))
        .into())
    }

    /// Release the container's address. Releasing an unknown container is
    /// a no-op.
    pub async fn release(&self, container_id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut state = self.load()?;
        if state.allocated.remove(container_id).is_some() {
            self.save(&state)?;
            debug!("Released address of container {}", container_id);
        }
        Ok(())
    }

    /// The container's current assignment, if any.
    pub async fn get(&self, container_id: &str) -> Result<Option<Ipv4Addr>> {
        let _guard = self.lock.lock().await;
        Ok(self.load()?.allocated.get(container_id).copied())
    }

    fn load(&self) -> Result<IpamState> {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).context("parse ipam.json"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(IpamState {
                subnet: self.subnet,
                gateway: self.gateway,
                allocated: BTreeMap::new(),
                last_allocated_host_part: 1,
            }),
            Err(e) => Err(e).context("read ipam.json"),
        }
    }

    fn save(&self, state: &IpamState) -> Result<()> {
        atomic::write_json(&self.path, state).context("persist ipam.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ipam(dir: &Path) -> Ipam {
        Ipam::new(
            dir,
            "172.17.0.0/16".parse().expect("valid subnet"),
            Ipv4Addr::new(172, 17, 0, 1),
        )
    }

    #[tokio::test]
    async fn allocations_are_distinct() -> Result<()> {
        let dir = TempDir::new()?;
        let ipam = ipam(dir.path());

        let a = ipam.allocate("c1").await?;
        let b = ipam.allocate("c2").await?;
        let c = ipam.allocate("c3").await?;

        assert_eq!(a, Ipv4Addr::new(172, 17, 0, 2));
        assert_eq!(b, Ipv4Addr::new(172, 17, 0, 3));
        assert_eq!(c, Ipv4Addr::new(172, 17, 0, 4));
        Ok(())
    }

    #[tokio::test]
    async fn allocate_is_idempotent_per_container() -> Result<()> {
        let dir = TempDir::new()?;
        let ipam = ipam(dir.path());

        let first = ipam.allocate("c1").await?;
        let second = ipam.allocate("c1").await?;
        assert_eq!(first, second);
        Ok(())
    }

    #[tokio::test]
    async fn gateway_is_never_allocated() -> Result<()> {
        let dir = TempDir::new()?;
        let ipam = ipam(dir.path());

        for i in 0..16 {
            let ip = ipam.allocate(&format!("c{}", i)).await?;
            assert_ne!(ip, ipam.gateway());
        }
        Ok(())
    }

    #[tokio::test]
    async fn release_is_idempotent() -> Result<()> {
        let dir = TempDir::new()?;
        let ipam = ipam(dir.path());

        let ip = ipam.allocate("c1").await?;
        assert_eq!(ipam.get("c1").await?, Some(ip));

        ipam.release("c1").await?;
        ipam.release("c1").await?;
        ipam.release("never-allocated").await?;
        assert_eq!(ipam.get("c1").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn state_survives_reopen() -> Result<()> {
        let dir = TempDir::new()?;
        let ip = {
            let ipam = ipam(dir.path());
            ipam.allocate("c1").await?
        };

        let reopened = ipam(dir.path());
        assert_eq!(reopened.get("c1").await?, Some(ip));

        // The next allocation continues after the persisted cursor.
        let next = reopened.allocate("c2").await?;
        assert_eq!(next, Ipv4Addr::new(172, 17, 0, 3));
        Ok(())
    }

    #[tokio::test]
    async fn allocation_wraps_in_small_subnet() -> Result<()> {
        let dir = TempDir::new()?;
        let ipam = Ipam::new(
            dir.path(),
            "10.0.0.0/29".parse().expect("valid subnet"),
            Ipv4Addr::new(10, 0, 0, 1),
        );

        // /29 leaves host parts 2..=5 usable (6 is the exclusive bound).
        let mut ips = vec![];
        for i in 0..4 {
            ips.push(ipam.allocate(&format!("c{}", i)).await?);
        }
        assert_eq!(ips.len(), 4);

        let err = ipam.allocate("c-overflow").await.unwrap_err();
        assert!(err.to_string().contains("resource unavailable"));

        // Releasing one allows the cursor to wrap around.
        ipam.release("c0").await?;
        let reused = ipam.allocate("c-new").await?;
        assert_eq!(reused, ips[0]);
        Ok(())
    }
}
