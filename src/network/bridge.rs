//! Bridge and veth pair driver.
//!
//! The host bridge is created once and reused; per container a veth pair
//! is created, the host side enslaved to the bridge and the peer moved
//! into the container's network namespace where it becomes `eth0` with
//! the allocated address and a default route via the bridge gateway.

use crate::network::{
    namespace::Namespace,
    netlink::{DefaultNetlink, Netlink},
};
use anyhow::{format_err, Context, Result};
use getset::Getters;
use log::{debug, trace};
use std::net::Ipv4Addr;
use sysctl::{Ctl, Sysctl};

/// Short ID length used to derive interface names.
const VETH_ID_LEN: usize = 8;

#[derive(Getters)]
/// Driver for the host bridge and container veth pairs.
pub struct BridgeDriver {
    #[get]
    /// Internal netlink instance to be used.
    netlink: Box<dyn Netlink>,
}

#[derive(Clone, Debug, Getters)]
/// Result of a container veth setup.
pub struct VethPair {
    #[get = "pub"]
    /// Interface name on the host side.
    host: String,

    #[get = "pub"]
    /// Interface name given to the peer before it becomes `eth0`.
    container: String,

    #[get = "pub"]
    /// MAC address of the container side interface, if known.
    mac_address: Option<String>,
}

/// Derive the veth pair names from a container ID.
pub fn veth_names(container_id: &str) -> (String, String) {
    let short: String = container_id.chars().take(VETH_ID_LEN).collect();
    (format!("veth{}", short), format!("ceth{}", short))
}

impl BridgeDriver {
    /// Create a driver backed by a fresh netlink connection.
    pub async fn new() -> Result<Self> {
        Ok(Self {
            netlink: Box::new(
                DefaultNetlink::new()
                    .await
                    .context("create netlink instance")?,
            ),
        })
    }

    #[cfg(test)]
    fn with_netlink(netlink: Box<dyn Netlink>) -> Self {
        Self { netlink }
    }

    /// Idempotently create the bridge, assign the gateway address, bring
    /// it up and enable host IP forwarding.
    pub async fn ensure_bridge(&self, name: &str, gateway: Ipv4Addr, prefix: u8) -> Result<()> {
        let link = match self.netlink().link_by_name(name).await {
            Ok(link) => {
                trace!("Reusing existing bridge {}", name);
                link
            }
            Err(_) => {
                debug!("Creating bridge {}", name);
                self.netlink()
                    .create_bridge(name)
                    .await
                    .context("create bridge")?;
                self.netlink()
                    .link_by_name(name)
                    .await
                    .context("get created bridge")?
            }
        };

        if !self
            .netlink()
            .has_address(&link, gateway)
            .await
            .context("check bridge address")?
        {
            self.netlink()
                .add_address(&link, gateway, prefix)
                .await
                .context("assign bridge address")?;
        }

        self.netlink()
            .set_link_up(&link)
            .await
            .context("bring bridge up")?;

        enable_ip_forwarding().context("enable IP forwarding")?;
        Ok(())
    }

    /// Create the container veth pair, attach the host side to the bridge
    /// and move the peer into the network namespace of `pid`. The peer is
    /// then configured inside that namespace.
    #[allow(clippy::too_many_arguments)]
    pub async fn setup_veth(
        &self,
        bridge_name: &str,
        container_id: &str,
        pid: i32,
        ip: Ipv4Addr,
        prefix: u8,
        gateway: Ipv4Addr,
    ) -> Result<VethPair> {
        let (host_name, peer_name) = veth_names(container_id);
        debug!(
            "Setting up veth pair ({}, {}) for PID {}",
            host_name, peer_name, pid
        );

        self.netlink()
            .create_veth(&host_name, &peer_name)
            .await
            .context("create veth pair")?;

        let result = self
            .connect_veth(bridge_name, &host_name, &peer_name, pid, ip, prefix, gateway)
            .await;
        if result.is_err() {
            // Unwind the pair; deleting the host side removes the peer.
            let _ = self.netlink().delete_link(&host_name).await;
        }
        let mac_address = result?;

        Ok(VethPair {
            host: host_name,
            container: peer_name,
            mac_address,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn connect_veth(
        &self,
        bridge_name: &str,
        host_name: &str,
        peer_name: &str,
        pid: i32,
        ip: Ipv4Addr,
        prefix: u8,
        gateway: Ipv4Addr,
    ) -> Result<Option<String>> {
        let bridge = self
            .netlink()
            .link_by_name(bridge_name)
            .await
            .context("get bridge link")?;
        let host = self
            .netlink()
            .link_by_name(host_name)
            .await
            .context("get host veth link")?;

        self.netlink()
            .set_master(&host, &bridge)
            .await
            .context("attach host veth to bridge")?;
        self.netlink()
            .set_link_up(&host)
            .await
            .context("bring host veth up")?;

        let peer = self
            .netlink()
            .link_by_name(peer_name)
            .await
            .context("get peer veth link")?;
        self.netlink()
            .set_ns_by_pid(&peer, pid as u32)
            .await
            .context("move peer into container namespace")?;

        // The rest happens inside the container's namespace on a pinned
        // thread with its own netlink connection.
        let peer_name = peer_name.to_string();
        Namespace::of_pid(pid)
            .context("open container network namespace")?
            .run(move || async move {
                let netlink = DefaultNetlink::new()
                    .await
                    .context("create in-namespace netlink instance")?;

                let peer = netlink
                    .link_by_name(&peer_name)
                    .await
                    .context("get peer inside namespace")?;
                netlink
                    .rename_link(&peer, "eth0")
                    .await
                    .context("rename peer to eth0")?;

                let eth0 = netlink
                    .link_by_name("eth0")
                    .await
                    .context("get eth0 link")?;
                netlink
                    .add_address(&eth0, ip, prefix)
                    .await
                    .context("assign container address")?;
                netlink
                    .set_link_up(&eth0)
                    .await
                    .context("bring eth0 up")?;
                netlink
                    .add_default_route(gateway)
                    .await
                    .context("add default route")?;

                let lo = netlink
                    .link_by_name("lo")
                    .await
                    .context("get loopback link")?;
                netlink
                    .set_link_up(&lo)
                    .await
                    .context("bring loopback up")?;

                Ok(eth0.mac_address())
            })
            .await
            .context("configure peer inside namespace")
    }

    /// Bring only the loopback device up inside the namespace of `pid`.
    /// Used for the `none` network mode.
    pub async fn setup_loopback(&self, pid: i32) -> Result<()> {
        Namespace::of_pid(pid)
            .context("open container network namespace")?
            .run(move || async move {
                let netlink = DefaultNetlink::new()
                    .await
                    .context("create in-namespace netlink instance")?;
                let lo = netlink
                    .link_by_name("lo")
                    .await
                    .context("get loopback link")?;
                netlink.set_link_up(&lo).await.context("bring loopback up")
            })
            .await
            .context("configure loopback inside namespace")
    }

    /// Delete the container's host side veth; the kernel removes the peer
    /// automatically. Absence is success.
    pub async fn teardown_veth(&self, container_id: &str) -> Result<()> {
        let (host_name, _) = veth_names(container_id);
        trace!("Deleting host veth {}", host_name);
        self.netlink()
            .delete_link(&host_name)
            .await
            .context("delete host veth")
    }
}

/// Turn on `net.ipv4.ip_forward` so bridged traffic can leave the host.
fn enable_ip_forwarding() -> Result<()> {
    let key = "net.ipv4.ip_forward";
    let ctl = Ctl::new(key).map_err(|e| format_err!("get sysctl {}: {}", key, e))?;
    ctl.set_value_string("1")
        .map_err(|e| format_err!("set sysctl {}: {}", key, e))?;
    Ok(())
}
