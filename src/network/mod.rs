//! Container networking: bridge, IPAM, iptables and namespace plumbing.

pub mod bridge;
pub mod ipam;
pub mod iptables;
pub mod namespace;
pub mod netlink;
pub mod port;

use crate::network::{
    bridge::BridgeDriver,
    ipam::Ipam,
    iptables::{DefaultIptables, Iptables, Rule, RuleBuilder},
    port::PortMapping,
};
use anyhow::{Context, Result};
use ipnetwork::Ipv4Network;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::{net::Ipv4Addr, path::Path};
use strum::{AsRefStr, EnumString};

/// Name of the host bridge interface.
pub const BRIDGE_NAME: &str = "vessel0";

/// The fixed container subnet.
pub const SUBNET: &str = "172.17.0.0/16";

/// Gateway address inside the subnet, assigned to the bridge.
pub const GATEWAY: Ipv4Addr = Ipv4Addr::new(172, 17, 0, 1);

/// The parsed form of [`SUBNET`].
pub fn subnet() -> Ipv4Network {
    SUBNET.parse().expect("static subnet must parse")
}

#[derive(
    AsRefStr, Clone, Copy, Debug, Deserialize, EnumString, Eq, PartialEq, Serialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
/// Network attachment mode of a container.
pub enum NetworkMode {
    Bridge,
    Host,
    None,
}

impl Default for NetworkMode {
    fn default() -> Self {
        NetworkMode::Bridge
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
/// The network resources a running container holds.
pub struct NetworkState {
    pub mode: Option<NetworkMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub veth_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub veth_container: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub port_mappings: Vec<PortMapping>,
}

/// Facade over IPAM, the bridge driver and iptables, responsible for the
/// setup/teardown ordering and rollback on partial failure.
pub struct NetworkManager {
    ipam: Ipam,
    iptables: Box<dyn Iptables>,
    driver: BridgeDriver,
}

impl NetworkManager {
    /// Create a manager rooted at the network state directory.
    pub async fn new<P: AsRef<Path>>(network_dir: P) -> Result<Self> {
        Ok(Self {
            ipam: Ipam::new(network_dir, subnet(), GATEWAY),
            iptables: Box::new(DefaultIptables::from_path()?),
            driver: BridgeDriver::new().await.context("create bridge driver")?,
        })
    }

    /// The IP allocator.
    pub fn ipam(&self) -> &Ipam {
        &self.ipam
    }

    /// Ensure the bridge exists with its gateway address and that the
    /// subnet-wide masquerade and forward rules are installed.
    pub async fn ensure_bridge(&self) -> Result<()> {
        self.driver
            .ensure_bridge(BRIDGE_NAME, GATEWAY, subnet().prefix())
            .await
            .context("ensure bridge")?;

        for rule in bridge_rules()? {
            self.iptables
                .ensure(&rule)
                .await
                .with_context(|| format!("install bridge rule: {}", rule))?;
        }
        Ok(())
    }

    /// Attach the container with PID `pid` to the configured network and
    /// install its port mappings. Rolls back everything acquired here when
    /// any step fails.
    pub async fn setup(
        &self,
        container_id: &str,
        pid: i32,
        mode: NetworkMode,
        port_mappings: &[PortMapping],
    ) -> Result<NetworkState> {
        let mut state = NetworkState {
            mode: Some(mode),
            ..Default::default()
        };

        match mode {
            NetworkMode::Host => Ok(state),
            NetworkMode::None => {
                self.driver
                    .setup_loopback(pid)
                    .await
                    .context("setup loopback")?;
                Ok(state)
            }
            NetworkMode::Bridge => {
                let ip = self
                    .ipam
                    .allocate(container_id)
                    .await
                    .context("allocate container address")?;

                let veth = match self
                    .driver
                    .setup_veth(BRIDGE_NAME, container_id, pid, ip, subnet().prefix(), GATEWAY)
                    .await
                {
                    Ok(veth) => veth,
                    Err(e) => {
                        let _ = self.ipam.release(container_id).await;
                        return Err(e).context("setup veth pair");
                    }
                };

                if let Err(e) = self.install_port_mappings(port_mappings, ip).await {
                    let _ = self.driver.teardown_veth(container_id).await;
                    let _ = self.ipam.release(container_id).await;
                    return Err(e).context("install port mappings");
                }

                state.ip_address = Some(ip);
                state.gateway = Some(GATEWAY);
                state.mac_address = veth.mac_address().clone();
                state.veth_host = Some(veth.host().clone());
                state.veth_container = Some(veth.container().clone());
                state.port_mappings = port_mappings.to_vec();
                debug!("Container {} attached with address {}", container_id, ip);
                Ok(state)
            }
        }
    }

    /// Install all rules of all mappings; on failure the already applied
    /// rules are removed in reverse order before the error is returned.
    async fn install_port_mappings(
        &self,
        port_mappings: &[PortMapping],
        container_ip: Ipv4Addr,
    ) -> Result<()> {
        let mut applied: Vec<Rule> = vec![];
        for mapping in port_mappings {
            for rule in mapping.rules(container_ip)? {
                if let Err(e) = self.iptables.ensure(&rule).await {
                    for rule in applied.iter().rev() {
                        if let Err(e) = self.iptables.delete(rule).await {
                            warn!("Rollback of rule failed: {:#}", e);
                        }
                    }
                    return Err(e).with_context(|| format!("install rule: {}", rule));
                }
                applied.push(rule);
            }
        }
        Ok(())
    }

    /// Release everything `setup` acquired. Best effort: failures are
    /// logged, the address is always released.
    pub async fn teardown(&self, container_id: &str, state: &NetworkState) -> Result<()> {
        if state.mode != Some(NetworkMode::Bridge) {
            return Ok(());
        }

        if let Some(ip) = state.ip_address {
            for mapping in &state.port_mappings {
                for rule in mapping.rules(ip)? {
                    if let Err(e) = self.iptables.delete(&rule).await {
                        warn!("Removing rule failed: {:#}", e);
                    }
                }
            }
        }

        if let Err(e) = self.driver.teardown_veth(container_id).await {
            warn!("Removing veth failed: {:#}", e);
        }

        self.ipam
            .release(container_id)
            .await
            .context("release container address")
    }
}

/// The subnet-wide masquerade and bridge forward rules.
fn bridge_rules() -> Result<Vec<Rule>> {
    Ok(vec![
        RuleBuilder::default()
            .table("nat")
            .chain("POSTROUTING")
            .spec(split_spec(&format!(
                "-s {} ! -o {} -j MASQUERADE",
                SUBNET, BRIDGE_NAME
            )))
            .build()?,
        RuleBuilder::default()
            .chain("FORWARD")
            .spec(split_spec(&format!("-i {} -j ACCEPT", BRIDGE_NAME)))
            .build()?,
        RuleBuilder::default()
            .chain("FORWARD")
            .spec(split_spec(&format!("-o {} -j ACCEPT", BRIDGE_NAME)))
            .build()?,
    ])
}

fn split_spec(spec: &str) -> Vec<String> {
    spec.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn network_mode_parses() -> Result<()> {
        assert_eq!(NetworkMode::from_str("bridge")?, NetworkMode::Bridge);
        assert_eq!(NetworkMode::from_str("host")?, NetworkMode::Host);
        assert_eq!(NetworkMode::from_str("none")?, NetworkMode::None);
        assert!(NetworkMode::from_str("mesh").is_err());
        Ok(())
    }

    #[test]
    fn bridge_rules_shape() -> Result<()> {
        let rules = bridge_rules()?;
        assert_eq!(
            rules[0].to_string(),
            "-t nat POSTROUTING -s 172.17.0.0/16 ! -o vessel0 -j MASQUERADE"
        );
        assert_eq!(
            rules[1].to_string(),
            "-t filter FORWARD -i vessel0 -j ACCEPT"
        );
        assert_eq!(
            rules[2].to_string(),
            "-t filter FORWARD -o vessel0 -j ACCEPT"
        );
        Ok(())
    }

    #[test]
    fn network_state_serializes_camel_case() -> Result<()> {
        let state = NetworkState {
            mode: Some(NetworkMode::Bridge),
            ip_address: Some(Ipv4Addr::new(172, 17, 0, 2)),
            gateway: Some(GATEWAY),
            ..Default::default()
        };
        let json = serde_json::to_string(&state)?;
        assert!(json.contains("\"ipAddress\":\"172.17.0.2\""));
        assert!(json.contains("\"mode\":\"bridge\""));
        assert!(!json.contains("vethHost"));
        Ok(())
    }

    #[test]
    fn subnet_parses() {
        assert_eq!(subnet().prefix(), 16);
        assert_eq!(subnet().network(), Ipv4Addr::new(172, 17, 0, 0));
    }
}
