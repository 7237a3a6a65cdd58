//! Host to container port mapping functionality.

use crate::{
    error::Error,
    network::iptables::{Rule, RuleBuilder},
};
use anyhow::Result;
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use std::{fmt, net::Ipv4Addr, str::FromStr};
use strum::{AsRefStr, EnumString};

#[derive(
    AsRefStr, Clone, Copy, Debug, Deserialize, EnumString, Eq, PartialEq, Serialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
/// Transport protocol of a port mapping.
pub enum Protocol {
    Tcp,
    Udp,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Tcp
    }
}

#[derive(
    Builder, Clone, Copy, CopyGetters, Debug, Deserialize, Eq, Getters, PartialEq, Serialize,
)]
#[builder(pattern = "owned", setter(into))]
#[serde(rename_all = "camelCase")]
/// A PortMapping represents a host to container port connection.
pub struct PortMapping {
    #[get_copy = "pub"]
    #[builder(default = "Ipv4Addr::UNSPECIFIED")]
    /// Host address to bind, `0.0.0.0` for all interfaces.
    host_ip: Ipv4Addr,

    #[get_copy = "pub"]
    /// The port number on the host.
    host_port: u16,

    #[get_copy = "pub"]
    /// The port number inside the container.
    container_port: u16,

    #[get_copy = "pub"]
    #[builder(default)]
    /// The protocol of the port mapping.
    protocol: Protocol,
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}/{}",
            self.host_ip,
            self.host_port,
            self.container_port,
            self.protocol.as_ref()
        )
    }
}

impl FromStr for PortMapping {
    type Err = anyhow::Error;

    /// Parse the `[HOST_IP:]HPORT:CPORT[/PROTO]` grammar.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidConfig(format!("invalid port mapping: {}", s));

        let (ports, protocol) = match s.split_once('/') {
            Some((ports, proto)) => (
                ports,
                Protocol::from_str(&proto.to_lowercase()).map_err(|_| invalid())?,
            ),
            None => (s, Protocol::default()),
        };

        let parts: Vec<&str> = ports.split(':').collect();
        let (host_ip, host_port, container_port) = match parts.as_slice() {
            [hport, cport] => (Ipv4Addr::UNSPECIFIED, hport, cport),
            [ip, hport, cport] => (ip.parse().map_err(|_| invalid())?, hport, cport),
            _ => return Err(invalid().into()),
        };

        let host_port: u16 = host_port.parse().map_err(|_| invalid())?;
        let container_port: u16 = container_port.parse().map_err(|_| invalid())?;
        if host_port == 0 || container_port == 0 {
            return Err(invalid().into());
        }

        Ok(Self {
            host_ip,
            host_port,
            container_port,
            protocol,
        })
    }
}

impl PortMapping {
    /// The iptables rules realizing this mapping for a container address,
    /// in installation order.
    ///
    /// Both DNAT rules are restricted to locally destined traffic so that
    /// host egress towards remote peers on the same port is not hijacked.
    pub fn rules(&self, container_ip: Ipv4Addr) -> Result<Vec<Rule>> {
        let mut dnat_spec = vec!["-p".to_string(), self.protocol.as_ref().to_string()];
        if !self.host_ip.is_unspecified() {
            dnat_spec.extend(vec!["-d".to_string(), self.host_ip.to_string()]);
        }
        dnat_spec.extend(vec![
            "-m".to_string(),
            "addrtype".to_string(),
            "--dst-type".to_string(),
            "LOCAL".to_string(),
            "--dport".to_string(),
            self.host_port.to_string(),
            "-j".to_string(),
            "DNAT".to_string(),
            "--to-destination".to_string(),
            format!("{}:{}", container_ip, self.container_port),
        ]);

        Ok(vec![
            RuleBuilder::default()
                .table("nat")
                .chain("PREROUTING")
                .spec(dnat_spec.clone())
                .build()?,
            RuleBuilder::default()
                .table("nat")
                .chain("OUTPUT")
                .spec(dnat_spec)
                .build()?,
            RuleBuilder::default()
                .table("filter")
                .chain("FORWARD")
                .spec(vec![
                    "-p".to_string(),
                    self.protocol.as_ref().to_string(),
                    "-d".to_string(),
                    container_ip.to_string(),
                    "--dport".to_string(),
                    self.container_port.to_string(),
                    "-j".to_string(),
                    "ACCEPT".to_string(),
                ])
                .build()?,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal() -> Result<()> {
        let mapping: PortMapping = "8080:80".parse()?;
        assert_eq!(mapping.host_ip(), Ipv4Addr::UNSPECIFIED);
        assert_eq!(mapping.host_port(), 8080);
        assert_eq!(mapping.container_port(), 80);
        assert_eq!(mapping.protocol(), Protocol::Tcp);
        Ok(())
    }

    #[test]
    fn parse_with_ip_and_protocol() -> Result<()> {
        let mapping: PortMapping = "127.0.0.1:5353:53/udp".parse()?;
        assert_eq!(mapping.host_ip(), Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(mapping.host_port(), 5353);
        assert_eq!(mapping.container_port(), 53);
        assert_eq!(mapping.protocol(), Protocol::Udp);
        Ok(())
    }

    #[test]
    fn parse_uppercase_protocol() -> Result<()> {
        let mapping: PortMapping = "80:80/TCP".parse()?;
        assert_eq!(mapping.protocol(), Protocol::Tcp);
        Ok(())
    }

    #[test]
    fn parse_rejects_garbage() {
        for input in ["", "80", "0:80", "80:0", "a:b", "1:2:3:4", "80:80/icmp"] {
            assert!(input.parse::<PortMapping>().is_err(), "accepted {}", input);
        }
    }

    #[test]
    fn display_format() -> Result<()> {
        let mapping: PortMapping = "8080:80".parse()?;
        assert_eq!(mapping.to_string(), "0.0.0.0:8080->80/tcp");
        Ok(())
    }

    #[test]
    fn rules_for_unspecified_host() -> Result<()> {
        let mapping: PortMapping = "8080:80".parse()?;
        let rules = mapping.rules(Ipv4Addr::new(172, 17, 0, 2))?;
        assert_eq!(rules.len(), 3);

        assert_eq!(
            rules[0].to_string(),
            "-t nat PREROUTING -p tcp -m addrtype --dst-type LOCAL \
             --dport 8080 -j DNAT --to-destination 172.17.0.2:80"
        );
        assert_eq!(rules[1].chain(), "OUTPUT");
        assert_eq!(
            rules[2].to_string(),
            "-t filter FORWARD -p tcp -d 172.17.0.2 --dport 80 -j ACCEPT"
        );
        Ok(())
    }

    #[test]
    fn rules_include_host_ip_match() -> Result<()> {
        let mapping: PortMapping = "127.0.0.1:8080:80".parse()?;
        let rules = mapping.rules(Ipv4Addr::new(172, 17, 0, 2))?;
        assert!(rules[0].spec().contains(&"-d".to_string()));
        assert!(rules[0].spec().contains(&"127.0.0.1".to_string()));
        Ok(())
    }

    #[test]
    fn serde_round_trip() -> Result<()> {
        let mapping: PortMapping = "127.0.0.1:8080:80/udp".parse()?;
        let json = serde_json::to_string(&mapping)?;
        assert!(json.contains("\"hostPort\":8080"));
        assert!(json.contains("\"protocol\":\"udp\""));
        let back: PortMapping = serde_json::from_str(&json)?;
        assert_eq!(back, mapping);
        Ok(())
    }
}
