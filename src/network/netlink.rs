//! Netlink related helpers and structures.

use anyhow::{Context, Result};
use async_trait::async_trait;
use dyn_clone::{clone_trait_object, DynClone};
use futures_util::stream::TryStreamExt;
use getset::Getters;
use log::{debug, trace};
use rtnetlink::packet::rtnl::{
    address::nlas::Nla as AddressNla, link::nlas::Nla as LinkNla, LinkMessage,
};
use std::{fmt, net::Ipv4Addr};

#[async_trait]
/// Netlink behavior trait. Queries have no sensible default and must be
/// provided; mutating operations default to no-ops so tests can mock only
/// what they assert on.
pub trait Netlink: DynClone + Send + Sync {
    /// Get a link referenced by its name.
    async fn link_by_name(&self, name: &str) -> Result<Link>;

    /// Whether an address is already assigned to the link.
    async fn has_address(&self, _link: &Link, _ip: Ipv4Addr) -> Result<bool> {
        Ok(false)
    }

    /// Create a bridge interface.
    async fn create_bridge(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    /// Create a veth pair.
    async fn create_veth(&self, _name: &str, _peer: &str) -> Result<()> {
        Ok(())
    }

    /// Set a link up.
    async fn set_link_up(&self, _link: &Link) -> Result<()> {
        Ok(())
    }

    /// Attach a link to a master (bridge) device.
    async fn set_master(&self, _link: &Link, _master: &Link) -> Result<()> {
        Ok(())
    }

    /// Move a link into the network namespace of the given PID.
    async fn set_ns_by_pid(&self, _link: &Link, _pid: u32) -> Result<()> {
        Ok(())
    }

    /// Rename a link.
    async fn rename_link(&self, _link: &Link, _name: &str) -> Result<()> {
        Ok(())
    }

    /// Assign an IPv4 address with prefix to the link.
    async fn add_address(&self, _link: &Link, _ip: Ipv4Addr, _prefix: u8) -> Result<()> {
        Ok(())
    }

    /// Install the IPv4 default route via the gateway.
    async fn add_default_route(&self, _gateway: Ipv4Addr) -> Result<()> {
        Ok(())
    }

    /// Delete a link. Absence is success.
    async fn delete_link(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

clone_trait_object!(Netlink);

#[derive(Clone, Debug, Default, Getters)]
/// A link returned by netlink usage.
pub struct Link {
    #[get = "pub"]
    name: String,

    #[get = "pub"]
    message: LinkMessage,
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Link {
    /// Create a link from its raw parts.
    pub fn new(name: impl Into<String>, message: LinkMessage) -> Self {
        Self {
            name: name.into(),
            message,
        }
    }

    /// The kernel interface index.
    pub fn index(&self) -> u32 {
        self.message.header.index
    }

    /// The hardware address, formatted as colon separated hex.
    pub fn mac_address(&self) -> Option<String> {
        self.message.nlas.iter().find_map(|nla| match nla {
            LinkNla::Address(bytes) => Some(
                bytes
                    .iter()
                    .map(|b| format!("{:02x}", b))
                    .collect::<Vec<_>>()
                    .join(":"),
            ),
            _ => None,
        })
    }
}

#[derive(Clone, Debug)]
/// The default netlink implementation backed by an rtnetlink socket.
pub struct DefaultNetlink {
    handle: rtnetlink::Handle,
}

impl DefaultNetlink {
    /// Create a new netlink instance.
    pub async fn new() -> Result<Self> {
        debug!("Creating new netlink connection");

        let (connection, handle, _) =
            rtnetlink::new_connection().context("create new netlink connection")?;
        tokio::spawn(connection);

        Ok(Self { handle })
    }
}

#[async_trait]
impl Netlink for DefaultNetlink {
    async fn link_by_name(&self, name: &str) -> Result<Link> {
        let message = self
            .handle
            .link()
            .get()
            .set_name_filter(name.into())
            .execute()
            .try_next()
            .await
            .context("get links")?
            .with_context(|| format!("no link found for name {}", name))?;
        trace!("Got link by name {}: {:?}", name, message.header);
        Ok(Link::new(name, message))
    }

    async fn has_address(&self, link: &Link, ip: Ipv4Addr) -> Result<bool> {
        let mut addresses = self
            .handle
            .address()
            .get()
            .set_link_index_filter(link.index())
            .execute();

        while let Some(message) = addresses.try_next().await.context("get addresses")? {
            let found = message.nlas.iter().any(|nla| match nla {
                AddressNla::Address(bytes) => bytes.as_slice() == ip.octets(),
                _ => false,
            });
            if found {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn create_bridge(&self, name: &str) -> Result<()> {
        trace!("Creating bridge {}", name);
        self.handle
            .link()
            .add()
            .bridge(name.into())
            .execute()
            .await
            .context("create bridge")
    }

    async fn create_veth(&self, name: &str, peer: &str) -> Result<()> {
        trace!("Creating veth pair {} <-> {}", name, peer);
        self.handle
            .link()
            .add()
            .veth(name.into(), peer.into())
            .execute()
            .await
            .context("create veth pair")
    }

    async fn set_link_up(&self, link: &Link) -> Result<()> {
        trace!("Setting link {} up", link);
        self.handle
            .link()
            .set(link.index())
            .up()
            .execute()
            .await
            .context("set link up")
    }

    async fn set_master(&self, link: &Link, master: &Link) -> Result<()> {
        trace!("Attaching {} to master {}", link, master);
        self.handle
            .link()
            .set(link.index())
            .master(master.index())
            .execute()
            .await
            .context("set link master")
    }

    async fn set_ns_by_pid(&self, link: &Link, pid: u32) -> Result<()> {
        trace!("Moving link {} into netns of PID {}", link, pid);
        self.handle
            .link()
            .set(link.index())
            .setns_by_pid(pid)
            .execute()
            .await
            .context("move link into namespace")
    }

    async fn rename_link(&self, link: &Link, name: &str) -> Result<()> {
        trace!("Renaming link {} to {}", link, name);
        self.handle
            .link()
            .set(link.index())
            .name(name.into())
            .execute()
            .await
            .context("rename link")
    }

    async fn add_address(&self, link: &Link, ip: Ipv4Addr, prefix: u8) -> Result<()> {
        trace!("Assigning {}/{} to {}", ip, prefix, link);
        self.handle
            .address()
            .add(link.index(), ip.into(), prefix)
            .execute()
            .await
            .context("add address")
    }

    async fn add_default_route(&self, gateway: Ipv4Addr) -> Result<()> {
        trace!("Adding default route via {}", gateway);
        self.handle
            .route()
            .add()
            .v4()
            .destination_prefix(Ipv4Addr::UNSPECIFIED, 0)
            .gateway(gateway)
            .execute()
            .await
            .context("add default route")
    }

    async fn delete_link(&self, name: &str) -> Result<()> {
        let link = match self.link_by_name(name).await {
            Ok(link) => link,
            // Already gone.
            Err(_) => return Ok(()),
        };
        self.handle
            .link()
            .del(link.index())
            .execute()
            .await
            .context("delete link")
    }
}
