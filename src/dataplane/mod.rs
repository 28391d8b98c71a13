//! # Network Plumber
//!
//! Host-to-container connectivity over a veth pair:
//!
//! ```text
//!   host namespace                       container namespace
//!  ┌──────────────────────┐             ┌──────────────────────────────┐
//!  │ cali1a2b3c4d5e6      │◄──veth────► │ eth0  10.0.0.7/32            │
//!  │  up, mtu, proxy_arp  │             │  169.254.1.1/32 scope link   │
//!  └──────────────────────┘             │  default via 169.254.1.1     │
//!                                       └──────────────────────────────┘
//! ```
//!
//! The container never learns the real gateway: it routes everything to the
//! link-local `169.254.1.1`, which the host side answers ARP for. Both routes
//! are installed with the kernel's defaults for manual routes (`proto boot`,
//! `table main`, unicast).
//!
//! Creation replaces a host link left over from an earlier attempt; deletion
//! of a missing link succeeds.
//!
//! ## Implementations
//!
//! | Backend | Drives | Use |
//! |---------|--------|-----|
//! | [`NetlinkDataplane`] | rtnetlink sockets | production |
//! | [`SimulatedDataplane`] | in-memory link table | tests |

pub mod netlink;
pub mod simulated;

pub use self::netlink::NetlinkDataplane;
pub use self::simulated::{PlumbingStep, SimulatedDataplane};

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ipnetwork::{IpNetwork, Ipv4Network};
use macaddr::MacAddr6;

use crate::constants::{CONTAINER_GATEWAY_V4, RT_TABLE_MAIN};
use crate::error::Result;

// =============================================================================
// Types
// =============================================================================

/// Snapshot of one network link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub name: String,
    pub index: u32,
    pub mtu: u32,
    /// Administratively up.
    pub up: bool,
    pub mac: Option<MacAddr6>,
}

/// Request to create a veth pair for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethRequest {
    /// Deterministic host-side name.
    pub host_iface: String,
    /// Name the peer carries while still in the host namespace.
    pub temp_iface: String,
    /// Final container-side name.
    pub container_iface: String,
    /// Target namespace.
    pub netns: PathBuf,
    /// MTU for both ends.
    pub mtu: u32,
}

/// Both ends of a freshly created veth pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethPair {
    /// Host-side link, up.
    pub host: LinkInfo,
    /// Container-side link, inside the target namespace, still down.
    pub container: LinkInfo,
}

/// Route scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteScope {
    Universe,
    Link,
    Host,
    Other,
}

/// Route origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteProtocol {
    Boot,
    Kernel,
    Static,
    Other,
}

/// Route type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Unicast,
    Local,
    Broadcast,
    Other,
}

/// One routing table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    /// `None` for the default route.
    pub destination: Option<IpNetwork>,
    pub gateway: Option<IpAddr>,
    pub device: Option<String>,
    pub scope: RouteScope,
    pub protocol: RouteProtocol,
    pub table: u32,
    pub kind: RouteKind,
}

impl RouteInfo {
    /// Returns true for a default route.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.destination.is_none_or(|dst| dst.prefix() == 0)
    }
}

/// Returns the two routes every container gets on `ifname`: a link-scope
/// route to the gateway and a default route through it.
#[must_use]
pub fn container_routes(ifname: &str) -> Vec<RouteInfo> {
    let gateway: Ipv4Addr = CONTAINER_GATEWAY_V4;
    vec![
        RouteInfo {
            destination: Some(IpNetwork::V4(Ipv4Network::from(gateway))),
            gateway: None,
            device: Some(ifname.to_string()),
            scope: RouteScope::Link,
            protocol: RouteProtocol::Boot,
            table: RT_TABLE_MAIN,
            kind: RouteKind::Unicast,
        },
        RouteInfo {
            destination: None,
            gateway: Some(IpAddr::V4(gateway)),
            device: Some(ifname.to_string()),
            scope: RouteScope::Universe,
            protocol: RouteProtocol::Boot,
            table: RT_TABLE_MAIN,
            kind: RouteKind::Unicast,
        },
    ]
}

// =============================================================================
// Trait
// =============================================================================

/// Kernel networking capability.
///
/// `netns: None` in queries means the namespace this process runs in.
#[async_trait]
pub trait NetworkPlumber: Send + Sync {
    /// Returns the backend name for logs.
    fn name(&self) -> &str;

    /// Fails with [`Error::NamespaceUnavailable`](crate::Error::NamespaceUnavailable)
    /// unless `netns` can be entered.
    async fn check_namespace(&self, netns: &Path) -> Result<()>;

    /// Creates the veth pair, moves the peer into the target namespace under
    /// its final name and brings the host side up.
    async fn create_veth(&self, request: &VethRequest) -> Result<VethPair>;

    /// Assigns `addresses` to `ifname` inside `netns`, brings it up and
    /// installs [`container_routes`].
    async fn configure_container_side(
        &self,
        netns: &Path,
        ifname: &str,
        addresses: &[IpNetwork],
    ) -> Result<()>;

    /// Deletes a host-side link by name, and with it the veth peer wherever
    /// that lives. Returns false if it did not exist.
    async fn delete_host_link(&self, name: &str) -> Result<bool>;

    /// Looks up a link by name.
    async fn link(&self, netns: Option<&Path>, name: &str) -> Result<Option<LinkInfo>>;

    /// Lists the global-scope addresses on a link.
    async fn addresses(&self, netns: Option<&Path>, name: &str) -> Result<Vec<IpNetwork>>;

    /// Lists the main table's routes.
    async fn routes(&self, netns: Option<&Path>) -> Result<Vec<RouteInfo>>;

    /// Returns true if the link exists.
    async fn link_exists(&self, netns: Option<&Path>, name: &str) -> Result<bool> {
        Ok(self.link(netns, name).await?.is_some())
    }

    /// Returns the link's MTU, if it exists.
    async fn link_mtu(&self, netns: Option<&Path>, name: &str) -> Result<Option<u32>> {
        Ok(self.link(netns, name).await?.map(|link| link.mtu))
    }

    /// Returns true if the link exists and is administratively up.
    async fn link_is_up(&self, netns: Option<&Path>, name: &str) -> Result<bool> {
        Ok(self.link(netns, name).await?.is_some_and(|link| link.up))
    }
}
