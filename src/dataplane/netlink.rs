//! rtnetlink backend.
//!
//! Talks to the kernel over `NETLINK_ROUTE` sockets. A socket belongs to the
//! network namespace it was opened in, so container-side operations use a
//! second connection opened after a short `setns(2)` into the target
//! namespace. The calling thread is switched back before anything awaits.
//!
//! ## Request Map
//!
//! | Operation | Request |
//! |-----------|---------|
//! | create pair | `RTM_NEWLINK` veth `<host>` peer `<tmp>` |
//! | move peer | `RTM_SETLINK <tmp>` `IFLA_NET_NS_FD` |
//! | rename peer | `RTM_SETLINK` `IFLA_IFNAME` (container socket) |
//! | address | `RTM_NEWADDR` (container socket) |
//! | route | `RTM_NEWROUTE` with protocol, scope, table and type attributes |
//! | proxy ARP | write `1` to `/proc/sys/net/ipv4/conf/<host>/proxy_arp` |
//!
//! Missing links are recognised by the kernel's `ENODEV` reply, never by
//! message text.

use std::collections::HashMap;
use std::fs::File;
use std::future::Future;
use std::net::IpAddr;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use ipnetwork::IpNetwork;
use macaddr::MacAddr6;
use netlink_packet_route::address::{AddressAttribute, AddressMessage, AddressScope};
use netlink_packet_route::link::{LinkAttribute, LinkFlag, LinkMessage};
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteMessage, RouteProtocol as NlRouteProtocol,
    RouteScope as NlRouteScope, RouteType,
};
use rtnetlink::{Handle, IpVersion};
use tracing::{debug, error, warn};

use super::{
    LinkInfo, NetworkPlumber, RouteInfo, RouteKind, RouteProtocol, RouteScope, VethPair,
    VethRequest, container_routes,
};
use crate::constants::{DATAPLANE_REQUEST_TIMEOUT, RT_TABLE_MAIN};
use crate::error::{Error, Result};

/// Namespace handle of the calling thread.
const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

// =============================================================================
// Errors
// =============================================================================

/// Outcome of a failed netlink request.
#[derive(Debug, thiserror::Error)]
enum NetlinkError {
    #[error("link {0} not found")]
    LinkNotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("netlink request failed: {0}")]
    Request(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl NetlinkError {
    fn from_request(err: rtnetlink::Error, link: &str) -> Self {
        let code = match &err {
            rtnetlink::Error::NetlinkError(msg) => msg.code.map(|code| code.get()),
            _ => None,
        };
        Self::from_errno(code, link).unwrap_or_else(|| Self::Request(err.to_string()))
    }

    /// Classifies the (negative) errno of a kernel reply.
    fn from_errno(code: Option<i32>, link: &str) -> Option<Self> {
        match code.map(i32::wrapping_neg) {
            Some(libc::ENODEV) => Some(Self::LinkNotFound(link.to_string())),
            Some(libc::EEXIST) => Some(Self::AlreadyExists(link.to_string())),
            _ => None,
        }
    }

    fn into_plumbing(self, operation: &'static str, link: &str) -> Error {
        Error::PlumbingFailed {
            operation,
            link: link.to_string(),
            reason: self.to_string(),
        }
    }
}

type NetlinkResult<T> = std::result::Result<T, NetlinkError>;

// =============================================================================
// Namespace Switching
// =============================================================================

/// Keeps the calling thread inside another network namespace until dropped.
struct NetnsGuard {
    original: File,
}

impl NetnsGuard {
    fn enter(netns: &Path) -> Result<Self> {
        let unavailable = |e: std::io::Error| Error::NamespaceUnavailable {
            path: netns.to_path_buf(),
            reason: e.to_string(),
        };
        let target = File::open(netns).map_err(unavailable)?;
        let original = File::open(THREAD_NETNS)
            .map_err(|e| Error::Internal(format!("{THREAD_NETNS}: {e}")))?;
        setns(&target).map_err(unavailable)?;
        Ok(Self { original })
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(&self.original) {
            error!(error = %e, "failed to return to the original network namespace");
        }
    }
}

fn setns(ns: &File) -> std::io::Result<()> {
    // SAFETY: the descriptor stays open for the duration of the call and the
    // kernel does not keep it.
    let rc = unsafe { libc::setns(ns.as_raw_fd(), libc::CLONE_NEWNET) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

// =============================================================================
// Message Conversion
// =============================================================================

fn link_info(msg: &LinkMessage) -> LinkInfo {
    let mut info = LinkInfo {
        name: String::new(),
        index: msg.header.index,
        mtu: 0,
        up: msg.header.flags.contains(&LinkFlag::Up),
        mac: None,
    };
    for attr in &msg.attributes {
        match attr {
            LinkAttribute::IfName(name) => info.name.clone_from(name),
            LinkAttribute::Mtu(mtu) => info.mtu = *mtu,
            LinkAttribute::Address(bytes) => {
                info.mac = <[u8; 6]>::try_from(bytes.as_slice())
                    .ok()
                    .map(MacAddr6::from);
            }
            _ => {}
        }
    }
    info
}

fn global_address(msg: &AddressMessage) -> Option<IpNetwork> {
    if msg.header.scope != AddressScope::Universe {
        return None;
    }
    msg.attributes.iter().find_map(|attr| match attr {
        AddressAttribute::Address(ip) => IpNetwork::new(*ip, msg.header.prefix_len).ok(),
        _ => None,
    })
}

fn route_ip(addr: &RouteAddress) -> Option<IpAddr> {
    match addr {
        RouteAddress::Inet(v4) => Some(IpAddr::V4(*v4)),
        RouteAddress::Inet6(v6) => Some(IpAddr::V6(*v6)),
        _ => None,
    }
}

fn route_info(msg: &RouteMessage, names: &HashMap<u32, String>) -> RouteInfo {
    let prefix = msg.header.destination_prefix_length;
    let mut route = RouteInfo {
        destination: None,
        gateway: None,
        device: None,
        scope: match msg.header.scope {
            NlRouteScope::Universe => RouteScope::Universe,
            NlRouteScope::Link => RouteScope::Link,
            NlRouteScope::Host => RouteScope::Host,
            _ => RouteScope::Other,
        },
        protocol: match msg.header.protocol {
            NlRouteProtocol::Boot => RouteProtocol::Boot,
            NlRouteProtocol::Kernel => RouteProtocol::Kernel,
            NlRouteProtocol::Static => RouteProtocol::Static,
            _ => RouteProtocol::Other,
        },
        table: u32::from(msg.header.table),
        kind: match msg.header.kind {
            RouteType::Unicast => RouteKind::Unicast,
            RouteType::Local => RouteKind::Local,
            RouteType::Broadcast => RouteKind::Broadcast,
            _ => RouteKind::Other,
        },
    };
    for attr in &msg.attributes {
        match attr {
            RouteAttribute::Destination(addr) if prefix > 0 => {
                route.destination = route_ip(addr).and_then(|ip| IpNetwork::new(ip, prefix).ok());
            }
            RouteAttribute::Gateway(addr) => route.gateway = route_ip(addr),
            RouteAttribute::Oif(index) => route.device = names.get(index).cloned(),
            RouteAttribute::Table(table) => route.table = *table,
            _ => {}
        }
    }
    route
}

fn nl_scope(scope: RouteScope) -> NlRouteScope {
    match scope {
        RouteScope::Link => NlRouteScope::Link,
        RouteScope::Host => NlRouteScope::Host,
        RouteScope::Universe | RouteScope::Other => NlRouteScope::Universe,
    }
}

fn nl_protocol(protocol: RouteProtocol) -> NlRouteProtocol {
    match protocol {
        RouteProtocol::Kernel => NlRouteProtocol::Kernel,
        RouteProtocol::Static => NlRouteProtocol::Static,
        RouteProtocol::Boot | RouteProtocol::Other => NlRouteProtocol::Boot,
    }
}

fn nl_kind(kind: RouteKind) -> RouteType {
    match kind {
        RouteKind::Local => RouteType::Local,
        RouteKind::Broadcast => RouteType::Broadcast,
        RouteKind::Unicast | RouteKind::Other => RouteType::Unicast,
    }
}

// =============================================================================
// Backend
// =============================================================================

/// [`NetworkPlumber`] speaking rtnetlink.
#[derive(Debug, Clone)]
pub struct NetlinkDataplane {
    proc_sys: PathBuf,
    timeout: Duration,
}

impl Default for NetlinkDataplane {
    fn default() -> Self {
        Self::new()
    }
}

impl NetlinkDataplane {
    /// Creates a backend with the default request timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            proc_sys: PathBuf::from("/proc/sys"),
            timeout: DATAPLANE_REQUEST_TIMEOUT,
        }
    }

    /// Opens a route socket in `netns` (`None` = this namespace).
    fn connect(&self, netns: Option<&Path>) -> Result<Handle> {
        let _guard = netns.map(NetnsGuard::enter).transpose()?;
        let (connection, handle, _) = rtnetlink::new_connection().map_err(|e| {
            Error::PlumbingFailed {
                operation: "open netlink socket for",
                link: netns.map_or_else(String::new, |p| p.display().to_string()),
                reason: e.to_string(),
            }
        })?;
        tokio::spawn(connection);
        Ok(handle)
    }

    /// Runs one request under the timeout.
    async fn exec<T, F>(&self, link: &str, request: F) -> NetlinkResult<T>
    where
        F: Future<Output = std::result::Result<T, rtnetlink::Error>>,
    {
        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(NetlinkError::from_request(e, link)),
            Err(_) => Err(NetlinkError::Timeout(self.timeout)),
        }
    }

    async fn find_link(&self, handle: &Handle, name: &str) -> NetlinkResult<Option<LinkMessage>> {
        let mut links = handle.link().get().match_name(name.to_string()).execute();
        match self.exec(name, links.try_next()).await {
            Err(NetlinkError::LinkNotFound(_)) => Ok(None),
            other => other,
        }
    }

    async fn required_link(&self, handle: &Handle, name: &str) -> Result<LinkMessage> {
        self.find_link(handle, name)
            .await
            .map_err(|e| e.into_plumbing("look up", name))?
            .ok_or_else(|| Error::PlumbingFailed {
                operation: "look up",
                link: name.to_string(),
                reason: "link vanished after creation".to_string(),
            })
    }

    async fn delete_link(&self, handle: &Handle, name: &str) -> NetlinkResult<bool> {
        let Some(link) = self.find_link(handle, name).await? else {
            return Ok(false);
        };
        match self
            .exec(name, handle.link().del(link.header.index).execute())
            .await
        {
            Ok(()) => Ok(true),
            Err(NetlinkError::LinkNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn interface_names(&self, handle: &Handle) -> NetlinkResult<HashMap<u32, String>> {
        let mut links = handle.link().get().execute();
        let mut names = HashMap::new();
        while let Some(link) = self.exec("*", links.try_next()).await? {
            let info = link_info(&link);
            names.insert(info.index, info.name);
        }
        Ok(names)
    }

    async fn add_route(&self, handle: &Handle, index: u32, route: &RouteInfo) -> Result<()> {
        let device = route.device.as_deref().unwrap_or_default();
        let mut request = handle
            .route()
            .add()
            .v4()
            .output_interface(index)
            .scope(nl_scope(route.scope))
            .protocol(nl_protocol(route.protocol))
            .table_id(route.table)
            .kind(nl_kind(route.kind));
        match route.destination {
            Some(IpNetwork::V4(dst)) => {
                request = request.destination_prefix(dst.ip(), dst.prefix());
            }
            Some(IpNetwork::V6(dst)) => {
                return Err(Error::PlumbingFailed {
                    operation: "add route on",
                    link: device.to_string(),
                    reason: format!("IPv6 destination {dst} not supported"),
                });
            }
            None => {}
        }
        if let Some(IpAddr::V4(gateway)) = route.gateway {
            request = request.gateway(gateway);
        }
        match self.exec(device, request.execute()).await {
            Ok(()) | Err(NetlinkError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e.into_plumbing("add route on", device)),
        }
    }

    async fn enable_proxy_arp(&self, host_iface: &str) -> Result<()> {
        let path = self
            .proc_sys
            .join("net/ipv4/conf")
            .join(host_iface)
            .join("proxy_arp");
        tokio::fs::write(&path, b"1")
            .await
            .map_err(|e| Error::PlumbingFailed {
                operation: "enable proxy ARP on",
                link: host_iface.to_string(),
                reason: format!("{}: {e}", path.display()),
            })
    }

    async fn create_veth_inner(
        &self,
        host: &Handle,
        container: &Handle,
        request: &VethRequest,
    ) -> Result<VethPair> {
        let host_iface = request.host_iface.as_str();
        let temp = request.temp_iface.as_str();

        self.exec(
            host_iface,
            host.link()
                .add()
                .veth(request.host_iface.clone(), request.temp_iface.clone())
                .execute(),
        )
        .await
        .map_err(|e| e.into_plumbing("create", host_iface))?;

        let host_index = self.required_link(host, host_iface).await?.header.index;
        let peer_index = self.required_link(host, temp).await?.header.index;
        for (index, name) in [(host_index, host_iface), (peer_index, temp)] {
            self.exec(name, host.link().set(index).mtu(request.mtu).execute())
                .await
                .map_err(|e| e.into_plumbing("set MTU on", name))?;
        }

        let netns = File::open(&request.netns).map_err(|e| Error::NamespaceUnavailable {
            path: request.netns.clone(),
            reason: e.to_string(),
        })?;
        self.exec(
            temp,
            host.link().set(peer_index).setns_by_fd(netns.as_raw_fd()).execute(),
        )
        .await
        .map_err(|e| e.into_plumbing("move", temp))?;

        let moved = self.required_link(container, temp).await?.header.index;
        self.exec(
            temp,
            container
                .link()
                .set(moved)
                .name(request.container_iface.clone())
                .execute(),
        )
        .await
        .map_err(|e| e.into_plumbing("rename", temp))?;

        self.exec(host_iface, host.link().set(host_index).up().execute())
            .await
            .map_err(|e| e.into_plumbing("bring up", host_iface))?;

        self.enable_proxy_arp(host_iface).await?;

        Ok(VethPair {
            host: link_info(&self.required_link(host, host_iface).await?),
            container: link_info(
                &self
                    .required_link(container, &request.container_iface)
                    .await?,
            ),
        })
    }
}

#[async_trait]
impl NetworkPlumber for NetlinkDataplane {
    fn name(&self) -> &str {
        "netlink"
    }

    async fn check_namespace(&self, netns: &Path) -> Result<()> {
        tokio::fs::File::open(netns)
            .await
            .map(drop)
            .map_err(|e| Error::NamespaceUnavailable {
                path: netns.to_path_buf(),
                reason: e.to_string(),
            })
    }

    async fn create_veth(&self, request: &VethRequest) -> Result<VethPair> {
        let host = self.connect(None)?;
        let container = self.connect(Some(&request.netns))?;

        let taken = self
            .find_link(&container, &request.container_iface)
            .await
            .map_err(|e| e.into_plumbing("look up", &request.container_iface))?;
        if taken.is_some() {
            return Err(Error::PlumbingFailed {
                operation: "rename",
                link: request.temp_iface.clone(),
                reason: format!("{} already exists in namespace", request.container_iface),
            });
        }

        if self
            .delete_link(&host, &request.host_iface)
            .await
            .map_err(|e| e.into_plumbing("delete", &request.host_iface))?
        {
            warn!(host_iface = %request.host_iface, "replaced stale host link");
        }

        match self.create_veth_inner(&host, &container, request).await {
            Ok(pair) => Ok(pair),
            Err(e) => {
                // Deleting either end removes the pair, wherever the peer is.
                for name in [&request.host_iface, &request.temp_iface] {
                    if let Err(cleanup) = self.delete_link(&host, name).await {
                        warn!(link = %name, error = %cleanup, "failed to clean up partial veth pair");
                    }
                }
                Err(e)
            }
        }
    }

    async fn configure_container_side(
        &self,
        netns: &Path,
        ifname: &str,
        addresses: &[IpNetwork],
    ) -> Result<()> {
        let handle = self.connect(Some(netns))?;
        let index = self.required_link(&handle, ifname).await?.header.index;

        for address in addresses {
            match self
                .exec(
                    ifname,
                    handle
                        .address()
                        .add(index, address.ip(), address.prefix())
                        .execute(),
                )
                .await
            {
                Ok(()) | Err(NetlinkError::AlreadyExists(_)) => {}
                Err(e) => return Err(e.into_plumbing("assign address to", ifname)),
            }
        }

        self.exec(ifname, handle.link().set(index).up().execute())
            .await
            .map_err(|e| e.into_plumbing("bring up", ifname))?;

        for route in container_routes(ifname) {
            self.add_route(&handle, index, &route).await?;
        }
        debug!(netns = %netns.display(), ifname, "container side configured");
        Ok(())
    }

    async fn delete_host_link(&self, name: &str) -> Result<bool> {
        let handle = self.connect(None)?;
        self.delete_link(&handle, name)
            .await
            .map_err(|e| e.into_plumbing("delete", name))
    }

    async fn link(&self, netns: Option<&Path>, name: &str) -> Result<Option<LinkInfo>> {
        let handle = self.connect(netns)?;
        Ok(self
            .find_link(&handle, name)
            .await
            .map_err(|e| e.into_plumbing("query", name))?
            .as_ref()
            .map(link_info))
    }

    async fn addresses(&self, netns: Option<&Path>, name: &str) -> Result<Vec<IpNetwork>> {
        let handle = self.connect(netns)?;
        let Some(link) = self
            .find_link(&handle, name)
            .await
            .map_err(|e| e.into_plumbing("query", name))?
        else {
            return Ok(Vec::new());
        };

        let mut messages = handle
            .address()
            .get()
            .set_link_index_filter(link.header.index)
            .execute();
        let mut addresses = Vec::new();
        while let Some(msg) = self
            .exec(name, messages.try_next())
            .await
            .map_err(|e| e.into_plumbing("query", name))?
        {
            addresses.extend(global_address(&msg));
        }
        Ok(addresses)
    }

    async fn routes(&self, netns: Option<&Path>) -> Result<Vec<RouteInfo>> {
        let handle = self.connect(netns)?;
        let names = self
            .interface_names(&handle)
            .await
            .map_err(|e| e.into_plumbing("list routes on", "*"))?;

        let mut routes = Vec::new();
        for version in [IpVersion::V4, IpVersion::V6] {
            let mut messages = handle.route().get(version).execute();
            while let Some(msg) = self
                .exec("*", messages.try_next())
                .await
                .map_err(|e| e.into_plumbing("list routes on", "*"))?
            {
                let route = route_info(&msg, &names);
                if route.table == RT_TABLE_MAIN {
                    routes.push(route);
                }
            }
        }
        Ok(routes)
    }
}
