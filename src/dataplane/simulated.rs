//! Simulated dataplane.
//!
//! An in-memory link table per namespace that behaves like the kernel where
//! the handlers can observe it: veth ends are deleted together, routes go
//! away with their device, and a destroyed namespace takes its links (and
//! their host-side peers) with it. Any step can be made to fail.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use macaddr::MacAddr6;

use super::{LinkInfo, NetworkPlumber, RouteInfo, VethPair, VethRequest, container_routes};
use crate::error::{Error, Result};

/// Plumbing steps that can be failed on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlumbingStep {
    CreateVeth,
    AssignAddress,
    AddRoutes,
    DeleteHostLink,
}

#[derive(Debug, Clone)]
struct SimLink {
    info: LinkInfo,
    addresses: Vec<IpNetwork>,
    /// Namespace (`None` = host) and name of the veth peer.
    peer: Option<(Option<PathBuf>, String)>,
}

#[derive(Debug, Default)]
struct Namespace {
    links: BTreeMap<String, SimLink>,
    routes: Vec<RouteInfo>,
}

#[derive(Debug, Default)]
struct State {
    namespaces: HashMap<Option<PathBuf>, Namespace>,
    failing: HashSet<PlumbingStep>,
    next_index: u32,
}

impl State {
    fn namespace_mut(&mut self, netns: Option<&Path>) -> Result<&mut Namespace> {
        let key = netns.map(Path::to_path_buf);
        self.namespaces
            .get_mut(&key)
            .ok_or_else(|| unavailable(netns))
    }

    fn namespace(&self, netns: Option<&Path>) -> Result<&Namespace> {
        let key = netns.map(Path::to_path_buf);
        self.namespaces.get(&key).ok_or_else(|| unavailable(netns))
    }

    fn check(&self, step: PlumbingStep, link: &str) -> Result<()> {
        if self.failing.contains(&step) {
            return Err(Error::PlumbingFailed {
                operation: step.operation(),
                link: link.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn new_link(&mut self, name: &str, mtu: u32, up: bool) -> LinkInfo {
        self.next_index += 1;
        let idx = self.next_index;
        LinkInfo {
            name: name.to_string(),
            index: idx,
            mtu,
            up,
            mac: Some(MacAddr6::new(0x02, 0, 0, 0, (idx >> 8) as u8, idx as u8)),
        }
    }

    /// Removes a link, its routes and its veth peer. Returns false if absent.
    fn remove_link(&mut self, netns: Option<&Path>, name: &str) -> bool {
        let key = netns.map(Path::to_path_buf);
        let Some(ns) = self.namespaces.get_mut(&key) else {
            return false;
        };
        let Some(link) = ns.links.remove(name) else {
            return false;
        };
        ns.routes.retain(|r| r.device.as_deref() != Some(name));

        if let Some((peer_ns, peer_name)) = link.peer {
            if let Some(ns) = self.namespaces.get_mut(&peer_ns) {
                ns.links.remove(&peer_name);
                ns.routes.retain(|r| r.device.as_deref() != Some(peer_name.as_str()));
            }
        }
        true
    }
}

impl PlumbingStep {
    fn operation(self) -> &'static str {
        match self {
            Self::CreateVeth => "create",
            Self::AssignAddress => "assign address to",
            Self::AddRoutes => "add route on",
            Self::DeleteHostLink => "delete",
        }
    }
}

fn unavailable(netns: Option<&Path>) -> Error {
    Error::NamespaceUnavailable {
        path: netns.map(Path::to_path_buf).unwrap_or_default(),
        reason: "no such namespace".to_string(),
    }
}

/// In-memory [`NetworkPlumber`].
#[derive(Debug)]
pub struct SimulatedDataplane {
    state: RwLock<State>,
}

impl Default for SimulatedDataplane {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDataplane {
    /// Creates a dataplane with only the host namespace.
    #[must_use]
    pub fn new() -> Self {
        let mut state = State::default();
        state.namespaces.insert(None, Namespace::default());
        Self {
            state: RwLock::new(state),
        }
    }

    /// Creates a namespace reachable at `path`.
    pub fn add_namespace(&self, path: impl Into<PathBuf>) {
        if let Ok(mut state) = self.state.write() {
            state
                .namespaces
                .entry(Some(path.into()))
                .or_default();
        }
    }

    /// Destroys a namespace. Veth peers of its links vanish from the host.
    pub fn remove_namespace(&self, path: &Path) {
        if let Ok(mut state) = self.state.write() {
            let names: Vec<String> = state
                .namespace(Some(path))
                .map(|ns| ns.links.keys().cloned().collect())
                .unwrap_or_default();
            for name in names {
                state.remove_link(Some(path), &name);
            }
            state.namespaces.remove(&Some(path.to_path_buf()));
        }
    }

    /// Makes every subsequent `step` fail.
    pub fn fail_at(&self, step: PlumbingStep) {
        if let Ok(mut state) = self.state.write() {
            state.failing.insert(step);
        }
    }

    /// Clears an injected failure.
    pub fn recover(&self, step: PlumbingStep) {
        if let Ok(mut state) = self.state.write() {
            state.failing.remove(&step);
        }
    }

    /// Adds a lone host link, as left behind by an earlier attempt.
    pub fn insert_host_link(&self, name: &str, mtu: u32) {
        if let Ok(mut state) = self.state.write() {
            let info = state.new_link(name, mtu, false);
            if let Some(host) = state.namespaces.get_mut(&None) {
                host.links.insert(
                    name.to_string(),
                    SimLink {
                        info,
                        addresses: Vec::new(),
                        peer: None,
                    },
                );
            }
        }
    }

    /// Returns the names of all links in `netns` (`None` = host).
    #[must_use]
    pub fn link_names(&self, netns: Option<&Path>) -> Vec<String> {
        self.state
            .read()
            .ok()
            .and_then(|state| {
                state
                    .namespace(netns)
                    .ok()
                    .map(|ns| ns.links.keys().cloned().collect())
            })
            .unwrap_or_default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))
    }
}

#[async_trait]
impl NetworkPlumber for SimulatedDataplane {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn check_namespace(&self, netns: &Path) -> Result<()> {
        self.read()?.namespace(Some(netns)).map(drop)
    }

    async fn create_veth(&self, request: &VethRequest) -> Result<VethPair> {
        let mut state = self.write()?;
        state.check(PlumbingStep::CreateVeth, &request.host_iface)?;
        let netns = Some(request.netns.as_path());
        if state.namespace(netns)?.links.contains_key(&request.container_iface) {
            return Err(Error::PlumbingFailed {
                operation: "rename",
                link: request.temp_iface.clone(),
                reason: format!("{} already exists in namespace", request.container_iface),
            });
        }
        state.remove_link(None, &request.host_iface);

        let host = state.new_link(&request.host_iface, request.mtu, true);
        let container = state.new_link(&request.container_iface, request.mtu, false);

        state.namespace_mut(None)?.links.insert(
            host.name.clone(),
            SimLink {
                info: host.clone(),
                addresses: Vec::new(),
                peer: Some((Some(request.netns.clone()), container.name.clone())),
            },
        );
        state.namespace_mut(netns)?.links.insert(
            container.name.clone(),
            SimLink {
                info: container.clone(),
                addresses: Vec::new(),
                peer: Some((None, host.name.clone())),
            },
        );
        Ok(VethPair { host, container })
    }

    async fn configure_container_side(
        &self,
        netns: &Path,
        ifname: &str,
        addresses: &[IpNetwork],
    ) -> Result<()> {
        let mut state = self.write()?;
        state.check(PlumbingStep::AssignAddress, ifname)?;
        let fail_routes = state.check(PlumbingStep::AddRoutes, ifname);

        let ns = state.namespace_mut(Some(netns))?;
        let link = ns
            .links
            .get_mut(ifname)
            .ok_or_else(|| Error::PlumbingFailed {
                operation: "assign address to",
                link: ifname.to_string(),
                reason: "no such device".to_string(),
            })?;
        for address in addresses {
            if !link.addresses.contains(address) {
                link.addresses.push(*address);
            }
        }
        link.info.up = true;

        fail_routes?;
        for route in container_routes(ifname) {
            if !ns.routes.contains(&route) {
                ns.routes.push(route);
            }
        }
        Ok(())
    }

    async fn delete_host_link(&self, name: &str) -> Result<bool> {
        let mut state = self.write()?;
        state.check(PlumbingStep::DeleteHostLink, name)?;
        Ok(state.remove_link(None, name))
    }

    async fn link(&self, netns: Option<&Path>, name: &str) -> Result<Option<LinkInfo>> {
        let state = self.read()?;
        Ok(state
            .namespace(netns)?
            .links
            .get(name)
            .map(|l| l.info.clone()))
    }

    async fn addresses(&self, netns: Option<&Path>, name: &str) -> Result<Vec<IpNetwork>> {
        let state = self.read()?;
        Ok(state
            .namespace(netns)?
            .links
            .get(name)
            .map(|l| l.addresses.clone())
            .unwrap_or_default())
    }

    async fn routes(&self, netns: Option<&Path>) -> Result<Vec<RouteInfo>> {
        let state = self.read()?;
        Ok(state.namespace(netns)?.routes.clone())
    }
}
