//! In-process address pool.
//!
//! Hands out addresses sequentially from `ipam.subnet`, skipping the network
//! address, the first host (conventionally the gateway) and the IPv4
//! broadcast address. Reservations are keyed by container id, so a repeated
//! reserve for the same container returns the same addresses.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde_json::Value;
use tracing::debug;

use super::{Ipam, IpamRequest};
use crate::error::{Error, Result};

#[derive(Default)]
struct Reservations {
    by_container: HashMap<String, Vec<IpNetwork>>,
    in_use: BTreeSet<IpAddr>,
}

/// Sequential in-memory [`Ipam`].
#[derive(Default)]
pub struct PoolIpam {
    reservations: RwLock<Reservations>,
    fail_reserve: AtomicBool,
    fail_release: AtomicBool,
}

impl PoolIpam {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent reserves fail.
    pub fn fail_reserve(&self, fail: bool) {
        self.fail_reserve.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent releases fail.
    pub fn fail_release(&self, fail: bool) {
        self.fail_release.store(fail, Ordering::SeqCst);
    }

    /// Returns the networks currently reserved for `container_id`.
    #[must_use]
    pub fn reserved(&self, container_id: &str) -> Vec<IpNetwork> {
        self.reservations
            .read()
            .map(|r| r.by_container.get(container_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Returns the number of containers holding a reservation.
    #[must_use]
    pub fn reservation_count(&self) -> usize {
        self.reservations
            .read()
            .map(|r| r.by_container.len())
            .unwrap_or_default()
    }

    fn subnet(request: &IpamRequest<'_>) -> Result<IpNetwork> {
        let invalid = |reason: &str| Error::InvalidNetworkConfig(format!("ipam.subnet {reason}"));
        let conf: Value = serde_json::from_slice(request.pool_config)
            .map_err(|e| Error::DecodeFailed(e.to_string()))?;
        conf.pointer("/ipam/subnet")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("is required"))?
            .parse::<IpNetwork>()
            .map_err(|e| invalid(&format!("is not a CIDR: {e}")))
    }

    fn is_assignable(subnet: &IpNetwork, addr: IpAddr) -> bool {
        let first_host = match subnet.network() {
            IpAddr::V4(net) => IpAddr::V4(u32::from(net).wrapping_add(1).into()),
            IpAddr::V6(net) => IpAddr::V6(u128::from(net).wrapping_add(1).into()),
        };
        if addr == subnet.network() || addr == first_host {
            return false;
        }
        match subnet {
            IpNetwork::V4(v4) => addr != IpAddr::V4(v4.broadcast()),
            IpNetwork::V6(_) => true,
        }
    }
}

#[async_trait]
impl Ipam for PoolIpam {
    fn name(&self) -> &str {
        "pool"
    }

    async fn reserve(&self, request: &IpamRequest<'_>) -> Result<Vec<IpNetwork>> {
        let failed = |reason: String| Error::AllocationFailed {
            operation: "reserve",
            container_id: request.container_id.to_string(),
            reason,
        };
        if self.fail_reserve.load(Ordering::SeqCst) {
            return Err(failed("injected failure".to_string()));
        }
        let subnet = Self::subnet(request)?;

        let mut reservations = self
            .reservations
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))?;
        if let Some(existing) = reservations.by_container.get(request.container_id) {
            return Ok(existing.clone());
        }

        let addr = subnet
            .iter()
            .find(|addr| {
                Self::is_assignable(&subnet, *addr) && !reservations.in_use.contains(addr)
            })
            .ok_or_else(|| failed(format!("pool {subnet} exhausted")))?;
        let network = IpNetwork::new(addr, subnet.prefix())
            .map_err(|e| Error::Internal(format!("building network for {addr}: {e}")))?;

        reservations.in_use.insert(addr);
        reservations
            .by_container
            .insert(request.container_id.to_string(), vec![network]);
        debug!(container_id = %request.container_id, address = %network, "reserved address");
        Ok(vec![network])
    }

    async fn release(&self, request: &IpamRequest<'_>) -> Result<()> {
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(Error::AllocationFailed {
                operation: "release",
                container_id: request.container_id.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        let mut reservations = self
            .reservations
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))?;
        if let Some(networks) = reservations.by_container.remove(request.container_id) {
            for network in networks {
                reservations.in_use.remove(&network.ip());
            }
            debug!(container_id = %request.container_id, "released addresses");
        }
        Ok(())
    }
}
