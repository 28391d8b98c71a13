//! # Address Allocator Gateway
//!
//! Reserves and releases workload addresses through a pluggable IPAM
//! collaborator. The gateway never chooses addresses itself.
//!
//! ```text
//!   ADD ──reserve(request)──►  Ipam  ──► [10.0.0.7/24, fd00::7/64]
//!   DEL ──release(request)──►  Ipam
//! ```
//!
//! Reservations are keyed by container id, so release works without knowing
//! which addresses were handed out.
//!
//! ## Implementations
//!
//! | Backend | Allocates via | Use |
//! |---------|---------------|-----|
//! | [`ExecIpam`] | delegated CNI IPAM plugin binary | production |
//! | [`PoolIpam`] | in-process sequential pool | tests, dry runs |

pub mod exec;
pub mod pool;

pub use self::exec::ExecIpam;
pub use self::pool::PoolIpam;

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde::Deserialize;

use crate::config::CniArgs;
use crate::error::{Error, Result};

/// One reserve or release request.
#[derive(Debug, Clone, Copy)]
pub struct IpamRequest<'a> {
    /// Raw network configuration document; carries the `ipam` pool section.
    pub pool_config: &'a [u8],
    /// IPAM plugin type from `ipam.type`.
    pub plugin: &'a str,
    /// Reservation key.
    pub container_id: &'a str,
    /// Target namespace, when known.
    pub netns: Option<&'a Path>,
    /// Container-side interface name.
    pub ifname: &'a str,
    /// Invocation `CNI_ARGS`, forwarded verbatim.
    pub cni_args: &'a CniArgs,
    /// Plugin search path.
    pub cni_path: &'a [PathBuf],
}

/// Address allocation collaborator.
#[async_trait]
pub trait Ipam: Send + Sync {
    /// Returns the backend name for logs.
    fn name(&self) -> &str;

    /// Reserves addresses for `request.container_id`.
    ///
    /// Returned networks carry the pool's prefix length; callers narrow them
    /// to host masks.
    async fn reserve(&self, request: &IpamRequest<'_>) -> Result<Vec<IpNetwork>>;

    /// Releases every reservation held by `request.container_id`. Releasing
    /// nothing is not an error.
    async fn release(&self, request: &IpamRequest<'_>) -> Result<()>;
}

/// Narrows a network to the single address it names (/32 or /128).
#[must_use]
pub fn host_network(network: &IpNetwork) -> IpNetwork {
    IpNetwork::from(network.ip())
}

// =============================================================================
// Result Parsing
// =============================================================================

#[derive(Debug, Deserialize)]
struct CurrentIp {
    address: IpNetwork,
}

#[derive(Debug, Deserialize)]
struct LegacyIp {
    ip: IpNetwork,
}

#[derive(Debug, Default, Deserialize)]
struct RawIpamResult {
    #[serde(default)]
    ips: Vec<CurrentIp>,
    #[serde(default)]
    ip4: Option<LegacyIp>,
    #[serde(default)]
    ip6: Option<LegacyIp>,
}

/// CNI error document printed by a failing plugin.
#[derive(Debug, Deserialize)]
pub(crate) struct PluginError {
    pub code: u32,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub details: String,
}

impl std::fmt::Display for PluginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "code {}: {}", self.code, self.msg)?;
        if !self.details.is_empty() {
            write!(f, " ({})", self.details)?;
        }
        Ok(())
    }
}

/// Extracts the reserved networks from an IPAM result document.
///
/// Accepts the current format (`ips[].address`) and the legacy 0.2 format
/// (`ip4.ip`, `ip6.ip`). IPv4 networks are ordered first.
///
/// # Errors
///
/// Returns [`Error::AllocationFailed`] for undecodable output or a result
/// without addresses.
pub fn parse_ipam_result(container_id: &str, output: &[u8]) -> Result<Vec<IpNetwork>> {
    let failed = |reason: String| Error::AllocationFailed {
        operation: "reserve",
        container_id: container_id.to_string(),
        reason,
    };

    let raw: RawIpamResult = serde_json::from_slice(output)
        .map_err(|e| failed(format!("undecodable IPAM result: {e}")))?;

    let mut networks: Vec<IpNetwork> = if raw.ips.is_empty() {
        raw.ip4.into_iter().chain(raw.ip6).map(|ip| ip.ip).collect()
    } else {
        raw.ips.into_iter().map(|ip| ip.address).collect()
    };
    if networks.is_empty() {
        return Err(failed("IPAM result contains no addresses".to_string()));
    }
    networks.sort_by_key(|n| matches!(n.ip(), IpAddr::V6(_)));
    Ok(networks)
}
