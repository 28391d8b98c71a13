//! # Plugin Constants
//!
//! Defines the fixed names, addresses, limits and timeouts used by the
//! plugin. These constants are the **single source of truth** for values
//! that other host tooling (the policy agent, the routing table, the orchestrator)
//! relies on being stable across invocations.
//!
//! ## Stability
//!
//! Several values are part of an implicit contract with state that outlives
//! a single invocation:
//! - [`HOST_IFACE_PREFIX`] and [`HOST_IFACE_HASH_LEN`]: a DEL must derive the
//!   same host-side name as the ADD that created the link.
//! - [`DATASTORE_KEY_PREFIX`]: records written by one plugin version must be
//!   found by the next.
//! - [`CONTAINER_GATEWAY_V4`]: every workload routes through this address.
//!
//! Changing any of them strands resources created by earlier versions.

use std::net::Ipv4Addr;
use std::time::Duration;

// =============================================================================
// Plugin Identity
// =============================================================================

/// Plugin type name expected in the network configuration `type` field.
pub const PLUGIN_TYPE: &str = "calico";

/// CNI versions this plugin can emit results for.
pub const SUPPORTED_CNI_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// CNI version assumed when the network configuration omits `cniVersion`.
pub const DEFAULT_CNI_VERSION: &str = "0.3.1";

/// Orchestrator name for plain CNI invocations.
pub const ORCHESTRATOR_CNI: &str = "cni";

/// Orchestrator name when Kubernetes pod arguments are present in `CNI_ARGS`.
pub const ORCHESTRATOR_K8S: &str = "k8s";

/// Endpoint (container interface) name used when `CNI_IFNAME` is unset.
pub const DEFAULT_ENDPOINT_NAME: &str = "eth0";

// =============================================================================
// Interface Naming
// =============================================================================
//
// Linux limits interface names to IFNAMSIZ - 1 = 15 bytes. The host-side
// name is `cali` + a hex digest prefix so it is both deterministic and
// always within that bound, whatever the workload identifier looks like.
// =============================================================================

/// Prefix of every host-side veth created by this plugin.
pub const HOST_IFACE_PREFIX: &str = "cali";

/// Prefix of the temporary peer name used while the container side is still
/// in the host namespace.
pub const TEMP_IFACE_PREFIX: &str = "tmp";

/// Maximum interface name length (IFNAMSIZ - 1).
pub const MAX_IFACE_NAME_LEN: usize = 15;

/// Number of hex digest characters appended to [`HOST_IFACE_PREFIX`].
pub const HOST_IFACE_HASH_LEN: usize = MAX_IFACE_NAME_LEN - HOST_IFACE_PREFIX.len();

// =============================================================================
// Link and Route Configuration
// =============================================================================

/// Default MTU for both ends of the veth pair.
pub const DEFAULT_MTU: u32 = 1500;

/// Smallest MTU accepted in the network configuration (IPv4 minimum).
pub const MIN_MTU: u32 = 68;

/// Largest MTU accepted in the network configuration.
pub const MAX_MTU: u32 = 65535;

/// Link-local gateway every workload routes through.
///
/// The container side gets a host-scoped route to this address plus a
/// default route via it, regardless of the subnet IPAM handed out. The host
/// side answers ARP for it (proxy ARP), so the address never has to exist
/// on any interface.
pub const CONTAINER_GATEWAY_V4: Ipv4Addr = Ipv4Addr::new(169, 254, 1, 1);

/// Kernel main routing table id (`RT_TABLE_MAIN`).
pub const RT_TABLE_MAIN: u32 = 254;

// =============================================================================
// Datastore Layout
// =============================================================================

/// Root of every key written by the plugin.
pub const DATASTORE_KEY_PREFIX: &str = "/calico/v1";

/// Datastore endpoint used when the configuration names none.
pub const DEFAULT_ETCD_ENDPOINT: &str = "http://127.0.0.1:2379";

// =============================================================================
// Timeouts
// =============================================================================
//
// The plugin adds no timeout layer of its own around a whole ADD or DEL; the
// orchestrator owns that. These bound individual collaborator calls so a
// hung datastore or IPAM plugin surfaces as a collaborator failure.
// =============================================================================

/// Timeout for a single datastore request (10 seconds).
pub const DATASTORE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for one delegated IPAM plugin execution (60 seconds).
///
/// **Rationale**: IPAM plugins may themselves talk to a datastore and retry;
/// 60s leaves room for that while still failing before typical orchestrator
/// deadlines.
pub const IPAM_EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for one netlink request (10 seconds).
pub const DATAPLANE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Input Limits
// =============================================================================

/// Maximum size of the network configuration document read from stdin (1 MiB).
///
/// **Security**: Bounds memory use when the orchestrator (or anything that
/// can invoke the plugin) supplies a malformed or hostile document.
pub const MAX_NETWORK_CONFIG_SIZE: usize = 1024 * 1024;

/// Environment variable holding a `tracing` filter directive that overrides
/// `log_level` from the network configuration.
pub const LOG_FILTER_ENV: &str = "CALICO_CNI_LOG";

// =============================================================================
// Container ID Validation
// =============================================================================

/// Valid characters for container identifiers.
///
/// Includes: `a-z`, `A-Z`, `0-9`, `-`, `_`, `.`
///
/// **Security**: Excludes `/` so identifiers can be embedded in datastore
/// keys without escaping or key-space traversal.
pub const CONTAINER_ID_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_.";

/// Maximum container ID length.
///
/// **Rationale**: 128 characters accommodates 64-char runtime hashes and
/// descriptive identifiers.
pub const MAX_CONTAINER_ID_LEN: usize = 128;

/// Validates a container identifier supplied by the orchestrator.
///
/// # Returns
///
/// `Ok(())` if valid, `Err(reason)` with a description of the failure.
#[inline]
#[must_use = "validation result must be checked before the ID reaches a datastore key"]
pub fn validate_container_id(id: &str) -> std::result::Result<(), &'static str> {
    if id.is_empty() {
        return Err("container ID cannot be empty");
    }
    if id.len() > MAX_CONTAINER_ID_LEN {
        return Err("container ID exceeds maximum length");
    }
    if !id.chars().all(|c| CONTAINER_ID_VALID_CHARS.contains(c)) {
        return Err("container ID contains invalid characters");
    }
    if id.starts_with('.') {
        return Err("container ID cannot start with '.'");
    }
    Ok(())
}

/// Validates a name that becomes a single datastore key segment (network
/// names, node names, endpoint names).
#[inline]
#[must_use = "validation result must be checked before the name reaches a datastore key"]
pub fn validate_key_segment(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("name cannot be empty");
    }
    if name.contains('/') {
        return Err("name cannot contain '/'");
    }
    if name == "." || name == ".." {
        return Err("name cannot be a relative path component");
    }
    Ok(())
}
