//! Node and workload identity.
//!
//! Every workload endpoint is keyed by `(node, orchestrator, workload,
//! endpoint)`. This module derives each part from the invocation, and the
//! deterministic host-side interface name that lets DEL find the veth again
//! without consulting the datastore.
//!
//! The host-side name is keyed by container id, not by workload. Two
//! instances of the same pod share a workload key but never a veth, so
//! bringing up a replacement cannot disturb the plumbing of the instance it
//! replaces.
//!
//! The system hostname is an explicit parameter rather than something read
//! deep inside the resolver: the process entry point reads it once with
//! [`system_hostname`] and hands it to the handler.

use sha2::{Digest, Sha256};

use crate::config::Invocation;
use crate::constants::{
    HOST_IFACE_HASH_LEN, HOST_IFACE_PREFIX, ORCHESTRATOR_CNI, ORCHESTRATOR_K8S, TEMP_IFACE_PREFIX,
    validate_key_segment,
};
use crate::error::{Error, Result};
use crate::model::WorkloadEndpointKey;

/// Resolves the node identity.
///
/// Precedence: explicit `nodename` > deprecated `hostname` > system hostname.
/// Blank values are skipped.
///
/// # Errors
///
/// - [`Error::MissingNodename`] if every candidate is blank
/// - [`Error::InvalidNetworkConfig`] if the winner cannot be a key segment
pub fn resolve_nodename(
    nodename: Option<&str>,
    hostname: Option<&str>,
    system_hostname: &str,
) -> Result<String> {
    let node = [nodename, hostname, Some(system_hostname)]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|candidate| !candidate.is_empty())
        .ok_or(Error::MissingNodename)?;

    validate_key_segment(node)
        .map_err(|reason| Error::InvalidNetworkConfig(format!("node name '{node}': {reason}")))?;
    Ok(node.to_string())
}

/// Returns the hostname reported by the kernel, or an empty string if it
/// cannot be read.
#[must_use]
pub fn system_hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: `buf` is a valid writable buffer of the length passed; the
    // kernel writes at most that many bytes.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if rc != 0 {
        tracing::warn!(
            error = %std::io::Error::last_os_error(),
            "gethostname failed"
        );
        return String::new();
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).trim().to_string()
}

/// Identity of the workload being attached or detached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadIdentity {
    /// Resolved node name.
    pub node: String,
    /// Orchestrator (`cni` or `k8s`).
    pub orchestrator: String,
    /// Workload identifier.
    pub workload: String,
    /// Endpoint name (container-side interface).
    pub endpoint: String,
    /// Container instance id stored on the record. Empty for `cni`, where the
    /// workload id already is the container id.
    pub active_instance_id: String,
    /// Container id from the invocation.
    pub container_id: String,
}

impl WorkloadIdentity {
    /// Derives the workload identity for `invocation` on `node`.
    ///
    /// With Kubernetes pod arguments the workload is `<namespace>.<pod>` and
    /// the container id becomes the active instance; otherwise the workload
    /// is the container id itself.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEnvironment`] if the pod arguments cannot form
    /// a key segment.
    pub fn from_invocation(invocation: &Invocation, node: String) -> Result<Self> {
        let (orchestrator, workload, active_instance_id) = match invocation.args.k8s_pod() {
            Some((namespace, pod)) => {
                let workload = format!("{namespace}.{pod}");
                validate_key_segment(&workload).map_err(|reason| Error::InvalidEnvironment {
                    name: "CNI_ARGS".to_string(),
                    reason: format!("pod '{workload}': {reason}"),
                })?;
                (
                    ORCHESTRATOR_K8S.to_string(),
                    workload,
                    invocation.container_id.clone(),
                )
            }
            None => (
                ORCHESTRATOR_CNI.to_string(),
                invocation.container_id.clone(),
                String::new(),
            ),
        };

        Ok(Self {
            node,
            orchestrator,
            workload,
            endpoint: invocation.ifname.clone(),
            active_instance_id,
            container_id: invocation.container_id.clone(),
        })
    }

    /// Returns the datastore key.
    #[must_use]
    pub fn key(&self) -> WorkloadEndpointKey {
        WorkloadEndpointKey {
            node: self.node.clone(),
            orchestrator: self.orchestrator.clone(),
            workload: self.workload.clone(),
            endpoint: self.endpoint.clone(),
        }
    }

    /// Returns the deterministic host-side interface name of this
    /// attachment.
    #[must_use]
    pub fn host_iface_name(&self) -> String {
        host_iface_name(&self.container_id, &self.endpoint)
    }
}

/// Derives the host-side interface name for one attachment.
///
/// `cali` followed by the first 11 hex characters of
/// SHA-256(`<container_id>.<endpoint>`), always 15 characters.
#[must_use]
pub fn host_iface_name(container_id: &str, endpoint: &str) -> String {
    format!("{HOST_IFACE_PREFIX}{}", iface_digest(container_id, endpoint))
}

/// Derives the temporary name the container-side link carries while it is
/// still in the host namespace.
#[must_use]
pub fn temp_iface_name(host_iface: &str) -> String {
    let suffix = host_iface
        .strip_prefix(HOST_IFACE_PREFIX)
        .unwrap_or(host_iface);
    format!("{TEMP_IFACE_PREFIX}{suffix}")
}

fn iface_digest(container_id: &str, endpoint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(container_id.as_bytes());
    hasher.update(b".");
    hasher.update(endpoint.as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(HOST_IFACE_HASH_LEN);
    digest
}
