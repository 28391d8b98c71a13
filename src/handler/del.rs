//! DEL: idempotent teardown.
//!
//! | Record for the key | Action |
//! |--------------------|--------|
//! | absent | release IPAM, sweep this attachment's host link, succeed |
//! | owned by another instance | release IPAM, sweep this attachment's host link, leave the record, succeed |
//! | owned by this instance | release IPAM, delete the recorded host link, delete record |
//!
//! Links are only ever deleted by host-side name, never by `CNI_NETNS` plus
//! `CNI_IFNAME`: a namespace path may already belong to another container.
//! Deleting the host end removes the whole veth pair.
//!
//! Only two failures reach the caller: the record lookup hitting a transport
//! error, and the final record delete. Everything else is logged and
//! absorbed.

use tracing::{Span, debug, field, info, instrument};

use super::{Plugin, best_effort};
use crate::config::{Invocation, NetConf};
use crate::error::Result;
use crate::identity::{WorkloadIdentity, resolve_nodename};
use crate::ipam::IpamRequest;

/// Runs DEL.
#[instrument(
    name = "del",
    skip_all,
    fields(
        container_id = %invocation.container_id,
        endpoint = %invocation.ifname,
        node = field::Empty,
        orchestrator = field::Empty,
        workload = field::Empty,
    )
)]
pub(super) async fn del(plugin: &Plugin, invocation: &Invocation) -> Result<()> {
    let conf = NetConf::parse(&invocation.config)?;
    let node = resolve_nodename(
        conf.nodename.as_deref(),
        conf.hostname.as_deref(),
        &plugin.system_hostname,
    )?;
    let identity = WorkloadIdentity::from_invocation(invocation, node)?;
    let span = Span::current();
    span.record("node", identity.node.as_str());
    span.record("orchestrator", identity.orchestrator.as_str());
    span.record("workload", identity.workload.as_str());

    let request = IpamRequest {
        pool_config: &invocation.config,
        plugin: &conf.ipam.plugin,
        container_id: &invocation.container_id,
        netns: invocation.netns.as_deref(),
        ifname: &invocation.ifname,
        cni_args: &invocation.args,
        cni_path: &invocation.cni_path,
    };

    let key = identity.key();
    let record = plugin
        .datastore
        .get_workload_endpoint(&key)
        .await
        .inspect_err(|e| {
            tracing::error!(error = %e, "endpoint lookup failed, DEL can be retried");
        })?;

    let host_iface = identity.host_iface_name();
    let Some(record) = record else {
        debug!(key = %key, "no endpoint record, sweeping stragglers");
        release(plugin, &request).await;
        sweep_host_link(plugin, &host_iface).await;
        return Ok(());
    };

    if record.metadata.active_instance_id != identity.active_instance_id {
        info!(
            active_instance = %record.metadata.active_instance_id,
            "endpoint belongs to another instance, leaving it in place"
        );
        release(plugin, &request).await;
        sweep_host_link(plugin, &host_iface).await;
        return Ok(());
    }

    release(plugin, &request).await;
    best_effort(
        plugin.dataplane.name(),
        "delete host link",
        plugin
            .dataplane
            .delete_host_link(&record.spec.interface_name)
            .await,
    );
    if record.spec.interface_name != host_iface {
        sweep_host_link(plugin, &host_iface).await;
    }

    plugin
        .datastore
        .delete_workload_endpoint(&key)
        .await
        .inspect_err(|e| {
            tracing::error!(error = %e, key = %key, "failed to delete endpoint record");
        })?;
    info!(key = %key, "workload detached");
    Ok(())
}

/// Deletes this attachment's own host link if an earlier attempt left it.
async fn sweep_host_link(plugin: &Plugin, host_iface: &str) {
    if best_effort(
        plugin.dataplane.name(),
        "delete host link",
        plugin.dataplane.delete_host_link(host_iface).await,
    ) == Some(true)
    {
        info!(host_iface = %host_iface, "removed straggling host link");
    }
}

async fn release(plugin: &Plugin, request: &IpamRequest<'_>) {
    if best_effort(
        plugin.ipam.name(),
        "release addresses",
        plugin.ipam.release(request).await,
    )
    .is_some()
    {
        debug!(ipam = plugin.ipam.name(), "addresses released");
    }
}
