//! ADD: bring a workload online.
//!
//! ```text
//!  ParsingConfig ─► ResolvingIdentity ─► ReservingAddress ─► EnsuringProfile
//!                                                                  │
//!                     Done ◄─ PersistingRecord ◄─ PlumbingNetwork ◄┘
//! ```
//!
//! Nothing is created before `ReservingAddress`, so failures up to there
//! need no cleanup. From there on every creating step pushes its undo
//! action, and any failure unwinds the stack before the error is returned.
//! The endpoint record is written last: once it exists the attachment is
//! complete.

use std::path::Path;

use tracing::{Span, debug, error, field, info, instrument, warn};

use super::{AddPhase, Plugin};
use crate::config::{Invocation, NetConf};
use crate::dataplane::VethRequest;
use crate::error::{Error, Result};
use crate::identity::{WorkloadIdentity, resolve_nodename, temp_iface_name};
use crate::ipam::{IpamRequest, host_network};
use crate::model::{WorkloadEndpoint, WorkloadEndpointMetadata, WorkloadEndpointSpec};
use crate::profile::{ProfileOutcome, ensure_profile};
use crate::result::AddResult;
use crate::rollback::{UndoAction, UndoContext, UndoStack};

/// Runs ADD, logging the phase a failure happened in.
#[instrument(
    name = "add",
    skip_all,
    fields(
        container_id = %invocation.container_id,
        endpoint = %invocation.ifname,
        node = field::Empty,
        orchestrator = field::Empty,
        workload = field::Empty,
    )
)]
pub(super) async fn add(plugin: &Plugin, invocation: &Invocation) -> Result<AddResult> {
    let mut phase = AddPhase::ParsingConfig;
    let outcome = attach(plugin, invocation, &mut phase).await;
    match &outcome {
        Ok(result) => info!(
            phase = %AddPhase::Done,
            addresses = result.ips.len(),
            "workload attached"
        ),
        Err(e) => error!(
            phase = %phase,
            category = %e.category(),
            retryable = e.is_retryable(),
            error = %e,
            "ADD failed"
        ),
    }
    outcome
}

/// Everything resolved before the first side effect.
struct Attachment<'a> {
    conf: &'a NetConf,
    identity: &'a WorkloadIdentity,
    netns: &'a Path,
    request: IpamRequest<'a>,
    /// Record of an earlier instance of the same workload, to be replaced.
    superseded: Option<WorkloadEndpoint>,
}

async fn attach(
    plugin: &Plugin,
    invocation: &Invocation,
    phase: &mut AddPhase,
) -> Result<AddResult> {
    let conf = NetConf::parse(&invocation.config)?;
    let netns = invocation
        .netns
        .as_deref()
        .ok_or_else(|| Error::MissingEnvironment("CNI_NETNS".to_string()))?;

    *phase = AddPhase::ResolvingIdentity;
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

    plugin.dataplane.check_namespace(netns).await?;
    let superseded = existing_record(plugin, &identity).await?;

    let attachment = Attachment {
        conf: &conf,
        identity: &identity,
        netns,
        request: IpamRequest {
            pool_config: &invocation.config,
            plugin: &conf.ipam.plugin,
            container_id: &invocation.container_id,
            netns: Some(netns),
            ifname: &invocation.ifname,
            cni_args: &invocation.args,
            cni_path: &invocation.cni_path,
        },
        superseded,
    };

    let mut undo = UndoStack::new();
    match commit(plugin, &attachment, &mut undo, phase).await {
        Ok(result) => Ok(result),
        Err(e) => {
            if !undo.is_empty() {
                let ctx = UndoContext {
                    datastore: plugin.datastore.as_ref(),
                    ipam: plugin.ipam.as_ref(),
                    dataplane: plugin.dataplane.as_ref(),
                    ipam_request: attachment.request,
                };
                let failures = undo.unwind(&ctx).await;
                if failures > 0 {
                    warn!(failures, "rollback incomplete, a later DEL will clean up");
                }
            }
            Err(e)
        }
    }
}

/// Looks up the record for this key.
///
/// A record owned by this very instance means ADD already ran; one owned by
/// a different instance is stale and gets replaced.
async fn existing_record(
    plugin: &Plugin,
    identity: &WorkloadIdentity,
) -> Result<Option<WorkloadEndpoint>> {
    let key = identity.key();
    match plugin.datastore.get_workload_endpoint(&key).await? {
        None => Ok(None),
        Some(record) if record.metadata.active_instance_id == identity.active_instance_id => {
            Err(Error::EndpointExists {
                key: key.to_string(),
                container_id: identity.container_id.clone(),
            })
        }
        Some(record) => {
            info!(
                previous_instance = %record.metadata.active_instance_id,
                "replacing endpoint of an earlier instance"
            );
            Ok(Some(record))
        }
    }
}

async fn commit(
    plugin: &Plugin,
    attachment: &Attachment<'_>,
    undo: &mut UndoStack,
    phase: &mut AddPhase,
) -> Result<AddResult> {
    let Attachment {
        conf,
        identity,
        netns,
        request,
        superseded,
    } = attachment;

    *phase = AddPhase::ReservingAddress;
    let reserved = plugin.ipam.reserve(request).await?;
    undo.push(UndoAction::ReleaseAddresses);
    let addresses: Vec<_> = reserved.iter().map(host_network).collect();
    if addresses.is_empty() {
        return Err(Error::AllocationFailed {
            operation: "reserve",
            container_id: identity.container_id.clone(),
            reason: "no addresses returned".to_string(),
        });
    }
    debug!(addresses = ?addresses, ipam = plugin.ipam.name(), "addresses reserved");

    *phase = AddPhase::EnsuringProfile;
    if let ProfileOutcome::Created(revision) =
        ensure_profile(plugin.datastore.as_ref(), &conf.name).await?
    {
        undo.push(UndoAction::DeleteProfile {
            name: conf.name.clone(),
            revision,
        });
    }

    *phase = AddPhase::PlumbingNetwork;
    let host_iface = identity.host_iface_name();
    let pair = plugin
        .dataplane
        .create_veth(&VethRequest {
            temp_iface: temp_iface_name(&host_iface),
            host_iface: host_iface.clone(),
            container_iface: identity.endpoint.clone(),
            netns: netns.to_path_buf(),
            mtu: conf.mtu,
        })
        .await?;
    undo.push(UndoAction::DeleteHostLink {
        name: host_iface.clone(),
    });
    plugin
        .dataplane
        .configure_container_side(netns, &identity.endpoint, &addresses)
        .await?;
    debug!(host_iface = %host_iface, dataplane = plugin.dataplane.name(), "veth configured");

    // Built before the record so a bad prevResult cannot strand a record.
    let result = AddResult::build(
        &conf.cni_version,
        conf.prev_result.as_ref(),
        &pair,
        &netns.to_string_lossy(),
        &addresses,
    )?;

    *phase = AddPhase::PersistingRecord;
    let key = identity.key();
    if superseded.is_some() {
        plugin.datastore.delete_workload_endpoint(&key).await?;
    }
    let record = WorkloadEndpoint {
        metadata: WorkloadEndpointMetadata {
            node: identity.node.clone(),
            orchestrator: identity.orchestrator.clone(),
            workload: identity.workload.clone(),
            name: identity.endpoint.clone(),
            active_instance_id: identity.active_instance_id.clone(),
        },
        spec: WorkloadEndpointSpec {
            interface_name: host_iface,
            ip_networks: addresses,
            mac: pair.container.mac,
            profiles: vec![conf.name.clone()],
        },
        revision: None,
    };
    let stored = plugin.datastore.create_workload_endpoint(&record).await?;
    debug!(
        key = %key,
        revision = ?stored.revision,
        datastore = plugin.datastore.name(),
        "endpoint persisted"
    );
    Ok(result)
}
