//! Shared fixtures: a plugin wired to in-memory collaborators.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use calico_cni::dataplane::SimulatedDataplane;
use calico_cni::datastore::MemoryDatastore;
use calico_cni::ipam::PoolIpam;
use calico_cni::{Invocation, Plugin, Reply, Result};

/// Hostname the plugin sees as the system hostname.
pub const SYSTEM_HOSTNAME: &str = "test-host";

/// Namespace every harness starts with.
pub const NETNS: &str = "/var/run/netns/test";

/// Network configuration for `net1` with a /24 pool.
pub fn config() -> Vec<u8> {
    config_with("")
}

/// Network configuration for `net1` with extra top-level members.
///
/// `extra` is spliced in verbatim and must end with a comma when non-empty.
pub fn config_with(extra: &str) -> Vec<u8> {
    format!(
        r#"{{"cniVersion":"0.3.1","name":"net1","type":"calico",{extra}"ipam":{{"type":"pool","subnet":"10.0.0.0/24"}}}}"#
    )
    .into_bytes()
}

/// Plugin plus handles to its in-memory collaborators.
pub struct Harness {
    pub datastore: Arc<MemoryDatastore>,
    pub ipam: Arc<PoolIpam>,
    pub dataplane: Arc<SimulatedDataplane>,
    pub plugin: Plugin,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_hostname(SYSTEM_HOSTNAME)
    }

    pub fn with_hostname(hostname: &str) -> Self {
        let datastore = Arc::new(MemoryDatastore::new());
        let ipam = Arc::new(PoolIpam::new());
        let dataplane = Arc::new(SimulatedDataplane::new());
        dataplane.add_namespace(NETNS);
        let plugin = Plugin::new(
            datastore.clone(),
            ipam.clone(),
            dataplane.clone(),
            hostname,
        );
        Self {
            datastore,
            ipam,
            dataplane,
            plugin,
        }
    }

    pub async fn add(&self, container_id: &str) -> Result<Reply> {
        self.add_in(container_id, NETNS, None, config()).await
    }

    pub async fn add_in(
        &self,
        container_id: &str,
        netns: &str,
        cni_args: Option<&str>,
        config: Vec<u8>,
    ) -> Result<Reply> {
        let invocation = invocation("ADD", container_id, Some(netns), cni_args, config)?;
        self.plugin.handle(&invocation).await
    }

    pub async fn del(&self, container_id: &str) -> Result<Reply> {
        self.del_in(container_id, Some(NETNS), None, config()).await
    }

    pub async fn del_in(
        &self,
        container_id: &str,
        netns: Option<&str>,
        cni_args: Option<&str>,
        config: Vec<u8>,
    ) -> Result<Reply> {
        let invocation = invocation("DEL", container_id, netns, cni_args, config)?;
        self.plugin.handle(&invocation).await
    }

    pub fn netns(&self) -> &'static Path {
        Path::new(NETNS)
    }
}

/// Builds an invocation without touching the process environment.
pub fn invocation(
    command: &str,
    container_id: &str,
    netns: Option<&str>,
    cni_args: Option<&str>,
    config: Vec<u8>,
) -> Result<Invocation> {
    let mut env = HashMap::new();
    env.insert("CNI_COMMAND", command.to_string());
    env.insert("CNI_CONTAINERID", container_id.to_string());
    env.insert("CNI_IFNAME", "eth0".to_string());
    env.insert("CNI_PATH", "/opt/cni/bin".to_string());
    if let Some(netns) = netns {
        env.insert("CNI_NETNS", netns.to_string());
    }
    if let Some(args) = cni_args {
        env.insert("CNI_ARGS", args.to_string());
    }
    Invocation::from_lookup(|name| env.get(name).cloned(), config)
}

/// Kubernetes pod arguments for `namespace/pod`.
pub fn k8s_args(namespace: &str, pod: &str) -> String {
    format!("IgnoreUnknown=1;K8S_POD_NAMESPACE={namespace};K8S_POD_NAME={pod}")
}
