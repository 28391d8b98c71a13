//! # calico-cni
//!
//! **Container network attachment plugin for Calico**
//!
//! The container runtime invokes the plugin once per operation, with the
//! request in environment variables and the network configuration on stdin.
//! ADD gives a container a routed veth, an address from IPAM and a workload
//! endpoint record in the cluster datastore; DEL takes all of that away
//! again; VERSION reports what the plugin speaks.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          calico-cni                                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │   env + stdin ──► Invocation ──► Plugin::handle ──► Reply / Error   │
//! │                                      │                              │
//! │        ┌──────────────┬──────────────┼──────────────┐               │
//! │        ▼              ▼              ▼              ▼               │
//! │   ┌─────────┐   ┌───────────┐  ┌───────────┐  ┌───────────┐         │
//! │   │Identity │   │   Ipam    │  │ Datastore │  │ Network   │         │
//! │   │Resolver │   │  gateway  │  │  gateway  │  │ Plumber   │         │
//! │   └─────────┘   └─────┬─────┘  └─────┬─────┘  └─────┬─────┘         │
//! ├───────────────────────┼──────────────┼──────────────┼───────────────┤
//! │                 delegated IPAM    etcd v3 JSON    rtnetlink +       │
//! │                 plugin (exec)     gateway (HTTP)  setns             │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Host Networking Model
//!
//! Every workload gets one veth pair. The container side carries the
//! workload address with a host mask and routes everything through a
//! link-local next hop; the host side answers for that next hop with proxy
//! ARP and carries no address at all:
//!
//! ```text
//!   container netns                 │  host netns
//!   eth0  10.0.0.5/32               │  cali1a2b3c4d5e6 (proxy_arp=1)
//!   169.254.1.1 dev eth0 scope link │
//!   default via 169.254.1.1         │
//! ```
//!
//! # Failure Model
//!
//! | Command | On failure |
//! |---------|------------|
//! | ADD | completed steps are undone in reverse order, error returned |
//! | DEL | only the record lookup and record delete are fatal |
//! | VERSION | cannot fail |
//!
//! Errors leave the process as a CNI error document on stdout with exit
//! status 1. The document's `code` tells the runtime whether a retry can
//! help (see [`Error::is_retryable`]).
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use calico_cni::{Invocation, Plugin};
//! use calico_cni::datastore::MemoryDatastore;
//! use calico_cni::dataplane::SimulatedDataplane;
//! use calico_cni::ipam::PoolIpam;
//!
//! # async fn run(config: Vec<u8>) -> calico_cni::Result<()> {
//! let plugin = Plugin::new(
//!     Arc::new(MemoryDatastore::new()),
//!     Arc::new(PoolIpam::new()),
//!     Arc::new(SimulatedDataplane::new()),
//!     "node-1",
//! );
//! let reply = plugin.handle(&Invocation::from_env(config)?).await?;
//! println!("{}", reply.to_json()?.unwrap_or_default());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod dataplane;
pub mod datastore;
pub mod error;
pub mod handler;
pub mod identity;
pub mod ipam;
pub mod logging;
pub mod model;
pub mod profile;
pub mod result;
pub mod rollback;

// Re-exports
pub use config::{CniArgs, CniCommand, Invocation, IpamConf, NetConf};
pub use error::{Error, ErrorCategory, Result};
pub use handler::{AddPhase, Plugin, Reply};
pub use identity::{WorkloadIdentity, resolve_nodename, system_hostname};
pub use result::{AddResult, ErrorDocument, VersionResult};
