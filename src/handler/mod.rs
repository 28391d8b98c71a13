//! # Invocation Handler
//!
//! `handle(invocation) -> Result<Reply>`: one call per process, no state
//! kept between calls. All coordination lives in the datastore and the
//! kernel.
//!
//! ```text
//!   Invocation ──► Plugin::handle ──┬── ADD ──► add::add ──► Reply::Added(AddResult)
//!                                   ├── DEL ──► del::del ──► Reply::Deleted
//!                                   └── VERSION ───────────► Reply::Version
//! ```
//!
//! ## Collaborators
//!
//! The plugin is built from three capability objects so the same state
//! machines run against a live cluster or entirely in memory:
//!
//! | Capability | Production | In memory |
//! |------------|------------|-----------|
//! | [`Datastore`] | `EtcdDatastore` | `MemoryDatastore` |
//! | [`Ipam`] | `ExecIpam` | `PoolIpam` |
//! | [`NetworkPlumber`] | `NetlinkDataplane` | `SimulatedDataplane` |
//!
//! The system hostname is passed in as well, so identity resolution never
//! reads ambient host state.

mod add;
mod del;

use std::sync::Arc;

use tracing::warn;

use crate::config::{CniCommand, Invocation};
use crate::datastore::Datastore;
use crate::dataplane::NetworkPlumber;
use crate::error::{Error, Result};
use crate::ipam::Ipam;
use crate::result::{AddResult, VersionResult};

/// Steps of the ADD state machine, in order. Failure can happen in any of
/// them; the step is reported with the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddPhase {
    ParsingConfig,
    ResolvingIdentity,
    ReservingAddress,
    EnsuringProfile,
    PlumbingNetwork,
    PersistingRecord,
    Done,
}

impl std::fmt::Display for AddPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ParsingConfig => "parsing config",
            Self::ResolvingIdentity => "resolving identity",
            Self::ReservingAddress => "reserving address",
            Self::EnsuringProfile => "ensuring profile",
            Self::PlumbingNetwork => "plumbing network",
            Self::PersistingRecord => "persisting record",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Successful outcome of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Added(AddResult),
    Deleted,
    Version(VersionResult),
}

impl Reply {
    /// Renders the stdout document, if the command has one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if rendering fails.
    pub fn to_json(&self) -> Result<Option<String>> {
        let json = match self {
            Self::Added(result) => serde_json::to_string(result),
            Self::Version(result) => serde_json::to_string(result),
            Self::Deleted => return Ok(None),
        };
        json.map(Some)
            .map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// The network-attachment plugin.
pub struct Plugin {
    datastore: Arc<dyn Datastore>,
    ipam: Arc<dyn Ipam>,
    dataplane: Arc<dyn NetworkPlumber>,
    system_hostname: String,
}

impl Plugin {
    /// Creates a plugin over the given collaborators.
    pub fn new(
        datastore: Arc<dyn Datastore>,
        ipam: Arc<dyn Ipam>,
        dataplane: Arc<dyn NetworkPlumber>,
        system_hostname: impl Into<String>,
    ) -> Self {
        Self {
            datastore,
            ipam,
            dataplane,
            system_hostname: system_hostname.into(),
        }
    }

    /// Handles one invocation.
    ///
    /// # Errors
    ///
    /// ADD fails on any step after rolling back what it created. DEL fails
    /// only when the endpoint record cannot be looked up or deleted.
    pub async fn handle(&self, invocation: &Invocation) -> Result<Reply> {
        match invocation.command {
            CniCommand::Add => add::add(self, invocation).await.map(Reply::Added),
            CniCommand::Del => del::del(self, invocation).await.map(|()| Reply::Deleted),
            CniCommand::Version => Ok(Reply::Version(VersionResult::default())),
        }
    }
}

/// Logs and drops the error of a best-effort step.
fn best_effort<T>(collaborator: &str, step: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(
                collaborator,
                step,
                category = %e.category(),
                error = %e,
                "best-effort step failed, continuing"
            );
            None
        }
    }
}
