//! # Datastore Gateway
//!
//! Typed access to the records other cluster components consume: Profiles
//! and WorkloadEndpoints. Each record carries a datastore-assigned
//! [`Revision`] that is only ever handed back for fenced writes.
//!
//! ## Contract
//!
//! | Operation | Absent record | Present record |
//! |-----------|---------------|----------------|
//! | `get_*` | `Ok(None)` | `Ok(Some(record))` |
//! | `create_profile` | `Created(revision)` | `AlreadyExists` |
//! | `create_workload_endpoint` | stored | `Err(RecordConflict)` |
//! | `delete_workload_endpoint` | `Ok(())` | deleted |
//! | `delete_profile(rev)` | `Ok(())` | deleted if revision matches, else `Err(RevisionMismatch)` |
//!
//! "Not found" is never an error for deletes; that is what makes DEL
//! idempotent at the datastore layer. Transport failures are always
//! [`Error::DatastoreUnavailable`](crate::Error::DatastoreUnavailable) and
//! never collapse into "not found".
//!
//! ## Implementations
//!
//! | Backend | Storage | Use |
//! |---------|---------|-----|
//! | [`EtcdDatastore`] | etcd v3 (JSON gateway) | production |
//! | [`MemoryDatastore`] | in-process maps | tests, dry runs |

pub mod etcd;
pub mod memory;

pub use self::etcd::EtcdDatastore;
pub use self::memory::{DatastoreOp, MemoryDatastore};

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{EndpointFilter, Profile, Revision, WorkloadEndpoint, WorkloadEndpointKey};

/// Outcome of a create-if-absent profile write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The record was written by this call.
    Created(Revision),
    /// A record with the same key already existed and was left untouched.
    AlreadyExists,
}

/// Typed CRUD over the external datastore.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the handler shares one instance
/// behind an `Arc`.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Returns the backend name for logs.
    fn name(&self) -> &str;

    /// Reads a profile by name.
    async fn get_profile(&self, name: &str) -> Result<Option<Profile>>;

    /// Creates a profile unless one with the same name exists.
    async fn create_profile(&self, profile: &Profile) -> Result<CreateOutcome>;

    /// Deletes a profile if it still carries `revision`.
    async fn delete_profile(&self, name: &str, revision: &Revision) -> Result<()>;

    /// Reads a workload endpoint by key.
    async fn get_workload_endpoint(
        &self,
        key: &WorkloadEndpointKey,
    ) -> Result<Option<WorkloadEndpoint>>;

    /// Lists workload endpoints matching `filter`, ordered by key.
    async fn list_workload_endpoints(&self, filter: &EndpointFilter)
    -> Result<Vec<WorkloadEndpoint>>;

    /// Creates a workload endpoint, returning it with its revision set.
    async fn create_workload_endpoint(
        &self,
        endpoint: &WorkloadEndpoint,
    ) -> Result<WorkloadEndpoint>;

    /// Deletes a workload endpoint. Absent keys are not an error.
    async fn delete_workload_endpoint(&self, key: &WorkloadEndpointKey) -> Result<()>;
}
