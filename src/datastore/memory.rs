//! In-process datastore.
//!
//! Keeps profiles and workload endpoints in maps behind a `RwLock`, issuing
//! revisions from a counter the way etcd issues `mod_revision`s. Individual
//! operations can be made to fail with a transport error to exercise the
//! handlers' rollback and absorb paths.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use super::{CreateOutcome, Datastore};
use crate::error::{Error, Result};
use crate::model::{EndpointFilter, Profile, Revision, WorkloadEndpoint, WorkloadEndpointKey};

/// Datastore operations that can be failed on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatastoreOp {
    GetProfile,
    CreateProfile,
    DeleteProfile,
    GetEndpoint,
    ListEndpoints,
    CreateEndpoint,
    DeleteEndpoint,
}

impl DatastoreOp {
    fn as_str(self) -> &'static str {
        match self {
            Self::GetProfile => "get profile",
            Self::CreateProfile => "create profile",
            Self::DeleteProfile => "delete profile",
            Self::GetEndpoint => "get workload endpoint",
            Self::ListEndpoints => "list workload endpoints",
            Self::CreateEndpoint => "create workload endpoint",
            Self::DeleteEndpoint => "delete workload endpoint",
        }
    }
}

#[derive(Default)]
struct State {
    revision: u64,
    profiles: HashMap<String, Profile>,
    endpoints: BTreeMap<WorkloadEndpointKey, WorkloadEndpoint>,
    failing: HashSet<DatastoreOp>,
}

impl State {
    fn next_revision(&mut self) -> Revision {
        self.revision += 1;
        Revision::new(self.revision.to_string())
    }

    fn check(&self, op: DatastoreOp) -> Result<()> {
        if self.failing.contains(&op) {
            return Err(Error::DatastoreUnavailable {
                operation: op.as_str(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

/// In-memory [`Datastore`].
#[derive(Default)]
pub struct MemoryDatastore {
    state: RwLock<State>,
}

impl MemoryDatastore {
    /// Creates an empty datastore.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `op` fail with a transport error.
    pub fn fail(&self, op: DatastoreOp) {
        self.lock_for_hook().failing.insert(op);
    }

    /// Clears an injected failure.
    pub fn recover(&self, op: DatastoreOp) {
        self.lock_for_hook().failing.remove(&op);
    }

    /// Replaces a stored profile, bumping its revision. Simulates a
    /// concurrent writer.
    pub fn put_profile(&self, profile: Profile) -> Revision {
        let mut state = self.lock_for_hook();
        let revision = state.next_revision();
        let mut stored = profile;
        stored.revision = Some(revision.clone());
        state
            .profiles
            .insert(stored.metadata.name.clone(), stored);
        revision
    }

    /// Returns the number of stored workload endpoints.
    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .endpoints
            .len()
    }

    // Test hooks have no error channel; a poisoned map is still usable.
    fn lock_for_hook(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_profile(&self, name: &str) -> Result<Option<Profile>> {
        let state = self.read()?;
        state.check(DatastoreOp::GetProfile)?;
        Ok(state.profiles.get(name).cloned())
    }

    async fn create_profile(&self, profile: &Profile) -> Result<CreateOutcome> {
        let mut state = self.write()?;
        state.check(DatastoreOp::CreateProfile)?;
        if state.profiles.contains_key(&profile.metadata.name) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        let revision = state.next_revision();
        let mut stored = profile.clone();
        stored.revision = Some(revision.clone());
        state
            .profiles
            .insert(stored.metadata.name.clone(), stored);
        Ok(CreateOutcome::Created(revision))
    }

    async fn delete_profile(&self, name: &str, revision: &Revision) -> Result<()> {
        let mut state = self.write()?;
        state.check(DatastoreOp::DeleteProfile)?;
        match state.profiles.get(name) {
            None => Ok(()),
            Some(existing) if existing.revision.as_ref() == Some(revision) => {
                state.profiles.remove(name);
                Ok(())
            }
            Some(_) => Err(Error::RevisionMismatch {
                key: name.to_string(),
                expected: revision.to_string(),
            }),
        }
    }

    async fn get_workload_endpoint(
        &self,
        key: &WorkloadEndpointKey,
    ) -> Result<Option<WorkloadEndpoint>> {
        let state = self.read()?;
        state.check(DatastoreOp::GetEndpoint)?;
        Ok(state.endpoints.get(key).cloned())
    }

    async fn list_workload_endpoints(
        &self,
        filter: &EndpointFilter,
    ) -> Result<Vec<WorkloadEndpoint>> {
        let state = self.read()?;
        state.check(DatastoreOp::ListEndpoints)?;
        Ok(state
            .endpoints
            .iter()
            .filter(|(key, _)| filter.matches(key))
            .map(|(_, endpoint)| endpoint.clone())
            .collect())
    }

    async fn create_workload_endpoint(
        &self,
        endpoint: &WorkloadEndpoint,
    ) -> Result<WorkloadEndpoint> {
        let mut state = self.write()?;
        state.check(DatastoreOp::CreateEndpoint)?;
        let key = endpoint.key();
        if state.endpoints.contains_key(&key) {
            return Err(Error::RecordConflict {
                key: key.to_string(),
            });
        }
        let mut stored = endpoint.clone();
        stored.revision = Some(state.next_revision());
        state.endpoints.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete_workload_endpoint(&self, key: &WorkloadEndpointKey) -> Result<()> {
        let mut state = self.write()?;
        state.check(DatastoreOp::DeleteEndpoint)?;
        state.endpoints.remove(key);
        Ok(())
    }
}
