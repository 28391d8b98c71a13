//! Profile Ensurer.
//!
//! Makes sure the network's default Profile exists before any endpoint
//! references it. An existing profile is never modified, even when an
//! operator has customised its rules.

use tracing::{debug, info, warn};

use crate::datastore::{CreateOutcome, Datastore};
use crate::error::Result;
use crate::model::{Profile, Revision};

/// What [`ensure_profile`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileOutcome {
    /// This call created the profile. The revision fences a later rollback.
    Created(Revision),
    /// A profile with the network's name was already present.
    Existing,
}

/// Ensures the default profile for `network` exists.
///
/// Reads first so the common case costs no write; a creation race against
/// another invocation resolves to [`ProfileOutcome::Existing`].
///
/// # Errors
///
/// Propagates datastore failures from the read or the create.
pub async fn ensure_profile(datastore: &dyn Datastore, network: &str) -> Result<ProfileOutcome> {
    if let Some(existing) = datastore.get_profile(network).await? {
        if existing.has_default_shape() {
            debug!(profile = %network, "profile already present");
        } else {
            warn!(
                profile = %network,
                "profile exists with non-default rules, leaving it unchanged"
            );
        }
        return Ok(ProfileOutcome::Existing);
    }

    match datastore
        .create_profile(&Profile::default_for_network(network))
        .await?
    {
        CreateOutcome::Created(revision) => {
            info!(profile = %network, revision = %revision, "created default profile");
            Ok(ProfileOutcome::Created(revision))
        }
        CreateOutcome::AlreadyExists => {
            debug!(profile = %network, "profile created concurrently");
            Ok(ProfileOutcome::Existing)
        }
    }
}
