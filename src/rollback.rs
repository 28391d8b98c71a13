//! Ordered undo list for ADD.
//!
//! Each ADD step that creates something pushes the action that removes it.
//! On a later failure the stack is unwound newest-first. Unwinding is
//! best-effort: a failing undo is logged and the rest still run, and the
//! caller reports the original error regardless.
//!
//! ```text
//!   push ReleaseAddresses ─► push DeleteProfile ─► push DeleteHostLink ─► ✗
//!                                                                         │
//!   unwind:  DeleteHostLink ◄── DeleteProfile ◄── ReleaseAddresses ◄──────┘
//! ```

use tracing::{debug, warn};

use crate::datastore::Datastore;
use crate::dataplane::NetworkPlumber;
use crate::error::Result;
use crate::ipam::{Ipam, IpamRequest};
use crate::model::Revision;

/// One compensating action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoAction {
    /// Release the container's IPAM reservation.
    ReleaseAddresses,
    /// Delete a profile this ADD created, if nobody modified it since.
    DeleteProfile { name: String, revision: Revision },
    /// Delete the host-side link (and with it the container side).
    DeleteHostLink { name: String },
}

impl std::fmt::Display for UndoAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReleaseAddresses => write!(f, "release addresses"),
            Self::DeleteProfile { name, .. } => write!(f, "delete profile {name}"),
            Self::DeleteHostLink { name } => write!(f, "delete host link {name}"),
        }
    }
}

/// Collaborators an unwind needs.
pub struct UndoContext<'a> {
    pub datastore: &'a dyn Datastore,
    pub ipam: &'a dyn Ipam,
    pub dataplane: &'a dyn NetworkPlumber,
    pub ipam_request: IpamRequest<'a>,
}

/// Actions accumulated by a running ADD.
#[derive(Debug, Default)]
pub struct UndoStack {
    actions: Vec<UndoAction>,
}

impl UndoStack {
    /// Creates an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the compensation for a step that just succeeded.
    pub fn push(&mut self, action: UndoAction) {
        self.actions.push(action);
    }

    /// Returns the pending actions, oldest first.
    #[must_use]
    pub fn actions(&self) -> &[UndoAction] {
        &self.actions
    }

    /// Returns true if nothing needs undoing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Runs every action newest-first. Returns the number that failed.
    pub async fn unwind(self, ctx: &UndoContext<'_>) -> usize {
        let mut failures = 0;
        for action in self.actions.into_iter().rev() {
            match run(&action, ctx).await {
                Ok(()) => debug!(action = %action, "rolled back"),
                Err(e) => {
                    failures += 1;
                    warn!(
                        action = %action,
                        container_id = %ctx.ipam_request.container_id,
                        category = %e.category(),
                        error = %e,
                        "rollback step failed"
                    );
                }
            }
        }
        failures
    }
}

async fn run(action: &UndoAction, ctx: &UndoContext<'_>) -> Result<()> {
    match action {
        UndoAction::ReleaseAddresses => ctx.ipam.release(&ctx.ipam_request).await,
        UndoAction::DeleteProfile { name, revision } => {
            ctx.datastore.delete_profile(name, revision).await
        }
        UndoAction::DeleteHostLink { name } => ctx.dataplane.delete_host_link(name).await.map(drop),
    }
}
