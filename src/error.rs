//! Error types for the network-attachment plugin.
//!
//! Every variant belongs to one [`ErrorCategory`], which decides how the ADD
//! and DEL handlers react (fatal, rollback, or absorb-and-log) and which CNI
//! error code the orchestrator sees.

use std::path::PathBuf;

/// Result type alias for plugin operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of failures, following the collaborator that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Malformed or incomplete configuration or environment. No side effects
    /// were attempted.
    Configuration,
    /// The address allocator (IPAM) failed.
    Allocation,
    /// A kernel networking operation failed.
    Plumbing,
    /// A datastore read, write or delete failed.
    Datastore,
    /// A bug or an unexpected state inside the plugin.
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Allocation => write!(f, "allocation"),
            Self::Plumbing => write!(f, "plumbing"),
            Self::Datastore => write!(f, "datastore"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Errors that can occur while handling an ADD, DEL or VERSION invocation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// The network configuration document is not valid JSON for this plugin.
    #[error("failed to decode network configuration: {0}")]
    DecodeFailed(String),

    /// The network configuration is well-formed but semantically invalid.
    #[error("invalid network configuration: {0}")]
    InvalidNetworkConfig(String),

    /// The requested CNI version is not supported.
    #[error("unsupported CNI version '{version}'")]
    IncompatibleVersion { version: String },

    /// A required CNI environment variable is missing.
    #[error("missing required environment variable {0}")]
    MissingEnvironment(String),

    /// A CNI environment variable has an unusable value.
    #[error("invalid value for {name}: {reason}")]
    InvalidEnvironment { name: String, reason: String },

    /// The container identifier cannot be used as a workload identifier.
    #[error("invalid container ID '{id}': {reason}")]
    InvalidContainerId { id: String, reason: String },

    /// No node identity could be resolved (nodename, hostname and system
    /// hostname all empty).
    #[error("unable to determine node name: nodename, hostname and system hostname are all empty")]
    MissingNodename,

    /// The delegated IPAM plugin binary was not found on the search path.
    #[error("IPAM plugin '{plugin}' not found in {searched:?}")]
    IpamPluginNotFound {
        plugin: String,
        searched: Vec<PathBuf>,
    },

    // =========================================================================
    // Allocation Errors
    // =========================================================================
    /// IPAM reserve or release failed.
    #[error("IPAM {operation} failed for container '{container_id}': {reason}")]
    AllocationFailed {
        operation: &'static str,
        container_id: String,
        reason: String,
    },

    // =========================================================================
    // Plumbing Errors
    // =========================================================================
    /// The target network namespace does not exist or cannot be opened.
    #[error("network namespace {path} unavailable: {reason}")]
    NamespaceUnavailable { path: PathBuf, reason: String },

    /// A kernel networking operation failed.
    #[error("failed to {operation} link '{link}': {reason}")]
    PlumbingFailed {
        operation: &'static str,
        link: String,
        reason: String,
    },

    // =========================================================================
    // Datastore Errors
    // =========================================================================
    /// The datastore could not be reached or returned a transport failure.
    #[error("datastore {operation} failed: {reason}")]
    DatastoreUnavailable {
        operation: &'static str,
        reason: String,
    },

    /// A record that must not exist yet is already present.
    #[error("record already exists: {key}")]
    RecordConflict { key: String },

    /// A fenced write lost against a concurrent modification.
    #[error("record {key} was modified concurrently (expected revision {expected})")]
    RevisionMismatch { key: String, expected: String },

    /// An endpoint for this exact workload instance is already registered.
    #[error("workload endpoint already exists for container '{container_id}': {key}")]
    EndpointExists { key: String, container_id: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the category of the collaborator that failed.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::DecodeFailed(_)
            | Self::InvalidNetworkConfig(_)
            | Self::IncompatibleVersion { .. }
            | Self::MissingEnvironment(_)
            | Self::InvalidEnvironment { .. }
            | Self::InvalidContainerId { .. }
            | Self::MissingNodename
            | Self::IpamPluginNotFound { .. } => ErrorCategory::Configuration,
            Self::AllocationFailed { .. } => ErrorCategory::Allocation,
            Self::NamespaceUnavailable { .. } | Self::PlumbingFailed { .. } => {
                ErrorCategory::Plumbing
            }
            Self::DatastoreUnavailable { .. }
            | Self::RecordConflict { .. }
            | Self::RevisionMismatch { .. }
            | Self::EndpointExists { .. } => ErrorCategory::Datastore,
            Self::Io(_) | Self::Serialization(_) | Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Returns the CNI error code reported to the orchestrator.
    ///
    /// Codes below 100 are reserved by the CNI spec; 100 and above are
    /// plugin-specific.
    #[must_use]
    pub fn cni_code(&self) -> u32 {
        match self {
            Self::IncompatibleVersion { .. } => 1,
            Self::NamespaceUnavailable { .. } => 3,
            Self::MissingEnvironment(_)
            | Self::InvalidEnvironment { .. }
            | Self::InvalidContainerId { .. } => 4,
            Self::DecodeFailed(_) => 6,
            Self::InvalidNetworkConfig(_)
            | Self::MissingNodename
            | Self::IpamPluginNotFound { .. } => 7,
            Self::DatastoreUnavailable { .. } => 11,
            Self::AllocationFailed { .. } => 100,
            Self::PlumbingFailed { .. } => 101,
            Self::RecordConflict { .. }
            | Self::RevisionMismatch { .. }
            | Self::EndpointExists { .. } => 102,
            Self::Io(_) | Self::Serialization(_) | Self::Internal(_) => 999,
        }
    }

    /// Returns true when retrying the same invocation may succeed.
    ///
    /// Configuration mistakes never become valid on retry; transport failures
    /// and lost optimistic-concurrency races may.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DatastoreUnavailable { .. }
                | Self::RevisionMismatch { .. }
                | Self::AllocationFailed { .. }
        )
    }
}
