//! Datastore record types.
//!
//! This module defines the records the plugin writes:
//! - `WorkloadEndpoint`: one container's network attachment
//! - `Profile`: default connectivity policy for a network
//! - `Revision`: opaque optimistic-concurrency token assigned by the datastore
//!
//! Records are split into `metadata` (identity) and `spec` (attributes). The
//! revision lives outside the serialized value: it is assigned by the
//! datastore on every write and never round-trips through JSON.

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use macaddr::MacAddr6;
use serde::{Deserialize, Serialize};

// =============================================================================
// Revision
// =============================================================================

/// Opaque optimistic-concurrency token.
///
/// Only ever passed back to the datastore that issued it; never compared or
/// interpreted by plugin logic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision(String);

impl Revision {
    /// Wraps a datastore-issued token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the token for sending back to the datastore.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Profile
// =============================================================================

/// Rule action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
}

/// Match criteria on the source or destination of traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRule {
    /// Matches endpoints carrying this tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl EntityRule {
    fn is_empty(&self) -> bool {
        self.tag.is_none()
    }
}

/// One ingress or egress rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub action: Action,
    #[serde(default, skip_serializing_if = "EntityRule::is_empty")]
    pub source: EntityRule,
}

impl Rule {
    /// Unconditional allow.
    #[must_use]
    pub fn allow_all() -> Self {
        Self {
            action: Action::Allow,
            source: EntityRule::default(),
        }
    }

    /// Allow traffic from endpoints tagged `tag`.
    #[must_use]
    pub fn allow_from_tag(tag: impl Into<String>) -> Self {
        Self {
            action: Action::Allow,
            source: EntityRule {
                tag: Some(tag.into()),
            },
        }
    }
}

/// Profile identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileMetadata {
    /// Profile name (the network name).
    pub name: String,
    /// Tags applied to every endpoint referencing the profile.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Profile rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSpec {
    #[serde(default)]
    pub ingress_rules: Vec<Rule>,
    #[serde(default)]
    pub egress_rules: Vec<Rule>,
}

/// Default connectivity policy scoped to one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub metadata: ProfileMetadata,
    pub spec: ProfileSpec,
    /// Datastore revision (not serialized).
    #[serde(skip)]
    pub revision: Option<Revision>,
}

impl Profile {
    /// Builds the default-allow profile for `network`.
    ///
    /// Tagged with the network name; egress allows everything; ingress allows
    /// only sources carrying the same tag.
    #[must_use]
    pub fn default_for_network(network: &str) -> Self {
        Self {
            metadata: ProfileMetadata {
                name: network.to_string(),
                tags: vec![network.to_string()],
            },
            spec: ProfileSpec {
                ingress_rules: vec![Rule::allow_from_tag(network)],
                egress_rules: vec![Rule::allow_all()],
            },
            revision: None,
        }
    }

    /// Returns true when tags and rules match [`Profile::default_for_network`].
    #[must_use]
    pub fn has_default_shape(&self) -> bool {
        let expected = Self::default_for_network(&self.metadata.name);
        self.metadata == expected.metadata && self.spec == expected.spec
    }
}

// =============================================================================
// Workload Endpoint
// =============================================================================

/// Primary key of a workload endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkloadEndpointKey {
    pub node: String,
    pub orchestrator: String,
    pub workload: String,
    pub endpoint: String,
}

impl std::fmt::Display for WorkloadEndpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.node, self.orchestrator, self.workload, self.endpoint
        )
    }
}

/// Workload endpoint identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadEndpointMetadata {
    pub node: String,
    pub orchestrator: String,
    pub workload: String,
    /// Endpoint name (the container-side interface name).
    pub name: String,
    /// Container instance currently owning the endpoint. Empty when the
    /// workload identifier already is the container identifier.
    #[serde(default)]
    pub active_instance_id: String,
}

impl WorkloadEndpointMetadata {
    /// Returns the primary key.
    #[must_use]
    pub fn key(&self) -> WorkloadEndpointKey {
        WorkloadEndpointKey {
            node: self.node.clone(),
            orchestrator: self.orchestrator.clone(),
            workload: self.workload.clone(),
            endpoint: self.name.clone(),
        }
    }
}

/// Workload endpoint attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadEndpointSpec {
    /// Host-side interface name.
    pub interface_name: String,
    /// Assigned networks (host mask).
    #[serde(default)]
    pub ip_networks: Vec<IpNetwork>,
    /// MAC of the container-side interface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<MacAddr6>,
    /// Profiles applied to the endpoint.
    #[serde(default)]
    pub profiles: Vec<String>,
}

/// Authoritative record of one container's network attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadEndpoint {
    pub metadata: WorkloadEndpointMetadata,
    pub spec: WorkloadEndpointSpec,
    /// Datastore revision (not serialized).
    #[serde(skip)]
    pub revision: Option<Revision>,
}

impl WorkloadEndpoint {
    /// Returns the primary key.
    #[must_use]
    pub fn key(&self) -> WorkloadEndpointKey {
        self.metadata.key()
    }

    /// Returns the assigned addresses without prefix.
    #[must_use]
    pub fn addresses(&self) -> Vec<IpAddr> {
        self.spec.ip_networks.iter().map(IpNetwork::ip).collect()
    }
}

/// Filter for listing workload endpoints. `None` fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointFilter {
    pub node: Option<String>,
    pub orchestrator: Option<String>,
    pub workload: Option<String>,
    pub endpoint: Option<String>,
}

impl EndpointFilter {
    /// Matches every endpoint on `node`.
    #[must_use]
    pub fn node(node: impl Into<String>) -> Self {
        Self {
            node: Some(node.into()),
            ..Self::default()
        }
    }

    /// Restricts the filter to `workload`.
    #[must_use]
    pub fn with_workload(mut self, workload: impl Into<String>) -> Self {
        self.workload = Some(workload.into());
        self
    }

    /// Restricts the filter to `orchestrator`.
    #[must_use]
    pub fn with_orchestrator(mut self, orchestrator: impl Into<String>) -> Self {
        self.orchestrator = Some(orchestrator.into());
        self
    }

    /// Returns true if `key` satisfies every set field.
    #[must_use]
    pub fn matches(&self, key: &WorkloadEndpointKey) -> bool {
        fn field(filter: &Option<String>, value: &str) -> bool {
            filter.as_deref().is_none_or(|f| f == value)
        }
        field(&self.node, &key.node)
            && field(&self.orchestrator, &key.orchestrator)
            && field(&self.workload, &key.workload)
            && field(&self.endpoint, &key.endpoint)
    }
}
