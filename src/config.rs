//! # Invocation Contract
//!
//! Everything the orchestrator hands the plugin for one invocation:
//!
//! - the **network configuration** document (JSON on stdin), parsed into
//!   [`NetConf`],
//! - the **CNI environment** (`CNI_COMMAND`, `CNI_CONTAINERID`, `CNI_NETNS`,
//!   `CNI_IFNAME`, `CNI_ARGS`, `CNI_PATH`), parsed into [`Invocation`],
//! - the free-form `CNI_ARGS` pairs, parsed into [`CniArgs`].
//!
//! Parsing is a pure function of its inputs. [`Invocation::from_lookup`]
//! takes a lookup closure rather than reading the process environment, so
//! tests can build invocations without touching global state.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::constants::{
    DEFAULT_CNI_VERSION, DEFAULT_ENDPOINT_NAME, DEFAULT_ETCD_ENDPOINT, DEFAULT_MTU,
    MAX_IFACE_NAME_LEN, MAX_MTU, MIN_MTU, SUPPORTED_CNI_VERSIONS, validate_container_id,
    validate_key_segment,
};
use crate::error::{Error, Result};

// =============================================================================
// Network Configuration
// =============================================================================

/// Network configuration document supplied on stdin.
#[derive(Debug, Clone, Deserialize)]
pub struct NetConf {
    /// CNI spec version the orchestrator expects results in.
    #[serde(rename = "cniVersion", default = "default_cni_version")]
    pub cni_version: String,

    /// Network name. Also the name and tag of the network's default Profile.
    pub name: String,

    /// Plugin type (`calico`).
    #[serde(rename = "type")]
    pub plugin: String,

    /// Comma-separated datastore endpoint URLs.
    #[serde(default)]
    pub etcd_endpoints: Option<String>,

    /// Datastore `host:port`, used when no endpoint URLs are given.
    #[serde(default)]
    pub etcd_authority: Option<String>,

    /// Explicit node identity (highest precedence).
    #[serde(default)]
    pub nodename: Option<String>,

    /// Deprecated node identity, used when `nodename` is absent.
    #[serde(default)]
    pub hostname: Option<String>,

    /// MTU for both ends of the veth pair.
    #[serde(default = "default_mtu")]
    pub mtu: u32,

    /// IPAM sub-configuration, forwarded to the address allocator.
    pub ipam: IpamConf,

    /// `tracing` filter directive for this invocation.
    #[serde(default)]
    pub log_level: Option<String>,

    /// Result of a previous plugin in a chain.
    #[serde(rename = "prevResult", default)]
    pub prev_result: Option<Value>,
}

/// IPAM sub-configuration.
///
/// Only `type` is interpreted here; everything else belongs to the IPAM
/// plugin and is kept verbatim.
#[derive(Debug, Clone, Deserialize)]
pub struct IpamConf {
    /// IPAM plugin type (binary name on `CNI_PATH`).
    #[serde(rename = "type")]
    pub plugin: String,

    /// Address pool, when the IPAM flavour takes a single subnet.
    #[serde(default)]
    pub subnet: Option<String>,

    /// Remaining plugin-specific keys.
    #[serde(flatten)]
    pub specific: Map<String, Value>,
}

fn default_cni_version() -> String {
    DEFAULT_CNI_VERSION.to_string()
}

fn default_mtu() -> u32 {
    DEFAULT_MTU
}

impl NetConf {
    /// Parses and validates a network configuration document.
    ///
    /// # Errors
    ///
    /// - [`Error::DecodeFailed`] if the bytes are not JSON of the right shape
    ///   (including missing `name`, `type` or `ipam`)
    /// - [`Error::IncompatibleVersion`] for an unsupported `cniVersion`
    /// - [`Error::InvalidNetworkConfig`] for semantically invalid values
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let conf: NetConf =
            serde_json::from_slice(bytes).map_err(|e| Error::DecodeFailed(e.to_string()))?;
        conf.validate()?;
        Ok(conf)
    }

    fn validate(&self) -> Result<()> {
        if !SUPPORTED_CNI_VERSIONS.contains(&self.cni_version.as_str()) {
            return Err(Error::IncompatibleVersion {
                version: self.cni_version.clone(),
            });
        }
        validate_key_segment(&self.name).map_err(|reason| {
            Error::InvalidNetworkConfig(format!("network name '{}': {reason}", self.name))
        })?;
        if self.plugin.is_empty() {
            return Err(Error::InvalidNetworkConfig(
                "plugin type cannot be empty".to_string(),
            ));
        }
        if self.ipam.plugin.is_empty() {
            return Err(Error::InvalidNetworkConfig(
                "ipam.type cannot be empty".to_string(),
            ));
        }
        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err(Error::InvalidNetworkConfig(format!(
                "mtu {} outside {MIN_MTU}..={MAX_MTU}",
                self.mtu
            )));
        }
        Ok(())
    }

    /// Returns the datastore endpoint URLs in failover order.
    ///
    /// `etcd_endpoints` wins over `etcd_authority`; with neither, the local
    /// default endpoint is used.
    #[must_use]
    pub fn datastore_endpoints(&self) -> Vec<String> {
        if let Some(endpoints) = self.etcd_endpoints.as_deref() {
            let parsed: Vec<String> = endpoints
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(|e| e.trim_end_matches('/').to_string())
                .collect();
            if !parsed.is_empty() {
                return parsed;
            }
        }
        match self.etcd_authority.as_deref().map(str::trim) {
            Some(authority) if !authority.is_empty() => vec![format!("http://{authority}")],
            _ => vec![DEFAULT_ETCD_ENDPOINT.to_string()],
        }
    }

    /// Reads `log_level` from a document without validating the rest, so
    /// logging can be configured before full parsing reports errors.
    #[must_use]
    pub fn peek_log_level(bytes: &[u8]) -> Option<String> {
        let value: Value = serde_json::from_slice(bytes).ok()?;
        value.get("log_level")?.as_str().map(str::to_string)
    }

    /// Reads `cniVersion` from a document without validating it, for
    /// stamping error documents. Falls back to the default version.
    #[must_use]
    pub fn peek_cni_version(bytes: &[u8]) -> String {
        serde_json::from_slice::<Value>(bytes)
            .ok()
            .and_then(|v| v.get("cniVersion")?.as_str().map(str::to_string))
            .filter(|v| SUPPORTED_CNI_VERSIONS.contains(&v.as_str()))
            .unwrap_or_else(default_cni_version)
    }
}

// =============================================================================
// CNI_ARGS
// =============================================================================

/// Key of the Kubernetes pod namespace in `CNI_ARGS`.
pub const K8S_POD_NAMESPACE: &str = "K8S_POD_NAMESPACE";

/// Key of the Kubernetes pod name in `CNI_ARGS`.
pub const K8S_POD_NAME: &str = "K8S_POD_NAME";

/// Parsed `CNI_ARGS` (`KEY=VALUE;KEY=VALUE`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CniArgs {
    raw: String,
    pairs: BTreeMap<String, String>,
}

impl CniArgs {
    /// Parses a `CNI_ARGS` string. Empty segments are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEnvironment`] for a segment without `=`.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut pairs = BTreeMap::new();
        for segment in raw.split(';').filter(|s| !s.trim().is_empty()) {
            let (key, value) = segment
                .split_once('=')
                .ok_or_else(|| Error::InvalidEnvironment {
                    name: "CNI_ARGS".to_string(),
                    reason: format!("segment '{segment}' is not KEY=VALUE"),
                })?;
            pairs.insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(Self {
            raw: raw.to_string(),
            pairs,
        })
    }

    /// Returns the value for `key`, if present and non-empty.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Returns the original string, for forwarding to delegated plugins.
    #[must_use]
    pub fn as_raw(&self) -> &str {
        &self.raw
    }

    /// Returns `(namespace, pod)` when both Kubernetes pod keys are present.
    #[must_use]
    pub fn k8s_pod(&self) -> Option<(&str, &str)> {
        Some((self.get(K8S_POD_NAMESPACE)?, self.get(K8S_POD_NAME)?))
    }
}

// =============================================================================
// Invocation
// =============================================================================

/// CNI operation requested by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CniCommand {
    /// Attach the container to the network.
    Add,
    /// Detach the container from the network.
    Del,
    /// Report supported CNI versions.
    Version,
}

impl CniCommand {
    /// Parses a `CNI_COMMAND` value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEnvironment`] for unknown commands.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "ADD" => Ok(Self::Add),
            "DEL" => Ok(Self::Del),
            "VERSION" => Ok(Self::Version),
            other => Err(Error::InvalidEnvironment {
                name: "CNI_COMMAND".to_string(),
                reason: format!("unsupported command '{other}'"),
            }),
        }
    }
}

impl std::fmt::Display for CniCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Add => write!(f, "ADD"),
            Self::Del => write!(f, "DEL"),
            Self::Version => write!(f, "VERSION"),
        }
    }
}

/// One plugin invocation: environment plus the raw configuration document.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Requested operation.
    pub command: CniCommand,
    /// Container identifier (empty for VERSION).
    pub container_id: String,
    /// Target network namespace path. Optional on DEL.
    pub netns: Option<PathBuf>,
    /// Container-side interface (endpoint) name.
    pub ifname: String,
    /// Parsed `CNI_ARGS`.
    pub args: CniArgs,
    /// Search path for delegated plugins.
    pub cni_path: Vec<PathBuf>,
    /// Raw network configuration document.
    pub config: Vec<u8>,
}

impl Invocation {
    /// Builds an invocation from an environment lookup and the stdin bytes.
    ///
    /// # Errors
    ///
    /// - [`Error::MissingEnvironment`] when a variable required by the
    ///   command is absent or empty
    /// - [`Error::InvalidEnvironment`] / [`Error::InvalidContainerId`] for
    ///   unusable values
    pub fn from_lookup<F>(lookup: F, config: Vec<u8>) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.is_empty());
        let required = |name: &str| {
            non_empty(name).ok_or_else(|| Error::MissingEnvironment(name.to_string()))
        };

        let command = CniCommand::parse(&required("CNI_COMMAND")?)?;
        if command == CniCommand::Version {
            return Ok(Self {
                command,
                container_id: String::new(),
                netns: None,
                ifname: DEFAULT_ENDPOINT_NAME.to_string(),
                args: CniArgs::default(),
                cni_path: Vec::new(),
                config,
            });
        }

        let container_id = required("CNI_CONTAINERID")?;
        validate_container_id(&container_id).map_err(|reason| Error::InvalidContainerId {
            id: container_id.clone(),
            reason: reason.to_string(),
        })?;

        let netns = match command {
            CniCommand::Add => Some(PathBuf::from(required("CNI_NETNS")?)),
            _ => non_empty("CNI_NETNS").map(PathBuf::from),
        };

        let ifname = non_empty("CNI_IFNAME").unwrap_or_else(|| DEFAULT_ENDPOINT_NAME.to_string());
        if ifname.len() > MAX_IFACE_NAME_LEN || validate_key_segment(&ifname).is_err() {
            return Err(Error::InvalidEnvironment {
                name: "CNI_IFNAME".to_string(),
                reason: format!("'{ifname}' is not a valid interface name"),
            });
        }

        let args = CniArgs::parse(&non_empty("CNI_ARGS").unwrap_or_default())?;
        let cni_path = non_empty("CNI_PATH")
            .map(|p| {
                p.split(':')
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            command,
            container_id,
            netns,
            ifname,
            args,
            cni_path,
            config,
        })
    }

    /// Builds an invocation from the process environment.
    ///
    /// # Errors
    ///
    /// See [`Invocation::from_lookup`].
    pub fn from_env(config: Vec<u8>) -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok(), config)
    }
}
