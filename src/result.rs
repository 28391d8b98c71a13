//! Documents written to stdout.
//!
//! | Command | Success | Failure |
//! |---------|---------|---------|
//! | ADD | [`AddResult`] | [`ErrorDocument`] |
//! | DEL | nothing | [`ErrorDocument`] |
//! | VERSION | [`VersionResult`] | [`ErrorDocument`] |
//!
//! The `ips[].version` field exists only before CNI 1.0.0 and is emitted
//! according to the requested `cniVersion`.

use std::net::{IpAddr, Ipv4Addr};

use ipnetwork::{IpNetwork, Ipv4Network};
use macaddr::MacAddr6;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{CONTAINER_GATEWAY_V4, SUPPORTED_CNI_VERSIONS};
use crate::dataplane::VethPair;
use crate::error::{Error, Result};

/// Interface entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Namespace path; absent for host interfaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// Assigned address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfig {
    /// `"4"` or `"6"`; only for results before 1.0.0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub address: IpNetwork,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    /// Index into `interfaces`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

/// Route entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub dst: IpNetwork,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}

/// DNS settings, passed through from a chained result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dns {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Dns {
    fn is_empty(&self) -> bool {
        self.nameservers.is_empty()
            && self.domain.is_none()
            && self.search.is_empty()
            && self.options.is_empty()
    }
}

/// Result of a successful ADD.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddResult {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    #[serde(default)]
    pub ips: Vec<IpConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
    #[serde(default, skip_serializing_if = "Dns::is_empty")]
    pub dns: Dns,
}

fn format_mac(mac: &MacAddr6) -> String {
    mac.as_bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn uses_ip_version_field(cni_version: &str) -> bool {
    cni_version.starts_with("0.")
}

impl AddResult {
    /// Builds the ADD result, appending this plugin's interfaces, addresses
    /// and default route to a chained `prev_result`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidNetworkConfig`] if `prev_result` is not a
    /// result document.
    pub fn build(
        cni_version: &str,
        prev_result: Option<&Value>,
        pair: &VethPair,
        sandbox: &str,
        addresses: &[IpNetwork],
    ) -> Result<Self> {
        let mut result = match prev_result {
            Some(prev) => serde_json::from_value::<AddResult>(prev.clone()).map_err(|e| {
                Error::InvalidNetworkConfig(format!("prevResult is not a result: {e}"))
            })?,
            None => AddResult {
                cni_version: String::new(),
                interfaces: Vec::new(),
                ips: Vec::new(),
                routes: Vec::new(),
                dns: Dns::default(),
            },
        };
        result.cni_version = cni_version.to_string();

        let with_version = uses_ip_version_field(cni_version);
        for ip in &mut result.ips {
            ip.version = with_version.then(|| ip_version(&ip.address));
        }

        result.interfaces.push(Interface {
            name: pair.host.name.clone(),
            mac: pair.host.mac.as_ref().map(format_mac),
            sandbox: None,
        });
        let container_index = result.interfaces.len();
        result.interfaces.push(Interface {
            name: pair.container.name.clone(),
            mac: pair.container.mac.as_ref().map(format_mac),
            sandbox: Some(sandbox.to_string()),
        });

        for address in addresses {
            result.ips.push(IpConfig {
                version: with_version.then(|| ip_version(address)),
                address: *address,
                gateway: match address {
                    IpNetwork::V4(_) => Some(IpAddr::V4(CONTAINER_GATEWAY_V4)),
                    IpNetwork::V6(_) => None,
                },
                interface: Some(container_index),
            });
        }

        if addresses.iter().any(IpNetwork::is_ipv4) {
            let any = Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0)
                .map_err(|e| Error::Internal(format!("default route: {e}")))?;
            let default_v4 = Route {
                dst: IpNetwork::V4(any),
                gw: Some(IpAddr::V4(CONTAINER_GATEWAY_V4)),
            };
            if !result.routes.contains(&default_v4) {
                result.routes.push(default_v4);
            }
        }
        Ok(result)
    }
}

fn ip_version(network: &IpNetwork) -> String {
    if network.is_ipv4() { "4" } else { "6" }.to_string()
}

/// Error reported to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDocument {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl ErrorDocument {
    /// Describes `error` for the orchestrator, including whether a retry
    /// may help.
    #[must_use]
    pub fn from_error(error: &Error, cni_version: &str) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            code: error.cni_code(),
            msg: error.to_string(),
            details: format!(
                "category: {}; retryable: {}",
                error.category(),
                error.is_retryable()
            ),
        }
    }
}

/// Result of VERSION.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionResult {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    #[serde(rename = "supportedVersions")]
    pub supported_versions: Vec<String>,
}

impl Default for VersionResult {
    fn default() -> Self {
        Self {
            cni_version: SUPPORTED_CNI_VERSIONS
                .last()
                .copied()
                .unwrap_or_default()
                .to_string(),
            supported_versions: SUPPORTED_CNI_VERSIONS
                .iter()
                .map(|v| (*v).to_string())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::LinkInfo;

    fn pair() -> VethPair {
        VethPair {
            host: LinkInfo {
                name: "cali0123456789a".to_string(),
                index: 7,
                mtu: 1500,
                up: true,
                mac: Some(MacAddr6::new(0xEE, 0xEE, 0xEE, 0xEE, 0xEE, 0xEE)),
            },
            container: LinkInfo {
                name: "eth0".to_string(),
                index: 8,
                mtu: 1500,
                up: false,
                mac: Some(MacAddr6::new(0x02, 0, 0, 0, 0, 0x08)),
            },
        }
    }

    #[test]
    fn test_ip_version_field_follows_cni_version() {
        let addrs = vec!["10.0.0.7/32".parse().unwrap()];

        let old = AddResult::build("0.3.1", None, &pair(), "/ns", &addrs).unwrap();
        let json = serde_json::to_value(&old).unwrap();
        assert_eq!(json["ips"][0]["version"], "4");
        assert_eq!(json["ips"][0]["address"], "10.0.0.7/32");
        assert_eq!(json["ips"][0]["interface"], 1);
        assert_eq!(json["interfaces"][0]["mac"], "ee:ee:ee:ee:ee:ee");
        assert_eq!(json["interfaces"][1]["sandbox"], "/ns");
        assert_eq!(json["routes"][0]["dst"], "0.0.0.0/0");

        let new = AddResult::build("1.0.0", None, &pair(), "/ns", &addrs).unwrap();
        let json = serde_json::to_value(&new).unwrap();
        assert!(json["ips"][0].get("version").is_none());
    }

    #[test]
    fn test_prev_result_is_extended() {
        let prev = serde_json::json!({
            "cniVersion": "0.4.0",
            "interfaces": [{"name": "bond0"}],
            "ips": [{"version": "4", "address": "192.168.0.5/24", "interface": 0}],
            "dns": {"nameservers": ["10.96.0.10"]}
        });
        let addrs = vec!["10.0.0.7/32".parse().unwrap()];
        let result = AddResult::build("0.4.0", Some(&prev), &pair(), "/ns", &addrs).unwrap();

        assert_eq!(result.interfaces.len(), 3);
        assert_eq!(result.interfaces[0].name, "bond0");
        assert_eq!(result.ips.len(), 2);
        assert_eq!(result.ips[1].interface, Some(2));
        assert_eq!(result.dns.nameservers, vec!["10.96.0.10".to_string()]);
    }

    #[test]
    fn test_bad_prev_result_rejected() {
        let prev = serde_json::json!({"ips": "nope"});
        assert!(matches!(
            AddResult::build("0.4.0", Some(&prev), &pair(), "/ns", &[]),
            Err(Error::InvalidNetworkConfig(_))
        ));
    }

    #[test]
    fn test_version_result() {
        let json = serde_json::to_value(VersionResult::default()).unwrap();
        assert_eq!(json["cniVersion"], "1.0.0");
        assert_eq!(
            json["supportedVersions"],
            serde_json::json!(["0.3.0", "0.3.1", "0.4.0", "1.0.0"])
        );
    }
}
