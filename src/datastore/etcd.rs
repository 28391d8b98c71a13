//! etcd v3 backend over the JSON gRPC gateway.
//!
//! ## Key Layout
//!
//! ```text
//! /calico/v1/policy/profile/<name>
//! /calico/v1/host/<node>/workload/<orchestrator>/<workload>/endpoint/<endpoint>
//! ```
//!
//! Values are the JSON form of the record (`metadata` + `spec`). The
//! record's revision is the etcd `mod_revision` of its key.
//!
//! ## Gateway Quirks
//!
//! - keys and values are base64 in both directions
//! - 64-bit integers are JSON strings
//! - fields holding their default value (`false`, `0`, empty list) are
//!   omitted from responses entirely
//!
//! Create-if-absent is a transaction comparing `create_revision == 0`; fenced
//! deletes compare `mod_revision`. Both fall back to a range read on the
//! failure branch so a lost compare can tell "gone" from "changed".

use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{CreateOutcome, Datastore};
use crate::config::NetConf;
use crate::constants::{DATASTORE_KEY_PREFIX, DATASTORE_REQUEST_TIMEOUT};
use crate::error::{Error, Result};
use crate::model::{EndpointFilter, Profile, Revision, WorkloadEndpoint, WorkloadEndpointKey};

// =============================================================================
// Keys
// =============================================================================

/// Returns the key of a profile.
#[must_use]
pub fn profile_key(name: &str) -> String {
    format!("{DATASTORE_KEY_PREFIX}/policy/profile/{name}")
}

/// Returns the key of a workload endpoint.
#[must_use]
pub fn endpoint_key(key: &WorkloadEndpointKey) -> String {
    format!(
        "{DATASTORE_KEY_PREFIX}/host/{}/workload/{}/{}/endpoint/{}",
        key.node, key.orchestrator, key.workload, key.endpoint
    )
}

/// Returns the narrowest key prefix covering every endpoint `filter` can
/// match. Fields are only used while the ones before them are set.
#[must_use]
pub fn endpoint_prefix(filter: &EndpointFilter) -> String {
    let mut prefix = format!("{DATASTORE_KEY_PREFIX}/host/");
    let Some(node) = &filter.node else {
        return prefix;
    };
    prefix.push_str(&format!("{node}/workload/"));
    let Some(orchestrator) = &filter.orchestrator else {
        return prefix;
    };
    prefix.push_str(&format!("{orchestrator}/"));
    let Some(workload) = &filter.workload else {
        return prefix;
    };
    prefix.push_str(&format!("{workload}/endpoint/"));
    prefix
}

/// Returns the exclusive upper bound of a prefix range: the prefix with its
/// last byte incremented.
fn prefix_range_end(prefix: &str) -> Vec<u8> {
    let mut end = prefix.as_bytes().to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // All 0xff: etcd's "to the end of the keyspace".
    vec![0]
}

// =============================================================================
// Gateway Wire Types
// =============================================================================

#[derive(Debug, Serialize)]
struct RangeRequest {
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    range_end: Option<String>,
}

#[derive(Debug, Serialize)]
struct PutRequest {
    key: String,
    value: String,
}

#[derive(Debug, Serialize)]
struct DeleteRangeRequest {
    key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "UPPERCASE")]
enum CompareTarget {
    Create,
    Mod,
}

#[derive(Debug, Serialize)]
struct Compare {
    key: String,
    result: &'static str,
    target: CompareTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    create_revision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mod_revision: Option<String>,
}

#[derive(Debug, Default, Serialize)]
struct RequestOp {
    #[serde(skip_serializing_if = "Option::is_none")]
    request_range: Option<RangeRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_put: Option<PutRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_delete_range: Option<DeleteRangeRequest>,
}

#[derive(Debug, Serialize)]
struct TxnRequest {
    compare: Vec<Compare>,
    success: Vec<RequestOp>,
    failure: Vec<RequestOp>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseHeader {
    #[serde(default)]
    revision: String,
}

#[derive(Debug, Default, Deserialize)]
struct KeyValue {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
    #[serde(default)]
    mod_revision: String,
}

#[derive(Debug, Default, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseOp {
    #[serde(default)]
    response_range: Option<RangeResponse>,
}

#[derive(Debug, Default, Deserialize)]
struct TxnResponse {
    #[serde(default)]
    header: ResponseHeader,
    #[serde(default)]
    succeeded: bool,
    #[serde(default)]
    responses: Vec<ResponseOp>,
}

impl TxnResponse {
    /// Returns true when the failure branch's range read found the key.
    fn failure_found_key(&self) -> bool {
        self.responses
            .iter()
            .filter_map(|r| r.response_range.as_ref())
            .any(|r| !r.kvs.is_empty())
    }
}

fn encode(bytes: impl AsRef<[u8]>) -> String {
    STANDARD.encode(bytes)
}

fn decode(field: &str, value: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|e| Error::Serialization(format!("invalid base64 in {field}: {e}")))
}

/// Decodes a stored record, attaching the key's `mod_revision`.
fn decode_record<T: DeserializeOwned>(kv: &KeyValue) -> Result<(T, Revision)> {
    let key = String::from_utf8_lossy(&decode("key", &kv.key)?).into_owned();
    let value = decode("value", &kv.value)?;
    let record = serde_json::from_slice(&value)
        .map_err(|e| Error::Serialization(format!("record {key}: {e}")))?;
    Ok((record, Revision::new(kv.mod_revision.clone())))
}

// =============================================================================
// Client
// =============================================================================

/// Datastore backed by etcd v3.
pub struct EtcdDatastore {
    endpoints: Vec<String>,
    http: reqwest::Client,
}

impl EtcdDatastore {
    /// Creates a client for `endpoints`, tried in order on transport failure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidNetworkConfig`] for an empty endpoint list, or
    /// [`Error::Internal`] if the HTTP client cannot be built.
    pub fn new(endpoints: Vec<String>, timeout: Duration) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::InvalidNetworkConfig(
                "no datastore endpoints configured".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { endpoints, http })
    }

    /// Creates a client from the network configuration's endpoint settings.
    ///
    /// # Errors
    ///
    /// See [`EtcdDatastore::new`].
    pub fn from_conf(conf: &NetConf) -> Result<Self> {
        Self::new(conf.datastore_endpoints(), DATASTORE_REQUEST_TIMEOUT)
    }

    /// Returns the configured endpoints in failover order.
    #[must_use]
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// POSTs `body` to `path` on the first endpoint that answers.
    ///
    /// Connection failures and 5xx responses move on to the next endpoint;
    /// any other non-success status is returned immediately.
    async fn call<B, R>(&self, operation: &'static str, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let mut last_error = String::new();
        for endpoint in &self.endpoints {
            let url = format!("{endpoint}{path}");
            let response = match self.http.post(&url).json(body).send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, operation, "datastore endpoint unreachable");
                    last_error = format!("{endpoint}: {e}");
                    continue;
                }
            };

            let status = response.status();
            if status.is_server_error() {
                warn!(endpoint = %endpoint, status = %status, operation, "datastore endpoint failed");
                last_error = format!("{endpoint}: HTTP {status}");
                continue;
            }
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(Error::DatastoreUnavailable {
                    operation,
                    reason: format!("{endpoint}: HTTP {status}: {}", text.trim()),
                });
            }

            return response
                .json::<R>()
                .await
                .map_err(|e| Error::DatastoreUnavailable {
                    operation,
                    reason: format!("{endpoint}: malformed response: {e}"),
                });
        }
        Err(Error::DatastoreUnavailable {
            operation,
            reason: last_error,
        })
    }

    async fn range(&self, operation: &'static str, request: &RangeRequest) -> Result<Vec<KeyValue>> {
        let response: RangeResponse = self.call(operation, "/v3/kv/range", request).await?;
        Ok(response.kvs)
    }

    async fn get_one<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        key: &str,
    ) -> Result<Option<(T, Revision)>> {
        let request = RangeRequest {
            key: encode(key),
            range_end: None,
        };
        match self.range(operation, &request).await?.first() {
            Some(kv) => decode_record(kv).map(Some),
            None => Ok(None),
        }
    }

    /// Writes `value` at `key` unless the key exists. Returns the revision of
    /// the write, or `None` if the key was already present.
    async fn create_if_absent(
        &self,
        operation: &'static str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<Option<Revision>> {
        let request = TxnRequest {
            compare: vec![Compare {
                key: encode(key),
                result: "EQUAL",
                target: CompareTarget::Create,
                create_revision: Some("0".to_string()),
                mod_revision: None,
            }],
            success: vec![RequestOp {
                request_put: Some(PutRequest {
                    key: encode(key),
                    value: encode(value),
                }),
                ..RequestOp::default()
            }],
            failure: Vec::new(),
        };
        let response: TxnResponse = self.call(operation, "/v3/kv/txn", &request).await?;
        if response.succeeded {
            Ok(Some(Revision::new(response.header.revision)))
        } else {
            Ok(None)
        }
    }
}

#[async_trait]
impl Datastore for EtcdDatastore {
    fn name(&self) -> &str {
        "etcd"
    }

    async fn get_profile(&self, name: &str) -> Result<Option<Profile>> {
        let found = self
            .get_one::<Profile>("get profile", &profile_key(name))
            .await?;
        Ok(found.map(|(mut profile, revision)| {
            profile.revision = Some(revision);
            profile
        }))
    }

    async fn create_profile(&self, profile: &Profile) -> Result<CreateOutcome> {
        let key = profile_key(&profile.metadata.name);
        let value =
            serde_json::to_vec(profile).map_err(|e| Error::Serialization(e.to_string()))?;
        match self.create_if_absent("create profile", &key, value).await? {
            Some(revision) => {
                debug!(key = %key, revision = %revision, "profile created");
                Ok(CreateOutcome::Created(revision))
            }
            None => Ok(CreateOutcome::AlreadyExists),
        }
    }

    async fn delete_profile(&self, name: &str, revision: &Revision) -> Result<()> {
        let key = profile_key(name);
        let request = TxnRequest {
            compare: vec![Compare {
                key: encode(&key),
                result: "EQUAL",
                target: CompareTarget::Mod,
                create_revision: None,
                mod_revision: Some(revision.as_str().to_string()),
            }],
            success: vec![RequestOp {
                request_delete_range: Some(DeleteRangeRequest { key: encode(&key) }),
                ..RequestOp::default()
            }],
            failure: vec![RequestOp {
                request_range: Some(RangeRequest {
                    key: encode(&key),
                    range_end: None,
                }),
                ..RequestOp::default()
            }],
        };
        let response: TxnResponse = self.call("delete profile", "/v3/kv/txn", &request).await?;
        if response.succeeded || !response.failure_found_key() {
            return Ok(());
        }
        Err(Error::RevisionMismatch {
            key,
            expected: revision.to_string(),
        })
    }

    async fn get_workload_endpoint(
        &self,
        key: &WorkloadEndpointKey,
    ) -> Result<Option<WorkloadEndpoint>> {
        let found = self
            .get_one::<WorkloadEndpoint>("get workload endpoint", &endpoint_key(key))
            .await?;
        Ok(found.map(|(mut endpoint, revision)| {
            endpoint.revision = Some(revision);
            endpoint
        }))
    }

    async fn list_workload_endpoints(
        &self,
        filter: &EndpointFilter,
    ) -> Result<Vec<WorkloadEndpoint>> {
        let prefix = endpoint_prefix(filter);
        let request = RangeRequest {
            key: encode(&prefix),
            range_end: Some(encode(prefix_range_end(&prefix))),
        };
        let mut endpoints = Vec::new();
        for kv in self.range("list workload endpoints", &request).await? {
            let (mut endpoint, revision) = decode_record::<WorkloadEndpoint>(&kv)?;
            if filter.matches(&endpoint.key()) {
                endpoint.revision = Some(revision);
                endpoints.push(endpoint);
            }
        }
        endpoints.sort_by_key(WorkloadEndpoint::key);
        Ok(endpoints)
    }

    async fn create_workload_endpoint(
        &self,
        endpoint: &WorkloadEndpoint,
    ) -> Result<WorkloadEndpoint> {
        let key = endpoint_key(&endpoint.key());
        let value =
            serde_json::to_vec(endpoint).map_err(|e| Error::Serialization(e.to_string()))?;
        match self
            .create_if_absent("create workload endpoint", &key, value)
            .await?
        {
            Some(revision) => {
                let mut stored = endpoint.clone();
                stored.revision = Some(revision);
                Ok(stored)
            }
            None => Err(Error::RecordConflict { key }),
        }
    }

    async fn delete_workload_endpoint(&self, key: &WorkloadEndpointKey) -> Result<()> {
        let request = DeleteRangeRequest {
            key: encode(endpoint_key(key)),
        };
        let _: serde_json::Value = self
            .call("delete workload endpoint", "/v3/kv/deleterange", &request)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> WorkloadEndpointKey {
        WorkloadEndpointKey {
            node: "node-a".to_string(),
            orchestrator: "k8s".to_string(),
            workload: "default.web-0".to_string(),
            endpoint: "eth0".to_string(),
        }
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(profile_key("net1"), "/calico/v1/policy/profile/net1");
        assert_eq!(
            endpoint_key(&key()),
            "/calico/v1/host/node-a/workload/k8s/default.web-0/endpoint/eth0"
        );
    }

    #[test]
    fn test_endpoint_prefix_stops_at_first_gap() {
        assert_eq!(endpoint_prefix(&EndpointFilter::default()), "/calico/v1/host/");
        assert_eq!(
            endpoint_prefix(&EndpointFilter::node("node-a").with_orchestrator("cni")),
            "/calico/v1/host/node-a/workload/cni/"
        );
        // Workload without orchestrator cannot narrow the range.
        assert_eq!(
            endpoint_prefix(&EndpointFilter::node("node-a").with_workload("abc")),
            "/calico/v1/host/node-a/workload/"
        );
        assert!(endpoint_key(&key()).starts_with(&endpoint_prefix(
            &EndpointFilter::node("node-a")
                .with_orchestrator("k8s")
                .with_workload("default.web-0")
        )));
    }

    #[test]
    fn test_prefix_range_end() {
        assert_eq!(prefix_range_end("/a/"), b"/a0".to_vec());
        assert_eq!(prefix_range_end("ab"), b"ac".to_vec());
    }

    #[test]
    fn test_txn_response_with_omitted_fields() {
        // A failed compare omits `succeeded` entirely.
        let response: TxnResponse =
            serde_json::from_str(r#"{"header":{"revision":"42"}}"#).unwrap();
        assert!(!response.succeeded);
        assert!(!response.failure_found_key());

        let response: TxnResponse = serde_json::from_str(
            r#"{"header":{"revision":"42"},
                "responses":[{"response_range":{"kvs":[{"key":"YQ==","mod_revision":"7"}],"count":"1"}}]}"#,
        )
        .unwrap();
        assert!(response.failure_found_key());
    }

    #[test]
    fn test_decode_record_attaches_revision() {
        let profile = Profile::default_for_network("net1");
        let kv = KeyValue {
            key: encode(profile_key("net1")),
            value: encode(serde_json::to_vec(&profile).unwrap()),
            mod_revision: "17".to_string(),
        };
        let (decoded, revision): (Profile, Revision) = decode_record(&kv).unwrap();
        assert_eq!(decoded.metadata, profile.metadata);
        assert_eq!(revision.as_str(), "17");
    }

    #[test]
    fn test_range_response_without_kvs() {
        let response: RangeResponse =
            serde_json::from_str(r#"{"header":{"cluster_id":"1","revision":"3"}}"#).unwrap();
        assert!(response.kvs.is_empty());
    }

    #[test]
    fn test_compare_serialization() {
        let compare = Compare {
            key: encode("k"),
            result: "EQUAL",
            target: CompareTarget::Create,
            create_revision: Some("0".to_string()),
            mod_revision: None,
        };
        assert_eq!(
            serde_json::to_value(&compare).unwrap(),
            serde_json::json!({"key": "aw==", "result": "EQUAL", "target": "CREATE", "create_revision": "0"})
        );
    }

    #[test]
    fn test_empty_endpoints_rejected() {
        assert!(matches!(
            EtcdDatastore::new(Vec::new(), Duration::from_secs(1)),
            Err(Error::InvalidNetworkConfig(_))
        ));
    }
}
