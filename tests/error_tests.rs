//! Tests for error types.
//!
//! Validates display formatting, categories, CNI codes and the retry
//! classification the orchestrator relies on.

use std::path::PathBuf;

use calico_cni::{Error, ErrorCategory, ErrorDocument};

// =============================================================================
// Display
// =============================================================================

#[test]
fn test_invalid_container_id_display() {
    let err = Error::InvalidContainerId {
        id: "bad/../id".to_string(),
        reason: "contains invalid characters".to_string(),
    };
    let msg = err.to_string();

    assert!(msg.contains("bad/../id"), "should include container ID");
    assert!(msg.contains("invalid container ID"));
    assert!(msg.contains("contains invalid characters"), "should include reason");
}

#[test]
fn test_plumbing_failed_display() {
    let err = Error::PlumbingFailed {
        operation: "create",
        link: "cali0123456789a".to_string(),
        reason: "File exists".to_string(),
    };
    assert_eq!(
        err.to_string(),
        "failed to create link 'cali0123456789a': File exists"
    );
}

#[test]
fn test_namespace_unavailable_display() {
    let err = Error::NamespaceUnavailable {
        path: PathBuf::from("/var/run/netns/gone"),
        reason: "No such file or directory".to_string(),
    };
    let msg = err.to_string();
    assert!(msg.contains("/var/run/netns/gone"));
    assert!(msg.contains("No such file or directory"));
}

#[test]
fn test_io_error_conversion() {
    let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
    let err: Error = io.into();
    assert!(matches!(err, Error::Io(_)));
    assert_eq!(err.category(), ErrorCategory::Internal);
    assert!(err.to_string().contains("pipe closed"));
}

// =============================================================================
// Categories and Codes
// =============================================================================

#[test]
fn test_configuration_errors_are_not_retryable() {
    let errors = [
        Error::DecodeFailed("eof".to_string()),
        Error::InvalidNetworkConfig("mtu".to_string()),
        Error::IncompatibleVersion {
            version: "0.1.0".to_string(),
        },
        Error::MissingEnvironment("CNI_COMMAND".to_string()),
        Error::MissingNodename,
        Error::IpamPluginNotFound {
            plugin: "host-local".to_string(),
            searched: vec![PathBuf::from("/opt/cni/bin")],
        },
    ];
    for err in errors {
        assert_eq!(err.category(), ErrorCategory::Configuration, "{err}");
        assert!(!err.is_retryable(), "{err}");
        assert!(err.cni_code() < 100, "{err}");
    }
}

#[test]
fn test_transient_errors_are_retryable() {
    let errors = [
        Error::DatastoreUnavailable {
            operation: "get workload endpoint",
            reason: "connection refused".to_string(),
        },
        Error::RevisionMismatch {
            key: "/calico/v1/policy/profile/net1".to_string(),
            expected: "7".to_string(),
        },
        Error::AllocationFailed {
            operation: "reserve",
            container_id: "c1".to_string(),
            reason: "timed out".to_string(),
        },
    ];
    for err in errors {
        assert!(err.is_retryable(), "{err}");
    }
}

#[test]
fn test_well_known_codes() {
    assert_eq!(
        Error::IncompatibleVersion {
            version: "0.1.0".to_string()
        }
        .cni_code(),
        1
    );
    assert_eq!(Error::DecodeFailed(String::new()).cni_code(), 6);
    assert_eq!(Error::InvalidNetworkConfig(String::new()).cni_code(), 7);
    assert_eq!(
        Error::DatastoreUnavailable {
            operation: "range",
            reason: String::new()
        }
        .cni_code(),
        11
    );
    assert_eq!(Error::Internal(String::new()).cni_code(), 999);
}

#[test]
fn test_endpoint_exists_is_a_datastore_conflict() {
    let err = Error::EndpointExists {
        key: "node/cni/c1/eth0".to_string(),
        container_id: "c1".to_string(),
    };
    assert_eq!(err.category(), ErrorCategory::Datastore);
    assert_eq!(err.cni_code(), 102);
    assert!(!err.is_retryable());
}

// =============================================================================
// Error Document
// =============================================================================

#[test]
fn test_error_document_shape() {
    let err = Error::DatastoreUnavailable {
        operation: "delete workload endpoint",
        reason: "connection refused".to_string(),
    };
    let doc = ErrorDocument::from_error(&err, "0.4.0");
    let json = serde_json::to_value(&doc).unwrap();

    assert_eq!(json["cniVersion"], "0.4.0");
    assert_eq!(json["code"], 11);
    assert_eq!(json["msg"], err.to_string());
    assert_eq!(json["details"], "category: datastore; retryable: true");
}
