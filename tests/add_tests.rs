//! Integration tests for ADD.
//!
//! Runs the handler against the in-memory datastore, pool IPAM and
//! simulated dataplane, then inspects all three.

mod common;

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use calico_cni::dataplane::{NetworkPlumber, PlumbingStep, RouteKind, RouteProtocol, RouteScope};
use calico_cni::datastore::{Datastore, DatastoreOp};
use calico_cni::identity::host_iface_name;
use calico_cni::model::{EndpointFilter, Profile, Rule, WorkloadEndpointKey};
use calico_cni::{AddResult, Error, ErrorCategory, Reply};
use common::{Harness, NETNS, SYSTEM_HOSTNAME, config, config_with, k8s_args};

fn added(reply: Reply) -> AddResult {
    match reply {
        Reply::Added(result) => result,
        other => panic!("expected ADD result, got {other:?}"),
    }
}

fn cni_key(node: &str, container_id: &str) -> WorkloadEndpointKey {
    WorkloadEndpointKey {
        node: node.to_string(),
        orchestrator: "cni".to_string(),
        workload: container_id.to_string(),
        endpoint: "eth0".to_string(),
    }
}

async fn assert_nothing_left(harness: &Harness) {
    assert_eq!(harness.datastore.endpoint_count(), 0, "no endpoint record");
    assert_eq!(harness.ipam.reservation_count(), 0, "no reservation");
    assert!(harness.dataplane.link_names(None).is_empty(), "no host link");
    assert!(
        harness
            .dataplane
            .link_names(Some(Path::new(NETNS)))
            .is_empty(),
        "no container link"
    );
}

// =============================================================================
// Record and Profile
// =============================================================================

#[tokio::test]
async fn test_add_creates_one_record_and_default_profile() {
    let harness = Harness::new();
    harness.add("c1").await.unwrap();

    let records = harness
        .datastore
        .list_workload_endpoints(&EndpointFilter::default())
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.metadata.workload, "c1");
    assert_eq!(record.metadata.node, SYSTEM_HOSTNAME);
    assert_eq!(record.metadata.orchestrator, "cni");
    assert_eq!(record.metadata.name, "eth0");
    assert_eq!(record.metadata.active_instance_id, "");
    assert_eq!(record.spec.profiles, vec!["net1".to_string()]);
    assert_eq!(record.spec.interface_name, host_iface_name("c1", "eth0"));

    let profile = harness
        .datastore
        .get_profile("net1")
        .await
        .unwrap()
        .expect("profile created");
    assert_eq!(profile.metadata.tags, vec!["net1".to_string()]);
    assert_eq!(profile.spec.egress_rules, vec![Rule::allow_all()]);
    assert_eq!(profile.spec.ingress_rules, vec![Rule::allow_from_tag("net1")]);
}

#[tokio::test]
async fn test_second_workload_reuses_profile() {
    let harness = Harness::new();
    harness.add("c1").await.unwrap();
    harness.add("c2").await.unwrap();

    assert_eq!(harness.datastore.endpoint_count(), 2);
    let profile = harness.datastore.get_profile("net1").await.unwrap().unwrap();
    assert!(profile.has_default_shape());
}

#[tokio::test]
async fn test_customised_profile_is_not_overwritten() {
    let harness = Harness::new();
    let mut custom = Profile::default_for_network("net1");
    custom.spec.ingress_rules = vec![Rule::allow_all()];
    harness.datastore.put_profile(custom);

    harness.add("c1").await.unwrap();

    let profile = harness.datastore.get_profile("net1").await.unwrap().unwrap();
    assert_eq!(profile.spec.ingress_rules, vec![Rule::allow_all()]);
}

// =============================================================================
// Identity
// =============================================================================

#[tokio::test]
async fn test_nodename_wins_over_hostname() {
    let harness = Harness::new();
    let conf = config_with(r#""hostname":"H","nodename":"N","#);
    harness.add_in("c1", NETNS, None, conf).await.unwrap();

    let record = harness
        .datastore
        .get_workload_endpoint(&cni_key("N", "c1"))
        .await
        .unwrap();
    assert!(record.is_some(), "record keyed by nodename");
}

#[tokio::test]
async fn test_hostname_used_without_nodename() {
    let harness = Harness::new();
    let conf = config_with(r#""hostname":"H","#);
    harness.add_in("c1", NETNS, None, conf).await.unwrap();

    let record = harness
        .datastore
        .get_workload_endpoint(&cni_key("H", "c1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.metadata.node, "H");
}

#[tokio::test]
async fn test_system_hostname_is_the_fallback() {
    let harness = Harness::with_hostname("sys-host");
    harness.add("c1").await.unwrap();

    let records = harness
        .datastore
        .list_workload_endpoints(&EndpointFilter::node("sys-host"))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn test_no_node_identity_fails_before_side_effects() {
    let harness = Harness::with_hostname("");
    let err = harness.add("c1").await.unwrap_err();

    assert!(matches!(err, Error::MissingNodename));
    assert_eq!(err.category(), ErrorCategory::Configuration);
    assert_nothing_left(&harness).await;
}

#[tokio::test]
async fn test_k8s_pod_arguments_set_workload_and_instance() {
    let harness = Harness::new();
    let args = k8s_args("default", "web-0");
    harness
        .add_in("c1", NETNS, Some(args.as_str()), config())
        .await
        .unwrap();

    let records = harness
        .datastore
        .list_workload_endpoints(&EndpointFilter::default().with_orchestrator("k8s"))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].metadata.workload, "default.web-0");
    assert_eq!(records[0].metadata.active_instance_id, "c1");
    assert_eq!(
        records[0].spec.interface_name,
        host_iface_name("c1", "eth0")
    );
}

// =============================================================================
// Plumbing
// =============================================================================

#[tokio::test]
async fn test_plumbing_matches_record() {
    let harness = Harness::new();
    harness.add("c1").await.unwrap();

    let record = harness
        .datastore
        .get_workload_endpoint(&cni_key(SYSTEM_HOSTNAME, "c1"))
        .await
        .unwrap()
        .unwrap();
    let dp = harness.dataplane.as_ref();
    let host_iface = record.spec.interface_name.as_str();

    assert!(dp.link_exists(None, host_iface).await.unwrap());
    assert!(dp.link_is_up(None, host_iface).await.unwrap());
    assert_eq!(dp.link_mtu(None, host_iface).await.unwrap(), Some(1500));

    let netns = Some(harness.netns());
    assert!(dp.link_is_up(netns, "eth0").await.unwrap());
    let addresses = dp.addresses(netns, "eth0").await.unwrap();
    assert_eq!(addresses.len(), 1);
    assert_eq!(addresses, record.spec.ip_networks);
    assert_eq!(addresses[0].prefix(), 32, "host mask regardless of pool prefix");
    assert_eq!(addresses[0].ip(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));

    let container = dp.link(netns, "eth0").await.unwrap().unwrap();
    assert_eq!(record.spec.mac, container.mac);
}

#[tokio::test]
async fn test_custom_mtu_applied_to_both_ends() {
    let harness = Harness::new();
    let conf = config_with(r#""mtu":1400,"#);
    harness.add_in("c1", NETNS, None, conf).await.unwrap();

    let dp = harness.dataplane.as_ref();
    let host_iface = host_iface_name("c1", "eth0");
    assert_eq!(dp.link_mtu(None, &host_iface).await.unwrap(), Some(1400));
    assert_eq!(
        dp.link_mtu(Some(harness.netns()), "eth0").await.unwrap(),
        Some(1400)
    );
}

#[tokio::test]
async fn test_container_routes_installed() {
    let harness = Harness::new();
    harness.add("c1").await.unwrap();

    let routes = harness
        .dataplane
        .routes(Some(harness.netns()))
        .await
        .unwrap();
    assert_eq!(routes.len(), 2);

    let gateway = IpAddr::V4(Ipv4Addr::new(169, 254, 1, 1));
    let link_route = routes
        .iter()
        .find(|r| r.destination.is_some_and(|d| d.ip() == gateway))
        .expect("route to the gateway");
    assert_eq!(link_route.destination.map(|d| d.prefix()), Some(32));
    assert_eq!(link_route.device.as_deref(), Some("eth0"));
    assert_eq!(link_route.scope, RouteScope::Link);

    let default = routes
        .iter()
        .find(|r| r.is_default())
        .expect("default route");
    assert_eq!(default.gateway, Some(gateway));

    for route in &routes {
        assert_eq!(route.protocol, RouteProtocol::Boot);
        assert_eq!(route.table, 254);
        assert_eq!(route.kind, RouteKind::Unicast);
    }
}

#[tokio::test]
async fn test_stale_host_link_is_replaced() {
    let harness = Harness::new();
    let host_iface = host_iface_name("c1", "eth0");
    harness.dataplane.insert_host_link(&host_iface, 9000);

    harness.add("c1").await.unwrap();

    let dp = harness.dataplane.as_ref();
    assert_eq!(dp.link_mtu(None, &host_iface).await.unwrap(), Some(1500));
    assert!(dp.link_is_up(None, &host_iface).await.unwrap());
}

// =============================================================================
// Result Document
// =============================================================================

#[tokio::test]
async fn test_result_document() {
    let harness = Harness::new();
    let result = added(harness.add("c1").await.unwrap());

    assert_eq!(result.cni_version, "0.3.1");
    assert_eq!(result.interfaces.len(), 2);
    assert_eq!(result.interfaces[0].name, host_iface_name("c1", "eth0"));
    assert_eq!(result.interfaces[0].sandbox, None);
    assert_eq!(result.interfaces[1].name, "eth0");
    assert_eq!(result.interfaces[1].sandbox.as_deref(), Some(NETNS));

    assert_eq!(result.ips.len(), 1);
    let ip = &result.ips[0];
    assert_eq!(ip.address.to_string(), "10.0.0.2/32");
    assert_eq!(ip.version.as_deref(), Some("4"));
    assert_eq!(ip.interface, Some(1));
    assert_eq!(ip.gateway, Some(IpAddr::V4(Ipv4Addr::new(169, 254, 1, 1))));

    assert_eq!(result.routes.len(), 1);
    assert_eq!(result.routes[0].dst.to_string(), "0.0.0.0/0");
}

#[tokio::test]
async fn test_result_for_1_0_0_omits_ip_version() {
    let harness = Harness::new();
    let conf = br#"{"cniVersion":"1.0.0","name":"net1","type":"calico","ipam":{"type":"pool","subnet":"10.0.0.0/24"}}"#;
    let result = added(
        harness
            .add_in("c1", NETNS, None, conf.to_vec())
            .await
            .unwrap(),
    );

    assert_eq!(result.cni_version, "1.0.0");
    assert_eq!(result.ips[0].version, None);
    let json = serde_json::to_value(&result).unwrap();
    assert!(json["ips"][0].get("version").is_none());
}

#[tokio::test]
async fn test_prev_result_is_extended() {
    let harness = Harness::new();
    let conf = config_with(
        r#""prevResult":{"cniVersion":"0.3.1","interfaces":[{"name":"bond0"}],"ips":[],"dns":{"nameservers":["10.96.0.10"]}},"#,
    );
    let result = added(harness.add_in("c1", NETNS, None, conf).await.unwrap());

    assert_eq!(result.interfaces.len(), 3);
    assert_eq!(result.interfaces[0].name, "bond0");
    assert_eq!(result.ips[0].interface, Some(2));
    assert_eq!(result.dns.nameservers, vec!["10.96.0.10".to_string()]);
}

#[tokio::test]
async fn test_invalid_prev_result_leaves_nothing_behind() {
    let harness = Harness::new();
    let conf = config_with(r#""prevResult":{"interfaces":"bogus"},"#);
    let err = harness.add_in("c1", NETNS, None, conf).await.unwrap_err();

    assert!(matches!(err, Error::InvalidNetworkConfig(_)));
    assert_nothing_left(&harness).await;
    assert!(harness.datastore.get_profile("net1").await.unwrap().is_none());
}

// =============================================================================
// Preconditions
// =============================================================================

#[tokio::test]
async fn test_missing_namespace_fails_without_side_effects() {
    let harness = Harness::new();
    let err = harness
        .add_in("c1", "/var/run/netns/missing", None, config())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NamespaceUnavailable { .. }));
    assert_eq!(err.cni_code(), 3);
    assert_nothing_left(&harness).await;
}

#[tokio::test]
async fn test_repeated_add_for_same_instance_is_rejected() {
    let harness = Harness::new();
    harness.add("c1").await.unwrap();

    let err = harness.add("c1").await.unwrap_err();
    assert!(matches!(err, Error::EndpointExists { .. }));
    assert!(!err.is_retryable());

    // The first attachment is intact.
    assert_eq!(harness.datastore.endpoint_count(), 1);
    assert_eq!(harness.ipam.reservation_count(), 1);
    let host_iface = host_iface_name("c1", "eth0");
    assert!(
        harness
            .dataplane
            .link_exists(None, &host_iface)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_new_pod_instance_supersedes_stale_record() {
    let harness = Harness::new();
    harness.dataplane.add_namespace("/var/run/netns/second");
    let args = k8s_args("default", "web-0");

    harness
        .add_in("c1", NETNS, Some(args.as_str()), config())
        .await
        .unwrap();
    harness
        .add_in("c2", "/var/run/netns/second", Some(args.as_str()), config())
        .await
        .unwrap();

    let records = harness
        .datastore
        .list_workload_endpoints(&EndpointFilter::default())
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].metadata.active_instance_id, "c2");
    assert_eq!(
        harness
            .dataplane
            .link_names(Some(Path::new("/var/run/netns/second"))),
        vec!["eth0".to_string()]
    );
    assert_eq!(
        records[0].spec.interface_name,
        host_iface_name("c2", "eth0")
    );

    // The earlier instance keeps its veth until its own DEL arrives.
    let dp = harness.dataplane.as_ref();
    assert!(dp.link_exists(None, &host_iface_name("c1", "eth0")).await.unwrap());
    assert!(dp.link_exists(Some(harness.netns()), "eth0").await.unwrap());
}

#[tokio::test]
async fn test_failed_replacement_leaves_earlier_instance_intact() {
    let harness = Harness::new();
    harness.dataplane.add_namespace("/var/run/netns/second");
    let args = k8s_args("default", "web-0");
    harness
        .add_in("c1", NETNS, Some(args.as_str()), config())
        .await
        .unwrap();

    harness.dataplane.fail_at(PlumbingStep::AddRoutes);
    harness
        .add_in("c2", "/var/run/netns/second", Some(args.as_str()), config())
        .await
        .unwrap_err();

    let records = harness
        .datastore
        .list_workload_endpoints(&EndpointFilter::default())
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].metadata.active_instance_id, "c1");

    let dp = harness.dataplane.as_ref();
    assert!(dp.link_is_up(None, &records[0].spec.interface_name).await.unwrap());
    assert!(dp.link_is_up(Some(harness.netns()), "eth0").await.unwrap());
    assert_eq!(
        dp.addresses(Some(harness.netns()), "eth0").await.unwrap(),
        records[0].spec.ip_networks
    );
    assert_eq!(
        dp.link_names(None),
        vec![host_iface_name("c1", "eth0")],
        "replacement's veth rolled back"
    );
    assert_eq!(harness.ipam.reserved("c1").len(), 1);
    assert!(harness.ipam.reserved("c2").is_empty());
}

// =============================================================================
// Rollback
// =============================================================================

#[tokio::test]
async fn test_reserve_failure_creates_nothing() {
    let harness = Harness::new();
    harness.ipam.fail_reserve(true);

    let err = harness.add("c1").await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Allocation);
    assert!(err.is_retryable());
    assert_nothing_left(&harness).await;
    assert!(harness.datastore.get_profile("net1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_profile_failure_releases_addresses() {
    let harness = Harness::new();
    harness.datastore.fail(DatastoreOp::CreateProfile);

    let err = harness.add("c1").await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Datastore);
    assert_nothing_left(&harness).await;
}

#[tokio::test]
async fn test_veth_failure_rolls_back_profile_and_addresses() {
    let harness = Harness::new();
    harness.dataplane.fail_at(PlumbingStep::CreateVeth);

    let err = harness.add("c1").await.unwrap_err();
    assert!(matches!(err, Error::PlumbingFailed { .. }));
    assert_nothing_left(&harness).await;
    assert!(harness.datastore.get_profile("net1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_address_failure_removes_veth() {
    let harness = Harness::new();
    harness.dataplane.fail_at(PlumbingStep::AssignAddress);

    harness.add("c1").await.unwrap_err();
    assert_nothing_left(&harness).await;
}

#[tokio::test]
async fn test_route_failure_removes_veth() {
    let harness = Harness::new();
    harness.dataplane.fail_at(PlumbingStep::AddRoutes);

    harness.add("c1").await.unwrap_err();
    assert_nothing_left(&harness).await;
    assert!(
        harness
            .dataplane
            .routes(Some(harness.netns()))
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_record_failure_rolls_back_everything() {
    let harness = Harness::new();
    harness.datastore.fail(DatastoreOp::CreateEndpoint);

    let err = harness.add("c1").await.unwrap_err();
    assert!(matches!(err, Error::DatastoreUnavailable { .. }));
    assert!(err.is_retryable());
    assert_nothing_left(&harness).await;
    assert!(harness.datastore.get_profile("net1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_rollback_keeps_profile_it_did_not_create() {
    let harness = Harness::new();
    harness.add("c1").await.unwrap();
    harness.datastore.fail(DatastoreOp::CreateEndpoint);

    harness.add("c2").await.unwrap_err();

    assert!(harness.datastore.get_profile("net1").await.unwrap().is_some());
    assert_eq!(harness.datastore.endpoint_count(), 1);
    assert_eq!(harness.ipam.reservation_count(), 1);
}

#[tokio::test]
async fn test_failed_rollback_still_reports_original_error() {
    let harness = Harness::new();
    harness.datastore.fail(DatastoreOp::CreateEndpoint);
    harness.dataplane.fail_at(PlumbingStep::DeleteHostLink);
    harness.ipam.fail_release(true);

    let err = harness.add("c1").await.unwrap_err();
    assert!(matches!(err, Error::DatastoreUnavailable { .. }));
    assert_eq!(harness.datastore.endpoint_count(), 0);

    // A DEL once the collaborators recover finishes the cleanup.
    harness.datastore.recover(DatastoreOp::CreateEndpoint);
    harness.dataplane.recover(PlumbingStep::DeleteHostLink);
    harness.ipam.fail_release(false);
    harness.del("c1").await.unwrap();
    assert_nothing_left(&harness).await;
}

#[tokio::test]
async fn test_add_succeeds_after_rolled_back_attempt() {
    let harness = Harness::new();
    harness.dataplane.fail_at(PlumbingStep::AssignAddress);
    harness.add("c1").await.unwrap_err();

    harness.dataplane.recover(PlumbingStep::AssignAddress);
    let result = added(harness.add("c1").await.unwrap());
    assert_eq!(result.ips[0].address.to_string(), "10.0.0.2/32");
    assert_eq!(harness.datastore.endpoint_count(), 1);
}
