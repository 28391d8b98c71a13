//! Tests for the invocation contract: network configuration, CNI
//! environment and `CNI_ARGS`.

use std::collections::HashMap;
use std::path::PathBuf;

use calico_cni::constants::{DEFAULT_CNI_VERSION, DEFAULT_MTU};
use calico_cni::{CniCommand, Error, Invocation, NetConf};

const MINIMAL: &[u8] = br#"{"name":"net1","type":"calico","ipam":{"type":"host-local"}}"#;

fn lookup(pairs: &[(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
    let env: HashMap<&str, &str> = pairs.iter().copied().collect();
    move |name| env.get(name).map(|v| (*v).to_string())
}

// =============================================================================
// Network Configuration
// =============================================================================

#[test]
fn test_minimal_config_defaults() {
    let conf = NetConf::parse(MINIMAL).unwrap();

    assert_eq!(conf.cni_version, DEFAULT_CNI_VERSION);
    assert_eq!(conf.name, "net1");
    assert_eq!(conf.plugin, "calico");
    assert_eq!(conf.mtu, DEFAULT_MTU);
    assert_eq!(conf.ipam.plugin, "host-local");
    assert!(conf.nodename.is_none());
    assert!(conf.hostname.is_none());
    assert!(conf.prev_result.is_none());
}

#[test]
fn test_ipam_keys_are_kept() {
    let conf = NetConf::parse(
        br#"{"name":"net1","type":"calico",
             "ipam":{"type":"host-local","subnet":"10.0.0.0/8","routes":[{"dst":"0.0.0.0/0"}]}}"#,
    )
    .unwrap();

    assert_eq!(conf.ipam.subnet.as_deref(), Some("10.0.0.0/8"));
    assert!(conf.ipam.specific.contains_key("routes"));
}

#[test]
fn test_unsupported_version_rejected() {
    let err = NetConf::parse(
        br#"{"cniVersion":"0.2.0","name":"net1","type":"calico","ipam":{"type":"host-local"}}"#,
    )
    .unwrap_err();

    assert!(matches!(err, Error::IncompatibleVersion { ref version } if version == "0.2.0"));
    assert_eq!(err.cni_code(), 1);
}

#[test]
fn test_missing_required_fields_fail_to_decode() {
    for doc in [
        &br#"{"type":"calico","ipam":{"type":"host-local"}}"#[..],
        &br#"{"name":"net1","type":"calico"}"#[..],
        &br#"{"name":"net1","type":"calico","ipam":{}}"#[..],
        &b"[]"[..],
        &b""[..],
    ] {
        assert!(
            matches!(NetConf::parse(doc), Err(Error::DecodeFailed(_))),
            "{}",
            String::from_utf8_lossy(doc)
        );
    }
}

#[test]
fn test_semantic_validation() {
    let cases: [&[u8]; 4] = [
        br#"{"name":"","type":"calico","ipam":{"type":"host-local"}}"#,
        br#"{"name":"a/b","type":"calico","ipam":{"type":"host-local"}}"#,
        br#"{"name":"net1","type":"calico","ipam":{"type":""}}"#,
        br#"{"name":"net1","type":"calico","mtu":20,"ipam":{"type":"host-local"}}"#,
    ];
    for doc in cases {
        assert!(
            matches!(NetConf::parse(doc), Err(Error::InvalidNetworkConfig(_))),
            "{}",
            String::from_utf8_lossy(doc)
        );
    }
}

#[test]
fn test_peek_cni_version() {
    assert_eq!(
        NetConf::peek_cni_version(br#"{"cniVersion":"1.0.0","name":7}"#),
        "1.0.0"
    );
    assert_eq!(
        NetConf::peek_cni_version(br#"{"cniVersion":"9.9.9"}"#),
        DEFAULT_CNI_VERSION
    );
    assert_eq!(NetConf::peek_cni_version(b"garbage"), DEFAULT_CNI_VERSION);
}

// =============================================================================
// CNI Environment
// =============================================================================

#[test]
fn test_add_invocation() {
    let invocation = Invocation::from_lookup(
        lookup(&[
            ("CNI_COMMAND", "ADD"),
            ("CNI_CONTAINERID", "abc123"),
            ("CNI_NETNS", "/var/run/netns/abc"),
            ("CNI_IFNAME", "eth1"),
            ("CNI_ARGS", "K8S_POD_NAMESPACE=ns;K8S_POD_NAME=pod"),
            ("CNI_PATH", "/opt/cni/bin:/usr/libexec/cni"),
        ]),
        MINIMAL.to_vec(),
    )
    .unwrap();

    assert_eq!(invocation.command, CniCommand::Add);
    assert_eq!(invocation.container_id, "abc123");
    assert_eq!(invocation.netns, Some(PathBuf::from("/var/run/netns/abc")));
    assert_eq!(invocation.ifname, "eth1");
    assert_eq!(invocation.args.k8s_pod(), Some(("ns", "pod")));
    assert_eq!(
        invocation.cni_path,
        vec![
            PathBuf::from("/opt/cni/bin"),
            PathBuf::from("/usr/libexec/cni")
        ]
    );
    assert_eq!(invocation.config, MINIMAL);
}

#[test]
fn test_ifname_defaults_to_eth0() {
    let invocation = Invocation::from_lookup(
        lookup(&[
            ("CNI_COMMAND", "DEL"),
            ("CNI_CONTAINERID", "abc123"),
        ]),
        MINIMAL.to_vec(),
    )
    .unwrap();

    assert_eq!(invocation.ifname, "eth0");
    assert_eq!(invocation.netns, None);
}

#[test]
fn test_add_requires_netns() {
    let err = Invocation::from_lookup(
        lookup(&[
            ("CNI_COMMAND", "ADD"),
            ("CNI_CONTAINERID", "abc123"),
            ("CNI_NETNS", ""),
        ]),
        MINIMAL.to_vec(),
    )
    .unwrap_err();

    assert!(matches!(err, Error::MissingEnvironment(ref name) if name == "CNI_NETNS"));
    assert_eq!(err.cni_code(), 4);
}

#[test]
fn test_missing_command_and_container_id() {
    let err = Invocation::from_lookup(lookup(&[]), Vec::new()).unwrap_err();
    assert!(matches!(err, Error::MissingEnvironment(ref name) if name == "CNI_COMMAND"));

    let err = Invocation::from_lookup(lookup(&[("CNI_COMMAND", "DEL")]), Vec::new()).unwrap_err();
    assert!(matches!(err, Error::MissingEnvironment(ref name) if name == "CNI_CONTAINERID"));
}

#[test]
fn test_unknown_command_rejected() {
    let err = Invocation::from_lookup(
        lookup(&[("CNI_COMMAND", "CHECK"), ("CNI_CONTAINERID", "abc")]),
        Vec::new(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidEnvironment { .. }));
}

#[test]
fn test_version_needs_nothing_else() {
    let invocation =
        Invocation::from_lookup(lookup(&[("CNI_COMMAND", "VERSION")]), Vec::new()).unwrap();
    assert_eq!(invocation.command, CniCommand::Version);
    assert!(invocation.container_id.is_empty());
}

#[test]
fn test_container_id_validated() {
    for bad in ["../etc", "a/b", ".hidden", "with space"] {
        let err = Invocation::from_lookup(
            |name: &str| match name {
                "CNI_COMMAND" => Some("DEL".to_string()),
                "CNI_CONTAINERID" => Some(bad.to_string()),
                _ => None,
            },
            Vec::new(),
        )
        .unwrap_err();
        assert!(
            matches!(err, Error::InvalidContainerId { .. }),
            "{bad} accepted"
        );
    }
}

#[test]
fn test_overlong_ifname_rejected() {
    let err = Invocation::from_lookup(
        lookup(&[
            ("CNI_COMMAND", "DEL"),
            ("CNI_CONTAINERID", "abc"),
            ("CNI_IFNAME", "a-very-long-interface-name"),
        ]),
        Vec::new(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidEnvironment { ref name, .. } if name == "CNI_IFNAME"));
}

#[test]
fn test_malformed_cni_args_rejected() {
    let err = Invocation::from_lookup(
        lookup(&[
            ("CNI_COMMAND", "DEL"),
            ("CNI_CONTAINERID", "abc"),
            ("CNI_ARGS", "IgnoreUnknown"),
        ]),
        Vec::new(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidEnvironment { ref name, .. } if name == "CNI_ARGS"));
}
