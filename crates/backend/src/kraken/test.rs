use super::*;

const FP: &str = "0123456789ABCDEF0123456789ABCDEF01234567";

// The 'r' line's identity field is base64(hex-decode(FP)).
const NETWORKSTATUS: &str = "\
published 2024-02-01 09:00:00
flag-thresholds stable-uptime=1637276
r TestBridge ASNFZ4mrze8BI0VniavN7wEjRWc oemFTmYCBhAfJjzXZHQ4Xu5DW1I 2024-02-01 08:18:41 1.2.3.4 443 0
a [2001:db8::1]:9001
s Fast Running Stable Valid
w Bandwidth=54000
p reject 1-65535
";

const EXTRAINFO: &str = "\
@type bridge-extra-info 1.3
extra-info TestBridge 0123456789ABCDEF0123456789ABCDEF01234567
master-key-ed25519 dummy
transport obfs4 1.2.3.4:12345 cert=abc,iat-mode=0
transport scramblesuit 1.2.3.4:23456
-----END SIGNATURE-----
";

const DESCRIPTORS: &str = "\
@type bridge-server-descriptor 1.2
router TestBridge 1.2.3.4 443 0 0
platform Tor 0.4.8.9 on Linux
fingerprint 0123 4567 89AB CDEF 0123 4567 89AB CDEF 0123 4567
bridge-distribution-request moat
router-signature
";

#[test]
fn networkstatus_parsing() {
    let bridges = parse_networkstatus(NETWORKSTATUS).unwrap();
    assert_eq!(1, bridges.len());

    let bridge = &bridges[FP];
    assert_eq!(FP, bridge.fingerprint);
    assert_eq!(Some("1.2.3.4".parse().unwrap()), bridge.address);
    assert_eq!(443, bridge.port);
    assert!(bridge.flags.fast && bridge.flags.running);
    assert!(bridge.flags.stable && bridge.flags.valid);

    // Both the r-line address and the additional IPv6 one are
    // collected.
    assert_eq!(2, bridge.or_addresses.len());
    let v6 = bridge
        .or_addresses
        .iter()
        .find(|a| a.ip_version == 6)
        .unwrap();
    assert_eq!("2001:db8::1".parse::<std::net::IpAddr>().unwrap(), v6.address);
    assert_eq!(9001, v6.port);
}

#[test]
fn extrainfo_parsing() {
    let bridges = parse_extrainfo_doc(EXTRAINFO).unwrap();
    let bridge = &bridges[FP];
    assert_eq!(2, bridge.transports.len());

    let obfs4 = &bridge.transports[0];
    assert_eq!("obfs4", obfs4.resource_type());
    assert_eq!(FP, obfs4.fingerprint);
    assert_eq!(Some("1.2.3.4".parse().unwrap()), obfs4.address);
    assert_eq!(12345, obfs4.port);
    assert_eq!("abc", obfs4.params["cert"]);
    assert_eq!("0", obfs4.params["iat-mode"]);

    assert_eq!("scramblesuit", bridge.transports[1].resource_type());
    assert!(bridge.transports[1].params.is_empty());
}

#[test]
fn malformed_transport_lines_error() {
    assert!(parse_extrainfo_doc(
        "extra-info b 0011\ntransport obfs4\n-----END SIGNATURE-----\n",
    )
    .is_err());
    assert!(parse_extrainfo_doc(
        "extra-info b 0011\ntransport obfs4 1.2.3.4:1 novalue\n-----END SIGNATURE-----\n",
    )
    .is_err());
}

#[test]
fn distribution_requests() {
    let requests = parse_distribution_requests(DESCRIPTORS);
    assert_eq!("moat", requests[FP]);

    let mut bridges = parse_networkstatus(NETWORKSTATUS).unwrap();
    let file = {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(DESCRIPTORS.as_bytes()).unwrap();
        f
    };

    // A known distributor is copied verbatim.
    apply_distribution_requests(
        file.path(),
        &["none".to_string(), "moat".to_string()],
        &mut bridges,
    )
    .unwrap();
    assert_eq!("moat", bridges[FP].distribution);

    // An unknown one falls back to "none".
    let mut bridges = parse_networkstatus(NETWORKSTATUS).unwrap();
    apply_distribution_requests(
        file.path(),
        &["none".to_string(), "https".to_string()],
        &mut bridges,
    )
    .unwrap();
    assert_eq!("none", bridges[FP].distribution);
}

#[test]
fn any_distribution_request_stays_empty() {
    let descriptors = DESCRIPTORS
        .replace("bridge-distribution-request moat", "bridge-distribution-request any");
    let requests = parse_distribution_requests(&descriptors);
    assert_eq!("any", requests[FP]);

    let mut bridges = parse_networkstatus(NETWORKSTATUS).unwrap();
    let file = {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(descriptors.as_bytes()).unwrap();
        f
    };
    apply_distribution_requests(
        file.path(),
        &["none".to_string(), "moat".to_string()],
        &mut bridges,
    )
    .unwrap();
    assert_eq!("", bridges[FP].distribution);
}

fn backend_with(proportions: &[(&str, u32)], types: &[&str]) -> BackendResources {
    use rdsys_core::{Collection, CollectionConfig, TypeConfig};

    let proportions: std::collections::BTreeMap<String, u32> = proportions
        .iter()
        .map(|(name, weight)| (name.to_string(), *weight))
        .collect();
    let cfg = CollectionConfig {
        storage_dir: None,
        types: types
            .iter()
            .map(|rtype| TypeConfig {
                rtype: rtype.to_string(),
                unpartitioned: false,
                proportions: proportions.clone(),
                stored: false,
            })
            .collect(),
    };
    BackendResources::new(Collection::new(
        &cfg,
        &rdsys_resources::default_registry(),
    ))
}

#[test]
fn reload_feeds_transports_into_the_backend() {
    let dir = tempfile::tempdir().unwrap();
    let write = |name: &str, content: &str| {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    };

    let config = BackendConfig {
        api_address: "127.0.0.1:0".into(),
        cert_file: None,
        key_file: None,
        extrainfo_file: write("cached-extrainfo", EXTRAINFO),
        networkstatus_file: write("networkstatus-bridges", NETWORKSTATUS),
        descriptors_file: write("bridge-descriptors", DESCRIPTORS),
        blocklist_file: Some(write(
            "blocklist",
            &format!("fingerprint {FP} country-code ru\n"),
        )),
        allowlist_file: None,
        api_tokens: Default::default(),
        bridgestrap_endpoint: String::new(),
        bridgestrap_token: String::new(),
        onbasca_endpoint: String::new(),
        onbasca_token: String::new(),
        bandwidth_ratio_threshold: 0.75,
        storage_dir: None,
        distribution_proportions: [("moat".to_string(), 1)]
            .into_iter()
            .collect(),
        resources: [
            ("obfs4".to_string(), crate::ResourceConfig::default()),
            ("scramblesuit".to_string(), crate::ResourceConfig::default()),
            ("vanilla".to_string(), crate::ResourceConfig::default()),
        ]
        .into_iter()
        .collect(),
    };

    let resources =
        backend_with(&[("moat", 1)], &["obfs4", "scramblesuit", "vanilla"]);
    let registry = rdsys_resources::default_registry();
    let submitted = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let test_func: TestFunc = {
        let submitted = submitted.clone();
        Arc::new(move |r: DynResource| {
            submitted.lock().unwrap().push(r.string_form());
        })
    };

    reload_bridge_descriptors(&config, &resources, &registry, &test_func);

    // The bridge has transports, so no vanilla flavour is handed out.
    assert_eq!(0, resources.collection().get("vanilla").unwrap().len());
    assert_eq!(1, resources.collection().get("obfs4").unwrap().len());
    assert_eq!(
        1,
        resources.collection().get("scramblesuit").unwrap().len(),
    );

    // The operator asked for moat, so both transports went there.
    let ring = resources.collection().hashring("moat", "obfs4").unwrap();
    let obfs4 = &ring.get_all()[0];
    assert!(obfs4.blocked_in().contains("ru"));
    assert_eq!(Some("moat".to_string()), obfs4.distributor());

    // Both transports carry public addresses and were submitted for
    // testing.
    assert_eq!(2, submitted.lock().unwrap().len());
}

#[test]
fn invalid_transport_addresses_are_marked_dysfunctional() {
    let extrainfo = EXTRAINFO.replace("1.2.3.4:12345", "127.0.0.1:12345");
    let dir = tempfile::tempdir().unwrap();
    let write = |name: &str, content: &str| {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    };

    let config = BackendConfig {
        api_address: "127.0.0.1:0".into(),
        cert_file: None,
        key_file: None,
        extrainfo_file: write("cached-extrainfo", &extrainfo),
        networkstatus_file: write("networkstatus-bridges", NETWORKSTATUS),
        descriptors_file: write("bridge-descriptors", DESCRIPTORS),
        blocklist_file: None,
        allowlist_file: None,
        api_tokens: Default::default(),
        bridgestrap_endpoint: String::new(),
        bridgestrap_token: String::new(),
        onbasca_endpoint: String::new(),
        onbasca_token: String::new(),
        bandwidth_ratio_threshold: 0.75,
        storage_dir: None,
        distribution_proportions: [("moat".to_string(), 1)]
            .into_iter()
            .collect(),
        resources: [("obfs4".to_string(), crate::ResourceConfig::default())]
            .into_iter()
            .collect(),
    };

    let resources = backend_with(&[("moat", 1)], &["obfs4", "scramblesuit"]);
    let registry = rdsys_resources::default_registry();
    let test_func: TestFunc = Arc::new(|_r| {});

    reload_bridge_descriptors(&config, &resources, &registry, &test_func);

    let ring = resources.collection().hashring("moat", "obfs4").unwrap();
    let obfs4 = &ring.get_all()[0];
    let test = obfs4.test_result();
    assert_eq!(TestState::Dysfunctional, test.state);
    assert_eq!("Bridge address is not valid", test.error);
}

#[test]
fn gates_flip_at_half_functional() {
    use rdsys_api::dummy::Dummy;
    use rdsys_api::ResourceTest;
    use rdsys_core::{Collection, CollectionConfig, TypeConfig};

    let cfg = CollectionConfig {
        storage_dir: None,
        types: vec![TypeConfig {
            rtype: "dummy".into(),
            unpartitioned: false,
            proportions: [("moat".to_string(), 1)].into_iter().collect(),
            stored: false,
        }],
    };
    let resources = BackendResources::new(Collection::new(
        &cfg,
        &Dummy::registry(),
    ));
    let metrics = Metrics::new();

    // All resources untested: both gates stay off and everything is
    // handed out as working.
    for uid in 1..=4u64 {
        let d = Dummy::new(uid, uid);
        d.set_test(ResourceTest::default());
        resources.add(Arc::new(d));
    }
    calc_tested_resources(&resources, &metrics);
    assert_eq!((false, false), resources.gates());
    assert_eq!(4, resources.get("moat", "dummy").working.len());

    // Half the resources functional: the reachability gate flips on.
    // The refreshed resources carry a new object id so they replace
    // the untested ones in place.
    for uid in 1..=2u64 {
        let d = Dummy::new(uid + 100, uid);
        d.set_test(ResourceTest {
            state: TestState::Functional,
            ..Default::default()
        });
        resources.add(Arc::new(d));
    }
    calc_tested_resources(&resources, &metrics);
    assert_eq!((true, false), resources.gates());
    assert_eq!(2, resources.get("moat", "dummy").working.len());
    assert_eq!(2, resources.get("moat", "dummy").not_working.len());
}
