use super::*;
use rdsys_api::dummy::Dummy;
use rdsys_api::{Hashkey, ResourceMap};

fn dummy(oid: u64, uid: u64) -> DynResource {
    Arc::new(Dummy::new(oid, uid))
}

fn single_partition_config() -> CollectionConfig {
    CollectionConfig {
        storage_dir: None,
        types: vec![TypeConfig {
            rtype: "dummy".into(),
            unpartitioned: false,
            proportions: [("partition".to_string(), 1)].into_iter().collect(),
            stored: false,
        }],
    }
}

fn collection() -> Collection {
    Collection::new(&single_partition_config(), &Dummy::registry())
}

#[test]
fn add_dispatches_by_type() {
    let c = collection();
    c.add(dummy(1, 1)).unwrap();
    assert_eq!(1, c.get("dummy").unwrap().len());

    #[derive(Debug)]
    struct Odd(Dummy);
    impl rdsys_api::Resource for Odd {
        fn resource_type(&self) -> &str {
            "odd"
        }
        fn string_form(&self) -> String {
            self.0.string_form()
        }
        fn is_valid(&self) -> bool {
            true
        }
        fn uid(&self) -> Hashkey {
            self.0.uid()
        }
        fn oid(&self) -> Hashkey {
            self.0.oid()
        }
        fn relation_identifiers(&self) -> Vec<String> {
            vec![]
        }
        fn distributor(&self) -> Option<String> {
            None
        }
        fn expiry(&self) -> std::time::Duration {
            self.0.expiry()
        }
        fn test_state(&self) -> &std::sync::RwLock<rdsys_api::ResourceTest> {
            self.0.test_state()
        }
        fn blocked_in(&self) -> rdsys_api::LocationSet {
            self.0.blocked_in()
        }
        fn set_blocked_in(&self, l: &rdsys_api::LocationSet) {
            self.0.set_blocked_in(l)
        }
        fn test_func(&self) -> Option<rdsys_api::TestFunc> {
            None
        }
        fn set_test_func(&self, _f: rdsys_api::TestFunc) {}
        fn to_json(&self) -> serde_json::Value {
            self.0.to_json()
        }
    }

    let err = c.add(Arc::new(Odd(Dummy::new(1, 1)))).unwrap_err();
    assert!(matches!(err, RdError::NotImplemented(_)));
}

#[test]
fn display_summarizes_types() {
    let c = collection();
    assert_eq!("0 dummy", c.to_string());
    c.add(dummy(1, 1)).unwrap();
    assert_eq!("1 dummy", c.to_string());
}

#[test]
fn hashring_lookup() {
    let c = collection();
    c.add(dummy(1, 1)).unwrap();
    let ring = c.hashring("partition", "dummy").unwrap();
    assert_eq!(1, ring.len());
    assert!(c.hashring("partition", "nope").is_none());
}

#[test]
fn apply_diff_updates_groups() {
    let c = collection();
    c.add(dummy(1, 1)).unwrap();

    let mut diff = ResourceDiff::new();
    diff.new = ResourceMap::single(dummy(2, 2));
    diff.changed = ResourceMap::single(dummy(9, 1));
    c.apply_diff(&diff);

    let group = c.get("dummy").unwrap();
    assert_eq!(2, group.len());
    let ring = c.hashring("partition", "dummy").unwrap();
    assert_eq!(9, ring.get_exact(Hashkey(1)).unwrap().oid().0);

    let mut diff = ResourceDiff::new();
    diff.full_update = true;
    diff.new = ResourceMap::single(dummy(5, 5));
    c.apply_diff(&diff);
    assert_eq!(1, group.len());
}

#[test]
fn unpartitioned_group_ignores_partition_name() {
    let cfg = CollectionConfig {
        storage_dir: None,
        types: vec![TypeConfig {
            rtype: "dummy".into(),
            unpartitioned: true,
            proportions: BTreeMap::new(),
            stored: false,
        }],
    };
    let c = Collection::new(&cfg, &Dummy::registry());
    c.add(dummy(1, 1)).unwrap();
    assert_eq!(1, c.hashring("whatever", "dummy").unwrap().len());
    assert_eq!("", c.get("dummy").unwrap().partition_name(&dummy(1, 1)));
}

#[test]
fn unpartitioned_stored_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = CollectionConfig {
        storage_dir: Some(dir.path().to_path_buf()),
        types: vec![TypeConfig {
            rtype: "dummy".into(),
            unpartitioned: true,
            proportions: BTreeMap::new(),
            stored: true,
        }],
    };
    let registry = Dummy::registry();

    let c = Collection::new(&cfg, &registry);
    c.add(dummy(1, 1)).unwrap();
    c.add(dummy(2, 2)).unwrap();
    c.save();

    let fresh = Collection::new(&cfg, &registry);
    assert_eq!(2, fresh.get("dummy").unwrap().len());
}
