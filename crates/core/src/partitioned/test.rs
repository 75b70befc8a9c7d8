use super::*;
use rdsys_api::dummy::Dummy;
use rdsys_api::Hashkey;

fn proportions(entries: &[(&str, u32)]) -> BTreeMap<String, u32> {
    entries
        .iter()
        .map(|(name, weight)| (name.to_string(), *weight))
        .collect()
}

fn dummy_with(
    uid: u64,
    relation_ids: &[&str],
    distribution: &str,
) -> DynResource {
    let mut d = Dummy::new(uid, uid);
    d.relation_ids = relation_ids.iter().map(|s| s.to_string()).collect();
    d.distribution = distribution.to_string();
    Arc::new(d)
}

#[test]
fn every_stencil_partition_gets_a_ring() {
    let p = PartitionedHashring::new(&proportions(&[("a", 1), ("b", 1)]));
    assert!(p.hashring("a").is_some());
    assert!(p.hashring("b").is_some());
    assert!(p.hashring(NONE_PARTITION).is_some());
    assert!(p.hashring("c").is_none());
}

#[test]
fn related_resources_are_colocated() {
    use rand::Rng;
    let mut rng = rand::thread_rng();

    // Whatever uids the related resources get, sharing a relation
    // identifier must put them into the same partition.
    for _ in 0..1000 {
        let p = PartitionedHashring::new(&proportions(&[
            ("partition1", 1),
            ("partition2", 1),
        ]));
        let r1 = dummy_with(rng.gen(), &["fingerprint1"], "");
        let r2 = dummy_with(rng.gen(), &["fingerprint1"], "");
        p.add(r1.clone()).unwrap();
        p.add(r2.clone()).unwrap();
        assert_eq!(p.partition_name(&r1), p.partition_name(&r2));
    }
}

#[test]
fn last_relation_match_wins() {
    let p = PartitionedHashring::new(&proportions(&[
        ("partition1", 1),
        ("partition2", 1),
    ]));
    {
        let mut relations = p.relations.lock().unwrap();
        relations.insert("id-a".to_string(), "partition1".to_string());
        relations.insert("id-b".to_string(), "partition2".to_string());
    }
    let r = dummy_with(1, &["id-a", "id-b"], "");
    assert_eq!("partition2", p.partition_name(&r));
    let r = dummy_with(1, &["id-b", "id-a"], "");
    assert_eq!("partition1", p.partition_name(&r));
}

#[test]
fn declared_distributor_overrides() {
    let p = PartitionedHashring::new(&proportions(&[
        ("https", 1),
        ("moat", 1),
    ]));

    // A known declared distributor wins over relations and stencil.
    let r = dummy_with(1, &["fp"], "moat");
    p.add(r.clone()).unwrap();
    assert_eq!("moat", p.partition_name(&r));
    assert_eq!(1, p.hashring("moat").unwrap().len());

    // An unknown declared distributor goes to "none".
    let r = dummy_with(2, &[], "salmon");
    assert_eq!(NONE_PARTITION, p.partition_name(&r));

    // Declaring "none" itself is honored.
    let r = dummy_with(3, &[], "none");
    assert_eq!(NONE_PARTITION, p.partition_name(&r));
}

#[test]
fn none_partition_records_no_relations() {
    let p = PartitionedHashring::new(&proportions(&[("https", 1)]));
    let r = dummy_with(1, &["fp"], "nobody");
    p.add(r).unwrap();
    assert!(p.relations.lock().unwrap().is_empty());
    assert_eq!(1, p.hashring(NONE_PARTITION).unwrap().len());

    // A resource landing in a real partition records its relations.
    let r = dummy_with(2, &["fp2"], "https");
    p.add(r).unwrap();
    assert_eq!(
        Some(&"https".to_string()),
        p.relations.lock().unwrap().get("fp2"),
    );
}

#[test]
fn add_remove_and_len() {
    let p = PartitionedHashring::new(&proportions(&[("a", 1), ("b", 1)]));
    let r1 = dummy_with(1, &[], "");
    let r2 = dummy_with(2, &[], "");
    p.add(r1.clone()).unwrap();
    p.add(r2).unwrap();
    assert_eq!(2, p.len());
    assert_eq!(2, p.get_all().len());

    p.remove(&r1).unwrap();
    assert_eq!(1, p.len());

    p.clear();
    assert!(p.is_empty());
}

#[test]
fn save_and_load_restores_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Dummy::registry();

    let mut p = PartitionedHashring::new(&proportions(&[
        ("https", 1),
        ("moat", 5),
    ]));
    p.init_store(JsonStore::new("dummy", dir.path()), true, &registry);

    let mut expected = Vec::new();
    for uid in 1..=20u64 {
        let r = dummy_with(uid, &[&format!("fp{uid}")], "");
        p.add(r.clone()).unwrap();
        expected.push((uid, p.partition_name(&r)));
    }
    p.save().unwrap();

    // A fresh process: load through the normal add path, driven by the
    // restored relations map.
    let mut fresh = PartitionedHashring::new(&proportions(&[
        ("https", 1),
        ("moat", 5),
    ]));
    fresh.init_store(JsonStore::new("dummy", dir.path()), true, &registry);

    assert_eq!(20, fresh.len());
    for (uid, partition) in expected {
        let ring = fresh.hashring(&partition).unwrap();
        assert!(
            ring.get_exact(Hashkey(uid)).is_ok(),
            "uid {uid} not in partition {partition}",
        );
    }
}
