use super::*;
use crate::{CollectionConfig, TypeConfig};
use rdsys_api::dummy::Dummy;
use rdsys_api::{Hashkey, ResourceTest};
use std::collections::BTreeMap;
use std::sync::Arc;

fn dummy(oid: u64, uid: u64) -> DynResource {
    Arc::new(Dummy::new(oid, uid))
}

fn backend_with_partition(partition: &str) -> BackendResources {
    let cfg = CollectionConfig {
        storage_dir: None,
        types: vec![TypeConfig {
            rtype: "dummy".into(),
            unpartitioned: false,
            proportions: [(partition.to_string(), 1)].into_iter().collect(),
            stored: false,
        }],
    };
    BackendResources::new(Collection::new(&cfg, &Dummy::registry()))
}

fn request(origin: &str) -> ResourceRequest {
    ResourceRequest {
        request_origin: origin.into(),
        resource_types: vec!["dummy".into()],
    }
}

#[test]
fn add_deduplicates_by_uid() {
    let b = backend_with_partition("partition");
    b.add(dummy(1, 1));
    b.add(dummy(2, 2));
    assert_eq!(2, b.collection().get("dummy").unwrap().len());

    // Same uid, different oid: update in place, no new element.
    b.add(dummy(3, 2));
    assert_eq!(2, b.collection().get("dummy").unwrap().len());
    let ring = b.collection().hashring("partition", "dummy").unwrap();
    assert_eq!(3, ring.get_exact(Hashkey(2)).unwrap().oid().0);
}

#[tokio::test]
async fn add_fans_out_new_and_changed_diffs() {
    let b = backend_with_partition("partition");
    let (tx, mut rx) = mpsc::channel(16);
    b.register_chan(&request("partition"), tx);

    b.add(dummy(1, 1));
    let diff = rx.recv().await.unwrap();
    assert_eq!(1, diff.new.len());
    assert!(!diff.full_update);

    // An unchanged re-add produces no diff, an oid change a changed
    // diff.
    b.add(dummy(1, 1));
    b.add(dummy(2, 1));
    let diff = rx.recv().await.unwrap();
    assert!(diff.new.is_empty());
    assert_eq!(1, diff.changed.len());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn subscribers_of_other_partitions_see_nothing() {
    let b = backend_with_partition("partition");
    let (tx, mut rx) = mpsc::channel(16);
    b.register_chan(&request("salmon"), tx);
    b.add(dummy(1, 1));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn declared_none_is_not_distributed() {
    let b = backend_with_partition("https");
    let (tx, mut rx) = mpsc::channel(16);
    b.register_chan(&request("https"), tx);

    let mut d = Dummy::new(1, 1);
    d.distribution = "none".into();
    b.add(Arc::new(d));

    assert!(rx.try_recv().is_err());
    assert!(b.get("https", "dummy").working.is_empty());
    assert_eq!(1, b.get("none", "dummy").working.len());
}

#[tokio::test]
async fn subscribers_only_get_requested_types() {
    let b = backend_with_partition("partition");
    let (tx, mut rx) = mpsc::channel(16);
    let req = ResourceRequest {
        request_origin: "partition".into(),
        resource_types: vec!["obfs4".into()],
    };
    b.register_chan(&req, tx);
    b.add(dummy(1, 1));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn prune_emits_gone_diffs() {
    let b = backend_with_partition("partition");
    let (tx, mut rx) = mpsc::channel(16);

    b.add(dummy(1, 1));
    b.register_chan(&request("partition"), tx);

    let ring = b.collection().hashring("partition", "dummy").unwrap();
    ring.backdate(Hashkey(1), std::time::Duration::from_secs(2 * 60 * 60));

    let pruned = b.prune("dummy");
    assert_eq!(1, pruned.len());
    let diff = rx.recv().await.unwrap();
    assert_eq!(1, diff.gone.len());
    assert!(b.collection().get("dummy").unwrap().is_empty());
}

#[tokio::test]
async fn full_channels_drop_diffs_without_stalling() {
    let b = backend_with_partition("partition");
    let (tx, mut rx) = mpsc::channel(1);
    b.register_chan(&request("partition"), tx);

    b.add(dummy(1, 1));
    b.add(dummy(2, 2));
    assert_eq!(1, b.dropped_diffs());

    let diff = rx.recv().await.unwrap();
    assert_eq!(1, diff.new.len());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn unregister_stops_delivery() {
    let b = backend_with_partition("partition");
    let (tx, mut rx) = mpsc::channel(16);
    b.register_chan(&request("partition"), tx.clone());
    b.unregister_chan("partition", &tx);
    b.add(dummy(1, 1));
    assert!(rx.try_recv().is_err());
}

#[test]
fn gates_classify_resources() {
    let b = backend_with_partition("partition");

    let untested = Dummy::new(1, 1);
    untested.set_test(ResourceTest::default());
    let broken = Dummy::new(2, 2);
    broken.set_test(ResourceTest {
        state: rdsys_api::TestState::Dysfunctional,
        ..Default::default()
    });
    let good = Dummy::new(3, 3);

    b.add(Arc::new(untested));
    b.add(Arc::new(broken));
    b.add(Arc::new(good));

    // With the gates off everything counts as working.
    let state = b.get("partition", "dummy");
    assert_eq!(3, state.working.len());

    // Flipping only_functional excludes everything non-functional.
    b.set_gates(true, false);
    let state = b.get("partition", "dummy");
    assert_eq!(1, state.working.len());
    assert_eq!(2, state.not_working.len());

    // The bandwidth gate only excludes rejected speeds.
    b.set_gates(false, true);
    let state = b.get("partition", "dummy");
    assert_eq!(3, state.working.len());
}
