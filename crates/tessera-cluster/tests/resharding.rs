mod common;

use bson::{Document, doc};
use common::{by_id, cluster, count, from, get, key, orders, s0, s1, text_key};
use tessera_cluster::{Cluster, RequestOptions, ReshardingPhase, failpoints};
use tessera_routing::{ErrorCode, KeyPattern};
use tessera_shard::{FailPointMode, FindAndModify, OpContext, Selector, SessionInfo, UpdateSpec};

fn by_region() -> KeyPattern {
    KeyPattern::new(["region"]).unwrap()
}

fn region(i: i32) -> &'static str {
    if i % 2 == 0 { "east" } else { "west" }
}

/// `shop.orders` with `_id` 0..10 split across both shards on `_id`,
/// every document tagged with a region.
fn regional_orders() -> Cluster {
    let cluster = cluster();
    let docs: Vec<Document> = (0..10)
        .map(|i| doc! { "_id": i, "region": region(i), "counter": 0 })
        .collect();
    cluster
        .router()
        .insert(&orders(), docs, &RequestOptions::default())
        .unwrap();
    cluster
        .shard_collection(&orders(), by_id(), false, &[key(5)])
        .unwrap();
    cluster.move_range(&orders(), &from(5), &s1()).unwrap();
    cluster
}

fn reshard_by_region(cluster: &Cluster) -> Result<(), tessera_cluster::ClusterError> {
    cluster
        .reshard_collection(&orders(), by_region(), &[text_key("m")])
        .map(|_| ())
}

fn current_pattern(cluster: &Cluster) -> KeyPattern {
    let info = cluster.routing_info(&orders()).unwrap();
    info.table().unwrap().key_pattern().clone()
}

fn direct_docs(cluster: &Cluster, shard: &tessera_routing::ShardId) -> Vec<Document> {
    cluster
        .shard(shard)
        .unwrap()
        .find(&orders(), &Selector::All, &OpContext::direct())
        .unwrap()
}

#[test]
fn resharding_places_documents_by_the_new_key() {
    let cluster = regional_orders();
    reshard_by_region(&cluster).unwrap();

    assert_eq!(current_pattern(&cluster), by_region());
    assert_eq!(count(&cluster, &orders()), 10);
    let east = direct_docs(&cluster, &s0());
    let west = direct_docs(&cluster, &s1());
    assert_eq!((east.len(), west.len()), (5, 5));
    assert!(east.iter().all(|d| d.get_str("region").unwrap() == "east"));
    assert!(west.iter().all(|d| d.get_str("region").unwrap() == "west"));
    assert!(cluster.resharding_phase(&orders()).unwrap().is_none());

    // Same key again is a no-op.
    let before = cluster.routing_info(&orders()).unwrap().version();
    reshard_by_region(&cluster).unwrap();
    assert_eq!(cluster.routing_info(&orders()).unwrap().version(), before);
}

#[test]
fn retried_write_is_not_reapplied_after_resharding() {
    let cluster = regional_orders();
    let session = SessionInfo::new([9; 16], 1);
    let opts = RequestOptions::retryable(session, 0);
    let request = FindAndModify {
        selector: Selector::Id(2.into()),
        update: Some(UpdateSpec::inc(doc! { "counter": 1 })),
        remove: false,
        upsert: false,
        return_new: true,
    };
    let first = cluster
        .router()
        .find_and_modify(&orders(), &request, &opts)
        .unwrap();
    assert_eq!(first.value.as_ref().unwrap().get_i32("counter").unwrap(), 1);

    reshard_by_region(&cluster).unwrap();

    let retried = cluster
        .router()
        .find_and_modify(&orders(), &request, &opts)
        .unwrap();
    assert_eq!(retried, first);
    assert_eq!(get(&cluster, &orders(), 2).unwrap().get_i32("counter").unwrap(), 1);
}

#[test]
fn resharding_resumes_after_a_coordinator_crash() {
    let cluster = regional_orders();
    cluster.configure_failpoint(
        failpoints::RESHARDING_CRASH_AFTER_CLONING,
        FailPointMode::Times(1),
        None,
    );
    let err = reshard_by_region(&cluster).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Interrupted);
    assert_eq!(
        cluster.resharding_phase(&orders()).unwrap(),
        Some(ReshardingPhase::Applying)
    );

    // Writes keep flowing to the old layout while the job is parked.
    cluster
        .router()
        .insert(
            &orders(),
            vec![doc! { "_id": 100, "region": "west", "counter": 0 }],
            &RequestOptions::default(),
        )
        .unwrap();

    let resumed = cluster.restart_resharding_coordinator().unwrap();
    assert_eq!(resumed, vec![(orders(), ReshardingPhase::Done)]);
    assert_eq!(current_pattern(&cluster), by_region());
    assert_eq!(count(&cluster, &orders()), 11);
    let west = direct_docs(&cluster, &s1());
    assert_eq!(west.len(), 6);
    assert!(west.iter().all(|d| d.get_str("region").unwrap() == "west"));
    assert!(cluster.resharding_phase(&orders()).unwrap().is_none());
}

#[test]
fn failure_before_commit_restores_the_original_collection() {
    let cluster = regional_orders();
    let uuid = cluster.routing_info(&orders()).unwrap().uuid();
    cluster.configure_failpoint(
        failpoints::RESHARDING_FAIL_BEFORE_COMMIT,
        FailPointMode::Times(1),
        None,
    );
    let err = reshard_by_region(&cluster).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ReshardCollectionAborted);

    assert_eq!(current_pattern(&cluster), by_id());
    assert_eq!(cluster.routing_info(&orders()).unwrap().uuid(), uuid);
    let temp = orders().resharding_temp(&uuid);
    for id in [s0(), s1()] {
        assert!(cluster.shard(&id).unwrap().collection(&temp).unwrap().is_none());
        assert!(
            cluster
                .shard(&id)
                .unwrap()
                .critical_sections()
                .active(&orders())
                .is_empty()
        );
    }
    let record = cluster.catalog().collection(&orders()).unwrap().unwrap();
    assert!(record.sharding.unwrap().allow_migrations);
    assert!(cluster.resharding_phase(&orders()).unwrap().is_none());

    cluster
        .router()
        .insert(
            &orders(),
            vec![doc! { "_id": 11, "region": "east", "counter": 0 }],
            &RequestOptions::default(),
        )
        .unwrap();
    assert_eq!(count(&cluster, &orders()), 11);
}

#[test]
fn aborting_without_a_resharding_is_an_error() {
    let cluster = regional_orders();
    let err = cluster.abort_reshard_collection(&orders()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoSuchReshardCollection);
}

#[test]
fn a_parked_resharding_can_be_aborted() {
    let cluster = regional_orders();
    cluster.configure_failpoint(
        failpoints::RESHARDING_CRASH_AFTER_CLONING,
        FailPointMode::Times(1),
        None,
    );
    assert!(reshard_by_region(&cluster).is_err());

    cluster.abort_reshard_collection(&orders()).unwrap();
    assert!(cluster.resharding_phase(&orders()).unwrap().is_none());
    assert_eq!(current_pattern(&cluster), by_id());
    assert_eq!(count(&cluster, &orders()), 10);
    assert!(cluster.restart_resharding_coordinator().unwrap().is_empty());
}

#[test]
fn dropping_during_resharding_is_refused() {
    let cluster = regional_orders();
    cluster.configure_failpoint(
        failpoints::RESHARDING_CRASH_AFTER_CLONING,
        FailPointMode::Times(1),
        None,
    );
    assert!(reshard_by_region(&cluster).is_err());
    let err = cluster.drop_collection(&orders()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConflictingOperationInProgress);
}
