mod common;

use bson::doc;
use common::{by_id, cluster, docs, from, key, orders, s1, split_orders, test_config};
use tessera_cluster::{ChangeEvent, ChangeStream, Cluster, OperationType, RequestOptions, ResumeToken};
use tessera_routing::ErrorCode;
use tessera_shard::{Selector, UpdateSpec};

fn insert(cluster: &Cluster, ids: std::ops::Range<i32>) {
    cluster
        .router()
        .insert(&orders(), docs(ids), &RequestOptions::default())
        .unwrap();
}

fn summary(events: &[ChangeEvent]) -> Vec<(OperationType, Option<i32>)> {
    events
        .iter()
        .map(|e| {
            let id = e.document_key.as_ref().and_then(|k| k.get_i32("_id").ok());
            (e.operation, id)
        })
        .collect()
}

fn drain(stream: &mut ChangeStream) -> Vec<ChangeEvent> {
    stream.next_batch().unwrap()
}

#[test]
fn stream_sees_each_write_once_in_commit_order() {
    let cluster = cluster();
    insert(&cluster, 0..1);
    let mut stream = cluster.open_change_stream(&orders(), None).unwrap();
    assert!(stream.resume_token().is_none());

    insert(&cluster, 1..3);
    cluster
        .router()
        .update(
            &orders(),
            &Selector::Id(1.into()),
            &UpdateSpec::set(doc! { "qty": 7 }),
            false,
            false,
            &RequestOptions::default(),
        )
        .unwrap();

    let events = drain(&mut stream);
    assert_eq!(
        summary(&events),
        vec![
            (OperationType::Insert, Some(1)),
            (OperationType::Insert, Some(2)),
            (OperationType::Update, Some(1)),
        ]
    );
    assert!(events.windows(2).all(|w| w[0].token < w[1].token));
    assert_eq!(
        events[2].full_document.as_ref().unwrap().get_i32("qty").unwrap(),
        7
    );
    assert_eq!(stream.resume_token(), Some(events[2].token.clone()));
    assert!(drain(&mut stream).is_empty());
}

#[test]
fn resumed_stream_continues_across_sharding_and_migration() {
    let cluster = cluster();
    let mut stream = cluster.open_change_stream(&orders(), None).unwrap();
    insert(&cluster, 1..3);
    assert_eq!(drain(&mut stream).len(), 2);
    let token = stream.resume_token().unwrap();
    drop(stream);

    cluster
        .shard_collection(&orders(), by_id(), false, &[key(5)])
        .unwrap();
    for id in [3, 6, 7] {
        insert(&cluster, id..id + 1);
    }
    cluster.move_range(&orders(), &from(5), &s1()).unwrap();
    let opts = RequestOptions::default();
    cluster
        .router()
        .update(
            &orders(),
            &Selector::Id(6.into()),
            &UpdateSpec::inc(doc! { "qty": 1 }),
            false,
            false,
            &opts,
        )
        .unwrap();
    cluster
        .router()
        .delete(&orders(), &Selector::Id(1.into()), false, &opts)
        .unwrap();
    // Orphan cleanup is migration traffic and must stay invisible.
    assert_eq!(cluster.cleanup_orphaned(&orders()).unwrap(), 2);

    let mut resumed = cluster.open_change_stream(&orders(), Some(token)).unwrap();
    let events = drain(&mut resumed);
    assert_eq!(
        summary(&events),
        vec![
            (OperationType::Insert, Some(3)),
            (OperationType::Insert, Some(6)),
            (OperationType::Insert, Some(7)),
            (OperationType::Update, Some(6)),
            (OperationType::Delete, Some(1)),
        ]
    );
    assert_eq!(events[3].token.shard, s1());
}

#[test]
fn resumed_stream_continues_across_resharding() {
    let cluster = cluster();
    split_orders(&cluster);
    let mut stream = cluster.open_change_stream(&orders(), None).unwrap();
    insert(&cluster, 10..11);
    assert_eq!(drain(&mut stream).len(), 1);
    let token = stream.resume_token().unwrap();
    drop(stream);

    cluster
        .reshard_collection(
            &orders(),
            tessera_routing::KeyPattern::new(["region"]).unwrap(),
            &[common::text_key("m")],
        )
        .unwrap();
    for (id, region) in [(11, "west"), (12, "east"), (13, "west")] {
        cluster
            .router()
            .insert(
                &orders(),
                vec![doc! { "_id": id, "qty": 1, "region": region }],
                &RequestOptions::default(),
            )
            .unwrap();
    }

    // Cloning into the new collection is internal and never surfaces.
    let mut resumed = cluster.open_change_stream(&orders(), Some(token)).unwrap();
    assert_eq!(
        summary(&drain(&mut resumed)),
        vec![
            (OperationType::Insert, Some(11)),
            (OperationType::Insert, Some(12)),
            (OperationType::Insert, Some(13)),
        ]
    );
    assert!(!resumed.is_closed());
}

#[test]
fn resume_token_text_round_trips_through_the_stream() {
    let cluster = cluster();
    let mut stream = cluster.open_change_stream(&orders(), None).unwrap();
    insert(&cluster, 0..2);
    let first = stream.try_next().unwrap().unwrap();
    let text = first.to_document().get_str("_id").unwrap().to_string();

    let token: ResumeToken = text.parse().unwrap();
    let mut resumed = cluster.open_change_stream(&orders(), Some(token)).unwrap();
    assert_eq!(summary(&drain(&mut resumed)), vec![(OperationType::Insert, Some(1))]);
}

#[test]
fn drop_invalidates_the_stream() {
    let cluster = cluster();
    split_orders(&cluster);
    let mut stream = cluster.open_change_stream(&orders(), None).unwrap();
    insert(&cluster, 20..21);
    assert!(cluster.drop_collection(&orders()).unwrap());

    let events = drain(&mut stream);
    let ops: Vec<OperationType> = events.iter().map(|e| e.operation).collect();
    assert_eq!(
        ops,
        vec![OperationType::Insert, OperationType::Drop, OperationType::Invalidate]
    );
    assert!(events[1].token < events[2].token);
    assert!(stream.is_closed());
    assert!(drain(&mut stream).is_empty());
}

#[test]
fn resuming_past_trimmed_history_fails() {
    let config = tessera_cluster::ClusterConfig {
        oplog_max_entries: 5,
        ..test_config()
    };
    let cluster = Cluster::start(config).unwrap();
    let mut stream = cluster.open_change_stream(&orders(), None).unwrap();
    insert(&cluster, 0..1);
    let token = stream.try_next().unwrap().unwrap().token;
    for id in 1..10 {
        insert(&cluster, id..id + 1);
    }

    let mut resumed = cluster.open_change_stream(&orders(), Some(token)).unwrap();
    let err = resumed.next_batch().unwrap_err();
    assert_eq!(err.code(), ErrorCode::ChangeStreamHistoryLost);
}

#[test]
fn internal_namespaces_cannot_be_watched() {
    let cluster = cluster();
    let ns = tessera_routing::Namespace::parse("config.chunks").unwrap();
    let err = cluster.open_change_stream(&ns, None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::IllegalOperation);
}
