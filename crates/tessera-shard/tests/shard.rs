mod common;

use std::sync::Arc;
use std::time::Duration;

use bson::doc;
use common::{Sharded, StaticSource, docs, fast_config, ns, shard};
use tessera_routing::{CollectionUuid, ErrorCode, ShardVersion};
use tessera_shard::{
    FindAndModify, MigratedOp, OpContext, OpKind, OpTime, RangeDeletionTask, SectionScope, Selector,
    SessionInfo, ShardConfig, ShardError, Timestamp, TxnState, UpdateSpec, WriteResponse, ops_from_oplog,
};

#[test]
fn orphans_are_invisible_to_versioned_reads_and_immutable() {
    let source = Arc::new(StaticSource::default());
    let mut coll = Sharded::new();
    coll.publish(&source, &[(None, None, "shard0")]);
    let s0 = shard("shard0", &source, fast_config());

    let inserted = s0.insert(&ns(), docs(0..10), &coll.ctx()).unwrap();
    assert_eq!(inserted.inserted, 10);

    // [5, MaxKey) now belongs to shard1; shard0 still stores the documents.
    coll.publish(&source, &[(None, Some(5), "shard0"), (Some(5), None, "shard1")]);
    s0.refresh_filtering(&ns()).unwrap();

    let all = Selector::All;
    assert_eq!(s0.count(&ns(), &all, &OpContext::direct()).unwrap(), 10);
    assert_eq!(s0.count(&ns(), &all, &coll.ctx()).unwrap(), 5);
    assert_eq!(s0.orphan_count(&ns()).unwrap(), 5);

    let bump = UpdateSpec::inc(doc! { "qty": 1 });
    let orphan = Selector::Id(7.into());
    let res = s0
        .update(&ns(), &orphan, &bump, false, false, &OpContext::direct())
        .unwrap();
    assert_eq!(res.matched, 0);
    let res = s0.delete(&ns(), &orphan, false, &OpContext::direct()).unwrap();
    assert_eq!(res.deleted, 0);

    let err = s0
        .insert(&ns(), vec![doc! { "_id": 42 }], &OpContext::direct())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::IllegalOperation);

    let owned = Selector::Id(3.into());
    let res = s0.update(&ns(), &owned, &bump, false, false, &coll.ctx()).unwrap();
    assert_eq!((res.matched, res.modified), (1, 1));
}

#[test]
fn range_deletion_waits_for_ready_and_removes_orphans() {
    let source = Arc::new(StaticSource::default());
    let mut coll = Sharded::new();
    coll.publish(&source, &[(None, None, "shard0")]);
    let s0 = shard("shard0", &source, fast_config());
    s0.insert(&ns(), docs(0..10), &coll.ctx()).unwrap();

    let task = RangeDeletionTask {
        id: [7; 16],
        ns: ns(),
        uuid: coll.meta.uuid,
        range: coll.range(Some(5), None),
        key_pattern: coll.meta.key_pattern.clone(),
        pending: true,
        ready_at_ms: 0,
    };
    s0.schedule_range_deletion(task).unwrap();
    coll.publish(&source, &[(None, Some(5), "shard0"), (Some(5), None, "shard1")]);
    s0.refresh_filtering(&ns()).unwrap();

    // Pending tasks are left alone.
    assert_eq!(s0.run_range_deletions(true).unwrap(), 0);
    assert_eq!(
        s0.cleanup_orphaned(&ns()).unwrap_err().code(),
        ErrorCode::ConflictingOperationInProgress
    );

    assert!(s0.mark_range_deletion_ready(&[7; 16], Duration::ZERO).unwrap());
    assert_eq!(s0.cleanup_orphaned(&ns()).unwrap(), 5);
    assert_eq!(s0.count(&ns(), &Selector::All, &OpContext::direct()).unwrap(), 5);
    assert!(s0.range_deletion_tasks(Some(&ns())).unwrap().is_empty());

    // Deletions are migration writes, hidden from change streams.
    let entries = s0.read_oplog(OpTime::ZERO, Timestamp::MAX, Some(&ns())).unwrap();
    let deletes: Vec<_> = entries.iter().filter(|e| e.kind == OpKind::Delete).collect();
    assert_eq!(deletes.len(), 5);
    assert!(deletes.iter().all(|e| e.from_migrate));
}

#[test]
fn range_deleter_refuses_owned_ranges() {
    let source = Arc::new(StaticSource::default());
    let mut coll = Sharded::new();
    coll.publish(&source, &[(None, None, "shard0")]);
    let s0 = shard("shard0", &source, fast_config());
    s0.insert(&ns(), docs(0..10), &coll.ctx()).unwrap();

    s0.schedule_range_deletion(RangeDeletionTask {
        id: [1; 16],
        ns: ns(),
        uuid: coll.meta.uuid,
        range: coll.range(Some(5), None),
        key_pattern: coll.meta.key_pattern.clone(),
        pending: false,
        ready_at_ms: 0,
    })
    .unwrap();
    assert_eq!(s0.run_range_deletions(false).unwrap(), 0);
    assert_eq!(s0.count(&ns(), &Selector::All, &coll.ctx()).unwrap(), 10);
}

#[test]
fn stale_versions_are_rejected() {
    let source = Arc::new(StaticSource::default());
    let mut coll = Sharded::new();
    coll.publish(&source, &[(None, None, "shard0")]);
    let s0 = shard("shard0", &source, fast_config());
    let old = coll.ctx();
    s0.insert(&ns(), docs(0..2), &old).unwrap();

    coll.publish(&source, &[(None, Some(5), "shard0"), (Some(5), None, "shard1")]);
    s0.refresh_filtering(&ns()).unwrap();
    let err = s0.insert(&ns(), docs(2..3), &old).unwrap_err();
    match err {
        ShardError::StaleConfig { wanted, .. } => {
            assert_eq!(wanted, ShardVersion::Sharded(coll.version));
        }
        other => panic!("expected StaleConfig, got {other:?}"),
    }
    s0.insert(&ns(), docs(2..3), &coll.ctx()).unwrap();
}

#[test]
fn expected_uuid_mismatch_reports_both_sides() {
    let source = Arc::new(StaticSource::default());
    let mut coll = Sharded::new();
    coll.publish(&source, &[(None, None, "shard0")]);
    let s0 = shard("shard0", &source, fast_config());
    let mut ctx = coll.ctx();
    ctx.expected_uuid = Some(CollectionUuid::new());
    let err = s0.insert(&ns(), docs(0..1), &ctx).unwrap_err();
    assert_eq!(err.code(), ErrorCode::CollectionUUIDMismatch);
    assert!(err.to_string().contains(&coll.meta.uuid.to_string()));
}

#[test]
fn critical_section_blocks_writes_to_its_range() {
    let source = Arc::new(StaticSource::default());
    let mut coll = Sharded::new();
    coll.publish(&source, &[(None, None, "shard0")]);
    let s0 = shard("shard0", &source, fast_config());
    s0.insert(&ns(), docs(0..10), &coll.ctx()).unwrap();

    let id = s0.critical_sections().enter(
        &ns(),
        SectionScope::Range(coll.range(Some(5), None)),
        "moveRange",
    );
    let bump = UpdateSpec::inc(doc! { "qty": 1 });

    let err = s0
        .update(&ns(), &Selector::Id(7.into()), &bump, false, false, &coll.ctx())
        .unwrap_err();
    assert!(err.is_stale());
    let err = s0
        .update(&ns(), &Selector::Id(7.into()), &bump, false, false, &OpContext::direct())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConflictingOperationInProgress);

    // Outside the range writes proceed.
    let res = s0
        .update(&ns(), &Selector::Id(2.into()), &bump, false, false, &coll.ctx())
        .unwrap();
    assert_eq!(res.modified, 1);

    s0.critical_sections().exit(&ns(), id);
    let res = s0
        .update(&ns(), &Selector::Id(7.into()), &bump, false, false, &coll.ctx())
        .unwrap();
    assert_eq!(res.modified, 1);
}

#[test]
fn retried_find_and_modify_returns_recorded_response() {
    let source = Arc::new(StaticSource::default());
    let mut coll = Sharded::new();
    coll.publish(&source, &[(None, None, "shard0")]);
    let s0 = shard("shard0", &source, fast_config());
    s0.insert(&ns(), vec![doc! { "_id": 1, "counter": 0 }], &coll.ctx())
        .unwrap();

    let mut ctx = coll.ctx();
    ctx.session = Some(SessionInfo::new([9; 16], 3));
    ctx.stmt_id = Some(0);
    let request = FindAndModify {
        selector: Selector::Id(1.into()),
        update: Some(UpdateSpec::inc(doc! { "counter": 1 })),
        remove: false,
        upsert: false,
        return_new: true,
    };
    let first = s0.find_and_modify(&ns(), &request, &ctx).unwrap();
    let retry = s0.find_and_modify(&ns(), &request, &ctx).unwrap();
    assert_eq!(first.to_document(), retry.to_document());
    assert_eq!(first.value.unwrap().get_i32("counter").unwrap(), 1);

    let stored = s0.find(&ns(), &Selector::Id(1.into()), &coll.ctx()).unwrap();
    assert_eq!(stored[0].get_i32("counter").unwrap(), 1);

    // An older transaction number on the same session is refused.
    ctx.session = Some(SessionInfo::new([9; 16], 2));
    let err = s0.find_and_modify(&ns(), &request, &ctx).unwrap_err();
    assert_eq!(err.code(), ErrorCode::TransactionTooOld);
}

#[test]
fn prepared_transaction_holds_its_keys_until_decided() {
    let source = Arc::new(StaticSource::default());
    let mut coll = Sharded::new();
    coll.publish(&source, &[(None, None, "shard0")]);
    let s0 = shard("shard0", &source, fast_config());
    s0.insert(&ns(), docs(0..3), &coll.ctx()).unwrap();

    let session = SessionInfo::new([4; 16], 1);
    let mut txn_ctx = coll.ctx();
    txn_ctx.session = Some(session);
    txn_ctx.in_transaction = true;
    txn_ctx.start_transaction = true;
    let set = UpdateSpec::set(doc! { "qty": 10 });
    s0.update(&ns(), &Selector::Id(1.into()), &set, false, false, &txn_ctx)
        .unwrap();

    // Uncommitted writes are invisible outside the transaction.
    let outside = s0.find(&ns(), &Selector::Id(1.into()), &coll.ctx()).unwrap();
    assert_eq!(outside[0].get_i32("qty").unwrap(), 1);

    let prepare_ts = s0.prepare_transaction(session).unwrap();
    assert_eq!(
        s0.transaction_state(&session),
        Some(TxnState::Prepared { prepare_ts })
    );
    assert!(s0.watermark() < prepare_ts);
    assert_eq!(
        s0.abort_transaction(session, false).unwrap_err().code(),
        ErrorCode::PreparedTransactionInProgress
    );

    let err = s0
        .update(&ns(), &Selector::Id(1.into()), &set, false, false, &coll.ctx())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::WriteConflict);

    let commit_ts = s0.clock().tick();
    s0.commit_transaction(session, Some(commit_ts)).unwrap();
    s0.commit_transaction(session, Some(commit_ts)).unwrap();
    let after = s0.find(&ns(), &Selector::Id(1.into()), &coll.ctx()).unwrap();
    assert_eq!(after[0].get_i32("qty").unwrap(), 10);

    let entries = s0.read_oplog(OpTime::ZERO, Timestamp::MAX, Some(&ns())).unwrap();
    let last = entries.last().unwrap();
    assert_eq!(last.optime.ts, commit_ts);
    assert_eq!(last.txn, Some(session));
}

#[test]
fn pressure_aborts_only_unprepared_transactions() {
    let source = Arc::new(StaticSource::default());
    let mut coll = Sharded::new();
    coll.publish(&source, &[(None, None, "shard0")]);
    let s0 = shard("shard0", &source, fast_config());
    s0.insert(&ns(), docs(0..3), &coll.ctx()).unwrap();

    let txn_ctx = |lsid: u8| {
        let mut ctx = coll.ctx();
        ctx.session = Some(SessionInfo::new([lsid; 16], 1));
        ctx.in_transaction = true;
        ctx.start_transaction = true;
        ctx
    };
    let set = UpdateSpec::set(doc! { "qty": 5 });
    s0.update(&ns(), &Selector::Id(0.into()), &set, false, false, &txn_ctx(1))
        .unwrap();
    s0.update(&ns(), &Selector::Id(1.into()), &set, false, false, &txn_ctx(2))
        .unwrap();
    let prepared = SessionInfo::new([2; 16], 1);
    s0.prepare_transaction(prepared).unwrap();

    assert_eq!(s0.relieve_pressure(), 1);
    let err = s0
        .commit_transaction(SessionInfo::new([1; 16], 1), None)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::TemporarilyUnavailable);
    assert!(matches!(
        s0.transaction_state(&prepared),
        Some(TxnState::Prepared { .. })
    ));
}

#[test]
fn transaction_conflicting_with_a_commit_fails_to_prepare() {
    let source = Arc::new(StaticSource::default());
    let mut coll = Sharded::new();
    coll.publish(&source, &[(None, None, "shard0")]);
    let s0 = shard("shard0", &source, fast_config());
    s0.insert(&ns(), docs(0..3), &coll.ctx()).unwrap();

    let session = SessionInfo::new([5; 16], 1);
    let mut txn_ctx = coll.ctx();
    txn_ctx.session = Some(session);
    txn_ctx.in_transaction = true;
    txn_ctx.start_transaction = true;
    s0.delete(&ns(), &Selector::Id(2.into()), false, &txn_ctx).unwrap();

    s0.update(
        &ns(),
        &Selector::Id(2.into()),
        &UpdateSpec::set(doc! { "qty": 9 }),
        false,
        false,
        &coll.ctx(),
    )
    .unwrap();

    let err = s0.prepare_transaction(session).unwrap_err();
    assert_eq!(err.code(), ErrorCode::WriteConflict);
    assert_eq!(s0.transaction_state(&session), Some(TxnState::Aborted));
}

#[test]
fn direct_commit_cannot_overwrite_keys_held_by_a_prepared_transaction() {
    let source = Arc::new(StaticSource::default());
    let mut coll = Sharded::new();
    coll.publish(&source, &[(None, None, "shard0")]);
    let s0 = shard("shard0", &source, fast_config());
    s0.insert(&ns(), docs(0..3), &coll.ctx()).unwrap();

    let txn_ctx = |lsid: u8| {
        let mut ctx = coll.ctx();
        ctx.session = Some(SessionInfo::new([lsid; 16], 1));
        ctx.in_transaction = true;
        ctx.start_transaction = true;
        ctx
    };
    let direct = SessionInfo::new([1; 16], 1);
    let prepared = SessionInfo::new([2; 16], 1);
    s0.update(&ns(), &Selector::Id(1.into()), &UpdateSpec::inc(doc! { "qty": 100 }), false, false, &txn_ctx(1))
        .unwrap();
    s0.update(&ns(), &Selector::Id(1.into()), &UpdateSpec::inc(doc! { "qty": 10 }), false, false, &txn_ctx(2))
        .unwrap();
    s0.prepare_transaction(prepared).unwrap();

    let err = s0.commit_transaction(direct, None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::WriteConflict);
    assert_eq!(s0.transaction_state(&direct), Some(TxnState::Aborted));

    let commit_ts = s0.clock().tick();
    s0.commit_transaction(prepared, Some(commit_ts)).unwrap();
    let after = s0.find(&ns(), &Selector::Id(1.into()), &coll.ctx()).unwrap();
    assert_eq!(after[0].get_i32("qty").unwrap(), 11);
}

#[test]
fn critical_section_refuses_transactions_touching_its_range() {
    let source = Arc::new(StaticSource::default());
    let mut coll = Sharded::new();
    coll.publish(&source, &[(None, None, "shard0")]);
    let s0 = shard("shard0", &source, fast_config());
    s0.insert(&ns(), docs(0..10), &coll.ctx()).unwrap();

    let txn_ctx = |lsid: u8| {
        let mut ctx = coll.ctx();
        ctx.session = Some(SessionInfo::new([lsid; 16], 1));
        ctx.in_transaction = true;
        ctx.start_transaction = true;
        ctx
    };
    let bump = UpdateSpec::inc(doc! { "qty": 1 });
    let committing = SessionInfo::new([1; 16], 1);
    let preparing = SessionInfo::new([2; 16], 1);
    let outside = SessionInfo::new([3; 16], 1);
    s0.update(&ns(), &Selector::Id(7.into()), &bump, false, false, &txn_ctx(1))
        .unwrap();
    s0.update(&ns(), &Selector::Id(8.into()), &bump, false, false, &txn_ctx(2))
        .unwrap();
    s0.update(&ns(), &Selector::Id(2.into()), &bump, false, false, &txn_ctx(3))
        .unwrap();

    let id = s0.critical_sections().enter(
        &ns(),
        SectionScope::Range(coll.range(Some(5), None)),
        "moveRange",
    );

    let err = s0.commit_transaction(committing, None).unwrap_err();
    assert!(err.is_stale());
    assert_eq!(s0.transaction_state(&committing), Some(TxnState::Aborted));
    let err = s0.prepare_transaction(preparing).unwrap_err();
    assert!(err.is_stale());
    assert_eq!(s0.transaction_state(&preparing), Some(TxnState::Aborted));
    assert!(!s0.has_prepared_transactions(&ns()));

    s0.commit_transaction(outside, None).unwrap();
    s0.critical_sections().exit(&ns(), id);

    let qty = |id: i32| {
        s0.find(&ns(), &Selector::Id(id.into()), &coll.ctx()).unwrap()[0]
            .get_i32("qty")
            .unwrap()
    };
    assert_eq!((qty(2), qty(7), qty(8)), (2, 1, 1));
}

#[test]
fn trimmed_oplog_reports_lost_history() {
    let source = Arc::new(StaticSource::default());
    let mut coll = Sharded::new();
    coll.publish(&source, &[(None, None, "shard0")]);
    let config = ShardConfig {
        oplog_max_entries: 4,
        ..fast_config()
    };
    let s0 = shard("shard0", &source, config);
    for d in docs(0..10) {
        s0.insert(&ns(), vec![d], &coll.ctx()).unwrap();
    }
    let err = s0
        .read_oplog(OpTime::ZERO, Timestamp::MAX, None)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ChangeStreamHistoryLost);

    let last = s0.last_optime().unwrap();
    assert!(s0.read_oplog(last, Timestamp::MAX, None).unwrap().is_empty());
}

#[test]
fn unsharded_collection_lives_on_its_primary() {
    let source = Arc::new(StaticSource::default());
    let uuid = CollectionUuid::new();
    source.set_unsharded(&ns(), uuid, "shard0");
    let s0 = shard("shard0", &source, fast_config());
    let s1 = shard("shard1", &source, fast_config());
    let ctx = OpContext::versioned(ShardVersion::Unsharded);

    s0.insert(&ns(), docs(0..3), &ctx).unwrap();
    assert_eq!(s0.collection(&ns()).unwrap().unwrap().uuid, uuid);
    let err = s1.insert(&ns(), docs(3..4), &ctx).unwrap_err();
    assert_eq!(err.code(), ErrorCode::IllegalOperation);

    let upserted = s0
        .update(
            &ns(),
            &Selector::Id(99.into()),
            &UpdateSpec::set(doc! { "qty": 1 }),
            false,
            true,
            &ctx,
        )
        .unwrap();
    assert_eq!(upserted.upserted_id, Some(99.into()));
    assert_eq!(s0.count(&ns(), &Selector::All, &ctx).unwrap(), 4);
}

#[test]
fn snapshot_and_catch_up_copy_a_range_to_the_recipient() {
    let source = Arc::new(StaticSource::default());
    let mut coll = Sharded::new();
    coll.publish(&source, &[(None, None, "shard0")]);
    let donor = shard("shard0", &source, fast_config());
    let recipient = shard("shard1", &source, fast_config());
    donor.insert(&ns(), docs(0..10), &coll.ctx()).unwrap();

    let range = coll.range(Some(5), None);
    let pattern = coll.meta.key_pattern.clone();
    recipient
        .ensure_collection(&ns(), coll.meta.uuid, Some(pattern.clone()))
        .unwrap();

    let (cloned, position) = donor.snapshot_range(&ns(), Some(&range)).unwrap();
    assert_eq!(cloned.len(), 5);
    let ops: Vec<MigratedOp> = cloned.into_iter().map(MigratedOp::Upsert).collect();
    assert_eq!(recipient.apply_migrated(&ns(), &ops).unwrap(), 5);

    // Writes racing the clone reach the recipient through the oplog.
    let mut retryable = coll.ctx();
    retryable.session = Some(SessionInfo::new([3; 16], 1));
    retryable.stmt_id = Some(0);
    donor
        .update(
            &ns(),
            &Selector::Id(7.into()),
            &UpdateSpec::inc(doc! { "qty": 1 }),
            false,
            false,
            &retryable,
        )
        .unwrap();
    donor
        .delete(&ns(), &Selector::Id(8.into()), false, &coll.ctx())
        .unwrap();
    donor
        .delete(&ns(), &Selector::Id(1.into()), false, &coll.ctx())
        .unwrap();

    let entries = donor
        .read_oplog(position, donor.watermark(), Some(&ns()))
        .unwrap();
    let ops: Vec<MigratedOp> = ops_from_oplog(&entries, &ns())
        .unwrap()
        .into_iter()
        .filter(|op| op.within(&pattern, &range))
        .collect();
    assert_eq!(ops.len(), 2);
    recipient.apply_migrated(&ns(), &ops).unwrap();

    let copied = recipient
        .find(&ns(), &Selector::All, &OpContext::direct())
        .unwrap();
    assert_eq!(copied.len(), 4);
    let seven = recipient
        .find(&ns(), &Selector::Id(7.into()), &OpContext::direct())
        .unwrap();
    assert_eq!(seven[0].get_i32("qty").unwrap(), 2);

    // Session history follows the documents it wrote.
    let history = donor
        .export_sessions(&ns(), Some((&pattern, &range)))
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(recipient.import_sessions(&history).unwrap(), 1);
    assert_eq!(recipient.import_sessions(&history).unwrap(), 0);
}
