#![cfg(feature = "memory")]

use std::sync::Arc;
use std::thread;

use tessera_store::{MemoryStore, Store, StoreError, Transaction};

const T: &str = "test";

fn mem_store() -> MemoryStore {
    let store = MemoryStore::new();
    store.create_table(T).unwrap();
    store
}

fn collect(iter: tessera_store::ScanIter<'_>) -> Vec<(Vec<u8>, Vec<u8>)> {
    iter.map(|r| r.unwrap()).collect()
}

#[test]
fn put_and_get() {
    let store = mem_store();
    let txn = store.begin(false).unwrap();
    txn.put(T, b"key1", b"value1").unwrap();
    txn.commit().unwrap();

    let txn = store.begin(true).unwrap();
    assert_eq!(txn.get(T, b"key1").unwrap().unwrap(), b"value1");
    assert!(txn.get(T, b"missing").unwrap().is_none());
}

#[test]
fn reads_see_own_writes() {
    let store = mem_store();
    let txn = store.begin(false).unwrap();
    txn.put(T, b"a", b"1").unwrap();
    assert_eq!(txn.get(T, b"a").unwrap().unwrap(), b"1");
    txn.delete(T, b"a").unwrap();
    assert!(txn.get(T, b"a").unwrap().is_none());
    assert_eq!(txn.pending_writes(), 1);
}

#[test]
fn snapshot_isolation() {
    let store = mem_store();
    let reader = store.begin(true).unwrap();

    let writer = store.begin(false).unwrap();
    writer.put(T, b"k", b"v").unwrap();
    writer.commit().unwrap();

    assert!(reader.get(T, b"k").unwrap().is_none());
    let fresh = store.begin(true).unwrap();
    assert_eq!(fresh.get(T, b"k").unwrap().unwrap(), b"v");
}

#[test]
fn scan_range_and_prefix() {
    let store = mem_store();
    let txn = store.begin(false).unwrap();
    for key in [&b"a:1"[..], b"a:2", b"b:1", b"c:1"] {
        txn.put(T, key, b"x").unwrap();
    }
    txn.commit().unwrap();

    let txn = store.begin(true).unwrap();
    let keys: Vec<_> = collect(txn.scan_prefix(T, b"a:").unwrap())
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(keys, vec![b"a:1".to_vec(), b"a:2".to_vec()]);

    let keys: Vec<_> = collect(txn.scan(T, b"a:2".to_vec()..b"c:1".to_vec()).unwrap())
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(keys, vec![b"a:2".to_vec(), b"b:1".to_vec()]);
}

#[test]
fn read_only_rejects_writes() {
    let store = mem_store();
    let txn = store.begin(true).unwrap();
    assert!(matches!(txn.put(T, b"k", b"v"), Err(StoreError::ReadOnly)));
}

#[test]
fn missing_table_errors() {
    let store = mem_store();
    let txn = store.begin(false).unwrap();
    assert!(matches!(
        txn.get("nope", b"k"),
        Err(StoreError::TableNotFound(_))
    ));
}

#[test]
fn conflicting_writes_first_committer_wins() {
    let store = mem_store();
    let t1 = store.begin(false).unwrap();
    let t2 = store.begin(false).unwrap();
    t1.put(T, b"k", b"one").unwrap();
    t2.put(T, b"k", b"two").unwrap();
    t1.commit().unwrap();
    let err = t2.commit().unwrap_err();
    assert!(err.is_write_conflict());

    let txn = store.begin(true).unwrap();
    assert_eq!(txn.get(T, b"k").unwrap().unwrap(), b"one");
}

#[test]
fn disjoint_writes_both_commit() {
    let store = mem_store();
    let t1 = store.begin(false).unwrap();
    let t2 = store.begin(false).unwrap();
    t1.put(T, b"a", b"1").unwrap();
    t2.put(T, b"b", b"2").unwrap();
    t1.commit().unwrap();
    t2.commit().unwrap();

    let txn = store.begin(true).unwrap();
    assert_eq!(txn.get(T, b"a").unwrap().unwrap(), b"1");
    assert_eq!(txn.get(T, b"b").unwrap().unwrap(), b"2");
}

#[test]
fn failing_hook_discards_writes() {
    let store = mem_store();
    let txn = store.begin(false).unwrap();
    txn.put(T, b"k", b"v").unwrap();
    let err = txn.commit_with(|| Err("log full".into())).unwrap_err();
    assert!(matches!(err, StoreError::CommitAborted(_)));

    let txn = store.begin(true).unwrap();
    assert!(txn.get(T, b"k").unwrap().is_none());
}

#[test]
fn hook_runs_before_apply() {
    let store = mem_store();
    let txn = store.begin(false).unwrap();
    txn.put(T, b"k", b"v").unwrap();
    let mut ran = false;
    txn.commit_with(|| {
        ran = true;
        Ok(())
    })
    .unwrap();
    assert!(ran);
    assert_eq!(store.table_len(T), Some(1));
}

#[test]
fn concurrent_counters_never_lose_updates() {
    let store = Arc::new(mem_store());
    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..50 {
                loop {
                    let txn = store.begin(false).unwrap();
                    let n = txn
                        .get(T, b"counter")
                        .unwrap()
                        .map(|v| u64::from_be_bytes(v.try_into().unwrap()))
                        .unwrap_or(0);
                    txn.put(T, b"counter", &(n + 1).to_be_bytes()).unwrap();
                    match txn.commit() {
                        Ok(()) => break,
                        Err(e) if e.is_write_conflict() => continue,
                        Err(e) => panic!("{e}"),
                    }
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    let txn = store.begin(true).unwrap();
    let v = txn.get(T, b"counter").unwrap().unwrap();
    assert_eq!(u64::from_be_bytes(v.try_into().unwrap()), 200);
}
