use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bson::{Bson, Document, doc};
use tessera_client::{Client, ClientPool, CommandOptions};
use tessera_cluster::{Cluster, ClusterConfig};
use tessera_routing::ErrorCode;
use tessera_server::Server;
use tessera_shard::{Selector, SessionInfo, UpdateSpec};

const NS: &str = "shop.orders";

struct Running {
    addr: String,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for Running {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn start_server_with(config: ClusterConfig) -> Running {
    let cluster = Arc::new(Cluster::start(config).unwrap());
    let server = Server::bind(cluster, "127.0.0.1:0").unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let shutdown = server.shutdown_handle();
    let handle = thread::spawn(move || {
        server.serve().unwrap();
    });
    Running {
        addr,
        shutdown,
        handle: Some(handle),
    }
}

fn start_server() -> Running {
    start_server_with(ClusterConfig {
        background_maintenance: false,
        orphan_cleanup_delay_ms: 0,
        ..ClusterConfig::default()
    })
}

/// MessagePack keeps the smallest integer width, so counters may come back
/// as either BSON integer type.
fn int(doc: &Document, key: &str) -> i64 {
    match doc.get(key) {
        Some(Bson::Int32(n)) => i64::from(*n),
        Some(Bson::Int64(n)) => *n,
        other => panic!("{key} is not an integer: {other:?}"),
    }
}

fn seed(client: &mut Client, n: i32) {
    let docs = (0..n).map(|i| doc! { "_id": i, "qty": 1 }).collect();
    let res = client.insert(NS, docs, &CommandOptions::default()).unwrap();
    assert_eq!(res.inserted, n as u64);
}

#[test]
fn crud_over_the_wire() {
    let server = start_server();
    let mut client = Client::connect(&server.addr).unwrap();
    let opts = CommandOptions::default();
    seed(&mut client, 5);

    assert_eq!(client.count(NS, Selector::All, &opts).unwrap(), 5);
    let res = client
        .update(NS, Selector::Id(2.into()), UpdateSpec::set(doc! { "qty": 9 }), false, false, &opts)
        .unwrap();
    assert_eq!((res.matched, res.modified), (1, 1));
    let found = client.find(NS, Selector::Id(2.into()), &opts).unwrap();
    assert_eq!(found[0].get_i32("qty").unwrap(), 9);

    let res = client.delete(NS, Selector::Id(4.into()), false, &opts).unwrap();
    assert_eq!(res.deleted, 1);
    assert_eq!(client.count(NS, Selector::All, &opts).unwrap(), 4);
}

#[test]
fn sharding_commands_and_error_replies() {
    let server = start_server();
    let mut client = Client::connect(&server.addr).unwrap();
    seed(&mut client, 10);

    let meta = client
        .shard_collection(NS, doc! { "_id": 1 }, false, vec![doc! { "_id": 5 }])
        .unwrap();
    assert_eq!(meta.get_document("key").unwrap(), &doc! { "_id": 1 });

    let moved = client
        .move_range(NS, Some(doc! { "_id": 5 }), None, "shard1")
        .unwrap();
    assert_eq!(moved.get_str("to").unwrap(), "shard1");
    assert_eq!(int(&moved, "cloned"), 5);

    let chunks = client.list_chunks(NS).unwrap();
    assert_eq!(chunks.len(), 2);
    assert_eq!(client.cleanup_orphaned(NS).unwrap(), 5);
    assert_eq!(
        client.count(NS, Selector::All, &CommandOptions::default()).unwrap(),
        10
    );

    let err = client.split_chunk(NS, doc! { "_id": 5 }).unwrap_err();
    assert_eq!(err.code(), ErrorCode::BadValue);
    assert!(!err.is_retryable());

    let err = client.count("no-dot", Selector::All, &CommandOptions::default()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidOptions);

    // The connection is still usable after errors.
    assert_eq!(client.list_chunks(NS).unwrap().len(), 2);
}

#[test]
fn transactions_commit_over_the_wire() {
    let server = start_server();
    let mut client = Client::connect(&server.addr).unwrap();
    seed(&mut client, 2);

    let session = SessionInfo::new([7; 16], 1);
    let txn = CommandOptions {
        session: Some(session),
        in_transaction: true,
        ..CommandOptions::default()
    };
    client.insert(NS, vec![doc! { "_id": 50 }], &txn).unwrap();
    let plain = CommandOptions::default();
    assert_eq!(client.count(NS, Selector::All, &plain).unwrap(), 2);

    client.commit_transaction(session).unwrap();
    assert_eq!(client.count(NS, Selector::All, &plain).unwrap(), 3);
}

#[test]
fn change_stream_cursor_follows_writes_until_drop() {
    let server = start_server();
    let mut client = Client::connect(&server.addr).unwrap();
    seed(&mut client, 1);

    let cursor = client.watch(NS, None).unwrap();
    client
        .insert(NS, vec![doc! { "_id": 10 }], &CommandOptions::default())
        .unwrap();
    let batch = client.get_more(cursor, 1_000).unwrap();
    assert_eq!(batch.events.len(), 1);
    let event = &batch.events[0];
    assert_eq!(event.get_str("operationType").unwrap(), "insert");
    assert_eq!(event.get_document("documentKey").unwrap(), &doc! { "_id": 10 });
    assert_eq!(batch.resume_token.as_deref(), Some(event.get_str("_id").unwrap()));
    assert!(!batch.closed);

    // Resuming from the token skips what was already seen.
    let resumed = client.watch(NS, batch.resume_token.as_deref()).unwrap();
    assert!(client.get_more(resumed, 20).unwrap().events.is_empty());
    client.kill_cursor(resumed).unwrap();

    assert!(client.drop_collection(NS).unwrap());
    let batch = client.get_more(cursor, 1_000).unwrap();
    let ops: Vec<&str> = batch
        .events
        .iter()
        .map(|e| e.get_str("operationType").unwrap())
        .collect();
    assert_eq!(ops, vec!["drop", "invalidate"]);
    assert!(batch.closed);
    assert!(client.get_more(cursor, 0).is_err());

    let err = client.watch(NS, Some("not-a-token")).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidResumeToken);
}

#[test]
fn pool_lends_a_bounded_number_of_connections() {
    let server = start_server();
    let pool = ClientPool::new(server.addr.as_str(), 2).unwrap();
    {
        let mut a = pool.get().unwrap();
        let _b = pool.get().unwrap();
        assert_eq!(pool.available(), 0);
        assert!(pool.get_timeout(Duration::from_millis(20)).is_err());
        seed(&mut a, 3);
    }
    assert_eq!(pool.available(), 2);
    let mut c = pool.get().unwrap();
    assert_eq!(
        c.count(NS, Selector::All, &CommandOptions::default()).unwrap(),
        3
    );
}

#[test]
fn server_with_a_data_dir_keeps_its_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let config = ClusterConfig {
        background_maintenance: false,
        data_dir: Some(dir.path().to_path_buf()),
        ..ClusterConfig::default()
    };
    {
        let server = start_server_with(config.clone());
        let mut client = Client::connect(&server.addr).unwrap();
        seed(&mut client, 4);
        client
            .shard_collection(NS, doc! { "_id": 1 }, false, vec![doc! { "_id": 2 }])
            .unwrap();
    }
    let server = start_server_with(config);
    let mut client = Client::connect(&server.addr).unwrap();
    assert_eq!(client.list_chunks(NS).unwrap().len(), 2);
}
