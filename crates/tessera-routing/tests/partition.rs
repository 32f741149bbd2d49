use bson::Bson;
use tessera_routing::{
    Chunk, ChunkRange, ChunkVersion, CollectionMetadata, CollectionUuid, Epoch, KeyPattern,
    Namespace, RoutingTable, ShardId, ShardKey, validate_partition,
};

fn key(n: i32) -> ShardKey {
    ShardKey::from_bson(&[Bson::Int32(n)]).unwrap()
}

fn metadata(epoch: Epoch) -> CollectionMetadata {
    CollectionMetadata {
        namespace: Namespace::parse("test.orders").unwrap(),
        uuid: CollectionUuid::new(),
        epoch,
        key_pattern: KeyPattern::new(["_id"]).unwrap(),
        unique: false,
        allow_migrations: true,
    }
}

/// Split every chunk at its midpoint-ish key, then merge neighbours pairwise
/// and move some to another shard; the partition must hold at every step.
#[test]
fn split_merge_and_move_preserve_partition() {
    let epoch = Epoch::new();
    let meta = metadata(epoch);
    let pattern = meta.key_pattern.clone();
    let mut table = RoutingTable::new(
        meta.clone(),
        vec![Chunk::new(
            ChunkRange::full(&pattern),
            ShardId::from("shard0"),
            ChunkVersion::initial(epoch),
        )],
    )
    .unwrap();

    // Split at 10, 20, ..., 90.
    let mut version = table.version();
    for split in (10..100).step_by(10) {
        let chunk = table.find_chunk(&key(split)).unwrap().clone();
        let left_version = version.bump_minor();
        let right_version = left_version.bump_minor();
        version = right_version;
        let left = Chunk::new(
            ChunkRange::new(chunk.range.min.clone(), key(split)).unwrap(),
            chunk.shard.clone(),
            left_version,
        );
        let right = Chunk::new(
            ChunkRange::new(key(split), chunk.range.max.clone()).unwrap(),
            chunk.shard.clone(),
            right_version,
        );
        table = table.apply_changes(meta.clone(), vec![left, right]).unwrap();
    }
    assert_eq!(table.num_chunks(), 10);

    // Move every other chunk to shard1.
    for split in (10..100).step_by(20) {
        let mut chunk = table.find_chunk(&key(split)).unwrap().clone();
        version = version.bump_major();
        chunk.shard = ShardId::from("shard1");
        chunk.version = version;
        table = table.apply_changes(meta.clone(), vec![chunk]).unwrap();
    }
    assert_eq!(table.shards().len(), 2);
    assert_eq!(table.chunks_for_shard(&ShardId::from("shard1")).count(), 5);

    let chunks: Vec<&Chunk> = table.chunks().collect();
    validate_partition(&meta.namespace, &pattern, epoch, &chunks).unwrap();
    assert!(chunks.first().unwrap().range.min.is_min());
    assert!(chunks.last().unwrap().range.max.is_max());
    for pair in chunks.windows(2) {
        assert_eq!(pair[0].range.max, pair[1].range.min);
        assert!(!pair[0].range.overlaps(&pair[1].range));
    }

    // Every key lands in exactly one chunk.
    for n in -5..105 {
        let owners = table.chunks().filter(|c| c.range.contains(&key(n))).count();
        assert_eq!(owners, 1, "key {n}");
    }
}

#[test]
fn shard_versions_track_highest_owned_chunk() {
    let epoch = Epoch::new();
    let meta = metadata(epoch);
    let pattern = meta.key_pattern.clone();
    let table = RoutingTable::new(
        meta,
        vec![
            Chunk::new(
                ChunkRange::new(pattern.min_key(), key(5)).unwrap(),
                ShardId::from("shard0"),
                ChunkVersion::new(epoch, 2, 1),
            ),
            Chunk::new(
                ChunkRange::new(key(5), pattern.max_key()).unwrap(),
                ShardId::from("shard1"),
                ChunkVersion::new(epoch, 2, 0),
            ),
        ],
    )
    .unwrap();
    assert_eq!(
        table.shard_version(&ShardId::from("shard0")),
        ChunkVersion::new(epoch, 2, 1)
    );
    assert_eq!(
        table.shard_version(&ShardId::from("shard1")),
        ChunkVersion::new(epoch, 2, 0)
    );
    assert_eq!(table.version(), ChunkVersion::new(epoch, 2, 1));
}
