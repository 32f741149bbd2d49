use bson::Bson;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use tessera_routing::{
    Chunk, ChunkRange, ChunkVersion, CollectionMetadata, CollectionUuid, Epoch, KeyPattern,
    Namespace, RoutingTable, ShardId, ShardKey,
};

// ── Helpers ─────────────────────────────────────────────────

fn key(n: i64) -> ShardKey {
    ShardKey::from_bson(&[Bson::Int64(n)]).unwrap()
}

/// Routing table with `n` equal chunks spread round-robin over four shards.
fn table(n: i64) -> RoutingTable {
    let epoch = Epoch::new();
    let pattern = KeyPattern::new(["_id"]).unwrap();
    let meta = CollectionMetadata {
        namespace: Namespace::parse("bench.orders").unwrap(),
        uuid: CollectionUuid::new(),
        epoch,
        key_pattern: pattern.clone(),
        unique: false,
        allow_migrations: true,
    };
    let mut bounds = vec![pattern.min_key()];
    bounds.extend((1..n).map(|i| key(i * 1_000)));
    bounds.push(pattern.max_key());
    let chunks = bounds
        .windows(2)
        .enumerate()
        .map(|(i, w)| {
            Chunk::new(
                ChunkRange::new(w[0].clone(), w[1].clone()).unwrap(),
                ShardId::new(format!("shard{}", i % 4)),
                ChunkVersion::new(epoch, 1, i as u32),
            )
        })
        .collect();
    RoutingTable::new(meta, chunks).unwrap()
}

// ── Lookup ──────────────────────────────────────────────────

fn bench_find_chunk(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_chunk");
    for n in [10, 1_000, 100_000] {
        let table = table(n);
        let lookups: Vec<ShardKey> = (0..100).map(|i| key(i * n * 10 + 7)).collect();
        group.bench_with_input(BenchmarkId::from_parameter(n), &lookups, |b, lookups| {
            b.iter(|| {
                lookups
                    .iter()
                    .filter(|k| table.find_chunk(k).is_some())
                    .count()
            });
        });
    }
    group.finish();
}

// ── Encoding ────────────────────────────────────────────────

fn bench_encode(c: &mut Criterion) {
    let values = [
        Bson::String("customer-000123".into()),
        Bson::Int64(987_654),
    ];
    c.bench_function("encode_compound_key", |b| {
        b.iter(|| ShardKey::from_bson(&values).unwrap())
    });
}

// ── Apply changes ───────────────────────────────────────────

fn bench_apply_changes(c: &mut Criterion) {
    let base = table(10_000);
    let moved: Vec<Chunk> = base
        .chunks()
        .take(10)
        .enumerate()
        .map(|(i, chunk)| {
            let mut c = chunk.clone();
            c.shard = ShardId::from("shard9");
            c.version = ChunkVersion::new(base.epoch(), 2, i as u32);
            c
        })
        .collect();
    c.bench_function("apply_changes_10_of_10000", |b| {
        b.iter(|| {
            base.apply_changes(base.metadata().clone(), moved.clone())
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_find_chunk, bench_encode, bench_apply_changes);
criterion_main!(benches);
