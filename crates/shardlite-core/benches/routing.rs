use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tempfile::tempdir;

use shardlite_core::{
    ConnectionPool, ConsistentHashStrategy, HashStrategy, Operation, PoolConfig, RangeStrategy,
    ShardManager, ShardingStrategy, ShardliteConfig,
};

fn bench_strategies(c: &mut Criterion) {
    let strategies: Vec<(&str, Arc<dyn ShardingStrategy>)> = vec![
        ("hash", Arc::new(HashStrategy::new(16).unwrap())),
        ("range", Arc::new(RangeStrategy::uniform(0, 1 << 20, 16).unwrap())),
        ("consistent", Arc::new(ConsistentHashStrategy::new(16, 100).unwrap())),
    ];
    for (name, strategy) in strategies {
        c.bench_function(&format!("shard_id_{name}"), |b| {
            let mut key = 0i64;
            b.iter(|| {
                key = (key + 7919) % (1 << 20);
                black_box(strategy.shard_id(black_box(key)).unwrap())
            })
        });
    }
}

fn bench_pool(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let pool = ConnectionPool::new(0, dir.path().join("shard_0.db"), PoolConfig::default()).unwrap();
    drop(pool.acquire().unwrap());
    c.bench_function("pool_acquire_release", |b| {
        b.iter(|| {
            let conn = pool.acquire().unwrap();
            black_box(conn.id());
        })
    });
}

fn bench_two_phase_commit(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let config = ShardliteConfig {
        num_shards: 4,
        ..ShardliteConfig::with_dir(dir.path())
    };
    let manager = ShardManager::open(config).unwrap();
    manager
        .apply_schema("CREATE TABLE kv (k INTEGER PRIMARY KEY, v INTEGER)")
        .unwrap();

    let mut next = 0i64;
    c.bench_function("two_phase_commit_2_shards", |b| {
        b.iter(|| {
            next += 2;
            let keys = [next, next + 1];
            let ops = keys
                .iter()
                .map(|&k| {
                    Operation::new(k, move |conn| {
                        conn.execute("INSERT OR REPLACE INTO kv (k, v) VALUES (?1, ?1)", [k])?;
                        Ok(())
                    })
                })
                .collect();
            assert!(manager.run_transaction(&keys, ops).unwrap());
        })
    });

    c.bench_function("fan_out_count", |b| {
        b.iter(|| black_box(manager.aggregate("kv", "COUNT(*)").unwrap()))
    });
}

criterion_group!(benches, bench_strategies, bench_pool, bench_two_phase_commit);
criterion_main!(benches);
