use std::sync::Arc;
use std::thread;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shardlru::prelude::*;

fn bench_lookup_hit(c: &mut Criterion) {
    let cache = CacheBuilder::new(1 << 24).shard_bits(4).try_build().unwrap();
    let ns = cache.default_handle();
    for i in 0..8192u64 {
        ns.put(&format!("key-{i}"), "sixteen byte val");
    }
    let mut rng = StdRng::seed_from_u64(42);

    c.bench_function("lookup_hit", |b| {
        b.iter(|| {
            let i = rng.gen_range(0..8192u64);
            std::hint::black_box(ns.get(&format!("key-{i}")))
        })
    });
}

fn bench_insert_eviction_churn(c: &mut Criterion) {
    c.bench_function("insert_eviction_churn", |b| {
        b.iter_batched(
            || {
                let cache = CacheBuilder::new(16 << 10).shard_bits(2).try_build().unwrap();
                (cache.default_handle(), cache)
            },
            |(ns, _cache)| {
                // Budget holds ~512 entries; most inserts evict.
                for i in 0..4096u64 {
                    ns.insert(
                        format!("churn-{i}").as_bytes(),
                        Arc::new(i),
                        32,
                        None,
                    );
                }
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_counter_merge(c: &mut Criterion) {
    let cache = CacheBuilder::new(1 << 20).try_build().unwrap();
    let ns = cache.default_handle();

    c.bench_function("counter_merge", |b| {
        b.iter(|| std::hint::black_box(ns.new_id("bench-seq").unwrap()))
    });
}

fn bench_sharded_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_mixed_ops");
    for bits in [1u32, 4] {
        group.bench_function(format!("shard_bits_{bits}"), |b| {
            b.iter_batched(
                || {
                    let cache = CacheBuilder::new(1 << 24)
                        .shard_bits(bits)
                        .try_build()
                        .unwrap();
                    let ns = cache.default_handle();
                    for i in 0..4096u64 {
                        ns.put(&format!("key-{i}"), "sixteen byte val");
                    }
                    cache
                },
                |cache| {
                    let handles: Vec<_> = (0..4)
                        .map(|t| {
                            let cache = cache.clone();
                            thread::spawn(move || {
                                let ns = cache.default_handle();
                                let mut rng = StdRng::seed_from_u64(t);
                                for _ in 0..2048 {
                                    let i = rng.gen_range(0..4096u64);
                                    if i % 5 == 0 {
                                        ns.put(&format!("key-{i}"), "sixteen byte val");
                                    } else {
                                        std::hint::black_box(ns.get(&format!("key-{i}")));
                                    }
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.join().unwrap();
                    }
                },
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_lookup_hit,
    bench_insert_eviction_churn,
    bench_counter_merge,
    bench_sharded_contention
);
criterion_main!(benches);
