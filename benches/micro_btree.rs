use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mvmap::{InMemoryStore, MapBuilder};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

const SEED: u64 = 0x5eed_cafe;

fn seeded_map(n: u64) -> mvmap::MVMap<u64, u64> {
    let store = InMemoryStore::new("bench");
    let map = MapBuilder::<u64, u64>::new_ordered().open(store, 1, 0).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(SEED);
    let mut keys: Vec<u64> = (0..n).collect();
    keys.shuffle(&mut rng);
    for k in keys {
        map.put(k, k).unwrap();
    }
    map
}

fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");
    for size in [1_000u64, 10_000, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || seeded_map(size),
                |map| {
                    map.put(black_box(size), black_box(size)).unwrap();
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    for size in [1_000u64, 10_000, 100_000] {
        let map = seeded_map(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                black_box(map.get(&(size / 2)));
            });
        });
    }
    group.finish();
}

fn bench_ordered_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("ordered_scan");
    for size in [1_000u64, 10_000] {
        let map = seeded_map(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let count = map.cursor(None, None, false).count();
                black_box(count);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_put, bench_get, bench_ordered_scan);
criterion_main!(benches);
