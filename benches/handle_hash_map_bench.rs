use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use ephemeron_table::handle_hash_map::{Handle, HandleHashMap};
use std::time::Duration;

fn lcg(mut s: u64) -> impl Iterator<Item = u64> {
    std::iter::from_fn(move || {
        s = s.wrapping_mul(6364136223846793005).wrapping_add(1);
        Some(s)
    })
}

fn bench_put_fresh_100k(c: &mut Criterion) {
    c.bench_function("handle::put_fresh_100k", |b| {
        b.iter_batched(
            HandleHashMap::<u64, u64>::new,
            |mut m| {
                for (i, x) in lcg(1).take(100_000).enumerate() {
                    m.put(x, i as u64);
                }
                black_box(m)
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_put_reserved_100k(c: &mut Criterion) {
    c.bench_function("handle::put_reserved_100k", |b| {
        b.iter_batched(
            || {
                let mut m = HandleHashMap::<u64, u64>::new();
                m.try_reserve(100_000).unwrap();
                m
            },
            |mut m| {
                for (i, x) in lcg(3).take(100_000).enumerate() {
                    m.put(x, i as u64);
                }
                black_box(m)
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_remove_random_10k(c: &mut Criterion) {
    c.bench_function("handle::remove_random_10k_of_110k", |b| {
        b.iter_batched(
            || {
                let mut m = HandleHashMap::new();
                let handles: Vec<Handle> = lcg(5)
                    .take(110_000)
                    .enumerate()
                    .map(|(i, x)| m.put(x, i as u64).0)
                    .collect();
                let n = handles.len();
                let mut sel = std::collections::HashSet::with_capacity(10_000);
                let mut s = 0x9e3779b97f4a7c15u64;
                while sel.len() < 10_000 {
                    s = s.wrapping_mul(2862933555777941757).wrapping_add(3037000493);
                    sel.insert((s as usize) % n);
                }
                let to_remove: Vec<Handle> = sel.into_iter().map(|i| handles[i]).collect();
                (m, to_remove)
            },
            |(mut m, to_remove)| {
                for h in to_remove {
                    let _ = m.remove(h);
                }
                black_box(m)
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_retain_half_100k(c: &mut Criterion) {
    c.bench_function("handle::retain_half_100k", |b| {
        b.iter_batched(
            || {
                let mut m = HandleHashMap::new();
                for (i, x) in lcg(9).take(100_000).enumerate() {
                    m.put(x, i as u64);
                }
                m
            },
            |mut m| {
                let removed = m.retain(|_, v| *v % 2 == 0);
                black_box((m, removed))
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_find_hit_10k(c: &mut Criterion) {
    c.bench_function("handle::find_hit_10k_on_100k", |b| {
        let mut m = HandleHashMap::new();
        let keys: Vec<u64> = lcg(7).take(100_000).collect();
        for (i, k) in keys.iter().enumerate() {
            m.put(*k, i as u64);
        }
        let n = keys.len();
        let mut s = 0x9e3779b97f4a7c15u64;
        let queries: Vec<u64> = (0..10_000)
            .map(|_| {
                s = s.wrapping_mul(2862933555777941757).wrapping_add(3037000493);
                keys[(s as usize) % n]
            })
            .collect();
        b.iter(|| {
            for k in &queries {
                black_box(m.find(k));
            }
        })
    });
}

fn bench_config() -> Criterion {
    Criterion::default()
        .sample_size(12)
        .measurement_time(Duration::from_secs(5))
        .warm_up_time(Duration::from_secs(1))
}

criterion_group! {
    name = benches;
    config = bench_config();
    targets = bench_put_fresh_100k, bench_put_reserved_100k, bench_remove_random_10k,
        bench_retain_half_100k, bench_find_hit_10k
}

criterion_main!(benches);
