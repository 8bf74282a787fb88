//! Benchmarks for the generational handle pool.
//!
//! Covers the three hot operations: acquire (free-list pop), closure access
//! through a live handle, and release (free-list push + generation bump),
//! each at several pool sizes to observe scaling behavior.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use hearth_containers::prelude::HandlePool;
use std::hint::black_box;

fn benchmark_acquire(c: &mut Criterion) {
    let mut group = c.benchmark_group("handle_pool_acquire");
    for size in [100u32, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::new("acquire", size), size, |b, &size| {
            b.iter(|| {
                let pool: HandlePool<u64> = HandlePool::new(size);
                for i in 0..size as u64 {
                    black_box(pool.acquire(black_box(i)).unwrap());
                }
                black_box(pool)
            });
        });
    }
    group.finish();
}

fn benchmark_with(c: &mut Criterion) {
    let mut group = c.benchmark_group("handle_pool_with");
    for size in [100u32, 1000, 10000].iter() {
        let pool: HandlePool<u64> = HandlePool::new(*size);
        let handles: Vec<_> = (0..*size as u64)
            .map(|i| pool.acquire(i).unwrap())
            .collect();
        group.bench_with_input(BenchmarkId::new("with", size), size, |b, _| {
            b.iter(|| {
                let mut sum = 0u64;
                for handle in &handles {
                    sum += pool.with(handle, |v| *v).unwrap();
                }
                black_box(sum)
            });
        });
    }
    group.finish();
}

fn benchmark_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("handle_pool_release");
    for size in [100u32, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::new("release", size), size, |b, &size| {
            b.iter(|| {
                let pool: HandlePool<u64> = HandlePool::new(size);
                let handles: Vec<_> = (0..size as u64)
                    .map(|i| pool.acquire(i).unwrap())
                    .collect();
                for handle in handles {
                    black_box(pool.release(handle).unwrap());
                }
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    benchmark_acquire,
    benchmark_with,
    benchmark_release
);
criterion_main!(benches);
