//! Benchmarks for the size-classed buffer pool

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nvpk_rs::{BufferPool, BufferPoolConfig};
use std::thread;

fn benchmark_acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_pool_acquire_release");

    for size in [4 * 1024, 64 * 1024, 1024 * 1024].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let pool = BufferPool::new(BufferPoolConfig::default());
            b.iter(|| {
                let mut buf = pool.acquire(black_box(size)).unwrap();
                buf.push(1);
                black_box(buf.len());
            });
        });
    }

    group.finish();
}

fn benchmark_cold_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_pool_cold");

    for size in [4 * 1024, 64 * 1024, 1024 * 1024].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                // Fresh pool every iteration, so every acquire misses
                let pool = BufferPool::new(BufferPoolConfig::default());
                black_box(pool.acquire(size).unwrap());
            });
        });
    }

    group.finish();
}

fn benchmark_mixed_classes(c: &mut Criterion) {
    c.bench_function("buffer_pool_mixed_classes", |b| {
        let pool = BufferPool::new(BufferPoolConfig::default());
        let sizes = [1000, 5000, 70_000, 300_000, 2_000_000];
        b.iter(|| {
            let held: Vec<_> = sizes.iter().map(|&s| pool.acquire(s).unwrap()).collect();
            black_box(held.len());
        });
    });
}

fn benchmark_into_vec(c: &mut Criterion) {
    c.bench_function("buffer_pool_into_vec", |b| {
        let pool = BufferPool::new(BufferPoolConfig::default());
        b.iter(|| {
            let mut buf = pool.acquire(64 * 1024).unwrap();
            buf.extend_from_slice(&[7u8; 1024]);
            black_box(buf.into_vec());
        });
    });
}

fn benchmark_concurrent(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_pool_concurrent");

    for threads in [2, 4, 8].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            threads,
            |b, &threads| {
                let pool = BufferPool::new(BufferPoolConfig::default());
                b.iter(|| {
                    let handles: Vec<_> = (0..threads)
                        .map(|_| {
                            let pool = pool.clone();
                            thread::spawn(move || {
                                for _ in 0..100 {
                                    black_box(pool.acquire(16 * 1024).unwrap());
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.join().unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_acquire_release,
    benchmark_cold_allocation,
    benchmark_mixed_classes,
    benchmark_into_vec,
    benchmark_concurrent
);
criterion_main!(benches);
