//! Benchmark: barrier, allocation and cycle costs.
//!
//! Measures the read barrier's fast path, bump allocation with safepoint
//! polling, and full cycles over live lists of increasing size.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use pauseless_gc::{Heap, HeapConfig, Mutator, ObjectShape, Value};
use std::hint::black_box;
use std::time::{Duration, Instant};

const NODE: ObjectShape = ObjectShape::new(1, 1);

fn heap() -> Heap {
    Heap::new(HeapConfig::new(32 * 1024, 256 * 1024 * 1024).with_gc_threads(2)).unwrap()
}

/// Roots a list of `len` nodes; returns the root index.
fn live_list(m: &mut Mutator, len: usize) -> usize {
    let head = m.push_root(Value::Null);
    for i in 0..len {
        let node = m.allocate(NODE);
        m.write_word(node, 0, i);
        let next = m.root(head);
        m.write_field(node, 0, next);
        m.set_root(head, Value::Object(node));
    }
    head
}

fn bench_read_barrier_fast_path(c: &mut Criterion) {
    let heap = heap();
    let mut m = heap.mutator();
    let a = m.allocate(NODE);
    let b = m.allocate(NODE);
    m.write_field(a, 0, Value::Object(b));

    c.bench_function("read_barrier_fast_path", |bench| {
        bench.iter(|| black_box(m.read_field(black_box(a), 0)));
    });
}

fn bench_allocation(c: &mut Criterion) {
    let heap = heap();
    let mut m = heap.mutator();

    c.bench_function("allocate_1000_small_objects", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                black_box(m.allocate(NODE));
            }
            m.safepoint();
        });
    });
}

fn bench_full_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_cycle");
    group.sample_size(20);
    for len in [100, 1_000, 10_000] {
        let heap = heap();
        let mut m = heap.mutator();
        live_list(&mut m, len);
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, _| {
            b.iter(|| m.collect());
        });
    }
    group.finish();
}

/// Longest gap between safepoints returning while cycles run underneath.
fn bench_safepoint_latency(c: &mut Criterion) {
    let heap = heap();
    let mut m = heap.mutator();
    live_list(&mut m, 10_000);

    c.bench_function("worst_safepoint_during_cycle", |b| {
        b.iter_custom(|iters| {
            let mut worst = Duration::ZERO;
            for _ in 0..iters {
                heap.request_collection();
                let target = heap.cycles() + 1;
                while heap.cycles() < target {
                    let start = Instant::now();
                    m.safepoint();
                    worst = worst.max(start.elapsed());
                }
            }
            worst * u32::try_from(iters).unwrap_or(u32::MAX)
        });
    });
}

criterion_group!(
    benches,
    bench_read_barrier_fast_path,
    bench_allocation,
    bench_full_cycle,
    bench_safepoint_latency
);
criterion_main!(benches);
