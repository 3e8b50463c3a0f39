//! Pipeline benchmarks
//!
//! Measures per-element overhead of synchronous assembly and drain paths.

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use rill_core::testkit::TestSubscriber;
use rill_core::Flow;
use std::hint::black_box;

/// Benchmark a plain map/filter chain drained with unbounded demand.
fn bench_map_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_filter");

    for element_count in &[1_000usize, 10_000, 100_000] {
        group.throughput(Throughput::Elements(*element_count as u64));
        group.bench_function(format!("{element_count}_elements"), |b| {
            let count = *element_count;
            b.iter(|| {
                let probe = TestSubscriber::unbounded();
                Flow::range(0, count)
                    .filter(|n| n % 2 == 0)
                    .map(|n| n * 3)
                    .subscribe(probe.clone());
                black_box(probe.value_count())
            });
        });
    }

    group.finish();
}

/// Benchmark flat_map over small inner flows, sequential vs concurrent.
fn bench_flat_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("flat_map");
    group.throughput(Throughput::Elements(10_000));

    group.bench_function("concat_map_10k", |b| {
        b.iter(|| {
            let probe = TestSubscriber::unbounded();
            Flow::range(0, 1_000)
                .concat_map(|n| Flow::range(n, 10))
                .subscribe(probe.clone());
            black_box(probe.value_count())
        });
    });

    group.bench_function("flat_map_unordered_10k", |b| {
        b.iter(|| {
            let probe = TestSubscriber::unbounded();
            Flow::range(0, 1_000)
                .flat_map_with(8, |n| Flow::range(n, 10))
                .subscribe(probe.clone());
            black_box(probe.value_count())
        });
    });

    group.finish();
}

/// Benchmark zip, which queues on both sides and drains pairwise.
fn bench_zip(c: &mut Criterion) {
    let mut group = c.benchmark_group("zip");
    group.throughput(Throughput::Elements(10_000));

    group.bench_function("zip_10k_pairs", |b| {
        b.iter(|| {
            let probe = TestSubscriber::unbounded();
            Flow::zip(Flow::range(0, 10_000), Flow::range(0, 10_000), |a, b| {
                a + b
            })
            .subscribe(probe.clone());
            black_box(probe.value_count())
        });
    });

    group.finish();
}

/// Benchmark the demand ledger under many small requests.
fn bench_bounded_requests(c: &mut Criterion) {
    let mut group = c.benchmark_group("bounded_requests");
    group.throughput(Throughput::Elements(10_000));

    group.bench_function("request_one_at_a_time_10k", |b| {
        b.iter(|| {
            let probe = TestSubscriber::with_initial_request(1);
            Flow::range(0, 10_000).subscribe(probe.clone());
            while probe.value_count() < 10_000 {
                probe.request(1);
            }
            black_box(probe.value_count())
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_map_filter,
    bench_flat_map,
    bench_zip,
    bench_bounded_requests
);
criterion_main!(benches);
