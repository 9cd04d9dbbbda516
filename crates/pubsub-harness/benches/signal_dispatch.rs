//! Performance benchmarks for delivery dispatch.
//!
//! Measures the cost of filter matching and of releasing a waiting task
//! through a correlation signal.

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use pubsub_harness::adapter::topic;
use pubsub_harness::{CorrelationSignal, Delivery, DeliveryCollector, DeliveryHandler, Payload};

/// Benchmark filter matching for exact, single-level and multi-level filters.
fn bench_topic_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("topic_matching");
    let topic = "sensors/building-1/floor-3/room-12/temp";

    for filter in [
        "sensors/building-1/floor-3/room-12/temp",
        "sensors/+/+/+/temp",
        "sensors/#",
        "other/#",
    ] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("matches", filter), &filter, |b, f| {
            b.iter(|| black_box(topic::matches(black_box(f), black_box(topic))));
        });
    }

    group.finish();
}

/// Benchmark counting a signal down without any waiter.
fn bench_signal_countdown(c: &mut Criterion) {
    let mut group = c.benchmark_group("signal_countdown");

    for count in [1usize, 100, 10_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("signal", count), &count, |b, &n| {
            b.iter(|| {
                let signal = CorrelationSignal::new(n);
                for _ in 0..n {
                    signal.signal();
                }
                black_box(signal.is_released())
            });
        });
    }

    group.finish();
}

/// Benchmark a waiter released by a task on another worker.
fn bench_signal_wakeup(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    c.bench_function("signal_wakeup", |b| {
        b.to_async(&rt).iter(|| async {
            let signal = CorrelationSignal::one();
            let producer = signal.clone();
            tokio::spawn(async move { producer.signal() });
            black_box(signal.wait(Duration::from_secs(1)).await)
        });
    });
}

/// Benchmark collecting a batch of deliveries through the handler seam.
fn bench_collector(c: &mut Criterion) {
    let mut group = c.benchmark_group("collector");
    let delivery = Delivery::new("tutorial/topic", Payload::from("Hello subscriber!"));

    for batch in [10usize, 1000] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("on_message", batch), &batch, |b, &n| {
            b.iter(|| {
                let collector = DeliveryCollector::new(n);
                for _ in 0..n {
                    collector.on_message(&delivery);
                }
                black_box(collector.signal().is_released())
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_topic_matching,
    bench_signal_countdown,
    bench_signal_wakeup,
    bench_collector,
);
criterion_main!(benches);
