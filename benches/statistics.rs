use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use smtp_sampler::message::{extract_header, MessageTemplate};
use smtp_sampler::metrics::{RunningStatistics, TimingCategory};

fn benchmark_add_sample(c: &mut Criterion) {
    let stats = RunningStatistics::new(TimingCategory::MessageSend).unwrap();
    let mut value = 1_000_000u64;
    c.bench_function("running_statistics_add_sample", |b| {
        b.iter(|| {
            value = value.wrapping_add(7919) % 50_000_000 + 1;
            stats.add_sample(black_box(value));
        })
    });
}

fn benchmark_contended_add_sample(c: &mut Criterion) {
    c.bench_function("running_statistics_contended_4x1000", |b| {
        b.iter(|| {
            let stats = Arc::new(RunningStatistics::new(TimingCategory::MessageSend).unwrap());
            let workers: Vec<_> = (0..4)
                .map(|worker| {
                    let stats = stats.clone();
                    thread::spawn(move || {
                        for i in 0..1000u64 {
                            stats.add_sample(1_000 + worker * 1_000 + i);
                        }
                    })
                })
                .collect();
            for worker in workers {
                worker.join().unwrap();
            }
            black_box(stats.snapshot(0.05))
        })
    });
}

fn benchmark_snapshot(c: &mut Criterion) {
    let stats = RunningStatistics::new(TimingCategory::RoundTrip).unwrap();
    for i in 0..100_000u64 {
        stats.add_sample(1_000_000 + (i * 7919) % 10_000_000);
    }
    c.bench_function("running_statistics_snapshot", |b| {
        b.iter(|| black_box(stats.snapshot(0.05)))
    });
}

fn benchmark_stamp_and_extract(c: &mut Criterion) {
    let mut message = MessageTemplate::generate("bench", "from@localhost", "to@localhost", 1024);
    let mut id = 0u64;
    c.bench_function("message_stamp_serialize_extract", |b| {
        b.iter(|| {
            id += 1;
            message.set_header("X-BENCHMARK-MESSAGE-ID", &id.to_string());
            let payload = message.to_bytes();
            black_box(extract_header(&payload, "X-BENCHMARK-MESSAGE-ID"))
        })
    });
}

criterion_group!(
    benches,
    benchmark_add_sample,
    benchmark_contended_add_sample,
    benchmark_snapshot,
    benchmark_stamp_and_extract
);
criterion_main!(benches);
