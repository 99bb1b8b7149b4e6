//! Schedule generator throughput.
//!
//! The open-loop scheduler walks these iterators on the dispatch hot path,
//! so generation must stay far cheaper than the sleeps between arrivals.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;

use infbench::clock::{ConstantSchedule, PoissonSchedule, TraceSchedule};

fn bench_constant(c: &mut Criterion) {
    c.bench_function("constant_schedule_10k", |b| {
        b.iter(|| {
            let mut rng = StdRng::seed_from_u64(7);
            let schedule = ConstantSchedule::new(black_box(100.0), black_box(100.0), 0.0, &mut rng);
            schedule.fold(0.0, |acc, t| acc + t)
        })
    });
}

fn bench_poisson(c: &mut Criterion) {
    c.bench_function("poisson_schedule_10k", |b| {
        b.iter(|| {
            let mut rng = StdRng::seed_from_u64(7);
            let schedule = PoissonSchedule::new(black_box(100.0), 0.0, &mut rng);
            schedule.take(10_000).fold(0.0, |acc, t| acc + t)
        })
    });
}

fn bench_trace(c: &mut Criterion) {
    let timestamps: Vec<f64> = (0..1_000).map(|i| i as f64 * 0.01).collect();
    c.bench_function("trace_schedule_10k", |b| {
        b.iter(|| {
            let schedule = TraceSchedule::new(black_box(&timestamps), 0.0);
            schedule.take(10_000).fold(0.0, |acc, t| acc + t)
        })
    });
}

criterion_group!(benches, bench_constant, bench_poisson, bench_trace);
criterion_main!(benches);
