use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use herald_core::ManualClock;
use herald_delivery::rate_limiter::Bucket;
use herald_delivery::{InMemorySharedStore, RateLimitPolicy, RateLimiter};

fn bench_bucket_math(c: &mut Criterion) {
    let policy = RateLimitPolicy::new("bench", 100, Duration::from_secs(60));
    let t0 = Utc::now();

    let mut group = c.benchmark_group("bucket");
    group.throughput(Throughput::Elements(1));

    group.bench_function("refill_and_consume", |b| {
        let mut bucket = Bucket::full(&policy, t0);
        let mut now = t0;
        b.iter(|| {
            now += chrono::Duration::milliseconds(250);
            bucket = bucket.refilled(&policy, now);
            black_box(bucket.try_consume(1.0));
        });
    });

    group.bench_function("retry_after_empty", |b| {
        let mut bucket = Bucket::full(&policy, t0);
        while bucket.try_consume(1.0) {}
        b.iter(|| black_box(bucket.retry_after(&policy)));
    });

    group.finish();
}

fn bench_limiter_admit(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("tokio runtime");

    let mut group = c.benchmark_group("limiter_admit");
    for subjects in [1usize, 100, 10_000] {
        group.throughput(Throughput::Elements(subjects as u64));
        group.bench_with_input(BenchmarkId::from_parameter(subjects), &subjects, |b, &subjects| {
            let clock = ManualClock::starting_now();
            let store = Arc::new(InMemorySharedStore::with_clock(clock.clone()));
            let limiter = RateLimiter::new(store, clock);
            let policy = RateLimitPolicy::sms_send();
            let names: Vec<String> = (0..subjects).map(|i| format!("actor-{i}")).collect();

            b.iter(|| {
                runtime.block_on(async {
                    for name in &names {
                        black_box(limiter.admit(name, 1, &policy).await);
                    }
                })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_bucket_math, bench_limiter_admit);
criterion_main!(benches);
