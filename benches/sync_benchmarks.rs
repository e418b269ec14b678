use criterion::{black_box, criterion_group, criterion_main, Criterion};
use syncroom_core::ClockSynchronizer;

fn benchmark_process_measurement(c: &mut Criterion) {
    let sync = ClockSynchronizer::new(0.0);
    let mut t = 0i64;

    c.bench_function("clock_sync_process_measurement", |b| {
        b.iter(|| {
            let t1 = black_box(t);
            let t2 = t1 + 5_500;
            let t3 = t2 + 100;
            let t4 = t1 + 11_000;
            sync.process_measurement(t1, t2, t3, t4);
            t += 50_000;
        });
    });
}

fn benchmark_server_to_local(c: &mut Criterion) {
    let sync = ClockSynchronizer::new(0.0);
    for i in 0..20 {
        let base = i * 50_000;
        sync.process_measurement(base, base + 5_500, base + 5_600, base + 11_000);
    }

    c.bench_function("clock_sync_server_to_local", |b| {
        b.iter(|| sync.server_to_local(black_box(123_456_789)));
    });
}

criterion_group!(benches, benchmark_process_measurement, benchmark_server_to_local);
criterion_main!(benches);
