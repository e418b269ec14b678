use criterion::{black_box, criterion_group, criterion_main, Criterion};
use syncroom_core::{BufferConfig, ClockSynchronizer, TimedAudioBuffer};

fn make_buffer() -> TimedAudioBuffer {
    TimedAudioBuffer::new(BufferConfig {
        sample_rate: 48_000,
        channels: 2,
        capacity_ms: 500,
        scheduled_start_grace_window_us: 10_000,
        calibrated_startup_latency_us: 0,
        startup_grace_us: 500_000,
        reanchor_threshold_us: 500_000,
    })
}

fn benchmark_write(c: &mut Criterion) {
    let buffer = make_buffer();
    let sync = ClockSynchronizer::new(0.0);
    let chunk = vec![0.25f32; 1024 * 2];

    c.bench_function("buffer_write_1024_frames_stereo", |b| {
        b.iter(|| buffer.write(black_box(&chunk), black_box(0), black_box(&sync)));
    });
}

fn benchmark_read_raw(c: &mut Criterion) {
    let buffer = make_buffer();
    let sync = ClockSynchronizer::new(0.0);
    let mut out = vec![0.0f32; 1024 * 2];

    c.bench_function("buffer_read_raw_1024_frames_stereo", |b| {
        b.iter(|| {
            buffer.write(&vec![0.25f32; 1024 * 2], 0, &sync);
            buffer.read_raw(black_box(&mut out), black_box(0))
        });
    });
}

fn benchmark_frame_accounting(c: &mut Criterion) {
    let buffer = make_buffer();
    let sync = ClockSynchronizer::new(0.0);
    buffer.write(&vec![0.25f32; 48_000 * 2], 0, &sync);
    let mut frame = [0.0f32; 2];

    c.bench_function("buffer_consume_frame_then_record_emission", |b| {
        b.iter(|| {
            buffer.consume_frame(black_box(&mut frame));
            buffer.record_emission(black_box(2), black_box(0));
        });
    });
}

criterion_group!(benches, benchmark_write, benchmark_read_raw, benchmark_frame_accounting);
criterion_main!(benches);
