//! Audio Pipeline Orchestrator: lifecycle state machine gluing decoder,
//! buffer, controller and output device together, arming playback once the
//! buffer is full enough and the clock is synchronized.
//!
//! Grounded on `receiver::audio_pipeline::AudioPipeline` for the
//! decode→buffer→output wiring and on `connection::state::ConnectionState`/
//! `ConnectionEvent` for the state-machine and event-enum shape.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex as AsyncMutex, Notify};

use crate::buffer::{BufferConfig, BufferStats, TimedAudioBuffer};
use crate::clock::MonotonicClock;
use crate::config::Config;
use crate::controller::{ControllerConfig, ControllerStats, SyncCorrectionController};
use crate::error::{ConfigError, PipelineError};
use crate::events::{EventBus, PipelineEvent};
use crate::format::AudioFormat;
use crate::sync::{ClockSyncStatus, ClockSynchronizer};
use crate::transport::{AudioOutput, Decoder, TransportEvent};

/// Pipeline lifecycle state. `Error` is reachable from any other state;
/// `Clear` moves `Playing` back to `Buffering`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum PipelineState {
    Idle,
    Starting,
    Buffering,
    Playing,
    Stopping,
    Error,
}

/// Observability snapshot combining every collaborator's stats.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PipelineStats {
    pub state: PipelineState,
    pub buffer: Option<BufferStats>,
    pub controller: Option<ControllerStats>,
    pub clock_sync: ClockSyncStatus,
}

struct StreamInner {
    buffer: TimedAudioBuffer,
    controller: std::sync::Mutex<SyncCorrectionController>,
    format: AudioFormat,
    buffer_ready_since_us: std::sync::Mutex<Option<i64>>,
}

/// Manages one stream's lifecycle end to end. Cheap to construct; expensive
/// collaborators (decoder, buffer, output) only exist between `start` and
/// `stop`/teardown-on-error.
pub struct AudioPipelineOrchestrator {
    config: Config,
    clock: Arc<MonotonicClock>,
    sync: Arc<ClockSynchronizer>,
    state: std::sync::Mutex<PipelineState>,
    current: std::sync::Mutex<Option<Arc<StreamInner>>>,
    decoder: AsyncMutex<Option<Box<dyn Decoder>>>,
    output: AsyncMutex<Option<Box<dyn AudioOutput>>>,
    events: EventBus,
    early_chunk_queue: std::sync::Mutex<VecDeque<(i64, Vec<u8>)>>,
    volume: AtomicU8,
    muted: AtomicBool,
    reanchor_notify: Notify,
    reanchor_flag: AtomicBool,
    decode_scratch: std::sync::Mutex<Vec<f32>>,
}

impl AudioPipelineOrchestrator {
    /// # Errors
    /// Returns [`ConfigError`] if `config` fails [`Config::validate`].
    pub fn new(config: Config, clock: Arc<MonotonicClock>, sync: Arc<ClockSynchronizer>) -> Result<Self, ConfigError> {
        config.validate()?;
        let capacity = config.early_chunk_queue_capacity;
        Ok(Self {
            config,
            clock,
            sync,
            state: std::sync::Mutex::new(PipelineState::Idle),
            current: std::sync::Mutex::new(None),
            decoder: AsyncMutex::new(None),
            output: AsyncMutex::new(None),
            events: EventBus::new(),
            early_chunk_queue: std::sync::Mutex::new(VecDeque::with_capacity(capacity)),
            volume: AtomicU8::new(100),
            muted: AtomicBool::new(false),
            reanchor_notify: Notify::new(),
            reanchor_flag: AtomicBool::new(false),
            decode_scratch: std::sync::Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn state(&self) -> PipelineState {
        *self.state.lock().unwrap()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        let stream = self.current.lock().unwrap().clone();
        PipelineStats {
            state: self.state(),
            buffer: stream.as_ref().map(|s| s.buffer.stats()),
            controller: stream.as_ref().map(|s| s.controller.lock().unwrap().stats()),
            clock_sync: self.sync.status(),
        }
    }

    fn set_state(&self, to: PipelineState) {
        let from = {
            let mut guard = self.state.lock().unwrap();
            let from = *guard;
            *guard = to;
            from
        };
        if from != to {
            self.events.emit(PipelineEvent::StateChanged { from, to });
        }
    }

    fn fail(&self, err: PipelineError) {
        tracing::warn!(error = %err, "pipeline entering error state");
        self.set_state(PipelineState::Error);
        self.events.emit(PipelineEvent::ErrorOccurred(Arc::new(err)));
    }

    /// Builds decoder/buffer/controller/output for a new stream and enters
    /// `Buffering`. Stops any prior stream first.
    ///
    /// # Errors
    /// Returns [`PipelineError::DeviceInit`] if the output device fails to
    /// open.
    pub async fn start(
        &self,
        format: AudioFormat,
        decoder: Box<dyn Decoder>,
        mut output: Box<dyn AudioOutput>,
    ) -> Result<(), PipelineError> {
        if self.state() != PipelineState::Idle {
            self.stop().await;
        }
        self.set_state(PipelineState::Starting);

        if let Err(e) = output.open(&format).await {
            let err = PipelineError::DeviceInit(e);
            self.fail(err.clone());
            return Err(err);
        }

        let buffer_config = BufferConfig {
            sample_rate: format.sample_rate,
            channels: format.channels,
            capacity_ms: self.config.buffer_capacity_ms,
            scheduled_start_grace_window_us: self.config.scheduled_start_grace_window_us,
            calibrated_startup_latency_us: output.calibrated_startup_latency_us(),
            startup_grace_us: self.config.startup_grace_us,
            reanchor_threshold_us: self.config.reanchor_threshold_us,
        };
        let controller_config = ControllerConfig {
            sample_rate: format.sample_rate,
            channels: format.channels,
            deadband_us: self.config.deadband_us as f64,
            resampling_threshold_us: self.config.resampling_threshold_us as f64,
            max_speed_correction: self.config.max_speed_correction,
            correction_target_seconds: self.config.correction_target_seconds,
            startup_grace_us: self.config.startup_grace_us,
        };

        let stream = Arc::new(StreamInner {
            buffer: TimedAudioBuffer::new(buffer_config),
            controller: std::sync::Mutex::new(SyncCorrectionController::new(controller_config)),
            format,
            buffer_ready_since_us: std::sync::Mutex::new(None),
        });

        *self.current.lock().unwrap() = Some(Arc::clone(&stream));
        *self.decoder.lock().await = Some(decoder);
        *self.output.lock().await = Some(output);

        self.set_state(PipelineState::Buffering);

        let pending: Vec<(i64, Vec<u8>)> = self.early_chunk_queue.lock().unwrap().drain(..).collect();
        for (ts, bytes) in pending {
            self.process_chunk(ts, &bytes).await;
        }

        Ok(())
    }

    /// Decodes and writes one chunk, checking readiness if still buffering.
    /// Decoder failures are logged and the chunk is skipped.
    pub async fn process_chunk(&self, server_timestamp_us: i64, encoded_bytes: &[u8]) {
        let state = self.state();
        if state == PipelineState::Starting || (state == PipelineState::Idle && self.current.lock().unwrap().is_none()) {
            let mut queue = self.early_chunk_queue.lock().unwrap();
            if queue.len() >= self.config.early_chunk_queue_capacity {
                // Overflow drops newest: the incoming chunk itself is discarded,
                // the already-queued chunks are left untouched.
                return;
            }
            queue.push_back((server_timestamp_us, encoded_bytes.to_vec()));
            return;
        }
        if state != PipelineState::Buffering && state != PipelineState::Playing {
            return;
        }

        let Some(stream) = self.current.lock().unwrap().clone() else {
            return;
        };

        let mut decoder_guard = self.decoder.lock().await;
        let Some(decoder) = decoder_guard.as_mut() else {
            return;
        };
        let mut scratch = self.decode_scratch.lock().unwrap();
        scratch.clear();
        if let Err(e) = decoder.decode(encoded_bytes, &mut scratch) {
            tracing::warn!(error = %e, "dropping undecodable chunk");
            return;
        }
        stream.buffer.write(&scratch, server_timestamp_us, &self.sync);
        drop(scratch);
        drop(decoder_guard);

        if self.state() == PipelineState::Buffering {
            self.evaluate_readiness(&stream).await;
        }
    }

    async fn evaluate_readiness(&self, stream: &Arc<StreamInner>) {
        let target_samples = (u64::from(self.config.target_buffer_ms) * u64::from(stream.format.sample_rate)
            / 1000
            * u64::from(stream.format.channels)) as usize;
        let fill = stream.buffer.stats().fill_samples;
        if (fill as f64) < 0.8 * target_samples as f64 {
            return;
        }

        if self.sync.has_minimal_sync() {
            self.set_state(PipelineState::Playing);
            return;
        }

        let now = self.clock.now_us();
        let ready_since = {
            let mut guard = stream.buffer_ready_since_us.lock().unwrap();
            if guard.is_none() {
                *guard = Some(now);
            }
            guard.unwrap()
        };

        if self.sync.is_converged() {
            self.set_state(PipelineState::Playing);
            return;
        }

        let elapsed_ms = (now - ready_since) / 1000;
        if elapsed_ms >= self.config.convergence_timeout_ms as i64 {
            tracing::warn!("starting playback without clock convergence after timeout");
            self.set_state(PipelineState::Playing);
        }
    }

    /// Real-time-safe sample source: fills `out` with up to `out.len()`
    /// corrected interleaved samples. Allocation-free, synchronous, no
    /// locks held across awaits — safe to call from an OS audio callback.
    /// Returns silence and `0` whenever not in `Playing`.
    pub fn pull_frame(&self, out: &mut [f32], now_local_us: i64) -> usize {
        if self.state() != PipelineState::Playing {
            out.fill(0.0);
            return 0;
        }
        let Some(stream) = self.current.lock().unwrap().clone() else {
            out.fill(0.0);
            return 0;
        };

        if stream.buffer.poll_reanchor() {
            out.fill(0.0);
            self.reanchor_flag.store(true, Ordering::Release);
            self.reanchor_notify.notify_one();
            return 0;
        }

        let channels = stream.format.channels as usize;
        let mut produced = 0;
        let mut controller = stream.controller.lock().unwrap();
        let elapsed_output_us = stream.buffer.elapsed_output_us();
        controller.update(stream.buffer.smoothed_error_us(), elapsed_output_us);
        while produced + channels <= out.len() {
            controller.next_frame(&stream.buffer, &mut out[produced..produced + channels], now_local_us);
            produced += channels;
        }
        if produced < out.len() {
            out[produced..].fill(0.0);
        }
        produced
    }

    /// Background task: awaits a re-anchor request raised from
    /// [`pull_frame`](Self::pull_frame) and runs [`clear`](Self::clear) for
    /// it. Spawn once per orchestrator instance, e.g.
    /// `tokio::spawn(Arc::clone(&orchestrator).run_reanchor_watcher())`.
    pub async fn run_reanchor_watcher(self: Arc<Self>) {
        loop {
            self.reanchor_notify.notified().await;
            if self.reanchor_flag.swap(false, Ordering::AcqRel) {
                tracing::info!("re-anchor requested, clearing stream");
                self.clear().await;
            }
        }
    }

    /// Halts output and tears down the decoder/buffer for the current
    /// stream, returning to `Idle`.
    pub async fn stop(&self) {
        if self.state() == PipelineState::Idle {
            return;
        }
        self.set_state(PipelineState::Stopping);
        if let Some(mut output) = self.output.lock().await.take() {
            output.close().await;
        }
        *self.decoder.lock().await = None;
        *self.current.lock().unwrap() = None;
        self.early_chunk_queue.lock().unwrap().clear();
        self.set_state(PipelineState::Idle);
    }

    /// Resets buffer and controller state without tearing down the stream.
    /// If `Playing`, returns to `Buffering`. Used on re-anchor and on
    /// explicit client request.
    pub async fn clear(&self) {
        let Some(stream) = self.current.lock().unwrap().clone() else {
            return;
        };
        stream.buffer.clear();
        stream.controller.lock().unwrap().reset();
        *stream.buffer_ready_since_us.lock().unwrap() = None;
        if self.state() == PipelineState::Playing {
            self.set_state(PipelineState::Buffering);
        }
    }

    /// Caches and forwards the volume level (0..=100).
    pub fn set_volume(&self, v: u8) {
        self.volume.store(v.min(100), Ordering::Relaxed);
    }

    #[must_use]
    pub fn volume(&self) -> u8 {
        self.volume.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, m: bool) {
        self.muted.store(m, Ordering::Relaxed);
    }

    #[must_use]
    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Replaces the output device for the current stream, preserving
    /// buffered audio. Performs a soft-reset (buffer [`soft_reset`] +
    /// controller `reset`), applying the new device's calibrated startup
    /// latency, rather than a full [`clear`] — the already-decoded audio in
    /// the buffer is still valid, only the playback timeline and latency
    /// assumptions need to restart.
    ///
    /// [`soft_reset`]: crate::buffer::TimedAudioBuffer::soft_reset
    /// [`clear`]: crate::buffer::TimedAudioBuffer::clear
    ///
    /// # Errors
    /// Returns [`PipelineError::DeviceInit`] if the new device fails to open.
    pub async fn switch_device(&self, mut new_output: Box<dyn AudioOutput>) -> Result<(), PipelineError> {
        let Some(stream) = self.current.lock().unwrap().clone() else {
            return Ok(());
        };
        if let Err(e) = new_output.open(&stream.format).await {
            let err = PipelineError::DeviceInit(e);
            self.fail(err.clone());
            return Err(err);
        }
        let new_calibrated_startup_latency_us = new_output.calibrated_startup_latency_us();
        if let Some(mut old) = self.output.lock().await.take() {
            old.close().await;
        }
        *self.output.lock().await = Some(new_output);

        stream.buffer.soft_reset(new_calibrated_startup_latency_us);
        stream.controller.lock().unwrap().reset();
        *stream.buffer_ready_since_us.lock().unwrap() = None;
        if self.state() == PipelineState::Playing {
            self.set_state(PipelineState::Buffering);
        }
        Ok(())
    }

    /// Feeds one completed NTP-style timing exchange to the clock
    /// synchronizer.
    pub fn process_timing_sample(&self, t1: i64, t2: i64, t3: i64, t4: i64) {
        self.sync.process_measurement(t1, t2, t3, t4);
    }

    /// Dispatches one [`TransportEvent`] from the (unmodeled) network
    /// receiver: chunks and timing samples feed straight into
    /// [`process_chunk`](Self::process_chunk)/
    /// [`process_timing_sample`](Self::process_timing_sample); a format
    /// change or stream end tears down the current stream, since neither
    /// can be handled without the application supplying a new decoder and
    /// output via [`start`](Self::start).
    pub async fn process_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Chunk { server_timestamp_us, data } => {
                self.process_chunk(server_timestamp_us, &data).await;
            }
            TransportEvent::TimingSample { t1, t2, t3, t4 } => {
                self.process_timing_sample(t1, t2, t3, t4);
            }
            TransportEvent::FormatChanged(format) => {
                tracing::info!(?format, "stream format changed, stopping current stream");
                self.stop().await;
            }
            TransportEvent::StreamEnded => {
                tracing::info!("stream ended");
                self.stop().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::config::Config;
    use crate::error::{AudioOutputError, DecoderError};
    use crate::format::AudioFormat;

    struct EchoDecoder {
        format: AudioFormat,
    }

    impl Decoder for EchoDecoder {
        fn decode(&mut self, chunk: &[u8], out: &mut Vec<f32>) -> Result<(), DecoderError> {
            out.extend(chunk.chunks_exact(4).map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])));
            Ok(())
        }

        fn format(&self) -> AudioFormat {
            self.format.clone()
        }
    }

    struct StubOutput {
        calibrated_startup_latency_us: i64,
    }

    #[async_trait]
    impl AudioOutput for StubOutput {
        async fn open(&mut self, _format: &AudioFormat) -> Result<(), AudioOutputError> {
            Ok(())
        }

        fn output_latency_us(&self) -> i64 {
            0
        }

        fn calibrated_startup_latency_us(&self) -> i64 {
            self.calibrated_startup_latency_us
        }

        async fn close(&mut self) {}
    }

    fn samples_to_bytes(samples: &[f32]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn test_orchestrator(config: Config) -> Arc<AudioPipelineOrchestrator> {
        let clock = Arc::new(MonotonicClock::new());
        let sync = Arc::new(ClockSynchronizer::new(0.0));
        Arc::new(AudioPipelineOrchestrator::new(config, clock, sync).unwrap())
    }

    #[tokio::test]
    async fn early_chunk_queue_overflow_drops_the_newly_arriving_chunk() {
        let config = Config::default().early_chunk_queue_capacity(2);
        let orchestrator = test_orchestrator(config);

        orchestrator.process_chunk(0, &samples_to_bytes(&[1.0])).await;
        orchestrator.process_chunk(1, &samples_to_bytes(&[2.0])).await;
        orchestrator.process_chunk(2, &samples_to_bytes(&[3.0])).await; // over capacity

        let queued: Vec<i64> = orchestrator
            .early_chunk_queue
            .lock()
            .unwrap()
            .iter()
            .map(|(ts, _)| *ts)
            .collect();
        assert_eq!(queued, vec![0, 1], "the newly-arriving chunk (ts=2) must be the one dropped");
    }

    #[tokio::test]
    async fn switch_device_preserves_buffered_audio_and_applies_new_latency() {
        let config = Config::default()
            .target_buffer_ms(10)
            .buffer_capacity_ms(1000)
            .startup_grace_us(0)
            .scheduled_start_grace_window_us(1_000_000);
        let orchestrator = test_orchestrator(config);

        let format = AudioFormat::new("pcm", 1000, 1);
        orchestrator
            .start(
                format.clone(),
                Box::new(EchoDecoder { format }),
                Box::new(StubOutput { calibrated_startup_latency_us: 0 }),
            )
            .await
            .unwrap();

        orchestrator.process_chunk(0, &samples_to_bytes(&[0.1, 0.2, 0.3])).await;
        let fill_before = orchestrator.stats().buffer.unwrap().fill_samples;
        assert!(fill_before > 0);

        orchestrator
            .switch_device(Box::new(StubOutput { calibrated_startup_latency_us: 5_000 }))
            .await
            .unwrap();

        assert_eq!(
            orchestrator.stats().buffer.unwrap().fill_samples,
            fill_before,
            "switching output devices must not discard already-buffered audio"
        );
    }

    #[tokio::test]
    async fn process_transport_event_dispatches_chunk_and_stream_ended() {
        let config = Config::default()
            .target_buffer_ms(10)
            .buffer_capacity_ms(1000)
            .startup_grace_us(0)
            .scheduled_start_grace_window_us(1_000_000);
        let orchestrator = test_orchestrator(config);

        let format = AudioFormat::new("pcm", 1000, 1);
        orchestrator
            .start(
                format.clone(),
                Box::new(EchoDecoder { format }),
                Box::new(StubOutput { calibrated_startup_latency_us: 0 }),
            )
            .await
            .unwrap();

        orchestrator
            .process_transport_event(TransportEvent::Chunk {
                server_timestamp_us: 0,
                data: samples_to_bytes(&[0.1, 0.2]),
            })
            .await;
        assert!(orchestrator.stats().buffer.unwrap().fill_samples > 0);

        orchestrator.process_transport_event(TransportEvent::StreamEnded).await;
        assert_eq!(orchestrator.state(), PipelineState::Idle);
    }
}

