//! External collaborator traits: the decoder and output device the
//! orchestrator drives, trimmed down from the teacher's
//! `audio::output::AudioOutput` to the pull/push surface this crate
//! actually needs (device enumeration, volume ramping and backend
//! selection stay outside this crate's boundary).

use async_trait::async_trait;

use crate::error::{AudioOutputError, DecoderError};
use crate::format::AudioFormat;

/// Decodes compressed chunks into interleaved `f32` PCM at `format()`.
///
/// Decoding itself (ALAC/AAC/PCM passthrough) is out of scope for this
/// crate; implementors live in the surrounding application and are handed
/// to the orchestrator as a trait object.
pub trait Decoder: Send {
    /// Decodes one chunk, appending interleaved samples to `out`.
    ///
    /// # Errors
    /// Returns [`DecoderError::DecodeFailed`] on corrupt or truncated input.
    fn decode(&mut self, chunk: &[u8], out: &mut Vec<f32>) -> Result<(), DecoderError>;

    /// The PCM format this decoder produces.
    fn format(&self) -> AudioFormat;
}

/// A playback device lifecycle handle.
///
/// This trait only covers lifecycle (open/close, latency reporting); the
/// real-time sample path does not go through it. Instead the surrounding
/// application wires its OS audio callback directly to
/// [`crate::pipeline::AudioPipelineOrchestrator::pull_frame`], matching the
/// pull-model callback signature `(out_buf, now_local_us) -> usize` from
/// the external interface contract — keeping the allocation-free hot path
/// entirely synchronous and out of `async fn` / trait-object dispatch.
#[async_trait]
pub trait AudioOutput: Send {
    /// Opens the device for `format`.
    ///
    /// # Errors
    /// Returns [`AudioOutputError::FormatNotSupported`] or
    /// [`AudioOutputError::DeviceError`].
    async fn open(&mut self, format: &AudioFormat) -> Result<(), AudioOutputError>;

    /// Informational output latency, in microseconds.
    fn output_latency_us(&self) -> i64;

    /// Prefill/startup latency baked into the scheduled-start math: 0 for
    /// pull-model backends, nonzero for push-model backends that prefill
    /// before the callback starts.
    fn calibrated_startup_latency_us(&self) -> i64;

    /// Closes the device, releasing any OS resources.
    async fn close(&mut self);
}

/// Events the transport layer (network receiver, not modeled in this
/// crate) reports to the orchestrator.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A compressed audio chunk with its server-clock timestamp.
    Chunk {
        server_timestamp_us: i64,
        data: Vec<u8>,
    },
    /// A completed NTP-style timing exchange.
    TimingSample { t1: i64, t2: i64, t3: i64, t4: i64 },
    /// The sender signaled a format change (new stream).
    FormatChanged(AudioFormat),
    /// The sender signaled the stream ended.
    StreamEnded,
}
