//! Clock synchronization, timed audio buffering and sync correction core for
//! a multi-room audio endpoint.
//!
//! This crate is the synchronized-playback engine, not a full player: it
//! owns clock sync, jitter buffering and drift correction, and exposes a
//! pull-model sample source for the surrounding application to wire into
//! its own audio output device and network transport.
//!
//! - [`clock`] — monotonic local time with a non-decreasing guarantee.
//! - [`sync`] — server/local clock offset and drift estimation.
//! - [`buffer`] — timestamp-aware jitter buffer with scheduled start.
//! - [`controller`] — tiered sync correction policy (resample/drop/insert).
//! - [`pipeline`] — lifecycle orchestration wiring the above together.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod buffer;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
#[cfg(feature = "tokio-runtime")]
pub mod events;
pub mod format;
#[cfg(feature = "tokio-runtime")]
pub mod pipeline;
pub mod sync;
pub mod transport;

pub use buffer::{BufferConfig, BufferStats, TimedAudioBuffer};
pub use clock::MonotonicClock;
pub use config::Config;
pub use controller::{ControllerConfig, ControllerStats, CorrectionMode, SyncCorrectionController};
pub use error::{AudioOutputError, ConfigError, DecoderError, PipelineError};
pub use format::AudioFormat;
pub use sync::{ClockSyncStatus, ClockSynchronizer};
pub use transport::{AudioOutput, Decoder, TransportEvent};

#[cfg(feature = "tokio-runtime")]
pub use events::{EventBus, PipelineEvent};
#[cfg(feature = "tokio-runtime")]
pub use pipeline::{AudioPipelineOrchestrator, PipelineState, PipelineStats};
