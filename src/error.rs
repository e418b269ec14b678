//! Error types for the synchronized audio endpoint core.

/// Errors from constructing or running the audio output collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AudioOutputError {
    /// Requested device could not be found.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Device does not support the requested format.
    #[error("format not supported: {0:?}")]
    FormatNotSupported(crate::format::AudioFormat),

    /// Generic device/stream failure.
    #[error("device error: {0}")]
    DeviceError(String),
}

/// Errors from the decoder collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DecoderError {
    /// The chunk could not be decoded (corrupt/truncated data).
    #[error("decode failed: {0}")]
    DecodeFailed(String),

    /// The decoder could not be constructed for the given format.
    #[error("unsupported format: {0:?}")]
    UnsupportedFormat(crate::format::AudioFormat),
}

/// Fatal errors surfaced by the pipeline orchestrator via
/// [`crate::events::PipelineEvent::ErrorOccurred`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    /// Output device initialization failed.
    #[error("output device initialization failed: {0}")]
    DeviceInit(#[from] AudioOutputError),

    /// Decoder construction failed for the stream's format.
    #[error("decoder construction failed: {0}")]
    DecoderConstruction(#[source] DecoderError),

    /// The re-anchor event could not be scheduled (orchestrator wiring
    /// failure, not a buffer-level condition).
    #[error("failed to schedule re-anchor: {0}")]
    ReAnchorSignaling(String),
}

/// Errors from validating a [`crate::config::Config`].
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    /// `buffer_capacity_ms` must be strictly greater than `target_buffer_ms`.
    #[error("buffer_capacity_ms ({capacity}) must be greater than target_buffer_ms ({target})")]
    CapacityNotGreaterThanTarget {
        /// Configured capacity.
        capacity: u32,
        /// Configured target.
        target: u32,
    },

    /// `max_speed_correction` must be in `(0, 1]`.
    #[error("max_speed_correction ({0}) must be in (0, 1]")]
    InvalidMaxSpeedCorrection(f64),

    /// `correction_target_seconds` must be greater than zero.
    #[error("correction_target_seconds ({0}) must be > 0")]
    InvalidCorrectionTargetSeconds(f64),

    /// `resampling_threshold_us` must be at least `deadband_us`.
    #[error(
        "resampling_threshold_us ({resampling}) must be >= deadband_us ({deadband})"
    )]
    ResamplingThresholdBelowDeadband {
        /// Configured resampling threshold.
        resampling: i64,
        /// Configured deadband.
        deadband: i64,
    },

    /// `reanchor_threshold_us` must be greater than `resampling_threshold_us`.
    #[error(
        "reanchor_threshold_us ({reanchor}) must be > resampling_threshold_us ({resampling})"
    )]
    ReanchorThresholdNotGreater {
        /// Configured re-anchor threshold.
        reanchor: i64,
        /// Configured resampling threshold.
        resampling: i64,
    },
}
