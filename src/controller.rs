//! Sync Correction Controller: the tiered policy (none / resample / drop /
//! insert) that reacts to the buffer's smoothed sync error.
//!
//! Grounded on `streaming::resampler::ResamplingSource` for the rubato
//! wiring of the resampling tier, and on `receiver::playback_timing`'s
//! latency accounting for the frame-level drop/insert bookkeeping against
//! [`crate::buffer::TimedAudioBuffer`].

use rubato::{FastFixedIn, PolynomialDegree, Resampler};

use crate::buffer::TimedAudioBuffer;

/// Which correction strategy is currently active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionMode {
    /// Error within the deadband: passthrough.
    None,
    /// Error within the resampling band: nudge playback rate.
    Resampling,
    /// Error beyond the resampling band, positive (device behind): drop
    /// frames periodically.
    Dropping,
    /// Error beyond the resampling band, negative (device ahead): insert
    /// frames periodically.
    Inserting,
}

/// Tuning for [`SyncCorrectionController`].
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Deadband in microseconds: `|error| < deadband_us` applies no correction.
    pub deadband_us: f64,
    /// `|error| < resampling_threshold_us` uses tier-2 rate nudging instead
    /// of frame drop/insert.
    pub resampling_threshold_us: f64,
    /// Maximum playback rate deviation from 1.0 (e.g. `0.02` for ±2%).
    pub max_speed_correction: f64,
    /// Desired time, in seconds, to fully correct the current error.
    pub correction_target_seconds: f64,
    /// Time after playback start, in emitted-output microseconds, before
    /// correction is allowed to engage.
    pub startup_grace_us: i64,
}

/// Snapshot of the controller's current policy state.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ControllerStats {
    pub mode: ControllerModeTag,
    pub target_playback_rate: f64,
    pub drop_every_n_frames: u32,
    pub insert_every_n_frames: u32,
}

/// Serializable mirror of [`CorrectionMode`] (the enum itself stays
/// `#[derive(Copy)]`-friendly without pulling serde into it directly).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ControllerModeTag {
    None,
    Resampling,
    Dropping,
    Inserting,
}

impl From<CorrectionMode> for ControllerModeTag {
    fn from(m: CorrectionMode) -> Self {
        match m {
            CorrectionMode::None => Self::None,
            CorrectionMode::Resampling => Self::Resampling,
            CorrectionMode::Dropping => Self::Dropping,
            CorrectionMode::Inserting => Self::Inserting,
        }
    }
}

pub struct SyncCorrectionController {
    config: ControllerConfig,
    mode: CorrectionMode,
    drop_every_n_frames: u32,
    insert_every_n_frames: u32,
    target_playback_rate: f64,
    frame_counter: u32,
    in_startup_grace: bool,
    last_output_frame: Vec<f32>,
    scratch_a: Vec<f32>,
    scratch_b: Vec<f32>,
}

impl SyncCorrectionController {
    #[must_use]
    pub fn new(config: ControllerConfig) -> Self {
        let channels = config.channels as usize;
        Self {
            config,
            mode: CorrectionMode::None,
            drop_every_n_frames: 0,
            insert_every_n_frames: 0,
            target_playback_rate: 1.0,
            frame_counter: 0,
            in_startup_grace: true,
            last_output_frame: vec![0.0; channels],
            scratch_a: vec![0.0; channels],
            scratch_b: vec![0.0; channels],
        }
    }

    /// Resets policy state for a new stream (new device, reconnect, seek).
    pub fn reset(&mut self) {
        self.mode = CorrectionMode::None;
        self.drop_every_n_frames = 0;
        self.insert_every_n_frames = 0;
        self.target_playback_rate = 1.0;
        self.frame_counter = 0;
        self.in_startup_grace = true;
        self.last_output_frame.iter_mut().for_each(|s| *s = 0.0);
    }

    #[must_use]
    pub fn mode(&self) -> CorrectionMode {
        self.mode
    }

    #[must_use]
    pub fn target_playback_rate(&self) -> f64 {
        self.target_playback_rate
    }

    #[must_use]
    pub fn stats(&self) -> ControllerStats {
        ControllerStats {
            mode: self.mode.into(),
            target_playback_rate: self.target_playback_rate,
            drop_every_n_frames: self.drop_every_n_frames,
            insert_every_n_frames: self.insert_every_n_frames,
        }
    }

    /// Re-evaluates the tiered policy from the buffer's smoothed error and
    /// elapsed emitted-output time since playback started.
    pub fn update(&mut self, smoothed_error_us: f64, elapsed_output_us: i64) {
        if self.in_startup_grace {
            if elapsed_output_us >= self.config.startup_grace_us {
                self.in_startup_grace = false;
            } else {
                self.apply_tier_none();
                return;
            }
        }

        let abs_error = smoothed_error_us.abs();
        if abs_error < self.config.deadband_us {
            self.apply_tier_none();
        } else if abs_error < self.config.resampling_threshold_us {
            self.mode = CorrectionMode::Resampling;
            self.drop_every_n_frames = 0;
            self.insert_every_n_frames = 0;
            let m = self.config.max_speed_correction;
            let raw = smoothed_error_us / (self.config.correction_target_seconds * 1_000_000.0);
            self.target_playback_rate = 1.0 + raw.clamp(-m, m);
        } else {
            self.target_playback_rate = 1.0;
            let sample_rate = f64::from(self.config.sample_rate);
            let frames_error = abs_error * sample_rate / 1_000_000.0;
            let max_per_sec = sample_rate * self.config.max_speed_correction;
            let desired_per_sec = (frames_error / self.config.correction_target_seconds)
                .min(max_per_sec)
                .max(1.0);
            let min_interval = u32::from(self.config.channels) * 10;
            let interval = ((sample_rate / desired_per_sec).floor() as u32).max(min_interval.max(1));

            if smoothed_error_us > 0.0 {
                self.mode = CorrectionMode::Dropping;
                self.drop_every_n_frames = interval;
                self.insert_every_n_frames = 0;
            } else {
                self.mode = CorrectionMode::Inserting;
                self.insert_every_n_frames = interval;
                self.drop_every_n_frames = 0;
            }
        }
    }

    fn apply_tier_none(&mut self) {
        self.mode = CorrectionMode::None;
        self.target_playback_rate = 1.0;
        self.drop_every_n_frames = 0;
        self.insert_every_n_frames = 0;
    }

    /// Produces one interleaved output frame (`channels` samples) into
    /// `out`, applying whatever correction tier is currently active.
    /// Allocation-free after construction.
    pub fn next_frame(&mut self, buffer: &TimedAudioBuffer, out: &mut [f32], now_local_us: i64) {
        let channels = self.config.channels as usize;
        debug_assert_eq!(out.len(), channels);
        self.frame_counter += 1;

        match self.mode {
            CorrectionMode::Dropping if self.frame_counter >= self.drop_every_n_frames.max(1) => {
                self.frame_counter = 0;
                if !buffer.consume_frame(&mut self.scratch_a) {
                    out.fill(0.0);
                    buffer.record_underrun();
                    return;
                }
                if buffer.consume_frame(&mut self.scratch_b) {
                    for i in 0..channels {
                        out[i] = (self.scratch_a[i] + self.scratch_b[i]) * 0.5;
                    }
                    buffer.notify_external_correction(channels as u32, 0);
                } else {
                    out.copy_from_slice(&self.scratch_a);
                }
                buffer.record_emission(channels as u32, now_local_us);
                self.last_output_frame.copy_from_slice(out);
            }
            CorrectionMode::Inserting if self.frame_counter >= self.insert_every_n_frames.max(1) => {
                self.frame_counter = 0;
                if buffer.peek_frame(&mut self.scratch_b) {
                    for i in 0..channels {
                        out[i] = (self.last_output_frame[i] + self.scratch_b[i]) * 0.5;
                    }
                    buffer.notify_external_correction(0, channels as u32);
                } else {
                    out.copy_from_slice(&self.last_output_frame);
                }
                buffer.record_emission(channels as u32, now_local_us);
                self.last_output_frame.copy_from_slice(out);
            }
            _ => {
                if !buffer.consume_frame(&mut self.scratch_a) {
                    out.fill(0.0);
                    buffer.record_underrun();
                    return;
                }
                out.copy_from_slice(&self.scratch_a);
                buffer.record_emission(channels as u32, now_local_us);
                self.last_output_frame.copy_from_slice(out);
            }
        }
    }
}

/// Playback-rate resampler used by [`CorrectionMode::Resampling`].
///
/// Wraps a rubato `FastFixedIn` resampler and exponentially smooths and
/// deadbands the target ratio so the audible rate never jumps abruptly
/// between successive controller updates.
pub struct PlaybackRateResampler {
    resampler: FastFixedIn<f32>,
    current_ratio: f64,
    channels: usize,
    input_scratch: Vec<Vec<f32>>,
    output_scratch: Vec<Vec<f32>>,
}

const RATE_SMOOTHING_ALPHA: f64 = 0.05;
const RATE_DEADBAND: f64 = 0.0005;

impl PlaybackRateResampler {
    /// # Errors
    /// Returns an error if rubato rejects the initial chunk size/ratio.
    pub fn new(channels: u16, chunk_size: usize) -> Result<Self, rubato::ResamplerConstructionError> {
        let channels = channels as usize;
        let resampler = FastFixedIn::<f32>::new(1.0, 1.0 + 2.0 * RATE_DEADBAND, PolynomialDegree::Cubic, chunk_size, channels)?;
        Ok(Self {
            resampler,
            current_ratio: 1.0,
            channels,
            input_scratch: vec![vec![0.0; chunk_size]; channels],
            output_scratch: vec![vec![0.0; chunk_size * 2]; channels],
        })
    }

    /// Smoothly steers the internal ratio towards `target_ratio`.
    pub fn set_target_ratio(&mut self, target_ratio: f64) {
        let next = RATE_SMOOTHING_ALPHA * target_ratio + (1.0 - RATE_SMOOTHING_ALPHA) * self.current_ratio;
        if (next - 1.0).abs() < RATE_DEADBAND {
            self.current_ratio = 1.0;
        } else {
            self.current_ratio = next;
        }
    }

    /// Resamples one interleaved chunk at the currently smoothed ratio.
    ///
    /// # Errors
    /// Propagates rubato processing failures (mismatched input length,
    /// internal state errors).
    pub fn process(&mut self, interleaved_in: &[f32]) -> Result<Vec<f32>, rubato::ResampleError> {
        let frames_in = interleaved_in.len() / self.channels;
        for ch in 0..self.channels {
            for f in 0..frames_in {
                self.input_scratch[ch][f] = interleaved_in[f * self.channels + ch];
            }
        }
        self.resampler.set_resample_ratio(self.current_ratio, true).ok();
        let (_, out_frames) = self.resampler.process_into_buffer(&self.input_scratch, &mut self.output_scratch, None)?;

        let mut interleaved_out = Vec::with_capacity(out_frames * self.channels);
        for f in 0..out_frames {
            for ch in 0..self.channels {
                interleaved_out.push(self.output_scratch[ch][f]);
            }
        }
        Ok(interleaved_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferConfig, TimedAudioBuffer};
    use crate::sync::ClockSynchronizer;

    fn controller_config() -> ControllerConfig {
        ControllerConfig {
            sample_rate: 1000,
            channels: 1,
            deadband_us: 1000.0,
            resampling_threshold_us: 20_000.0,
            max_speed_correction: 0.02,
            correction_target_seconds: 1.0,
            startup_grace_us: 0,
        }
    }

    #[test]
    fn deadband_keeps_mode_none() {
        let mut c = SyncCorrectionController::new(controller_config());
        c.update(500.0, 1_000_000);
        assert_eq!(c.mode(), CorrectionMode::None);
        assert_eq!(c.target_playback_rate(), 1.0);
    }

    #[test]
    fn large_positive_error_selects_dropping() {
        let mut c = SyncCorrectionController::new(controller_config());
        c.update(100_000.0, 1_000_000);
        assert_eq!(c.mode(), CorrectionMode::Dropping);
    }

    #[test]
    fn large_negative_error_selects_inserting() {
        let mut c = SyncCorrectionController::new(controller_config());
        c.update(-100_000.0, 1_000_000);
        assert_eq!(c.mode(), CorrectionMode::Inserting);
    }

    #[test]
    fn mid_range_error_selects_resampling_within_bounds() {
        let mut c = SyncCorrectionController::new(controller_config());
        c.update(10_000.0, 1_000_000);
        assert_eq!(c.mode(), CorrectionMode::Resampling);
        assert!(c.target_playback_rate() > 1.0);
        assert!(c.target_playback_rate() <= 1.0 + controller_config().max_speed_correction);
    }

    #[test]
    fn startup_grace_forces_tier_none_regardless_of_error() {
        let mut cfg = controller_config();
        cfg.startup_grace_us = 2_000_000;
        let mut c = SyncCorrectionController::new(cfg);
        c.update(100_000.0, 500_000);
        assert_eq!(c.mode(), CorrectionMode::None);
    }

    #[test]
    fn dropping_every_frame_consumes_two_frames_and_emits_one() {
        let mut cfg = controller_config();
        cfg.channels = 1;
        let mut c = SyncCorrectionController::new(cfg);
        c.update(100_000.0, 1_000_000);
        // Force the interval down to 1 so next_frame always drops.
        let interval = 1;
        let buffer = TimedAudioBuffer::new(BufferConfig {
            sample_rate: 1000,
            channels: 1,
            capacity_ms: 1000,
            scheduled_start_grace_window_us: 1_000_000,
            calibrated_startup_latency_us: 0,
            startup_grace_us: 0,
            reanchor_threshold_us: 1_000_000,
        });
        let sync = ClockSynchronizer::new(0.0);
        buffer.write(&[1.0, 2.0, 3.0, 4.0], 0, &sync);
        let mut out = [0.0f32; 1];
        buffer.read_raw(&mut out, 0); // start playback, consume one frame normally
        let before = buffer.stats().total_dropped_samples;
        // Manually align counter so the dropping branch fires this call.
        c.frame_counter = interval;
        c.next_frame(&buffer, &mut out, 0);
        assert!(buffer.stats().total_dropped_samples >= before);
    }
}
