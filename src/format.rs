//! PCM stream format description shared across the buffer, controller and
//! transport boundary.

use serde::{Deserialize, Serialize};

/// Describes the PCM layout of a stream.
///
/// Unlike a codec-level format descriptor this only carries what the sync
/// and buffering machinery needs: sample rate and channel count. `codec` is
/// informational (carried through from the transport) and `bit_depth` is
/// optional since the buffer always operates on `f32` samples internally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Source codec tag, e.g. `"pcm"`, `"alac"`, `"aac"`. Informational only;
    /// decoding happens upstream of this crate's boundary.
    pub codec: String,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count.
    pub channels: u16,
    /// Bit depth of the source, if known. Not used internally (samples are
    /// always `f32` once past the decoder), but preserved for diagnostics.
    pub bit_depth: Option<u8>,
}

impl AudioFormat {
    /// CD-quality stereo PCM: 44100 Hz, 2 channels, 16-bit source.
    pub const CD_QUALITY: Self = Self {
        codec: String::new(),
        sample_rate: 44_100,
        channels: 2,
        bit_depth: Some(16),
    };

    #[must_use]
    pub fn new(codec: impl Into<String>, sample_rate: u32, channels: u16) -> Self {
        Self {
            codec: codec.into(),
            sample_rate,
            channels,
            bit_depth: None,
        }
    }

    /// Number of interleaved samples per second (`sample_rate * channels`).
    #[must_use]
    pub fn samples_per_second(&self) -> u64 {
        u64::from(self.sample_rate) * u64::from(self.channels)
    }

    /// Converts a duration (microseconds) to an interleaved sample count.
    #[must_use]
    pub fn us_to_samples(&self, us: i64) -> i64 {
        (us as i128 * self.samples_per_second() as i128 / 1_000_000) as i64
    }

    /// Converts an interleaved sample count to a duration (microseconds).
    #[must_use]
    pub fn samples_to_us(&self, samples: i64) -> i64 {
        let sps = self.samples_per_second();
        if sps == 0 {
            return 0;
        }
        (samples as i128 * 1_000_000 / sps as i128) as i64
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        let mut f = Self::CD_QUALITY;
        f.codec = "pcm".to_string();
        f
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_us_to_samples_at_cd_quality() {
        let f = AudioFormat::CD_QUALITY;
        let samples = f.us_to_samples(1_000_000);
        assert_eq!(samples, 44_100 * 2);
        assert_eq!(f.samples_to_us(samples), 1_000_000);
    }
}
