//! Endpoint configuration surface: one struct with a fluent builder and a
//! `validate()` boundary check, following `ReceiverConfig`'s style
//! (`src/receiver/config.rs`) of `Default` + chained `#[must_use]` setters.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// All tunables for a [`crate::pipeline::AudioPipelineOrchestrator`] and its
/// collaborators. Construct with [`Config::default`] or the builder setters,
/// then call [`Config::validate`] before use — the orchestrator does this
/// itself at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub target_buffer_ms: u32,
    pub buffer_capacity_ms: u32,
    pub max_speed_correction: f64,
    pub correction_target_seconds: f64,
    pub deadband_us: i64,
    pub resampling_threshold_us: i64,
    pub reanchor_threshold_us: i64,
    pub startup_grace_us: i64,
    pub scheduled_start_grace_window_us: i64,
    pub static_delay_ms: f64,
    pub convergence_timeout_ms: u64,
    pub early_chunk_queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_buffer_ms: 250,
            buffer_capacity_ms: 500,
            max_speed_correction: 0.02,
            correction_target_seconds: 3.0,
            deadband_us: 1000,
            resampling_threshold_us: 15_000,
            reanchor_threshold_us: 500_000,
            startup_grace_us: 500_000,
            scheduled_start_grace_window_us: 10_000,
            static_delay_ms: 0.0,
            convergence_timeout_ms: 5000,
            early_chunk_queue_capacity: 100,
        }
    }
}

impl Config {
    #[must_use]
    pub fn target_buffer_ms(mut self, v: u32) -> Self {
        self.target_buffer_ms = v;
        self
    }

    #[must_use]
    pub fn buffer_capacity_ms(mut self, v: u32) -> Self {
        self.buffer_capacity_ms = v;
        self
    }

    #[must_use]
    pub fn max_speed_correction(mut self, v: f64) -> Self {
        self.max_speed_correction = v;
        self
    }

    #[must_use]
    pub fn correction_target_seconds(mut self, v: f64) -> Self {
        self.correction_target_seconds = v;
        self
    }

    #[must_use]
    pub fn deadband_us(mut self, v: i64) -> Self {
        self.deadband_us = v;
        self
    }

    #[must_use]
    pub fn resampling_threshold_us(mut self, v: i64) -> Self {
        self.resampling_threshold_us = v;
        self
    }

    #[must_use]
    pub fn reanchor_threshold_us(mut self, v: i64) -> Self {
        self.reanchor_threshold_us = v;
        self
    }

    #[must_use]
    pub fn startup_grace_us(mut self, v: i64) -> Self {
        self.startup_grace_us = v;
        self
    }

    #[must_use]
    pub fn scheduled_start_grace_window_us(mut self, v: i64) -> Self {
        self.scheduled_start_grace_window_us = v;
        self
    }

    #[must_use]
    pub fn static_delay_ms(mut self, v: f64) -> Self {
        self.static_delay_ms = v;
        self
    }

    #[must_use]
    pub fn convergence_timeout_ms(mut self, v: u64) -> Self {
        self.convergence_timeout_ms = v;
        self
    }

    #[must_use]
    pub fn early_chunk_queue_capacity(mut self, v: usize) -> Self {
        self.early_chunk_queue_capacity = v;
        self
    }

    /// Checks the documented orderings between fields.
    ///
    /// # Errors
    /// Returns the first violated ordering as a [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_capacity_ms <= self.target_buffer_ms {
            return Err(ConfigError::CapacityNotGreaterThanTarget {
                capacity: self.buffer_capacity_ms,
                target: self.target_buffer_ms,
            });
        }
        if !(self.max_speed_correction > 0.0 && self.max_speed_correction <= 1.0) {
            return Err(ConfigError::InvalidMaxSpeedCorrection(self.max_speed_correction));
        }
        if !(self.correction_target_seconds > 0.0) {
            return Err(ConfigError::InvalidCorrectionTargetSeconds(
                self.correction_target_seconds,
            ));
        }
        if self.resampling_threshold_us < self.deadband_us {
            return Err(ConfigError::ResamplingThresholdBelowDeadband {
                resampling: self.resampling_threshold_us,
                deadband: self.deadband_us,
            });
        }
        if self.reanchor_threshold_us <= self.resampling_threshold_us {
            return Err(ConfigError::ReanchorThresholdNotGreater {
                reanchor: self.reanchor_threshold_us,
                resampling: self.resampling_threshold_us,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn capacity_must_exceed_target() {
        let cfg = Config::default().buffer_capacity_ms(200).target_buffer_ms(250);
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::CapacityNotGreaterThanTarget {
                capacity: 200,
                target: 250
            })
        );
    }

    #[test]
    fn reanchor_threshold_must_exceed_resampling_threshold() {
        let cfg = Config::default()
            .resampling_threshold_us(15_000)
            .reanchor_threshold_us(10_000);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn builder_chains_apply_in_order() {
        let cfg = Config::default().target_buffer_ms(100).buffer_capacity_ms(400);
        assert_eq!(cfg.target_buffer_ms, 100);
        assert_eq!(cfg.buffer_capacity_ms, 400);
    }
}
