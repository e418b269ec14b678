//! Clock Synchronizer: converts between server and local microsecond time
//! using a scalar two-state (offset, drift) estimator driven by an
//! NTP-style four-timestamp exchange.
//!
//! Grounded on the offset/RTT arithmetic of `protocol::ptp::clock` in the
//! teacher (`TimingMeasurement::calculate`), replacing its median/two-point
//! regression with a proper recursive estimator that tracks its own
//! uncertainty, since downstream consumers (the correction controller) need
//! a convergence signal, not just a point estimate.

use std::sync::Mutex;

use serde::Serialize;

const MIN_SIGMA_US: f64 = 100.0;
const PROCESS_NOISE_OFFSET_US2_PER_S: f64 = 4.0;
const PROCESS_NOISE_DRIFT_US2_PER_S3: f64 = 0.01;
const MIN_ELAPSED_FOR_DRIFT_UPDATE_S: f64 = 0.01;

const CONVERGED_MEASUREMENT_COUNT: u64 = 5;
const CONVERGED_OFFSET_UNCERTAINTY_US: f64 = 1000.0;
const MINIMAL_SYNC_MEASUREMENT_COUNT: u64 = 2;
const DRIFT_RELIABLE_MEASUREMENT_COUNT: u64 = 10;
const DRIFT_RELIABLE_UNCERTAINTY_US_PER_S: f64 = 50.0;

#[derive(Debug, Clone, Copy)]
struct EstimatorState {
    offset_us: f64,
    drift_us_per_s: f64,
    offset_uncertainty_us: f64,
    drift_uncertainty_us_per_s: f64,
    measurement_count: u64,
    last_update_local_us: i64,
}

impl Default for EstimatorState {
    fn default() -> Self {
        Self {
            offset_us: 0.0,
            drift_us_per_s: 0.0,
            offset_uncertainty_us: 1.0e9,
            drift_uncertainty_us_per_s: 1.0e6,
            measurement_count: 0,
            last_update_local_us: 0,
        }
    }
}

/// Point-in-time snapshot of the synchronizer's estimate, suitable for
/// inclusion in a stats stream.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ClockSyncStatus {
    pub offset_us: f64,
    pub offset_uncertainty_us: f64,
    pub drift_us_per_s: f64,
    pub drift_uncertainty_us_per_s: f64,
    pub measurement_count: u64,
    /// True once enough measurements have landed and offset uncertainty has
    /// settled below a usable threshold.
    pub converged: bool,
    /// True once the drift estimate itself has settled; controllers can use
    /// this to decide whether drift-based extrapolation is trustworthy.
    pub drift_reliable: bool,
}

/// Converts between server-side and local microsecond timelines.
///
/// Every public method other than [`reset`](Self::reset) and
/// [`set_static_delay_ms`](Self::set_static_delay_ms) is non-blocking and
/// safe to call from any thread; the estimator state lives behind a single
/// short-held mutex.
pub struct ClockSynchronizer {
    state: Mutex<EstimatorState>,
    static_delay_us: Mutex<f64>,
}

impl ClockSynchronizer {
    #[must_use]
    pub fn new(static_delay_ms: f64) -> Self {
        Self {
            state: Mutex::new(EstimatorState::default()),
            static_delay_us: Mutex::new(static_delay_ms * 1000.0),
        }
    }

    /// Updates the fixed network/processing delay folded into conversions.
    /// Added to `server_to_local`, subtracted from `local_to_server`.
    pub fn set_static_delay_ms(&self, ms: f64) {
        *self.static_delay_us.lock().unwrap() = ms * 1000.0;
    }

    /// Feeds one NTP-style exchange: `t1` local send, `t2` server receive,
    /// `t3` server send, `t4` local receive (all microseconds).
    ///
    /// Measurements with non-positive or non-finite round-trip time are
    /// silently rejected and leave the estimator bitwise unchanged.
    pub fn process_measurement(&self, t1: i64, t2: i64, t3: i64, t4: i64) {
        let offset_obs = ((t2 - t1) as f64 + (t3 - t4) as f64) / 2.0;
        let rtt = ((t4 - t1) - (t3 - t2)) as f64;
        if !(rtt.is_finite() && offset_obs.is_finite()) || rtt <= 0.0 {
            tracing::debug!(rtt, "rejecting clock sync measurement");
            return;
        }

        let sigma = (rtt / 2.0).max(MIN_SIGMA_US);
        let sigma_sq = sigma * sigma;

        let mut st = self.state.lock().unwrap();

        let elapsed_s = if st.measurement_count == 0 {
            0.0
        } else {
            ((t4 - st.last_update_local_us) as f64 / 1_000_000.0).max(0.0)
        };

        let predicted_offset = st.offset_us + st.drift_us_per_s * elapsed_s;
        let predicted_offset_var =
            st.offset_uncertainty_us * st.offset_uncertainty_us + PROCESS_NOISE_OFFSET_US2_PER_S * elapsed_s;

        let gain = predicted_offset_var / (predicted_offset_var + sigma_sq);
        let innovation = offset_obs - predicted_offset;
        st.offset_us = predicted_offset + gain * innovation;
        st.offset_uncertainty_us = ((1.0 - gain) * predicted_offset_var).max(0.0).sqrt();

        if elapsed_s > MIN_ELAPSED_FOR_DRIFT_UPDATE_S {
            let predicted_drift_var = st.drift_uncertainty_us_per_s * st.drift_uncertainty_us_per_s
                + PROCESS_NOISE_DRIFT_US2_PER_S3 * elapsed_s;
            let drift_obs_var = sigma_sq / (elapsed_s * elapsed_s);
            let drift_gain = predicted_drift_var / (predicted_drift_var + drift_obs_var);
            let drift_innovation = innovation / elapsed_s;
            st.drift_us_per_s += drift_gain * drift_innovation;
            st.drift_uncertainty_us_per_s = ((1.0 - drift_gain) * predicted_drift_var).max(0.0).sqrt();
        }

        st.measurement_count += 1;
        st.last_update_local_us = t4;
    }

    /// Converts a server-clock microsecond timestamp to this endpoint's
    /// local clock, extrapolating drift from the last measurement and
    /// adding the configured static delay.
    #[must_use]
    pub fn server_to_local(&self, t_server: i64) -> i64 {
        let st = self.state.lock().unwrap();
        let elapsed_s = (t_server - st.last_update_local_us) as f64 / 1_000_000.0;
        let extrapolated_offset = st.offset_us + st.drift_us_per_s * elapsed_s;
        drop(st);
        let static_delay = *self.static_delay_us.lock().unwrap();
        (t_server as f64 - extrapolated_offset + static_delay).round() as i64
    }

    /// Inverse of [`server_to_local`](Self::server_to_local): applies the
    /// same drift extrapolation anchored at `last_update_local_us`, so the
    /// two conversions are approximate inverses of one another.
    #[must_use]
    pub fn local_to_server(&self, t_local: i64) -> i64 {
        let st = self.state.lock().unwrap();
        let elapsed_s = (t_local - st.last_update_local_us) as f64 / 1_000_000.0;
        let extrapolated_offset = st.offset_us + st.drift_us_per_s * elapsed_s;
        drop(st);
        let static_delay = *self.static_delay_us.lock().unwrap();
        (t_local as f64 + extrapolated_offset - static_delay).round() as i64
    }

    #[must_use]
    pub fn status(&self) -> ClockSyncStatus {
        let st = self.state.lock().unwrap();
        ClockSyncStatus {
            offset_us: st.offset_us,
            offset_uncertainty_us: st.offset_uncertainty_us,
            drift_us_per_s: st.drift_us_per_s,
            drift_uncertainty_us_per_s: st.drift_uncertainty_us_per_s,
            measurement_count: st.measurement_count,
            converged: st.measurement_count >= CONVERGED_MEASUREMENT_COUNT
                && st.offset_uncertainty_us < CONVERGED_OFFSET_UNCERTAINTY_US,
            drift_reliable: st.measurement_count >= DRIFT_RELIABLE_MEASUREMENT_COUNT
                && st.drift_uncertainty_us_per_s < DRIFT_RELIABLE_UNCERTAINTY_US_PER_S,
        }
    }

    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.status().converged
    }

    /// True once at least two measurements have landed — enough for the
    /// buffer to start scheduling against, even before full convergence.
    #[must_use]
    pub fn has_minimal_sync(&self) -> bool {
        self.state.lock().unwrap().measurement_count >= MINIMAL_SYNC_MEASUREMENT_COUNT
    }

    /// Discards all estimator state; used on reconnect. The configured
    /// static delay is a user preference and survives reset.
    pub fn reset(&self) {
        *self.state.lock().unwrap() = EstimatorState::default();
    }
}
