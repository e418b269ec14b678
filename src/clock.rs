//! Monotonic high-precision local clock.
//!
//! Everything in this crate that schedules or measures time reads from a
//! single [`MonotonicClock`] instead of wall-clock time, so NTP steps and
//! leap seconds on the host never appear as discontinuities in playback
//! timing.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

const RESOLUTION_PROBE_SAMPLES: usize = 8;
const RESOLUTION_WARN_THRESHOLD_US: i64 = 100;

/// A microsecond clock that never returns a value lower than one it has
/// already returned, even if the underlying platform timer briefly appears
/// to move backwards (observed on some VM hosts around suspend/resume).
pub struct MonotonicClock {
    epoch: Instant,
    high_water_us: AtomicI64,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        let resolution_us = Self::probe_resolution_us();
        if resolution_us > RESOLUTION_WARN_THRESHOLD_US {
            tracing::warn!(
                resolution_us,
                "platform timer resolution coarser than 100us; sync quality will degrade"
            );
        }
        Self {
            epoch: Instant::now(),
            high_water_us: AtomicI64::new(0),
        }
    }

    /// Microseconds elapsed since this clock was constructed. Strictly
    /// non-decreasing across calls.
    pub fn now_us(&self) -> i64 {
        let elapsed = self.epoch.elapsed();
        let raw = i64::try_from(elapsed.as_micros()).unwrap_or(i64::MAX);

        let mut prev = self.high_water_us.load(Ordering::Acquire);
        loop {
            if raw <= prev {
                return prev;
            }
            match self.high_water_us.compare_exchange_weak(
                prev,
                raw,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return raw,
                Err(actual) => prev = actual,
            }
        }
    }

    fn probe_resolution_us() -> i64 {
        let mut min_delta: i64 = i64::MAX;
        let mut last = Instant::now();
        for _ in 0..RESOLUTION_PROBE_SAMPLES {
            let now = Instant::now();
            let delta = now.duration_since(last).as_micros();
            if delta > 0 {
                min_delta = min_delta.min(i64::try_from(delta).unwrap_or(i64::MAX));
            }
            last = now;
        }
        if min_delta == i64::MAX {
            0
        } else {
            min_delta
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_us_is_non_decreasing() {
        let clock = MonotonicClock::new();
        let mut last = clock.now_us();
        for _ in 0..1000 {
            let now = clock.now_us();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn clamps_to_high_water_mark() {
        let clock = MonotonicClock::new();
        // Simulate a prior reading far in the future; subsequent real
        // readings must never be reported below it.
        clock.high_water_us.store(i64::MAX - 1, Ordering::Release);
        assert_eq!(clock.now_us(), i64::MAX - 1);
    }
}
