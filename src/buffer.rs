//! Timed Audio Buffer: a circular PCM store with a FIFO queue of timestamp
//! tagged segments, driving the scheduled-start protocol and tracking the
//! sync error the correction controller reacts to.
//!
//! Grounded on `receiver::ap2::jitter_buffer::JitterBuffer` for the
//! overflow/underrun vocabulary and stats shape, and on
//! `receiver::playback_timing::PlaybackTiming` for the scheduled-start
//! latency math. Unlike the teacher's `audio::buffer::AudioRingBuffer`
//! (lock-free, `UnsafeCell` + atomics), this buffer is a single
//! `std::sync::Mutex` guarding one small struct: the producer and consumer
//! critical sections are both short, and a real two-state estimator needs a
//! consistent snapshot of fill level, segments and counters together.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::sync::ClockSynchronizer;

const SYNC_ERROR_EMA_ALPHA: f64 = 0.1;
const UNDERRUN_LOG_INTERVAL: u64 = 50;

/// Logs at most once per `interval` occurrences, so a sustained underrun
/// storm doesn't flood the log the way an unconditional `warn!` would.
struct RateLimiter {
    count: u64,
    interval: u64,
}

impl RateLimiter {
    fn new(interval: u64) -> Self {
        Self { count: 0, interval: interval.max(1) }
    }

    fn should_log(&mut self) -> bool {
        self.count += 1;
        self.count % self.interval == 1
    }
}

#[derive(Debug, Clone, Copy)]
struct TimedSegment {
    local_playback_time_us: i64,
    sample_count: u32,
}

/// Configuration for a [`TimedAudioBuffer`] instance.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Total ring capacity, in milliseconds of audio at `sample_rate`.
    pub capacity_ms: u32,
    /// How far past a segment's scheduled start we'll wait before starting
    /// playback anyway (clock not yet converged, or segment arrived late).
    pub scheduled_start_grace_window_us: i64,
    /// Output latency baked into the playback start instant, so the first
    /// sample reaches the speaker close to its scheduled time rather than
    /// `calibrated_startup_latency_us` late. Only the construction-time
    /// value; after a device switch it's updated in place via
    /// [`TimedAudioBuffer::soft_reset`], not by reconstructing this config.
    pub calibrated_startup_latency_us: i64,
    /// Time after playback start, measured in emitted-output time, before
    /// the re-anchor check begins evaluating error magnitude.
    pub startup_grace_us: i64,
    /// `|smoothed_error_us|` above which a re-anchor is requested instead
    /// of a continued correction attempt.
    pub reanchor_threshold_us: i64,
}

impl BufferConfig {
    fn capacity_samples(&self) -> usize {
        let frames = u64::from(self.capacity_ms) * u64::from(self.sample_rate) / 1000;
        (frames * u64::from(self.channels)) as usize
    }
}

/// Snapshot of buffer state for diagnostics/stats streams.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BufferStats {
    pub fill_samples: usize,
    pub capacity_samples: usize,
    pub overrun_count: u64,
    pub underrun_count: u64,
    pub total_dropped_samples: u64,
    pub total_inserted_samples: u64,
    pub smoothed_error_us: f64,
    pub samples_read_since_start: u64,
    pub samples_output_since_start: u64,
    pub playback_started: bool,
    pub waiting_for_scheduled_start: bool,
}

struct BufferInner {
    data: Vec<f32>,
    write_idx: usize,
    fill: usize,
    segments: VecDeque<TimedSegment>,

    playback_started: bool,
    waiting_for_scheduled_start: bool,
    scheduled_start_local_us: Option<i64>,
    playback_start_local_us: Option<i64>,

    samples_read_since_start: u64,
    samples_output_since_start: u64,
    smoothed_error_us: f64,
    last_raw_error_us: f64,

    overrun_count: u64,
    underrun_count: u64,
    total_dropped_samples: u64,
    total_inserted_samples: u64,
    underrun_log_limiter: RateLimiter,
}

impl BufferInner {
    fn new(capacity: usize) -> Self {
        Self {
            data: vec![0.0; capacity.max(1)],
            write_idx: 0,
            fill: 0,
            segments: VecDeque::new(),
            playback_started: false,
            waiting_for_scheduled_start: false,
            scheduled_start_local_us: None,
            playback_start_local_us: None,
            samples_read_since_start: 0,
            samples_output_since_start: 0,
            smoothed_error_us: 0.0,
            last_raw_error_us: 0.0,
            overrun_count: 0,
            underrun_count: 0,
            total_dropped_samples: 0,
            total_inserted_samples: 0,
            underrun_log_limiter: RateLimiter::new(UNDERRUN_LOG_INTERVAL),
        }
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn drop_oldest(&mut self, mut n: usize) {
        n = n.min(self.fill);
        self.fill -= n;
        let mut remaining = n;
        while remaining > 0 {
            let Some(seg) = self.segments.front_mut() else {
                break;
            };
            let sc = seg.sample_count as usize;
            if sc <= remaining {
                remaining -= sc;
                self.segments.pop_front();
            } else {
                seg.sample_count -= remaining as u32;
                remaining = 0;
            }
        }
    }

    fn read_head(&self) -> usize {
        let capacity = self.capacity();
        (self.write_idx + capacity - self.fill) % capacity
    }

    fn consume_into(&mut self, out: &mut [f32]) -> usize {
        let n = out.len().min(self.fill);
        let capacity = self.capacity();
        let head = self.read_head();
        for (i, slot) in out.iter_mut().enumerate().take(n) {
            *slot = self.data[(head + i) % capacity];
        }
        if n < out.len() {
            out[n..].fill(0.0);
        }
        self.fill -= n;
        let mut remaining = n;
        while remaining > 0 {
            let Some(seg) = self.segments.front_mut() else {
                break;
            };
            let sc = seg.sample_count as usize;
            if sc <= remaining {
                remaining -= sc;
                self.segments.pop_front();
            } else {
                seg.sample_count -= remaining as u32;
                remaining = 0;
            }
        }
        n
    }
}

/// Circular PCM store plus FIFO segment queue, single-mutex protected.
///
/// `write` is the producer side; `read_raw`, `consume_frame`, `peek_frame`
/// and `record_emission` make up the consumer side used directly (for
/// uncorrected playback) or via [`crate::controller::SyncCorrectionController`]
/// (when drop/insert correction is active).
pub struct TimedAudioBuffer {
    config: BufferConfig,
    inner: Mutex<BufferInner>,
    reanchor_pending: AtomicBool,
    calibrated_startup_latency_us: Mutex<i64>,
}

impl TimedAudioBuffer {
    #[must_use]
    pub fn new(config: BufferConfig) -> Self {
        let capacity = config.capacity_samples();
        let calibrated_startup_latency_us = config.calibrated_startup_latency_us;
        Self {
            inner: Mutex::new(BufferInner::new(capacity)),
            config,
            reanchor_pending: AtomicBool::new(false),
            calibrated_startup_latency_us: Mutex::new(calibrated_startup_latency_us),
        }
    }

    /// Writes `samples` (interleaved), tagging them with the local playback
    /// time derived from `server_timestamp_us` via `sync`. Never blocks: on
    /// overflow, drops the oldest samples (and their segment headers) to
    /// make room and counts an overrun.
    pub fn write(&self, samples: &[f32], server_timestamp_us: i64, sync: &ClockSynchronizer) {
        if samples.is_empty() {
            return;
        }
        let local_ts = sync.server_to_local(server_timestamp_us);
        let mut inner = self.inner.lock().unwrap();
        let capacity = inner.capacity();

        let incoming = samples.len().min(capacity);
        let skip = samples.len() - incoming;
        let overflow = (inner.fill + incoming).saturating_sub(capacity);
        if overflow > 0 || skip > 0 {
            // `skip` samples never enter the ring at all (the incoming slice
            // itself exceeds capacity); `overflow` samples are dropped from
            // existing fill to make room. Both are samples lost off the
            // oldest end, so both count toward the same overrun event.
            if overflow > 0 {
                inner.drop_oldest(overflow);
            }
            inner.overrun_count += 1;
            tracing::debug!(dropped = overflow + skip, "buffer overflow, dropping oldest samples");
        }

        for &s in &samples[skip..] {
            let idx = inner.write_idx;
            inner.data[idx] = s;
            inner.write_idx = (idx + 1) % capacity;
        }
        inner.fill += incoming;
        inner.segments.push_back(TimedSegment {
            local_playback_time_us: local_ts,
            sample_count: incoming as u32,
        });
    }

    /// Bulk, uncorrected read: fills `out` with up to `out.len()` samples,
    /// running the scheduled-start protocol and underrun handling. Used for
    /// tiers that apply no drop/insert correction.
    pub fn read_raw(&self, out: &mut [f32], now_local_us: i64) -> usize {
        out.fill(0.0);
        if self.take_reanchor_event() {
            return 0;
        }

        let mut inner = self.inner.lock().unwrap();

        if !inner.playback_started {
            if inner.scheduled_start_local_us.is_none() {
                let Some(seg) = inner.segments.front() else {
                    return 0;
                };
                inner.scheduled_start_local_us = Some(seg.local_playback_time_us);
                inner.waiting_for_scheduled_start = true;
            }
            let scheduled = inner.scheduled_start_local_us.unwrap();
            if scheduled - now_local_us > self.config.scheduled_start_grace_window_us {
                return 0;
            }
            let calibrated_startup_latency_us = *self.calibrated_startup_latency_us.lock().unwrap();
            inner.playback_start_local_us = Some(now_local_us - calibrated_startup_latency_us);
            inner.waiting_for_scheduled_start = false;
            inner.playback_started = true;
            inner.samples_read_since_start = 0;
            inner.samples_output_since_start = 0;
        }

        if inner.fill == 0 {
            inner.underrun_count += 1;
            if inner.underrun_log_limiter.should_log() {
                tracing::warn!(total = inner.underrun_count, "buffer underrun");
            }
            return 0;
        }

        let n = inner.consume_into(out);
        self.account_emission(&mut inner, n as u32, now_local_us);
        n
    }

    /// Consumes exactly one frame's worth (`channels` samples) from the
    /// ring without touching the read/output accounting counters. Used by
    /// the correction controller, which manages accounting itself since a
    /// single emitted frame may consume zero, one or two buffered frames.
    pub fn consume_frame(&self, frame: &mut [f32]) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.fill < frame.len() {
            frame.fill(0.0);
            return false;
        }
        inner.consume_into(frame);
        true
    }

    /// Looks at the next frame without consuming it. Used by the insert
    /// tier to blend in upcoming audio while leaving the buffer untouched.
    pub fn peek_frame(&self, frame: &mut [f32]) -> bool {
        let inner = self.inner.lock().unwrap();
        if inner.fill < frame.len() {
            frame.fill(0.0);
            return false;
        }
        let capacity = inner.capacity();
        let head = inner.read_head();
        for (i, slot) in frame.iter_mut().enumerate() {
            *slot = inner.data[(head + i) % capacity];
        }
        true
    }

    /// Records that `n` samples were emitted to the device outside the
    /// bulk `read_raw` path (i.e. via `consume_frame`/`peek_frame`),
    /// updating both accounting counters 1:1 and re-running the sync error
    /// and re-anchor checks. The correction controller calls this once per
    /// frame it produces, in addition to [`notify_external_correction`]
    /// when that frame applied a drop or insert.
    ///
    /// [`notify_external_correction`]: Self::notify_external_correction
    pub fn record_emission(&self, n: u32, now_local_us: i64) {
        let mut inner = self.inner.lock().unwrap();
        self.account_emission(&mut inner, n, now_local_us);
    }

    /// Counts an underrun observed by the correction controller's
    /// frame-level read path (mirrors the underrun branch of `read_raw`).
    pub fn record_underrun(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.underrun_count += 1;
        if inner.underrun_log_limiter.should_log() {
            tracing::warn!(total = inner.underrun_count, "buffer underrun");
        }
    }

    /// Adjusts `samples_read_since_start` to reflect a drop or insert
    /// applied outside the buffer. At most one of `dropped`/`inserted` is
    /// nonzero. Dropping adds to `samples_read_since_start` (we consumed
    /// beyond what we emitted); inserting subtracts from it (we emitted
    /// beyond what we consumed) — this is what steers the smoothed error
    /// back towards zero after a correction.
    pub fn notify_external_correction(&self, dropped: u32, inserted: u32) {
        debug_assert!(dropped == 0 || inserted == 0);
        let mut inner = self.inner.lock().unwrap();
        inner.samples_read_since_start = inner
            .samples_read_since_start
            .saturating_add(u64::from(dropped))
            .saturating_sub(u64::from(inserted));
        inner.total_dropped_samples += u64::from(dropped);
        inner.total_inserted_samples += u64::from(inserted);
    }

    /// Resets buffer contents and playback state for a new stream. Overrun,
    /// underrun, and cumulative drop/insert counters survive — they track
    /// the device's lifetime, not a single stream.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        let capacity = inner.capacity();
        inner.data.iter_mut().for_each(|s| *s = 0.0);
        inner.write_idx = 0;
        inner.fill = 0;
        inner.segments.clear();
        inner.playback_started = false;
        inner.waiting_for_scheduled_start = false;
        inner.scheduled_start_local_us = None;
        inner.playback_start_local_us = None;
        inner.samples_read_since_start = 0;
        inner.samples_output_since_start = 0;
        inner.smoothed_error_us = 0.0;
        inner.last_raw_error_us = 0.0;
        inner.underrun_log_limiter = RateLimiter::new(UNDERRUN_LOG_INTERVAL);
        debug_assert_eq!(inner.capacity(), capacity);
    }

    /// Resets scheduled-start/readiness and sync-error state without
    /// discarding buffered PCM — unlike [`clear`](Self::clear), `data`,
    /// `segments` and `fill` are left untouched. Used on a device switch,
    /// where the already-decoded audio is still valid but the playback
    /// timeline must restart against the new device's latency.
    pub fn soft_reset(&self, new_calibrated_startup_latency_us: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.playback_started = false;
        inner.waiting_for_scheduled_start = false;
        inner.scheduled_start_local_us = None;
        inner.playback_start_local_us = None;
        inner.samples_read_since_start = 0;
        inner.samples_output_since_start = 0;
        inner.smoothed_error_us = 0.0;
        inner.last_raw_error_us = 0.0;
        drop(inner);
        *self.calibrated_startup_latency_us.lock().unwrap() = new_calibrated_startup_latency_us;
        self.reanchor_pending.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn stats(&self) -> BufferStats {
        let inner = self.inner.lock().unwrap();
        BufferStats {
            fill_samples: inner.fill,
            capacity_samples: inner.capacity(),
            overrun_count: inner.overrun_count,
            underrun_count: inner.underrun_count,
            total_dropped_samples: inner.total_dropped_samples,
            total_inserted_samples: inner.total_inserted_samples,
            smoothed_error_us: inner.smoothed_error_us,
            samples_read_since_start: inner.samples_read_since_start,
            samples_output_since_start: inner.samples_output_since_start,
            playback_started: inner.playback_started,
            waiting_for_scheduled_start: inner.waiting_for_scheduled_start,
        }
    }

    /// Smoothed sync error, for the correction controller's tiered policy.
    #[must_use]
    pub fn smoothed_error_us(&self) -> f64 {
        self.inner.lock().unwrap().smoothed_error_us
    }

    /// Emitted-output time elapsed since playback started, in microseconds
    /// (0 if playback hasn't started). Used for the startup-grace gate.
    #[must_use]
    pub fn elapsed_output_us(&self) -> i64 {
        let inner = self.inner.lock().unwrap();
        Self::elapsed_output_us_locked(&self.config, &inner)
    }

    fn elapsed_output_us_locked(config: &BufferConfig, inner: &BufferInner) -> i64 {
        let sps = u64::from(config.sample_rate) * u64::from(config.channels);
        if sps == 0 {
            return 0;
        }
        (inner.samples_output_since_start * 1_000_000 / sps) as i64
    }

    fn account_emission(&self, inner: &mut BufferInner, n: u32, now_local_us: i64) {
        inner.samples_read_since_start += u64::from(n);
        inner.samples_output_since_start += u64::from(n);
        self.update_sync_error(inner, now_local_us);
        self.check_reanchor(inner);
    }

    fn update_sync_error(&self, inner: &mut BufferInner, now_local_us: i64) {
        let Some(start) = inner.playback_start_local_us else {
            return;
        };
        let elapsed_us = (now_local_us - start) as f64;
        let sps = f64::from(self.config.sample_rate) * f64::from(self.config.channels);
        let samples_read_time_us = if sps > 0.0 {
            inner.samples_read_since_start as f64 * 1_000_000.0 / sps
        } else {
            0.0
        };
        let raw_error_us = elapsed_us - samples_read_time_us;
        inner.last_raw_error_us = raw_error_us;
        if inner.samples_read_since_start as f64 <= f64::from(self.config.channels) {
            inner.smoothed_error_us = raw_error_us;
        } else {
            inner.smoothed_error_us =
                SYNC_ERROR_EMA_ALPHA * raw_error_us + (1.0 - SYNC_ERROR_EMA_ALPHA) * inner.smoothed_error_us;
        }
    }

    fn check_reanchor(&self, inner: &BufferInner) {
        if Self::elapsed_output_us_locked(&self.config, inner) < self.config.startup_grace_us {
            return;
        }
        if inner.last_raw_error_us.abs() > self.config.reanchor_threshold_us as f64 {
            self.reanchor_pending.store(true, Ordering::Release);
        }
    }

    /// Consumes a pending re-anchor request, if any. Returns `true` exactly
    /// once per request (single-slot, coalesced: requests that arrive
    /// while one is already pending are absorbed into the same signal).
    fn take_reanchor_event(&self) -> bool {
        self.reanchor_pending.swap(false, Ordering::AcqRel)
    }

    /// Polls and clears a pending re-anchor request from outside the read
    /// path (used by the orchestrator's event loop alongside the frame
    /// path, since both can originate a request).
    #[must_use]
    pub fn poll_reanchor(&self) -> bool {
        self.take_reanchor_event()
    }
}
