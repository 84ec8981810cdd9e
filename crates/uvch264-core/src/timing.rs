//! # Capture Timestamp Synchronizer
//!
//! Hardware capture timestamps are jittery, and the camera's real frame
//! rate never quite matches its nominal one. Players stutter on noisy PTS,
//! so output timestamps are synthesized instead:
//!
//! - every slice advances the PTS by the current frame-interval estimate,
//!   which keeps spacing perfectly regular;
//! - the estimate is re-measured every `interval_update_frames` slices (on
//!   an IDR) and blended in with a `1/smoothing_divisor` moving average;
//! - when the synthesized PTS wanders more than `hysteresis_intervals`
//!   frame intervals away from the capture clock, it is pulled back by at
//!   most half an interval per slice.
//!
//! All arithmetic is integer nanoseconds. The first output PTS of a
//! session is the slice's offset from the first capture frame, so time
//! spent waiting for the first keyframe is preserved.

use tracing::{debug, trace};

pub const DEFAULT_INTERVAL_UPDATE_FRAMES: u32 = 60;
pub const DEFAULT_SMOOTHING_DIVISOR: u32 = 20;
pub const DEFAULT_HYSTERESIS_INTERVALS: u32 = 2;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Nominal frame interval in nanoseconds for an integer frame rate.
pub fn interval_for_framerate(fps: u32) -> u64 {
    NANOS_PER_SEC / u64::from(fps.max(1))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// Slices between interval re-estimations.
    pub interval_update_frames: u32,
    /// Weight of the history in the moving average (`N` in `1/N`).
    pub smoothing_divisor: u32,
    /// Correction dead band, in frame intervals.
    pub hysteresis_intervals: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_update_frames: DEFAULT_INTERVAL_UPDATE_FRAMES,
            smoothing_divisor: DEFAULT_SMOOTHING_DIVISOR,
            hysteresis_intervals: DEFAULT_HYSTERESIS_INTERVALS,
        }
    }
}

/// Output timestamps for one slice. DTS equals PTS: the stream has no
/// B-frame reordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub pts: u64,
    pub dts: u64,
    pub duration: u64,
}

/// Per-session filter state. Nothing here survives a session restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncState {
    /// Capture timestamp of the session's first frame.
    pub start_time: Option<u64>,
    pub prev_output_pts: Option<i64>,
    /// Current interval estimate (ns).
    pub frame_interval: i64,
    pub frames_since_interval_update: u32,
    /// Relative timestamp of the last re-estimation point.
    pub prev_interval_anchor_ts: Option<i64>,
}

impl SyncState {
    fn new(frame_interval: i64) -> Self {
        Self {
            start_time: None,
            prev_output_pts: None,
            frame_interval,
            frames_since_interval_update: 0,
            prev_interval_anchor_ts: None,
        }
    }
}

pub struct TimestampSync {
    config: SyncConfig,
    nominal_interval: i64,
    state: SyncState,
}

impl TimestampSync {
    /// `nominal_interval_ns` seeds the estimate, normally `1e9 / framerate`.
    pub fn new(nominal_interval_ns: u64, config: SyncConfig) -> Self {
        let nominal_interval = i64::try_from(nominal_interval_ns).unwrap_or(i64::MAX).max(1);
        let config = SyncConfig {
            interval_update_frames: config.interval_update_frames.max(1),
            smoothing_divisor: config.smoothing_divisor.max(1),
            hysteresis_intervals: config.hysteresis_intervals.max(1),
        };
        Self {
            config,
            nominal_interval,
            state: SyncState::new(nominal_interval),
        }
    }

    pub fn for_framerate(fps: u32, config: SyncConfig) -> Self {
        Self::new(interval_for_framerate(fps), config)
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    /// Current frame-interval estimate in nanoseconds.
    pub fn frame_interval(&self) -> u64 {
        self.state.frame_interval as u64
    }

    /// Forget all timing history; the next frame becomes time zero again.
    pub fn reset(&mut self) {
        self.state = SyncState::new(self.nominal_interval);
    }

    /// Capture timestamp relative to the first frame of the session. The
    /// first call establishes the origin.
    pub fn relative(&mut self, capture_ts: u64) -> i64 {
        let start = *self.state.start_time.get_or_insert(capture_ts);
        i64::try_from(capture_ts.saturating_sub(start)).unwrap_or(i64::MAX)
    }

    /// Output timing for an emitted slice captured at `relative_ts`.
    pub fn stamp(&mut self, relative_ts: i64, keyframe: bool) -> Timing {
        let config = self.config;
        let s = &mut self.state;

        // Slices dropped before the first keyframe still count towards the
        // spacing of the first emitted one.
        let prev = *s
            .prev_output_pts
            .get_or_insert(relative_ts - s.frame_interval);

        s.frames_since_interval_update += 1;
        if keyframe && s.frames_since_interval_update >= config.interval_update_frames {
            // The first batch after start-up is too noisy to measure; it
            // only sets the anchor.
            if let Some(anchor) = s.prev_interval_anchor_ts {
                let frames = i64::from(s.frames_since_interval_update);
                let measured = (relative_ts - anchor).max(0) / frames;
                let div = i64::from(config.smoothing_divisor);
                let blended = (s.frame_interval * (div - 1) + measured + div / 2) / div;
                debug!(
                    "Frame interval re-estimated: measured {} ns, {} -> {} ns",
                    measured, s.frame_interval, blended
                );
                s.frame_interval = blended.max(1);
            }
            s.frames_since_interval_update = 0;
            s.prev_interval_anchor_ts = Some(relative_ts);
        }

        let mut candidate = prev + s.frame_interval;
        if s.prev_interval_anchor_ts.is_some() {
            let diff = relative_ts - candidate;
            let band = i64::from(config.hysteresis_intervals) * s.frame_interval;
            if diff.abs() > band {
                let limit = s.frame_interval / 2;
                let adjustment = diff.clamp(-limit, limit);
                trace!("PTS drift {} ns, adjusting by {} ns", diff, adjustment);
                candidate += adjustment;
            }
        }

        s.prev_output_pts = Some(candidate);
        let pts = candidate.max(0) as u64;
        Timing {
            pts,
            dts: pts,
            duration: (candidate - prev).max(0) as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const I: u64 = 33_333_333;
    const BASE: u64 = 5_000_000_000;

    /// Feed one slice per capture frame; keyframe every `gop` frames.
    fn run(sync: &mut TimestampSync, ts: &[u64], gop: usize) -> Vec<Timing> {
        ts.iter()
            .enumerate()
            .map(|(k, &t)| {
                let rel = sync.relative(t);
                sync.stamp(rel, k % gop == 0)
            })
            .collect()
    }

    #[test]
    fn interval_from_framerate() {
        assert_eq!(interval_for_framerate(30), I);
        assert_eq!(interval_for_framerate(25), 40_000_000);
        assert_eq!(interval_for_framerate(0), NANOS_PER_SEC);
    }

    #[test]
    fn first_slice_is_time_zero_with_nominal_duration() {
        let mut sync = TimestampSync::new(I, SyncConfig::default());
        let rel = sync.relative(BASE);
        assert_eq!(rel, 0);
        let t = sync.stamp(rel, true);
        assert_eq!(t, Timing { pts: 0, dts: 0, duration: I });
        assert_eq!(sync.state().start_time, Some(BASE));
    }

    #[test]
    fn time_before_first_keyframe_is_preserved() {
        let mut sync = TimestampSync::new(I, SyncConfig::default());
        // Three frames were dropped waiting for the IDR; they still set the origin.
        sync.relative(BASE);
        let rel = sync.relative(BASE + 3 * I);
        let t = sync.stamp(rel, true);
        assert_eq!(t.pts, 3 * I);
        assert_eq!(t.duration, I);
    }

    #[test]
    fn jitter_within_band_is_fully_absorbed() {
        let ts: Vec<u64> = (0..600u64)
            .map(|k| {
                let nominal = BASE + k * I;
                match k % 3 {
                    0 => nominal,
                    1 => nominal + I * 9 / 10,
                    _ => nominal - I * 9 / 10,
                }
            })
            .collect();
        let mut sync = TimestampSync::new(I, SyncConfig::default());
        let out = run(&mut sync, &ts, 30);

        for (k, t) in out.iter().enumerate() {
            assert_eq!(t.pts, k as u64 * I, "frame {}", k);
            assert_eq!(t.duration, I);
        }
        assert_eq!(sync.frame_interval(), I);
    }

    #[test]
    fn first_measurement_only_sets_anchor() {
        // Camera really runs at twice the nominal interval.
        let ts: Vec<u64> = (0..=60u64).map(|k| BASE + k * 2 * I).collect();
        let mut sync = TimestampSync::new(I, SyncConfig::default());
        run(&mut sync, &ts, 30);
        assert_eq!(sync.frame_interval(), I);
        assert_eq!(sync.state().prev_interval_anchor_ts, Some(120 * I as i64));
        assert_eq!(sync.state().frames_since_interval_update, 0);
    }

    #[test]
    fn second_measurement_blends_with_one_twentieth_weight() {
        let ts: Vec<u64> = (0..=120u64).map(|k| BASE + k * 2 * I).collect();
        let mut sync = TimestampSync::new(I, SyncConfig::default());
        run(&mut sync, &ts, 30);
        let measured = 2 * I;
        assert_eq!(sync.frame_interval(), (I * 19 + measured + 10) / 20);
    }

    #[test]
    fn slow_camera_drift_is_tracked() {
        let real = I + I / 100;
        let ts: Vec<u64> = (0..3000u64).map(|k| BASE + k * real).collect();
        let mut sync = TimestampSync::new(I, SyncConfig::default());
        let out = run(&mut sync, &ts, 30);

        for (k, t) in out.iter().enumerate() {
            let rel = k as u64 * real;
            let err = t.pts.abs_diff(rel);
            assert!(err <= 3 * I, "frame {} off by {} ns", k, err);
        }
        let learned = sync.frame_interval();
        assert!(learned > I + (real - I) * 8 / 10, "interval {}", learned);
        assert!(learned <= real);
    }

    #[test]
    fn step_jump_is_corrected_by_at_most_half_an_interval_per_frame() {
        let mut ts: Vec<u64> = (0..200u64).map(|k| BASE + k * I).collect();
        // Capture clock leaps ten intervals ahead after the anchor exists.
        for t in ts.iter_mut().skip(100) {
            *t += 10 * I;
        }
        let mut sync = TimestampSync::new(I, SyncConfig::default());
        let out = run(&mut sync, &ts, 30);

        // The re-estimate at frame 120 sees the jump too, so allow the
        // interval a little headroom above nominal.
        for t in &out[101..] {
            assert!(t.duration <= I + I / 2 + I / 50, "duration {}", t.duration);
            assert!(t.duration >= I);
        }
        // Caught up to within the dead band again.
        let last_rel = 199 * I + 10 * I;
        assert!(out[199].pts.abs_diff(last_rel) <= 2 * I);
    }

    #[test]
    fn no_correction_before_anchor() {
        let mut ts: Vec<u64> = (0..50u64).map(|k| BASE + k * I).collect();
        for t in ts.iter_mut().skip(10) {
            *t += 10 * I;
        }
        let mut sync = TimestampSync::new(I, SyncConfig::default());
        let out = run(&mut sync, &ts, 30);
        assert!(out.iter().all(|t| t.duration == I));
    }

    #[test]
    fn reset_restores_nominal_interval_and_origin() {
        let ts: Vec<u64> = (0..=120u64).map(|k| BASE + k * 2 * I).collect();
        let mut sync = TimestampSync::new(I, SyncConfig::default());
        run(&mut sync, &ts, 30);
        assert_ne!(sync.frame_interval(), I);

        sync.reset();
        assert_eq!(sync.state(), &SyncState::new(I as i64));
        let rel = sync.relative(BASE * 3);
        assert_eq!(sync.stamp(rel, true).pts, 0);
    }

    #[test]
    fn capture_clock_going_backwards_saturates() {
        let mut sync = TimestampSync::new(I, SyncConfig::default());
        sync.relative(BASE);
        assert_eq!(sync.relative(BASE - 1), 0);
    }

    #[test]
    fn frozen_capture_clock_still_advances_pts() {
        let ts = vec![BASE; 400];
        let mut sync = TimestampSync::new(I, SyncConfig::default());
        let out = run(&mut sync, &ts, 30);
        for pair in out.windows(2) {
            assert!(pair[1].pts > pair[0].pts);
        }
    }
}
