//! Session counters.
//!
//! Written by the producer context, read by whoever holds a clone of the
//! `Arc`. Relaxed atomics are enough: the counters are diagnostics, not
//! synchronization.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct SessionStats {
    frames_received: AtomicU64,
    empty_frames: AtomicU64,
    units_emitted: AtomicU64,
    units_before_keyframe: AtomicU64,
    malformed_units: AtomicU64,
    param_set_writes: AtomicU64,
    param_set_write_failures: AtomicU64,
    queue_overflow_drops: AtomicU64,
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_received: u64,
    pub empty_frames: u64,
    pub units_emitted: u64,
    pub units_before_keyframe: u64,
    pub malformed_units: u64,
    pub param_set_writes: u64,
    pub param_set_write_failures: u64,
    pub queue_overflow_drops: u64,
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        pub(crate) fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl SessionStats {
    counter!(frame_received, frames_received);
    counter!(empty_frame, empty_frames);
    counter!(unit_emitted, units_emitted);
    counter!(unit_before_keyframe, units_before_keyframe);
    counter!(malformed_unit, malformed_units);
    counter!(param_set_written, param_set_writes);
    counter!(param_set_write_failed, param_set_write_failures);
    counter!(queue_overflow_drop, queue_overflow_drops);

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            empty_frames: self.empty_frames.load(Ordering::Relaxed),
            units_emitted: self.units_emitted.load(Ordering::Relaxed),
            units_before_keyframe: self.units_before_keyframe.load(Ordering::Relaxed),
            malformed_units: self.malformed_units.load(Ordering::Relaxed),
            param_set_writes: self.param_set_writes.load(Ordering::Relaxed),
            param_set_write_failures: self.param_set_write_failures.load(Ordering::Relaxed),
            queue_overflow_drops: self.queue_overflow_drops.load(Ordering::Relaxed),
        }
    }
}
