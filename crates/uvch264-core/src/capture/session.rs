use std::io;
use std::sync::Arc;

use tracing::warn;

use super::{FrameCallback, RawFrame};
use crate::config::SourceConfig;
use crate::media::assembler::{Assembler, Persistence};
use crate::media::params::ParameterSets;
use crate::persist;
use crate::queue::{AccessUnit, FrameProducer};
use crate::stats::SessionStats;
use crate::timing::TimestampSync;

/// Assembler for device `identity`, seeded from the configured
/// parameter-set store.
pub fn build_assembler(
    config: &SourceConfig,
    identity: &str,
    stats: Arc<SessionStats>,
) -> io::Result<Assembler> {
    let mut assembler = match persist::open(&config.persistence)? {
        Some(store) => Assembler::with_persistence(Persistence::new(store, identity), stats),
        None => Assembler::new(ParameterSets::default(), None, stats),
    };
    assembler.set_max_units(config.max_units_per_frame);
    Ok(assembler)
}

/// Producer-side state for one streaming session. Owned by the capture
/// callback; nothing here is shared with the consumer except the queue
/// and the counters.
pub struct CaptureSession {
    assembler: Assembler,
    sync: TimestampSync,
    producer: FrameProducer,
    stats: Arc<SessionStats>,
}

impl CaptureSession {
    pub fn new(
        assembler: Assembler,
        sync: TimestampSync,
        producer: FrameProducer,
        stats: Arc<SessionStats>,
    ) -> Self {
        Self {
            assembler,
            sync,
            producer,
            stats,
        }
    }

    pub fn assembler(&self) -> &Assembler {
        &self.assembler
    }

    pub fn sync(&self) -> &TimestampSync {
        &self.sync
    }

    /// Frame, timestamp and queue everything one hardware frame contains.
    pub fn on_frame(&mut self, frame: RawFrame<'_>) {
        self.stats.frame_received();
        if frame.data.is_empty() {
            self.stats.empty_frame();
            warn!("Empty or invalid frame received");
            return;
        }

        let relative = self.sync.relative(frame.timestamp);
        for unit in self.assembler.process(frame.data) {
            let keyframe = unit.is_keyframe();
            let timing = unit
                .nal_type
                .is_slice()
                .then(|| self.sync.stamp(relative, keyframe));
            self.stats.unit_emitted();
            self.producer.push(AccessUnit {
                data: unit.data,
                timing,
                keyframe,
            });
        }
    }

    /// Begin a new session on the same device: framing and timing state
    /// start over, the parameter-set cache is kept.
    pub fn reset(&mut self) {
        self.assembler.reset();
        self.sync.reset();
    }

    pub fn into_callback(mut self) -> FrameCallback {
        Box::new(move |frame| self.on_frame(frame))
    }
}
