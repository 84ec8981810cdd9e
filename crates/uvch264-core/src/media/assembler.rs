//! # Access-Unit Assembler
//!
//! Turns the NAL units of one capture frame into output units:
//!
//! - SPS/PPS update the cache and are never emitted on their own.
//! - The first IDR of a session, and the first IDR after a parameter-set
//!   update, is prefixed with the cached SPS and PPS.
//! - Everything before the first IDR is dropped, so the stream always opens
//!   on a decodable picture.
//!
//! When a frame changed the cached pair, the pair is persisted once after
//! the whole frame has been processed.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info, warn};

use super::nal::{self, NalType, NalUnit};
use super::params::ParameterSets;
use crate::persist::ParamSetStore;
use crate::stats::SessionStats;

/// Scanner cap for a live capture frame: slice fragments plus parameter sets.
pub const DEFAULT_MAX_UNITS_PER_FRAME: usize = 10;

/// One output unit, ready to cross to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledUnit {
    /// Annex-B bytes: optional SPS+PPS prefix, then the unit itself.
    pub data: Bytes,
    pub nal_type: NalType,
    /// Whether the cached SPS/PPS were prepended.
    pub has_parameter_sets: bool,
}

impl AssembledUnit {
    pub fn is_keyframe(&self) -> bool {
        self.nal_type == NalType::IdrSlice
    }
}

/// Per-session framing state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerState {
    /// An IDR has been emitted this session.
    pub had_keyframe: bool,
    /// SPS or PPS arrived and must ride along with the next IDR.
    pub pending_param_injection: bool,
}

/// Store plus the device identity it is keyed by.
pub struct Persistence {
    store: Arc<dyn ParamSetStore>,
    key: String,
}

impl Persistence {
    pub fn new(store: Arc<dyn ParamSetStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Cached pair for this device, falling back to the built-in defaults
    /// for anything missing or invalid.
    pub fn load(&self) -> ParameterSets {
        let mut params = ParameterSets::default();
        let Some((sps, pps)) = self.store.load(&self.key) else {
            info!("Using built-in SPS/PPS for device '{}'", self.key);
            return params;
        };
        let loaded = params.set_sps(&sps).and_then(|_| params.set_pps(&pps));
        match loaded {
            Ok(_) => debug!(
                "Loaded SPS ({} bytes) and PPS ({} bytes) for device '{}'",
                params.sps().len(),
                params.pps().len(),
                self.key
            ),
            Err(e) => {
                warn!("Stored parameter sets for '{}' rejected: {:?}", self.key, e);
                params = ParameterSets::default();
            }
        }
        params
    }

    fn save(&self, params: &ParameterSets) -> std::io::Result<()> {
        self.store.store(&self.key, params.sps(), params.pps())
    }
}

pub struct Assembler {
    params: ParameterSets,
    state: AssemblerState,
    persistence: Option<Persistence>,
    max_units: usize,
    stats: Arc<SessionStats>,
}

impl Assembler {
    pub fn new(
        params: ParameterSets,
        persistence: Option<Persistence>,
        stats: Arc<SessionStats>,
    ) -> Self {
        Self {
            params,
            state: AssemblerState::default(),
            persistence,
            max_units: DEFAULT_MAX_UNITS_PER_FRAME,
            stats,
        }
    }

    /// Seed the cache from `persistence` and keep writing back to it.
    pub fn with_persistence(persistence: Persistence, stats: Arc<SessionStats>) -> Self {
        let params = persistence.load();
        Self::new(params, Some(persistence), stats)
    }

    pub fn set_max_units(&mut self, max_units: usize) {
        self.max_units = max_units.max(1);
    }

    pub fn params(&self) -> &ParameterSets {
        &self.params
    }

    pub fn state(&self) -> AssemblerState {
        self.state
    }

    /// Start a new session. The parameter-set cache survives.
    pub fn reset(&mut self) {
        self.state = AssemblerState::default();
    }

    /// Process every NAL unit of one capture frame, in order.
    pub fn process(&mut self, frame: &[u8]) -> Vec<AssembledUnit> {
        let mut out = Vec::new();
        let mut params_changed = false;

        for unit in nal::scan(frame, self.max_units) {
            match unit.nal_type {
                NalType::Sps | NalType::Pps => {
                    params_changed |= self.update_param_set(&unit);
                }
                NalType::IdrSlice => {
                    out.push(self.keyframe(&unit));
                }
                other => {
                    if !self.state.had_keyframe {
                        self.stats.unit_before_keyframe();
                        continue;
                    }
                    out.push(AssembledUnit {
                        data: Bytes::copy_from_slice(unit.data),
                        nal_type: other,
                        has_parameter_sets: false,
                    });
                }
            }
        }

        if params_changed {
            self.persist();
        }
        out
    }

    fn update_param_set(&mut self, unit: &NalUnit<'_>) -> bool {
        let result = match unit.nal_type {
            NalType::Sps => self.params.set_sps(unit.data),
            _ => self.params.set_pps(unit.data),
        };
        match result {
            Ok(changed) => {
                self.state.pending_param_injection = true;
                if changed {
                    debug!("{:?} updated ({} bytes)", unit.nal_type, unit.len());
                }
                changed
            }
            Err(rejected) => {
                self.stats.malformed_unit();
                warn!("Ignoring {:?}: {:?}", unit.nal_type, rejected);
                false
            }
        }
    }

    fn keyframe(&mut self, unit: &NalUnit<'_>) -> AssembledUnit {
        let inject = !self.state.had_keyframe || self.state.pending_param_injection;
        let data = if inject {
            let mut buf = BytesMut::with_capacity(self.params.prefix_len() + unit.len());
            self.params.write_prefix(&mut buf);
            buf.put_slice(unit.data);
            buf.freeze()
        } else {
            Bytes::copy_from_slice(unit.data)
        };
        if !self.state.had_keyframe {
            info!("First keyframe of the session");
        }
        self.state.pending_param_injection = false;
        self.state.had_keyframe = true;

        AssembledUnit {
            data,
            nal_type: NalType::IdrSlice,
            has_parameter_sets: inject,
        }
    }

    fn persist(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        match persistence.save(&self.params) {
            Ok(()) => self.stats.param_set_written(),
            Err(e) => {
                self.stats.param_set_write_failed();
                warn!(
                    "Failed to persist parameter sets for '{}': {}",
                    persistence.key(),
                    e
                );
            }
        }
    }
}
