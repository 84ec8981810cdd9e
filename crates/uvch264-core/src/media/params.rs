//! Cached SPS/PPS pair.
//!
//! Both sets are held Annex-B framed (start code included) so they can be
//! prepended to an IDR slice verbatim and persisted as a self-describing blob.

use bytes::{BufMut, Bytes, BytesMut};

use super::nal::{self, NalType};

/// Largest SPS or PPS accepted from the stream or from the store.
pub const MAX_PARAM_SET_LEN: usize = 1024;

/// Fallback SPS (High profile, level 5.2) used until a real one is seen.
pub const DEFAULT_SPS: [u8; 31] = [
    0x00, 0x00, 0x00, 0x01, 0x67, 0x64, 0x00, 0x34, 0xAC, 0x4D, 0x00, 0xF0, 0x04, 0x4F, 0xCB,
    0x35, 0x01, 0x01, 0x01, 0x40, 0x00, 0x00, 0xFA, 0x00, 0x00, 0x3A, 0x98, 0x03, 0xC7, 0x0C,
    0xA8,
];

/// Fallback PPS matching [`DEFAULT_SPS`].
pub const DEFAULT_PPS: [u8; 8] = [0x00, 0x00, 0x00, 0x01, 0x68, 0xEE, 0x3C, 0xB0];

/// Why a candidate parameter set was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    /// No NAL header after the start code; only reachable through the
    /// setters, the scanner never yields such a unit.
    TooShort,
    TooLong(usize),
}

/// The current SPS and PPS, each an owned Annex-B framed NAL unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSets {
    sps: Bytes,
    pps: Bytes,
}

impl Default for ParameterSets {
    fn default() -> Self {
        Self {
            sps: Bytes::from_static(&DEFAULT_SPS),
            pps: Bytes::from_static(&DEFAULT_PPS),
        }
    }
}

fn validate(unit: &[u8]) -> Result<(), Rejected> {
    if unit.len() < nal::MIN_UNIT_LEN {
        return Err(Rejected::TooShort);
    }
    if unit.len() > MAX_PARAM_SET_LEN {
        return Err(Rejected::TooLong(unit.len()));
    }
    Ok(())
}

/// Split a persisted blob back into its SPS and PPS units. Units are
/// matched by NAL type, not by position, so a PPS-first blob still loads.
pub fn split_blob(blob: &[u8]) -> (Option<&[u8]>, Option<&[u8]>) {
    let mut sps = None;
    let mut pps = None;
    for unit in nal::scan(blob, 2) {
        match unit.nal_type {
            NalType::Sps => sps = Some(unit.data),
            NalType::Pps => pps = Some(unit.data),
            _ => {}
        }
    }
    (sps, pps)
}

impl ParameterSets {
    pub fn sps(&self) -> &[u8] {
        &self.sps
    }

    pub fn pps(&self) -> &[u8] {
        &self.pps
    }

    /// Replace the SPS. Returns whether the stored bytes changed.
    pub fn set_sps(&mut self, unit: &[u8]) -> Result<bool, Rejected> {
        validate(unit)?;
        if self.sps[..] == *unit {
            return Ok(false);
        }
        self.sps = Bytes::copy_from_slice(unit);
        Ok(true)
    }

    /// Replace the PPS. Returns whether the stored bytes changed.
    pub fn set_pps(&mut self, unit: &[u8]) -> Result<bool, Rejected> {
        validate(unit)?;
        if self.pps[..] == *unit {
            return Ok(false);
        }
        self.pps = Bytes::copy_from_slice(unit);
        Ok(true)
    }

    /// Write SPS then PPS into `out`.
    pub fn write_prefix(&self, out: &mut BytesMut) {
        out.reserve(self.prefix_len());
        out.put_slice(&self.sps);
        out.put_slice(&self.pps);
    }

    pub fn prefix_len(&self) -> usize {
        self.sps.len() + self.pps.len()
    }

    /// The persisted form: SPS NAL followed by PPS NAL.
    pub fn to_blob(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.write_prefix(&mut out);
        out.freeze()
    }
}
