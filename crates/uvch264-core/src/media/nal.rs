//! # Annex-B NAL Unit Scanner
//!
//! Splits an H.264 byte-stream buffer into NAL unit views. Units are
//! delimited by the 4-byte start code `00 00 00 01`; each view keeps its
//! start code so it can be forwarded to a byte-stream consumer unchanged.
//!
//! The scanner never copies: every [`NalUnit`] borrows from the buffer it
//! was found in, so a view cannot outlive the capture callback that owns
//! the bytes.

use std::iter::FusedIterator;

/// Annex-B start code (4 bytes).
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Start code plus the one-byte NAL header.
pub const MIN_UNIT_LEN: usize = START_CODE.len() + 1;

/// H.264 NAL unit type (low 5 bits of the NAL header).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NalType {
    /// Coded slice of a non-IDR picture (P/B).
    NonIdrSlice,
    /// Coded slice of an IDR picture (keyframe).
    IdrSlice,
    /// Sequence parameter set.
    Sps,
    /// Picture parameter set.
    Pps,
    /// Anything else (SEI, AUD, filler, ...). Forwarded, never interpreted.
    Other(u8),
}

impl From<u8> for NalType {
    fn from(header: u8) -> Self {
        match header & 0x1F {
            1 => NalType::NonIdrSlice,
            5 => NalType::IdrSlice,
            7 => NalType::Sps,
            8 => NalType::Pps,
            n => NalType::Other(n),
        }
    }
}

impl NalType {
    /// The raw 5-bit type number.
    pub fn raw(self) -> u8 {
        match self {
            NalType::NonIdrSlice => 1,
            NalType::IdrSlice => 5,
            NalType::Sps => 7,
            NalType::Pps => 8,
            NalType::Other(n) => n,
        }
    }

    /// Slices carry picture data and are the only units that get timestamps.
    pub fn is_slice(self) -> bool {
        matches!(self, NalType::NonIdrSlice | NalType::IdrSlice)
    }

    pub fn is_parameter_set(self) -> bool {
        matches!(self, NalType::Sps | NalType::Pps)
    }
}

/// A view into one NAL unit of a larger buffer, start code included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalUnit<'a> {
    /// Byte offset of the start code within the scanned buffer.
    pub offset: usize,
    /// Start code, header and payload up to the next start code.
    pub data: &'a [u8],
    pub nal_type: NalType,
}

impl NalUnit<'_> {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Header byte plus payload, without the start code.
    pub fn payload(&self) -> &[u8] {
        self.data.get(START_CODE.len()..).unwrap_or(&[])
    }
}

/// Locate the next start code at or after `from` that is followed by at
/// least a header byte.
fn find_start_code(buf: &[u8], from: usize) -> Option<usize> {
    if buf.len() < from + MIN_UNIT_LEN {
        return None;
    }
    (from..buf.len() - START_CODE.len()).find(|&i| buf[i..i + START_CODE.len()] == START_CODE)
}

/// Scan `buf` for at most `max_units` NAL units.
///
/// Bytes before the first start code are ignored. Once `max_units` units
/// have been produced the rest of the buffer is left unparsed. Buffers
/// shorter than [`MIN_UNIT_LEN`] or without a start code yield nothing.
pub fn scan(buf: &[u8], max_units: usize) -> NalUnits<'_> {
    NalUnits {
        buf,
        next: find_start_code(buf, 0),
        remaining: max_units,
    }
}

/// Lazy iterator over the NAL units of a buffer. Cloning it restarts the
/// scan from the clone's current position.
#[derive(Debug, Clone)]
pub struct NalUnits<'a> {
    buf: &'a [u8],
    next: Option<usize>,
    remaining: usize,
}

impl<'a> Iterator for NalUnits<'a> {
    type Item = NalUnit<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            self.next = None;
        }
        let start = self.next?;
        let following = find_start_code(self.buf, start + MIN_UNIT_LEN);
        let end = following.unwrap_or(self.buf.len());
        self.next = following;
        self.remaining -= 1;

        Some(NalUnit {
            offset: start,
            data: &self.buf[start..end],
            nal_type: NalType::from(self.buf[start + START_CODE.len()]),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.next {
            Some(_) if self.remaining > 0 => (1, Some(self.remaining)),
            _ => (0, Some(0)),
        }
    }
}

impl FusedIterator for NalUnits<'_> {}
