//! # H.264 Byte-Stream Handling
//!
//! Scans capture frames for NAL units, caches parameter sets and assembles
//! keyframe-gated output units.

pub mod assembler;
pub mod nal;
pub mod params;
