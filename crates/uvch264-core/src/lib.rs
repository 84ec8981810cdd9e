//! # uvch264-core
//!
//! Framing and timing for H.264 UVC capture. Raw hardware frames go in
//! through a [`capture::CaptureSession`]; clean, keyframe-first access
//! units with smoothed timestamps come out of a [`queue::FrameQueue`].
//!
//! ```text
//! device callback → media::nal → media::assembler ⇄ persist
//!                                      ↓
//!                                   timing → queue → consumer
//! ```
//!
//! [`format::select_format`] runs once before streaming and seeds
//! [`timing::TimestampSync`] with the nominal frame interval.

pub mod capture;
pub mod config;
pub mod format;
pub mod media;
pub mod persist;
pub mod queue;
pub mod stats;
pub mod timing;
