//! Capture seam.
//!
//! A [`CaptureDevice`] owns the producer thread and hands every hardware
//! frame to a callback as a borrowed [`RawFrame`]. The frame is only valid
//! for the duration of the call.

pub mod replay;
mod session;

use std::io;

use thiserror::Error;

use crate::format::{Capability, SelectedFormat};

pub use session::{build_assembler, CaptureSession};

/// One hardware frame, borrowed from the device for a single callback.
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    pub data: &'a [u8],
    /// Capture time in nanoseconds, device clock domain.
    pub timestamp: u64,
}

pub type FrameCallback = Box<dyn FnMut(RawFrame<'_>) + Send>;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("capture device not configured: {0}")]
    NotConfigured(String),
    #[error("capture device is already streaming")]
    AlreadyStreaming,
}

pub trait CaptureDevice: Send {
    /// Stable device identity; keys the parameter-set store.
    fn identity(&self) -> &str;

    /// H.264 formats the device can produce.
    fn capabilities(&self) -> Vec<Capability>;

    /// Begin delivering frames to `callback` from the device's own thread.
    /// The callback is dropped once delivery ends, for whatever reason.
    fn start(&mut self, format: SelectedFormat, callback: FrameCallback)
        -> Result<(), CaptureError>;

    /// Stop delivery. Returns once the callback will not be invoked again.
    fn stop(&mut self);
}
