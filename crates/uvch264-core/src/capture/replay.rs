//! File-backed capture device.
//!
//! Replays an Annex-B elementary stream as if it came off a camera: NAL
//! units are grouped into hardware-sized frames and delivered from a named
//! thread, paced at the negotiated frame rate and stamped with a monotonic
//! clock reading. End of file ends the session.

use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use quanta::Instant;
use tracing::{debug, info, warn};

use super::{CaptureDevice, CaptureError, FrameCallback, RawFrame};
use crate::config::SourceConfig;
use crate::format::{Capability, SelectedFormat};
use crate::media::nal;

/// Longest single sleep while pacing, so a stop request is noticed quickly.
const MAX_SLEEP: Duration = Duration::from_millis(50);

/// Byte ranges of capture-like frames in an Annex-B stream. Each frame
/// closes with a slice; parameter sets and SEI travel with the slice that
/// follows them. Bytes before the first start code are ignored.
pub fn split_frames(data: &[u8]) -> Vec<Range<usize>> {
    let mut frames = Vec::new();
    let mut start: Option<usize> = None;
    for unit in nal::scan(data, usize::MAX) {
        let frame_start = *start.get_or_insert(unit.offset);
        if unit.nal_type.is_slice() {
            let end = unit.offset + unit.len();
            frames.push(frame_start..end);
            start = None;
        }
    }
    if let Some(frame_start) = start {
        frames.push(frame_start..data.len());
    }
    frames
}

pub struct ReplayDevice {
    identity: String,
    path: PathBuf,
    capability: Capability,
    paced: bool,
    running: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl ReplayDevice {
    pub fn new(
        path: impl Into<PathBuf>,
        identity: impl Into<String>,
        capability: Capability,
    ) -> Self {
        Self {
            identity: identity.into(),
            path: path.into(),
            capability,
            paced: true,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Device for `path` using the configured identity and replay format.
    pub fn from_config(path: impl Into<PathBuf>, config: &SourceConfig) -> Self {
        Self::new(path, config.device_index.clone(), config.replay.capability())
    }

    /// Unpaced replay delivers frames back to back with exact nominal
    /// timestamps.
    pub fn paced(mut self, paced: bool) -> Self {
        self.paced = paced;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn join_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Replay thread for '{}' panicked", self.identity);
            }
        }
    }
}

impl CaptureDevice for ReplayDevice {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![self.capability.clone()]
    }

    fn start(
        &mut self,
        format: SelectedFormat,
        callback: FrameCallback,
    ) -> Result<(), CaptureError> {
        if self.is_running() {
            return Err(CaptureError::AlreadyStreaming);
        }
        // A previous run may have ended on its own at end of file.
        self.join_worker();

        let data = fs::read(&self.path)?;
        let frames = split_frames(&data);
        if frames.is_empty() {
            warn!("No H.264 NAL units found in {}", self.path.display());
        }
        info!(
            "Replaying {} frames from {} at {}x{} @ {} fps",
            frames.len(),
            self.path.display(),
            format.width,
            format.height,
            format.framerate
        );

        self.running.store(true, Ordering::Release);
        let running = self.running.clone();
        let interval_ns = format.frame_interval_ns();
        let paced = self.paced;
        let worker = thread::Builder::new()
            .name("uvch264-replay".into())
            .spawn(move || {
                let mut callback = callback;
                let origin = Instant::now();
                let mut delivered = 0usize;
                for (n, range) in frames.into_iter().enumerate() {
                    if !running.load(Ordering::Acquire) {
                        break;
                    }
                    let nominal = interval_ns.saturating_mul(n as u64);
                    let timestamp = if paced {
                        if !sleep_until(origin, nominal, &running) {
                            break;
                        }
                        Instant::now().duration_since(origin).as_nanos() as u64
                    } else {
                        nominal
                    };
                    callback(RawFrame {
                        data: &data[range],
                        timestamp,
                    });
                    delivered += 1;
                }
                debug!("Replay delivered {} frames", delivered);
                running.store(false, Ordering::Release);
            });

        match worker {
            Ok(worker) => {
                self.worker = Some(worker);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(CaptureError::Io(e))
            }
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.join_worker();
    }
}

impl Drop for ReplayDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sleep until `offset_ns` past `origin`. Returns false if stopped first.
fn sleep_until(origin: Instant, offset_ns: u64, running: &AtomicBool) -> bool {
    let due = Duration::from_nanos(offset_ns);
    loop {
        if !running.load(Ordering::Acquire) {
            return false;
        }
        let elapsed = Instant::now().duration_since(origin);
        if elapsed >= due {
            return true;
        }
        thread::sleep((due - elapsed).min(MAX_SLEEP));
    }
}
