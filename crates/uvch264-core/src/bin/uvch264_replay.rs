//! # uvch264-replay
//!
//! Runs a recorded Annex-B H.264 file through the capture pipeline as if it
//! came from a UVC camera, and writes out what a consumer would receive.
//!
//! ```bash
//! # Clean stream plus per-slice timing
//! uvch264-replay --input cam.h264 --output clean.h264 --timestamps pts.csv
//!
//! # As fast as possible, with nominal capture timestamps
//! uvch264-replay --input cam.h264 --fast --fps 25
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use uvch264_core::capture::replay::ReplayDevice;
use uvch264_core::capture::{build_assembler, CaptureDevice, CaptureSession};
use uvch264_core::config::SourceConfig;
use uvch264_core::format::{select_format, FormatFilter};
use uvch264_core::queue::{FrameQueue, PopError};
use uvch264_core::stats::SessionStats;
use uvch264_core::timing::TimestampSync;

/// Replay an H.264 capture through the framing and timing pipeline.
#[derive(Parser, Debug)]
#[command(name = "uvch264-replay", about = "Replay an H.264 capture file")]
struct Cli {
    /// Annex-B H.264 input file.
    #[arg(long)]
    input: PathBuf,

    /// Where to write the framed elementary stream.
    #[arg(long)]
    output: Option<PathBuf>,

    /// CSV of `pts_ns,duration_ns,keyframe` per timed unit.
    #[arg(long)]
    timestamps: Option<PathBuf>,

    /// Device identity (parameter-set cache key).
    #[arg(long)]
    device: Option<String>,

    /// Parameter-set cache directory.
    #[arg(long)]
    spspps_dir: Option<PathBuf>,

    /// Only accept this framerate.
    #[arg(long)]
    fps: Option<u32>,

    /// Advertised width.
    #[arg(long, requires = "height")]
    width: Option<u32>,

    /// Advertised height.
    #[arg(long, requires = "width")]
    height: Option<u32>,

    /// TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Don't pace delivery; stamp frames with nominal timestamps.
    #[arg(long, default_value_t = false)]
    fast: bool,
}

fn load_config(cli: &Cli) -> anyhow::Result<SourceConfig> {
    let mut config = match &cli.config {
        Some(path) => SourceConfig::from_file(path)?,
        None => SourceConfig::default(),
    };
    if let Some(device) = &cli.device {
        config.device_index = device.clone();
    }
    if let Some(dir) = &cli.spspps_dir {
        config.persistence.dir = Some(dir.clone());
    }
    if let Some(fps) = cli.fps {
        if !config.replay.framerates.contains(&fps) {
            config.replay.framerates.push(fps);
        }
    }
    if let (Some(width), Some(height)) = (cli.width, cli.height) {
        config.replay.width = width;
        config.replay.height = height;
    }
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    // ── Config ──────────────────────────────────────────────────
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    tracing::info!(
        input = %cli.input.display(),
        device = %config.device_index,
        fast = cli.fast,
        "uvch264-replay starting"
    );

    // ── Negotiation ─────────────────────────────────────────────
    let mut device = ReplayDevice::from_config(&cli.input, &config).paced(!cli.fast);
    let mut constraint = FormatFilter::new();
    if let Some(fps) = cli.fps {
        constraint = constraint.framerate(fps);
    }
    let format = select_format(&device.capabilities(), &constraint)?;

    // ── Session ─────────────────────────────────────────────────
    let stats = Arc::new(SessionStats::default());
    let assembler = build_assembler(&config, device.identity(), stats.clone())
        .context("failed to open parameter-set store")?;
    let sync = TimestampSync::new(format.frame_interval_ns(), config.timing);
    let queue = FrameQueue::new(config.queue.capacity, config.queue.overflow);
    let producer = queue.producer(stats.clone());
    let session = CaptureSession::new(assembler, sync, producer, stats.clone());

    let mut output = match &cli.output {
        Some(path) => Some(BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => None,
    };
    let mut timestamps = match &cli.timestamps {
        Some(path) => {
            let mut w = BufWriter::new(
                File::create(path).with_context(|| format!("creating {}", path.display()))?,
            );
            writeln!(w, "pts_ns,duration_ns,keyframe")?;
            Some(w)
        }
        None => None,
    };

    queue.start();
    device
        .start(format, session.into_callback())
        .with_context(|| format!("replaying {}", cli.input.display()))?;

    // ── Consume ─────────────────────────────────────────────────
    let mut units = 0u64;
    let mut bytes = 0u64;
    let mut last_pts = None;
    loop {
        let unit = match queue.pop() {
            Ok(unit) => unit,
            Err(PopError::Closed) => break,
            Err(e) => bail!("queue failed: {}", e),
        };
        units += 1;
        bytes += unit.data.len() as u64;
        if let Some(out) = output.as_mut() {
            out.write_all(&unit.data)?;
        }
        if let (Some(csv), Some(timing)) = (timestamps.as_mut(), unit.timing) {
            writeln!(
                csv,
                "{},{},{}",
                timing.pts,
                timing.duration,
                u8::from(unit.keyframe)
            )?;
        }
        if unit.timing.is_some() {
            last_pts = unit.pts();
        }
    }

    device.stop();
    queue.stop();
    if let Some(mut out) = output {
        out.flush()?;
    }
    if let Some(mut csv) = timestamps {
        csv.flush()?;
    }

    // ── Summary ─────────────────────────────────────────────────
    let snap = stats.snapshot();
    tracing::info!(
        frames = snap.frames_received,
        empty = snap.empty_frames,
        units,
        bytes,
        dropped_before_keyframe = snap.units_before_keyframe,
        malformed = snap.malformed_units,
        param_set_writes = snap.param_set_writes,
        param_set_write_failures = snap.param_set_write_failures,
        overflow_drops = snap.queue_overflow_drops,
        last_pts_ns = ?last_pts,
        "replay finished"
    );
    if units == 0 {
        bail!("no decodable units in {}", cli.input.display());
    }
    Ok(())
}
