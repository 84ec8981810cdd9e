//! `uvch264src` in real pipelines, fed from replay files.

use std::path::Path;
use std::sync::Once;
use std::time::Duration;

use gst::prelude::*;
use gstuvch264::src::{register, Uvch264Src};

const SPS: [u8; 9] = [0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0xC0, 0x1F, 0x8C];
const PPS: [u8; 7] = [0x00, 0x00, 0x00, 0x01, 0x68, 0xCE, 0x3C];

fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        gst::init().unwrap();
        register(None).unwrap();
    });
}

fn slice(nal_type: u8, n: u8) -> Vec<u8> {
    vec![0x00, 0x00, 0x00, 0x01, 0x60 | nal_type, 0x88, n | 0x80, 0xAA]
}

/// Three P slices before the first keyframe, then `gops` GOPs of ten.
fn write_recording(path: &Path, gops: usize) {
    let mut out = Vec::new();
    for n in 0..3 {
        out.extend(slice(1, n));
    }
    for g in 0..gops {
        out.extend_from_slice(&SPS);
        out.extend_from_slice(&PPS);
        out.extend(slice(5, g as u8));
        for p in 1..10 {
            out.extend(slice(1, p));
        }
    }
    std::fs::write(path, out).unwrap();
}

struct Pulled {
    data: Vec<u8>,
    pts: Option<gst::ClockTime>,
    delta: bool,
}

/// Runs `launch` to EOS, collecting everything that reached `appsink name=sink`.
fn run_to_eos(launch: &str) -> (gst::Pipeline, Vec<Pulled>, Option<gst::Caps>) {
    let pipeline = gst::parse::launch(launch)
        .expect("Failed to construct pipeline")
        .downcast::<gst::Pipeline>()
        .expect("Failed to cast to pipeline");
    let appsink = pipeline
        .by_name("sink")
        .unwrap()
        .downcast::<gst_app::AppSink>()
        .unwrap();

    pipeline.set_state(gst::State::Playing).unwrap();

    let mut pulled = Vec::new();
    let mut caps = None;
    while let Some(sample) = appsink.try_pull_sample(gst::ClockTime::from_seconds(5)) {
        if caps.is_none() {
            caps = sample.caps().map(|c| c.to_owned());
        }
        let buffer = sample.buffer().unwrap();
        let map = buffer.map_readable().unwrap();
        pulled.push(Pulled {
            data: map.as_slice().to_vec(),
            pts: buffer.pts(),
            delta: buffer.flags().contains(gst::BufferFlags::DELTA_UNIT),
        });
    }
    assert!(appsink.is_eos(), "pipeline stalled before EOS");
    (pipeline, pulled, caps)
}

// ─── Streaming ──────────────────────────────────────────────────────────────

#[test]
fn replay_reaches_eos_with_clean_stream() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("cam.h264");
    write_recording(&file, 3);
    let store = dir.path().join("spspps");

    let launch = format!(
        "uvch264src location=\"{}\" spspps-dir=\"{}\" index=cam0 name=src \
         ! appsink name=sink sync=false",
        file.display(),
        store.display()
    );
    let (pipeline, pulled, caps) = run_to_eos(&launch);

    // Keyframe gating and parameter-set prefix.
    let first = &pulled[0];
    assert!(!first.delta);
    assert!(first.data.starts_with(&SPS));
    assert_eq!(&first.data[SPS.len()..SPS.len() + PPS.len()], &PPS[..]);
    assert_eq!(first.data[SPS.len() + PPS.len() + 4] & 0x1F, 5);

    assert_eq!(pulled.len(), 3 * 10);
    assert_eq!(pulled.iter().filter(|p| !p.delta).count(), 3);

    // Paced capture: the gated P slices still move the clock forward.
    let pts: Vec<_> = pulled.iter().map(|p| p.pts.unwrap()).collect();
    assert!(pts[0] >= gst::ClockTime::from_mseconds(50));
    for pair in pts.windows(2) {
        assert!(pair[1] > pair[0]);
    }

    let caps = caps.unwrap();
    let s = caps.structure(0).unwrap();
    assert_eq!(s.name(), "video/x-h264");
    assert_eq!(s.get::<i32>("width").unwrap(), 1920);
    assert_eq!(
        s.get::<gst::Fraction>("framerate").unwrap(),
        gst::Fraction::new(30, 1)
    );

    let src = pipeline.by_name("src").unwrap();
    let stats = src.property::<gst::Structure>("stats");
    assert_eq!(stats.name(), "uvch264src-stats");
    assert_eq!(stats.get::<u64>("units_before_keyframe").unwrap(), 3);
    assert_eq!(stats.get::<u64>("units_emitted").unwrap(), 30);
    assert_eq!(
        src.downcast_ref::<Uvch264Src>().unwrap().stats().param_set_writes,
        1
    );

    pipeline.set_state(gst::State::Null).unwrap();
    assert!(store.join("cam0").exists());
}

#[test]
fn downstream_framerate_is_honoured() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("cam.h264");
    write_recording(&file, 1);
    let config = dir.path().join("src.toml");
    std::fs::write(
        &config,
        format!(
            "version = 1\n[persistence]\ndir = \"{}\"\n[replay]\nframerates = [15, 30]\n",
            dir.path().join("spspps").display()
        ),
    )
    .unwrap();

    let launch = format!(
        "uvch264src location=\"{}\" config-file=\"{}\" \
         ! video/x-h264,framerate=15/1 ! appsink name=sink sync=false",
        file.display(),
        config.display()
    );
    let (pipeline, pulled, caps) = run_to_eos(&launch);

    let caps = caps.unwrap();
    assert_eq!(
        caps.structure(0).unwrap().get::<gst::Fraction>("framerate").unwrap(),
        gst::Fraction::new(15, 1)
    );
    let pts: Vec<_> = pulled.iter().filter_map(|p| p.pts).collect();
    assert_eq!(
        pts[1] - pts[0],
        gst::ClockTime::from_nseconds(66_666_666)
    );
    pipeline.set_state(gst::State::Null).unwrap();
}

// ─── Failure Paths ──────────────────────────────────────────────────────────

#[test]
fn incompatible_downstream_caps_error_out() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("cam.h264");
    write_recording(&file, 1);

    let launch = format!(
        "uvch264src location=\"{}\" spspps-dir=\"{}\" \
         ! video/x-h264,width=640,height=480 ! appsink name=sink sync=false",
        file.display(),
        dir.path().join("spspps").display()
    );
    let pipeline = gst::parse::launch(&launch)
        .unwrap()
        .downcast::<gst::Pipeline>()
        .unwrap();
    let _ = pipeline.set_state(gst::State::Playing);

    let bus = pipeline.bus().unwrap();
    let start = std::time::Instant::now();
    let mut errored = false;
    while start.elapsed() < Duration::from_secs(5) {
        if let Some(msg) = bus.timed_pop(gst::ClockTime::from_mseconds(100)) {
            use gst::MessageView;
            match msg.view() {
                MessageView::Error(..) => {
                    errored = true;
                    break;
                }
                MessageView::Eos(..) => panic!("unexpected EOS"),
                _ => (),
            }
        }
    }
    assert!(errored, "negotiation failure was not reported");
    pipeline.set_state(gst::State::Null).unwrap();
}

#[test]
fn config_file_with_parent_reference_is_ignored() {
    init();
    let src = gst::ElementFactory::make("uvch264src").build().unwrap();
    src.set_property("config-file", "../etc/uvch264.toml");
    assert_eq!(src.property::<String>("config"), "");

    src.set_property("config", "version = 1\n[device]\nindex = \"cam7\"\n[queue]\ncapacity = 8\n");
    assert_eq!(src.property::<String>("index"), "cam7");
    assert_eq!(src.property::<u32>("queue-size"), 8);

    // Invalid TOML leaves the previous settings in place.
    src.set_property("config", "version = 9");
    assert_eq!(src.property::<String>("index"), "cam7");
}
