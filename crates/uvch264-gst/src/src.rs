use crate::caps::{output_caps, template_caps, CapsConstraint};
use crate::util::lock_or_recover;
use gst::glib;
use gst::prelude::*;
use gst::subclass::prelude::*;
use gst_base::prelude::*;
use gst_base::subclass::prelude::*;
use once_cell::sync::Lazy;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use uvch264_core::capture::replay::ReplayDevice;
use uvch264_core::capture::{build_assembler, CaptureDevice, CaptureSession};
use uvch264_core::config::{SourceConfig, DEFAULT_DEVICE_INDEX};
use uvch264_core::format::{select_format, SelectedFormat};
use uvch264_core::media::assembler::Assembler;
use uvch264_core::queue::{FrameQueue, PopError};
use uvch264_core::stats::{SessionStats, StatsSnapshot};
use uvch264_core::timing::TimestampSync;

static CAT: Lazy<gst::DebugCategory> = Lazy::new(|| {
    gst::DebugCategory::new(
        "uvch264src",
        gst::DebugColorFlags::empty(),
        Some("UVC H.264 capture source"),
    )
});

fn stats_structure(snap: &StatsSnapshot) -> gst::Structure {
    gst::Structure::builder("uvch264src-stats")
        .field("frames_received", snap.frames_received)
        .field("empty_frames", snap.empty_frames)
        .field("units_emitted", snap.units_emitted)
        .field("units_before_keyframe", snap.units_before_keyframe)
        .field("malformed_units", snap.malformed_units)
        .field("param_set_writes", snap.param_set_writes)
        .field("param_set_write_failures", snap.param_set_write_failures)
        .field("queue_overflow_drops", snap.queue_overflow_drops)
        .build()
}

mod imp {
    use super::*;

    struct Settings {
        index: String,
        location: Option<String>,
        spspps_dir: Option<String>,
        queue_size: u32,
        config_toml: String,
    }

    impl Default for Settings {
        fn default() -> Self {
            Self {
                index: DEFAULT_DEVICE_INDEX.to_string(),
                location: None,
                spspps_dir: None,
                queue_size: 0,
                config_toml: String::new(),
            }
        }
    }

    impl Settings {
        /// TOML config with the individually set properties on top.
        fn resolve(&self) -> Result<SourceConfig, uvch264_core::config::ConfigError> {
            let mut config = SourceConfig::from_toml_str(&self.config_toml)?;
            config.device_index = self.index.clone();
            config.queue.capacity = self.queue_size as usize;
            if let Some(dir) = &self.spspps_dir {
                config.persistence.dir = Some(PathBuf::from(dir));
            }
            Ok(config)
        }
    }

    /// Between `start` and `stop`.
    struct State {
        config: SourceConfig,
        device: Box<dyn CaptureDevice>,
        installed: bool,
        /// Taken by the session when streaming begins.
        assembler: Option<Assembler>,
        format: Option<SelectedFormat>,
        streaming: bool,
    }

    #[derive(Default)]
    pub struct Uvch264Src {
        settings: Mutex<Settings>,
        installed: Mutex<Option<Box<dyn CaptureDevice>>>,
        state: Mutex<Option<State>>,
        queue: Mutex<Option<Arc<FrameQueue>>>,
        stats: Mutex<Arc<SessionStats>>,
    }

    impl Uvch264Src {
        fn apply_config_toml(&self, toml_str: &str) {
            if toml_str.trim().is_empty() {
                return;
            }
            match SourceConfig::from_toml_str(toml_str) {
                Ok(cfg) => {
                    let mut settings = lock_or_recover(&self.settings);
                    settings.config_toml = toml_str.to_string();
                    settings.index = cfg.device_index;
                    settings.queue_size = u32::try_from(cfg.queue.capacity).unwrap_or(u32::MAX);
                    settings.spspps_dir = cfg
                        .persistence
                        .dir
                        .map(|d| d.to_string_lossy().into_owned());
                }
                Err(e) => {
                    gst::warning!(CAT, imp = self, "Invalid config TOML: {}", e);
                }
            }
        }

        pub(super) fn install_device(&self, device: Box<dyn CaptureDevice>) {
            gst::info!(CAT, imp = self, "Capture device '{}' installed", device.identity());
            *lock_or_recover(&self.installed) = Some(device);
        }

        pub(super) fn snapshot(&self) -> StatsSnapshot {
            lock_or_recover(&self.stats).snapshot()
        }

        /// Open the session on the first `create`: new synchronizer seeded
        /// from the negotiated interval, then the device starts delivering.
        fn ensure_streaming(&self) -> Result<Arc<FrameQueue>, gst::FlowError> {
            let queue = lock_or_recover(&self.queue)
                .clone()
                .ok_or(gst::FlowError::Flushing)?;

            let mut state_guard = lock_or_recover(&self.state);
            let Some(state) = state_guard.as_mut() else {
                return Err(gst::FlowError::Flushing);
            };
            if state.streaming {
                return Ok(queue);
            }
            if queue.is_flushing() {
                return Err(gst::FlowError::Flushing);
            }

            let Some(format) = state.format else {
                gst::error!(CAT, imp = self, "create called before negotiation");
                return Err(gst::FlowError::NotNegotiated);
            };
            let Some(assembler) = state.assembler.take() else {
                return Err(gst::FlowError::Error);
            };

            let stats = lock_or_recover(&self.stats).clone();
            let sync = TimestampSync::new(format.frame_interval_ns(), state.config.timing);
            let session =
                CaptureSession::new(assembler, sync, queue.producer(stats.clone()), stats);

            queue.start();
            if let Err(e) = state.device.start(format, session.into_callback()) {
                queue.stop();
                gst::element_imp_error!(
                    self,
                    gst::ResourceError::Read,
                    ["Failed to start capture on '{}': {}", state.device.identity(), e]
                );
                return Err(gst::FlowError::Error);
            }
            state.streaming = true;
            gst::info!(
                CAT,
                imp = self,
                "Streaming {}x{} @ {} fps from '{}'",
                format.width,
                format.height,
                format.framerate,
                state.device.identity()
            );
            Ok(queue)
        }
    }

    #[glib::object_subclass]
    impl ObjectSubclass for Uvch264Src {
        const NAME: &'static str = "Uvch264Src";
        type Type = super::Uvch264Src;
        type ParentType = gst_base::PushSrc;
    }

    impl ObjectImpl for Uvch264Src {
        fn constructed(&self) {
            self.parent_constructed();
            let obj = self.obj();
            obj.set_live(true);
            obj.set_format(gst::Format::Time);
        }

        fn properties() -> &'static [glib::ParamSpec] {
            static PROPERTIES: std::sync::OnceLock<Vec<glib::ParamSpec>> =
                std::sync::OnceLock::new();

            PROPERTIES.get_or_init(|| {
                vec![
                    glib::ParamSpecString::builder("index")
                        .nick("Device Index")
                        .blurb("Capture device identity; also keys the SPS/PPS cache")
                        .default_value(Some(DEFAULT_DEVICE_INDEX))
                        .mutable_ready()
                        .build(),
                    glib::ParamSpecString::builder("location")
                        .nick("Location")
                        .blurb("Annex-B H.264 file to replay when no device is installed")
                        .mutable_ready()
                        .build(),
                    glib::ParamSpecString::builder("spspps-dir")
                        .nick("SPS/PPS Directory")
                        .blurb("Directory for cached parameter sets (default $HOME/.spspps)")
                        .mutable_ready()
                        .build(),
                    glib::ParamSpecUInt::builder("queue-size")
                        .nick("Queue Size")
                        .blurb("Maximum queued access units (0 = unbounded)")
                        .default_value(0)
                        .mutable_ready()
                        .build(),
                    glib::ParamSpecString::builder("config")
                        .nick("Config (TOML)")
                        .blurb("TOML config with versioned schema")
                        .mutable_ready()
                        .build(),
                    glib::ParamSpecString::builder("config-file")
                        .nick("Config File")
                        .blurb("Path to TOML config file (alternative to inline config property)")
                        .mutable_ready()
                        .build(),
                    glib::ParamSpecBoxed::builder::<gst::Structure>("stats")
                        .nick("Statistics")
                        .blurb("Session counters")
                        .read_only()
                        .build(),
                ]
            })
        }

        fn set_property(&self, _id: usize, value: &glib::Value, pspec: &glib::ParamSpec) {
            match pspec.name() {
                "index" => {
                    let index: Option<String> = value.get().expect("type checked upstream");
                    let mut settings = lock_or_recover(&self.settings);
                    settings.index = index
                        .map(|i| i.trim().to_string())
                        .filter(|i| !i.is_empty())
                        .unwrap_or_else(|| DEFAULT_DEVICE_INDEX.to_string());
                }
                "location" => {
                    let mut settings = lock_or_recover(&self.settings);
                    settings.location = value
                        .get::<Option<String>>()
                        .expect("type checked upstream")
                        .filter(|l| !l.is_empty());
                }
                "spspps-dir" => {
                    let mut settings = lock_or_recover(&self.settings);
                    settings.spspps_dir = value
                        .get::<Option<String>>()
                        .expect("type checked upstream")
                        .filter(|d| !d.is_empty());
                }
                "queue-size" => {
                    let mut settings = lock_or_recover(&self.settings);
                    settings.queue_size = value.get().expect("type checked upstream");
                }
                "config" => {
                    let cfg: Option<String> = value.get().expect("type checked upstream");
                    self.apply_config_toml(cfg.as_deref().unwrap_or(""));
                }
                "config-file" => {
                    let path: Option<String> = value.get().expect("type checked upstream");
                    let Some(path) = path.filter(|p| !p.is_empty()) else {
                        return;
                    };
                    if path.contains("..") {
                        gst::warning!(CAT, imp = self, "Rejected config-file path with '..': {}", path);
                        return;
                    }
                    match std::fs::read_to_string(&path) {
                        Ok(cfg) => self.apply_config_toml(&cfg),
                        Err(e) => {
                            gst::warning!(
                                CAT,
                                imp = self,
                                "Failed to read config file '{}': {}",
                                path,
                                e
                            );
                        }
                    }
                }
                _ => {
                    gst::warning!(CAT, imp = self, "Unknown property: {}", pspec.name());
                }
            }
        }

        fn property(&self, _id: usize, pspec: &glib::ParamSpec) -> glib::Value {
            match pspec.name() {
                "index" => lock_or_recover(&self.settings).index.to_value(),
                "location" => lock_or_recover(&self.settings).location.to_value(),
                "spspps-dir" => lock_or_recover(&self.settings).spspps_dir.to_value(),
                "queue-size" => lock_or_recover(&self.settings).queue_size.to_value(),
                "config" | "config-file" => {
                    lock_or_recover(&self.settings).config_toml.to_value()
                }
                "stats" => stats_structure(&self.snapshot()).to_value(),
                _ => {
                    gst::warning!(CAT, imp = self, "Unknown property: {}", pspec.name());
                    "".to_value()
                }
            }
        }
    }

    impl GstObjectImpl for Uvch264Src {}

    impl ElementImpl for Uvch264Src {
        fn metadata() -> Option<&'static gst::subclass::ElementMetadata> {
            static ELEMENT_METADATA: std::sync::OnceLock<gst::subclass::ElementMetadata> =
                std::sync::OnceLock::new();

            Some(ELEMENT_METADATA.get_or_init(|| {
                gst::subclass::ElementMetadata::new(
                    "UVC H.264 Source",
                    "Source/Video",
                    "Captures H.264 from a UVC camera as keyframe-first access units",
                    "uvch264 Contributors <https://github.com/RephlexZero/uvch264>",
                )
            }))
        }

        fn pad_templates() -> &'static [gst::PadTemplate] {
            static PAD_TEMPLATES: std::sync::OnceLock<Vec<gst::PadTemplate>> =
                std::sync::OnceLock::new();

            PAD_TEMPLATES.get_or_init(|| {
                vec![gst::PadTemplate::new(
                    "src",
                    gst::PadDirection::Src,
                    gst::PadPresence::Always,
                    &template_caps(),
                )
                .expect("valid src pad template")]
            })
        }
    }

    impl BaseSrcImpl for Uvch264Src {
        fn start(&self) -> Result<(), gst::ErrorMessage> {
            let mut state_guard = lock_or_recover(&self.state);
            if state_guard.is_some() {
                return Ok(());
            }

            let (config, location) = {
                let settings = lock_or_recover(&self.settings);
                let config = settings.resolve().map_err(|e| {
                    gst::error_msg!(gst::ResourceError::Settings, ["Invalid config: {}", e])
                })?;
                (config, settings.location.clone())
            };

            let (device, installed): (Box<dyn CaptureDevice>, bool) =
                match lock_or_recover(&self.installed).take() {
                    Some(device) => (device, true),
                    None => match location {
                        Some(location) => {
                            gst::info!(CAT, imp = self, "Replaying '{}'", location);
                            (Box::new(ReplayDevice::from_config(location, &config)), false)
                        }
                        None => {
                            return Err(gst::error_msg!(
                                gst::ResourceError::NotFound,
                                ["No capture device installed and no location set"]
                            ));
                        }
                    },
                };

            let stats = Arc::new(SessionStats::default());
            let assembler = match build_assembler(&config, device.identity(), stats.clone()) {
                Ok(assembler) => assembler,
                Err(e) => {
                    if installed {
                        *lock_or_recover(&self.installed) = Some(device);
                    }
                    return Err(gst::error_msg!(
                        gst::ResourceError::OpenReadWrite,
                        ["Failed to open SPS/PPS store: {}", e]
                    ));
                }
            };
            gst::debug!(
                CAT,
                imp = self,
                "Parameter sets for '{}' ready ({} + {} bytes)",
                device.identity(),
                assembler.params().sps().len(),
                assembler.params().pps().len()
            );

            *lock_or_recover(&self.stats) = stats;
            *lock_or_recover(&self.queue) = Some(Arc::new(FrameQueue::new(
                config.queue.capacity,
                config.queue.overflow,
            )));
            *state_guard = Some(State {
                config,
                device,
                installed,
                assembler: Some(assembler),
                format: None,
                streaming: false,
            });
            Ok(())
        }

        fn stop(&self) -> Result<(), gst::ErrorMessage> {
            if let Some(mut state) = lock_or_recover(&self.state).take() {
                state.device.stop();
                if state.installed {
                    *lock_or_recover(&self.installed) = Some(state.device);
                }
            }
            if let Some(queue) = lock_or_recover(&self.queue).take() {
                queue.stop();
            }
            gst::debug!(CAT, imp = self, "Stopped; {:?}", self.snapshot());
            Ok(())
        }

        fn negotiate(&self) -> Result<(), gst::LoggableError> {
            let obj = self.obj();
            let pad = obj.src_pad();
            let template = pad.pad_template_caps();
            let peer = pad.peer_query_caps(Some(&template));
            gst::debug!(CAT, imp = self, "Peer caps {:?}", peer);

            let capabilities = match lock_or_recover(&self.state).as_ref() {
                Some(state) => state.device.capabilities(),
                None => return Err(gst::loggable_error!(CAT, "Negotiating while stopped")),
            };
            let format = select_format(&capabilities, &CapsConstraint::new(peer))
                .map_err(|e| gst::loggable_error!(CAT, "{}", e))?;

            obj.set_caps(&output_caps(&format))
                .map_err(|_| gst::loggable_error!(CAT, "Downstream refused {:?}", format))?;

            if let Some(state) = lock_or_recover(&self.state).as_mut() {
                state.format = Some(format);
            }
            Ok(())
        }

        fn unlock(&self) -> Result<(), gst::ErrorMessage> {
            if let Some(queue) = lock_or_recover(&self.queue).as_ref() {
                queue.set_flushing(true);
            }
            Ok(())
        }

        fn unlock_stop(&self) -> Result<(), gst::ErrorMessage> {
            if let Some(queue) = lock_or_recover(&self.queue).as_ref() {
                queue.set_flushing(false);
            }
            Ok(())
        }
    }

    impl PushSrcImpl for Uvch264Src {
        fn create(
            &self,
            _buf: Option<&mut gst::BufferRef>,
        ) -> Result<gst_base::subclass::base_src::CreateSuccess, gst::FlowError> {
            let queue = self.ensure_streaming()?;

            let unit = match queue.pop() {
                Ok(unit) => unit,
                Err(PopError::Flushing) => return Err(gst::FlowError::Flushing),
                Err(PopError::Closed) => {
                    gst::info!(CAT, imp = self, "Capture ended");
                    return Err(gst::FlowError::Eos);
                }
                Err(PopError::NotStarted) => return Err(gst::FlowError::Error),
            };

            let mut buffer = gst::Buffer::from_slice(unit.data);
            {
                let buffer = buffer.make_mut();
                if let Some(timing) = unit.timing {
                    buffer.set_pts(gst::ClockTime::from_nseconds(timing.pts));
                    buffer.set_dts(gst::ClockTime::from_nseconds(timing.dts));
                    buffer.set_duration(gst::ClockTime::from_nseconds(timing.duration));
                }
                if !unit.keyframe {
                    buffer.set_flags(gst::BufferFlags::DELTA_UNIT);
                }
            }
            Ok(gst_base::subclass::base_src::CreateSuccess::NewBuffer(
                buffer,
            ))
        }
    }
}

glib::wrapper! {
    pub struct Uvch264Src(ObjectSubclass<imp::Uvch264Src>)
        @extends gst_base::PushSrc, gst_base::BaseSrc, gst::Element, gst::Object;
}

impl Uvch264Src {
    /// Use `device` instead of replaying `location`. Takes effect at the
    /// next start; the element keeps the device across restarts.
    pub fn set_capture_device(&self, device: Box<dyn CaptureDevice>) {
        self.imp().install_device(device);
    }

    /// Counters of the current (or last) session.
    pub fn stats(&self) -> StatsSnapshot {
        self.imp().snapshot()
    }
}

pub fn register(plugin: Option<&gst::Plugin>) -> Result<(), glib::BoolError> {
    gst::Element::register(
        plugin,
        "uvch264src",
        gst::Rank::NONE,
        Uvch264Src::static_type(),
    )
}
