use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::format::Capability;
use crate::media::assembler::DEFAULT_MAX_UNITS_PER_FRAME;
use crate::queue::OverflowPolicy;
use crate::timing::SyncConfig;

pub const CONFIG_VERSION: u32 = 1;

pub const DEFAULT_DEVICE_INDEX: &str = "0";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SourceConfigInput {
    pub version: u32,
    pub device: DeviceConfigInput,
    pub assembler: AssemblerConfigInput,
    pub persistence: PersistenceConfigInput,
    pub timing: TimingConfigInput,
    pub queue: QueueConfigInput,
    pub replay: ReplayConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeviceConfigInput {
    pub index: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AssemblerConfigInput {
    pub max_units_per_frame: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PersistenceConfigInput {
    pub enabled: Option<bool>,
    pub dir: Option<PathBuf>,
    pub background: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimingConfigInput {
    pub interval_update_frames: Option<u32>,
    pub smoothing_divisor: Option<u32>,
    pub hysteresis_intervals: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueueConfigInput {
    pub capacity: Option<usize>,
    pub overflow: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReplayConfigInput {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub framerates: Option<Vec<u32>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceConfig {
    pub enabled: bool,
    /// `None` means the platform default (`$HOME/.spspps`).
    pub dir: Option<PathBuf>,
    pub background: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            background: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueConfig {
    /// 0 = unbounded.
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayConfig {
    pub width: u32,
    pub height: u32,
    pub framerates: Vec<u32>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            framerates: vec![30],
        }
    }
}

impl ReplayConfig {
    /// The single capability a replayed file advertises.
    pub fn capability(&self) -> Capability {
        Capability::discrete(self.width, self.height, self.framerates.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    pub version: u32,
    pub device_index: String,
    pub max_units_per_frame: usize,
    pub persistence: PersistenceConfig,
    pub timing: SyncConfig,
    pub queue: QueueConfig,
    pub replay: ReplayConfig,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            device_index: DEFAULT_DEVICE_INDEX.to_string(),
            max_units_per_frame: DEFAULT_MAX_UNITS_PER_FRAME,
            persistence: PersistenceConfig::default(),
            timing: SyncConfig::default(),
            queue: QueueConfig::default(),
            replay: ReplayConfig::default(),
        }
    }
}

impl SourceConfigInput {
    pub fn resolve(self) -> Result<SourceConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let defaults = SourceConfig::default();

        let device_index = self
            .device
            .index
            .map(|i| i.trim().to_string())
            .filter(|i| !i.is_empty())
            .unwrap_or(defaults.device_index);

        let persistence = PersistenceConfig {
            enabled: self
                .persistence
                .enabled
                .unwrap_or(defaults.persistence.enabled),
            dir: self
                .persistence
                .dir
                .filter(|d| !d.as_os_str().is_empty()),
            background: self
                .persistence
                .background
                .unwrap_or(defaults.persistence.background),
        };

        let timing = SyncConfig {
            interval_update_frames: self
                .timing
                .interval_update_frames
                .unwrap_or(defaults.timing.interval_update_frames)
                .max(1),
            smoothing_divisor: self
                .timing
                .smoothing_divisor
                .unwrap_or(defaults.timing.smoothing_divisor)
                .max(1),
            hysteresis_intervals: self
                .timing
                .hysteresis_intervals
                .unwrap_or(defaults.timing.hysteresis_intervals)
                .max(1),
        };

        let overflow = match self.queue.overflow {
            Some(name) => name.parse::<OverflowPolicy>().map_err(ConfigError::Invalid)?,
            None => defaults.queue.overflow,
        };
        let queue = QueueConfig {
            capacity: self.queue.capacity.unwrap_or(defaults.queue.capacity),
            overflow,
        };

        let framerates = self
            .replay
            .framerates
            .map(|rates| rates.into_iter().filter(|&r| r > 0).collect::<Vec<_>>())
            .unwrap_or(defaults.replay.framerates);
        if framerates.is_empty() {
            return Err(ConfigError::Invalid(
                "replay.framerates needs at least one non-zero entry".into(),
            ));
        }
        let replay = ReplayConfig {
            width: self.replay.width.unwrap_or(defaults.replay.width),
            height: self.replay.height.unwrap_or(defaults.replay.height),
            framerates,
        };
        if replay.width == 0 || replay.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "replay size {}x{} is empty",
                replay.width, replay.height
            )));
        }

        Ok(SourceConfig {
            version,
            device_index,
            max_units_per_frame: self
                .assembler
                .max_units_per_frame
                .unwrap_or(defaults.max_units_per_frame)
                .max(1),
            persistence,
            timing,
            queue,
            replay,
        })
    }
}

impl SourceConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(SourceConfig::default());
        }
        let parsed: SourceConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&input)
    }
}
