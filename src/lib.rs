pub mod engine;
pub mod pipeline;
pub mod source;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::source::frame::{pcm_frame_len, VideoPixelFormat, VideoRotation};

pub use crate::source::{
    AudioFrame, DataSource, FrameError, FrameResult, SourceId, StreamDataSource, VideoFrame,
};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Prefix for environment overrides, e.g. `STREAMSOURCE__VIDEO__WIDTH=1280`
pub const ENV_PREFIX: &str = "STREAMSOURCE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("pixel format {0:?} has no byte-buffer layout")]
    UnsupportedPixelFormat(VideoPixelFormat),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub video: VideoConfig,
    pub audio: AudioConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Built-in test pattern and tone
    #[default]
    Synthetic,
    /// Samples pushed by an application-side producer
    Relay,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub relay_video_frames: usize,
    pub relay_audio_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: VideoPixelFormat,
    pub rotation: VideoRotation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u32,
    /// Duration of one pulled chunk
    pub frame_ms: u32,
    /// Synthetic tone frequency
    pub tone_hz: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 0 runs until interrupted
    pub run_secs: u64,
    /// Engine-side video buffer; defaults to one frame of the configured format
    pub video_buffer_bytes: Option<usize>,
    /// Bound on pull events queued for logging
    pub event_queue: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Synthetic,
            relay_video_frames: 4,
            relay_audio_ms: 200,
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 360,
            fps: 30,
            format: VideoPixelFormat::I420,
            rotation: VideoRotation::Deg0,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
            frame_ms: 10,
            tone_hz: 440.0,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            run_secs: 5,
            video_buffer_bytes: None,
            event_queue: 64,
        }
    }
}

impl VideoConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 || self.fps == 0 {
            return Err(ConfigError::Invalid(
                "video width, height and fps must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl AudioConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_ms as u64)
    }

    /// Byte size of one pulled chunk
    pub fn chunk_len(&self) -> usize {
        pcm_frame_len(self.sample_rate, self.channels, self.frame_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 || self.frame_ms == 0 {
            return Err(ConfigError::Invalid(
                "audio sample_rate and frame_ms must be non-zero".into(),
            ));
        }
        if !(1..=8).contains(&self.channels) {
            return Err(ConfigError::Invalid(format!(
                "audio channels must be 1..=8, got {}",
                self.channels
            )));
        }
        Ok(())
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `STREAMSOURCE__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.video.validate()?;
        self.audio.validate()?;
        if self.video_buffer_len().is_none() {
            return Err(ConfigError::UnsupportedPixelFormat(self.video.format));
        }
        Ok(())
    }

    /// Engine-side video buffer size
    pub fn video_buffer_len(&self) -> Option<usize> {
        self.engine.video_buffer_bytes.or_else(|| {
            self.video
                .format
                .frame_len(self.video.width, self.video.height)
        })
    }
}
