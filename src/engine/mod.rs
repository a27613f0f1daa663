//! Minimal stand-in for the streaming engine.
//!
//! Drives attached sources the way the real engine does: start, pull video
//! and audio from separate threads into reused buffers, stop, and drop its
//! side-table entry when the source reports its destruction.

pub mod pull;
pub mod session;

pub use pull::{KindStats, MediaKind, PullDriver, PullEvent, PullPlan, PullStats};
pub use session::{Session, SessionTable};

use std::sync::Arc;

use crate::source::{DataSource, StreamDataSource};
use crate::{Config, ConfigError};

pub struct Engine {
    plan: PullPlan,
    sessions: SessionTable,
    events: Option<flume::Sender<PullEvent>>,
}

impl Engine {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let video_capacity = config
            .video_buffer_len()
            .ok_or(ConfigError::UnsupportedPixelFormat(config.video.format))?;
        Ok(Self {
            plan: PullPlan {
                video_capacity,
                video_interval: config.video.frame_interval(),
                audio_capacity: config.audio.chunk_len(),
                audio_interval: config.audio.frame_interval(),
            },
            sessions: SessionTable::new(),
            events: None,
        })
    }

    /// Report every pull on `tx`; full channels drop events.
    pub fn with_events(mut self, tx: flume::Sender<PullEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn plan(&self) -> PullPlan {
        self.plan
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Track `source` and start pulling from it.
    pub fn attach(
        &self,
        source: Arc<DataSource<dyn StreamDataSource>>,
        label: &str,
    ) -> std::io::Result<PullDriver> {
        self.sessions.attach(&*source, label);
        PullDriver::start(source, self.plan, self.events.clone())
    }
}
