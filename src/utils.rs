use std::sync::Arc;

use tracing::info;

use crate::source::relay::{relay, RelayCapacity, RelayFeeder};
use crate::source::{DataSource, StreamDataSource, SyntheticSource};
use crate::{Config, ConfigError, SourceKind, CONFIG};

pub type SharedSource = Arc<DataSource<dyn StreamDataSource>>;

/// Source built from configuration
pub struct BuiltSource {
    pub source: SharedSource,
    /// Present for relay sources: the application's push side
    pub feeder: Option<RelayFeeder>,
}

/// Construct the configured data source
pub fn build_source(config: &Config) -> Result<BuiltSource, ConfigError> {
    let built = match config.source.kind {
        SourceKind::Synthetic => {
            let synthetic = SyntheticSource::new(config.video.clone(), config.audio.clone())?;
            BuiltSource {
                source: Arc::new(DataSource::new(synthetic)),
                feeder: None,
            }
        }
        SourceKind::Relay => {
            let capacity = RelayCapacity {
                video_frames: config.source.relay_video_frames,
                audio_ms: config.source.relay_audio_ms,
            };
            let (source, feeder) = relay(config.audio.clone(), capacity)?;
            BuiltSource {
                source: Arc::new(DataSource::new(source)),
                feeder: Some(feeder),
            }
        }
    };
    info!(
        kind = ?config.source.kind,
        id = %built.source.id(),
        "data source built"
    );
    Ok(built)
}

/// Construct the data source described by the active global [`CONFIG`]
pub fn build_configured_source() -> Result<BuiltSource, ConfigError> {
    let config = CONFIG.load();
    config.validate()?;
    build_source(&config)
}
