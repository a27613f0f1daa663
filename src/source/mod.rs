pub mod data_source;
pub mod destroy;
pub mod frame;
pub mod relay;
pub mod synthetic;

pub use data_source::{DataSource, FrameError, FrameResult, LifecycleState, StreamDataSource};
pub use destroy::{DestroySlot, SourceId};
pub use frame::{AudioFrame, VideoFrame};
pub use relay::{relay, RelayFeeder, RelaySource};
pub use synthetic::SyntheticSource;
