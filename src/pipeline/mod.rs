pub mod ringbuf;

pub use self::ringbuf::{VideoSample, VideoSampleQueue};
