//! Forwarding source: hands out samples an application produced elsewhere
//!
//! The application keeps a [`RelayFeeder`] and pushes video frames and PCM
//! from its own threads. The engine pulls through [`RelaySource`], which
//! never waits for the feeder.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

use crate::pipeline::ringbuf::{pcm_ring, PcmReader, PcmWriter, VideoSample, VideoSampleQueue};
use crate::source::data_source::{FrameError, FrameResult, StreamDataSource};
use crate::source::frame::{
    pcm_frame_len, AudioFrame, AudioFrameFormat, VideoFrame, VideoPixelFormat, PCM_SAMPLE_BYTES,
};
use crate::{AudioConfig, ConfigError};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("pixel format {0:?} cannot be relayed as a byte buffer")]
    UnsupportedFormat(VideoPixelFormat),
    #[error("frame is {actual} bytes, expected {expected} for its format and size")]
    SizeMismatch { expected: usize, actual: usize },
}

/// How much the relay buffers before the producer starts losing data
#[derive(Debug, Clone, Copy)]
pub struct RelayCapacity {
    pub video_frames: usize,
    pub audio_ms: u32,
}

impl Default for RelayCapacity {
    fn default() -> Self {
        Self {
            video_frames: 4,
            audio_ms: 200,
        }
    }
}

struct Shared {
    video: VideoSampleQueue,
    active: AtomicBool,
}

/// Pull side of a relay
pub struct RelaySource {
    shared: Arc<Shared>,
    audio: Mutex<PcmReader>,
    audio_config: AudioConfig,
    samples_read: AtomicU64,
    truncation_reported: AtomicBool,
}

/// Push side of a relay, owned by the application
pub struct RelayFeeder {
    shared: Arc<Shared>,
    audio: PcmWriter,
    block: usize,
}

/// Build a connected source/feeder pair.
pub fn relay(
    audio_config: AudioConfig,
    capacity: RelayCapacity,
) -> Result<(RelaySource, RelayFeeder), ConfigError> {
    audio_config.validate()?;
    let shared = Arc::new(Shared {
        video: VideoSampleQueue::new(capacity.video_frames),
        active: AtomicBool::new(false),
    });
    let ring_bytes = pcm_frame_len(
        audio_config.sample_rate,
        audio_config.channels,
        capacity.audio_ms,
    );
    let (writer, reader) = pcm_ring(ring_bytes);
    let block = audio_config.channels as usize * PCM_SAMPLE_BYTES;

    Ok((
        RelaySource {
            shared: shared.clone(),
            audio: Mutex::new(reader),
            audio_config,
            samples_read: AtomicU64::new(0),
            truncation_reported: AtomicBool::new(false),
        },
        RelayFeeder {
            shared,
            audio: writer,
            block,
        },
    ))
}

impl RelayFeeder {
    /// Whether the engine is currently pulling
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Queue a video frame. The oldest queued frame is dropped if full.
    ///
    /// Returns `Ok(false)` and discards the frame while the engine is not
    /// pulling.
    pub fn push_video(&self, sample: VideoSample) -> Result<bool, RelayError> {
        let expected = sample
            .format
            .frame_len(sample.width, sample.height)
            .ok_or(RelayError::UnsupportedFormat(sample.format))?;
        if sample.data.len() != expected {
            return Err(RelayError::SizeMismatch {
                expected,
                actual: sample.data.len(),
            });
        }
        if !self.is_active() {
            trace!("relay inactive, video frame discarded");
            return Ok(false);
        }
        if self.shared.video.push(sample) {
            debug!("relay video queue full, dropped oldest frame");
        }
        Ok(true)
    }

    /// Queue interleaved PCM. Returns the bytes accepted; a trailing partial
    /// sample frame or anything beyond the ring's free space is rejected, and
    /// nothing is accepted while the engine is not pulling.
    pub fn push_audio(&mut self, pcm: &[u8]) -> usize {
        if !self.is_active() {
            trace!(offered = pcm.len(), "relay inactive, audio discarded");
            return 0;
        }
        let accepted = self.audio.write(pcm, self.block);
        if accepted < pcm.len() {
            debug!(accepted, offered = pcm.len(), "relay audio ring short");
        }
        accepted
    }

    /// (written, read, dropped) video frame counters
    pub fn video_stats(&self) -> (usize, usize, usize) {
        self.shared.video.stats()
    }
}

impl RelaySource {
    fn block(&self) -> usize {
        self.audio_config.channels as usize * PCM_SAMPLE_BYTES
    }

    fn drain(&self) {
        while self.shared.video.pop().is_some() {}
        if let Ok(mut reader) = self.audio.lock() {
            let mut sink = [0u8; 1024];
            while reader.read(&mut sink, 1) > 0 {}
        }
    }
}

impl StreamDataSource for RelaySource {
    #[instrument(skip(self))]
    fn on_start(&self) {
        // A push that raced the previous stop may have landed after its drain.
        self.drain();
        self.samples_read.store(0, Ordering::Relaxed);
        self.shared.active.store(true, Ordering::Release);
        info!("relay accepting pulls");
    }

    #[instrument(skip(self))]
    fn on_stop(&self) {
        self.shared.active.store(false, Ordering::Release);
        // Stale samples must not leak into a later session.
        self.drain();
    }

    fn on_request_video_frame(&self, frame: &mut VideoFrame<'_>) -> FrameResult {
        if !self.shared.active.load(Ordering::Acquire) {
            return Err(FrameError::Unavailable);
        }
        let sample = self.shared.video.pop().ok_or(FrameError::Unavailable)?;

        let capacity = frame.capacity();
        let written = frame.fill(&sample.data);
        if written < sample.data.len() {
            if !self.truncation_reported.swap(true, Ordering::Relaxed) {
                warn!(
                    capacity,
                    frame_bytes = sample.data.len(),
                    "video frame larger than engine buffer, truncating"
                );
            } else {
                trace!(capacity, frame_bytes = sample.data.len(), "video frame truncated");
            }
        }
        frame.pixel_format = sample.format;
        frame.width = sample.width;
        frame.height = sample.height;
        frame.timestamp_ms = sample.timestamp_ms;
        frame.rotation = sample.rotation;
        Ok(written)
    }

    fn on_request_audio_frame(&self, frame: &mut AudioFrame<'_>) -> FrameResult {
        if !self.shared.active.load(Ordering::Acquire) {
            return Err(FrameError::Unavailable);
        }
        let block = self.block();
        let mut reader = self.audio.lock().map_err(|_| FrameError::Unavailable)?;
        let capacity = frame.capacity();
        let written = reader.read(&mut frame.data[..capacity], block);
        if written == 0 {
            return Err(FrameError::Unavailable);
        }

        let samples = self
            .samples_read
            .fetch_add((written / block) as u64, Ordering::Relaxed);
        frame.length = written;
        frame.audio_format = AudioFrameFormat::Pcm;
        frame.sample_rate = self.audio_config.sample_rate;
        frame.channel_count = self.audio_config.channels;
        frame.timestamp_ms = samples * 1000 / self.audio_config.sample_rate as u64;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::frame::VideoRotation;
    use bytes::Bytes;

    fn pair() -> (RelaySource, RelayFeeder) {
        relay(AudioConfig::default(), RelayCapacity::default()).unwrap()
    }

    fn bgra(width: u32, height: u32, tag: u8) -> VideoSample {
        VideoSample {
            data: Bytes::from(vec![tag; (width * height * 4) as usize]),
            format: VideoPixelFormat::Bgra32,
            width,
            height,
            timestamp_ms: 33,
            rotation: VideoRotation::Deg180,
        }
    }

    #[test]
    fn partial_audio_is_handed_out_as_is() {
        let (source, mut feeder) = pair();
        source.on_start();
        assert_eq!(feeder.push_audio(&[5u8; 40]), 40);

        let mut buf = [0u8; 100];
        let mut frame = AudioFrame::new(&mut buf);
        assert_eq!(source.on_request_audio_frame(&mut frame), Ok(40));
        assert_eq!(frame.length, 40);
        assert_eq!(frame.audio_format, AudioFrameFormat::Pcm);
    }

    #[test]
    fn empty_pull_leaves_buffer_untouched() {
        let (source, _feeder) = pair();
        source.on_start();
        let mut buf = [0x55u8; 100];
        let mut frame = VideoFrame::new(&mut buf);
        assert_eq!(source.on_request_video_frame(&mut frame), Err(FrameError::Unavailable));
        assert_eq!(frame.length, 100);
        let mut frame = AudioFrame::new(&mut buf);
        assert_eq!(source.on_request_audio_frame(&mut frame), Err(FrameError::Unavailable));
        assert!(buf.iter().all(|&b| b == 0x55));
    }

    #[test]
    fn audio_remainder_carries_to_next_pull() {
        let (source, mut feeder) = pair();
        source.on_start();
        feeder.push_audio(&[1u8; 100]);
        let mut buf = [0u8; 64];
        let mut frame = AudioFrame::new(&mut buf);
        assert_eq!(source.on_request_audio_frame(&mut frame), Ok(64));
        frame.length = 64;
        assert_eq!(source.on_request_audio_frame(&mut frame), Ok(36));
        assert_eq!(frame.timestamp_ms, 0);
    }

    #[test]
    fn video_frame_metadata_is_forwarded() {
        let (source, feeder) = pair();
        source.on_start();
        assert!(feeder.is_active());
        feeder.push_video(bgra(2, 2, 9)).unwrap();
        let mut buf = [0u8; 32];
        let mut frame = VideoFrame::new(&mut buf);
        assert_eq!(source.on_request_video_frame(&mut frame), Ok(16));
        assert_eq!(frame.pixel_format, VideoPixelFormat::Bgra32);
        assert_eq!(frame.rotation, VideoRotation::Deg180);
        assert_eq!(frame.timestamp_ms, 33);
        assert_eq!(frame.filled(), &[9u8; 16]);
    }

    #[test]
    fn rejects_malformed_samples() {
        let (_source, feeder) = pair();
        let mut sample = bgra(2, 2, 0);
        sample.data = Bytes::from_static(&[0u8; 3]);
        assert!(matches!(
            feeder.push_video(sample),
            Err(RelayError::SizeMismatch { expected: 16, actual: 3 })
        ));
        let mut sample = bgra(2, 2, 0);
        sample.format = VideoPixelFormat::Texture2D;
        assert!(matches!(
            feeder.push_video(sample),
            Err(RelayError::UnsupportedFormat(VideoPixelFormat::Texture2D))
        ));
    }

    #[test]
    fn stop_discards_queued_samples() {
        let (source, mut feeder) = pair();
        source.on_start();
        feeder.push_video(bgra(1, 1, 1)).unwrap();
        feeder.push_audio(&[1u8; 8]);
        source.on_stop();
        assert!(!feeder.is_active());
        source.on_start();
        let mut buf = [0u8; 16];
        assert!(source
            .on_request_video_frame(&mut VideoFrame::new(&mut buf))
            .is_err());
        assert!(source
            .on_request_audio_frame(&mut AudioFrame::new(&mut buf))
            .is_err());
    }

    #[test]
    fn pushes_while_stopped_are_discarded() {
        let (source, mut feeder) = pair();
        source.on_start();
        source.on_stop();
        let mut stale = bgra(1, 1, 7);
        stale.timestamp_ms = 999;
        assert!(!feeder.push_video(stale).unwrap());
        assert_eq!(feeder.push_audio(&[9u8; 8]), 0);

        source.on_start();
        let mut buf = [0u8; 16];
        assert_eq!(
            source.on_request_video_frame(&mut VideoFrame::new(&mut buf)),
            Err(FrameError::Unavailable)
        );
        assert_eq!(
            source.on_request_audio_frame(&mut AudioFrame::new(&mut buf)),
            Err(FrameError::Unavailable)
        );
    }

    #[test]
    fn start_drops_samples_that_raced_the_previous_stop() {
        let (source, mut feeder) = pair();
        source.on_start();
        source.on_stop();
        // a producer that saw the relay active just before the stop
        feeder.shared.video.push(bgra(1, 1, 7));
        feeder.audio.write(&[9u8; 8], feeder.block);

        source.on_start();
        let mut buf = [0u8; 16];
        assert!(source
            .on_request_video_frame(&mut VideoFrame::new(&mut buf))
            .is_err());
        assert!(source
            .on_request_audio_frame(&mut AudioFrame::new(&mut buf))
            .is_err());
    }

    #[test]
    fn oversized_frames_are_truncated_to_capacity() {
        let (source, feeder) = pair();
        source.on_start();
        let mut buf = [0u8; 8];
        for _ in 0..2 {
            assert!(feeder.push_video(bgra(2, 2, 3)).unwrap());
            let mut frame = VideoFrame::new(&mut buf);
            assert_eq!(source.on_request_video_frame(&mut frame), Ok(8));
            assert_eq!(frame.length, 8);
        }
        assert!(source.truncation_reported.load(Ordering::Relaxed));
    }
}
