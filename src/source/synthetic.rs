//! Test-pattern source: moving gradient video and a sine tone

use std::f64::consts::TAU;
use std::sync::Mutex;
use std::time::Instant;

use crossbeam::atomic::AtomicCell;
use tracing::{debug, info, instrument};

use crate::source::data_source::{FrameError, FrameResult, StreamDataSource};
use crate::source::frame::{
    pcm_frame_len, AudioFrame, AudioFrameFormat, VideoFrame, VideoPixelFormat, PCM_SAMPLE_BYTES,
};
use crate::{AudioConfig, ConfigError, VideoConfig};

const TONE_AMPLITUDE: f64 = 0.25 * i16::MAX as f64;

struct VideoGen {
    sequence: u64,
    scratch: Vec<u8>,
}

struct AudioGen {
    phase: f64,
    samples_emitted: u64,
    scratch: Vec<u8>,
}

/// Generates frames on demand. Produces nothing unless started.
pub struct SyntheticSource {
    video_config: VideoConfig,
    audio_config: AudioConfig,
    frame_len: usize,
    /// Set while started; the instant of the latest `on_start`
    epoch: AtomicCell<Option<Instant>>,
    video: Mutex<VideoGen>,
    audio: Mutex<AudioGen>,
}

impl SyntheticSource {
    pub fn new(video_config: VideoConfig, audio_config: AudioConfig) -> Result<Self, ConfigError> {
        let frame_len = video_config
            .format
            .frame_len(video_config.width, video_config.height)
            .ok_or(ConfigError::UnsupportedPixelFormat(video_config.format))?;
        if frame_len == 0 {
            return Err(ConfigError::Invalid("video width and height must be non-zero".into()));
        }
        audio_config.validate()?;

        let chunk = pcm_frame_len(
            audio_config.sample_rate,
            audio_config.channels,
            audio_config.frame_ms,
        );

        Ok(Self {
            video_config,
            audio_config,
            frame_len,
            epoch: AtomicCell::new(None),
            video: Mutex::new(VideoGen {
                sequence: 0,
                scratch: vec![0; frame_len],
            }),
            audio: Mutex::new(AudioGen {
                phase: 0.0,
                samples_emitted: 0,
                scratch: vec![0; chunk],
            }),
        })
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    fn elapsed_ms(&self) -> Option<u64> {
        self.epoch
            .load()
            .map(|epoch| epoch.elapsed().as_millis() as u64)
    }

    fn paint(format: VideoPixelFormat, width: usize, height: usize, seq: u64, out: &mut [u8]) {
        let shift = (seq * 4) as usize;
        match format {
            VideoPixelFormat::I420 => {
                let (luma, chroma) = out.split_at_mut(width * height);
                for (y, row) in luma.chunks_exact_mut(width).enumerate() {
                    for (x, px) in row.iter_mut().enumerate() {
                        *px = (x + y + shift) as u8;
                    }
                }
                let (u, v) = chroma.split_at_mut(chroma.len() / 2);
                u.fill(128);
                v.fill((seq % 256) as u8);
            }
            VideoPixelFormat::Bgra32 => {
                for (i, px) in out.chunks_exact_mut(4).enumerate() {
                    let (x, y) = (i % width, i / width);
                    px.copy_from_slice(&[(x + shift) as u8, y as u8, (seq % 256) as u8, 0xff]);
                }
            }
            VideoPixelFormat::Unknown | VideoPixelFormat::Texture2D => {}
        }
    }
}

impl StreamDataSource for SyntheticSource {
    #[instrument(skip(self))]
    fn on_start(&self) {
        self.epoch.store(Some(Instant::now()));
        info!(
            width = self.video_config.width,
            height = self.video_config.height,
            format = ?self.video_config.format,
            sample_rate = self.audio_config.sample_rate,
            "synthetic source running"
        );
    }

    #[instrument(skip(self))]
    fn on_stop(&self) {
        if self.epoch.swap(None).is_none() {
            debug!("stop without a running session");
        }
    }

    fn on_request_video_frame(&self, frame: &mut VideoFrame<'_>) -> FrameResult {
        let timestamp_ms = self.elapsed_ms().ok_or(FrameError::Unavailable)?;
        let mut state = self.video.lock().map_err(|_| FrameError::Unavailable)?;
        let VideoGen { sequence, scratch } = &mut *state;

        let cfg = &self.video_config;
        Self::paint(
            cfg.format,
            cfg.width as usize,
            cfg.height as usize,
            *sequence,
            scratch,
        );
        *sequence += 1;

        let written = frame.fill(scratch);
        frame.pixel_format = cfg.format;
        frame.width = cfg.width;
        frame.height = cfg.height;
        frame.rotation = cfg.rotation;
        frame.timestamp_ms = timestamp_ms;
        Ok(written)
    }

    fn on_request_audio_frame(&self, frame: &mut AudioFrame<'_>) -> FrameResult {
        if self.epoch.load().is_none() {
            return Err(FrameError::Unavailable);
        }
        let mut state = self.audio.lock().map_err(|_| FrameError::Unavailable)?;
        let AudioGen {
            phase,
            samples_emitted,
            scratch,
        } = &mut *state;

        let cfg = &self.audio_config;
        let channels = cfg.channels as usize;
        let block = channels * PCM_SAMPLE_BYTES;
        let len = scratch.len().min(frame.capacity()) / block * block;
        if len == 0 {
            return Err(FrameError::Unavailable);
        }

        let step = TAU * cfg.tone_hz / cfg.sample_rate as f64;
        for sample_frame in scratch[..len].chunks_exact_mut(block) {
            let value = (phase.sin() * TONE_AMPLITUDE) as i16;
            for ch in sample_frame.chunks_exact_mut(PCM_SAMPLE_BYTES) {
                ch.copy_from_slice(&value.to_le_bytes());
            }
            *phase = (*phase + step) % TAU;
        }

        frame.timestamp_ms = *samples_emitted * 1000 / cfg.sample_rate as u64;
        *samples_emitted += (len / block) as u64;

        let written = frame.fill(&scratch[..len]);
        frame.audio_format = AudioFrameFormat::Pcm;
        frame.sample_rate = cfg.sample_rate;
        frame.channel_count = cfg.channels;
        Ok(written)
    }
}
