//! Frame shapes exchanged between the engine and a data source.
//!
//! Frames never own their pixels or samples: `data` borrows a buffer the
//! engine allocated, and the source writes into it during a single pull.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw discriminant did not name a known variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown {kind} value: {value}")]
pub struct FormatError {
    pub kind: &'static str,
    pub value: i32,
}

macro_rules! abi_enum {
    ($name:ident, $kind:literal { $($variant:ident = $value:literal),+ $(,)? }) => {
        impl TryFrom<i32> for $name {
            type Error = FormatError;

            fn try_from(value: i32) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok(Self::$variant),)+
                    _ => Err(FormatError { kind: $kind, value }),
                }
            }
        }

        impl From<$name> for i32 {
            fn from(v: $name) -> i32 {
                v as i32
            }
        }
    };
}

/// How the video payload is carried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(i32)]
pub enum VideoBufferKind {
    #[default]
    Unknown = 0,
    /// Plain bytes in `data`. The only kind the fill path supports.
    Buffer = 1,
    Texture = 3,
}

abi_enum!(VideoBufferKind, "buffer kind" { Unknown = 0, Buffer = 1, Texture = 3 });

/// Pixel formats the engine accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(i32)]
pub enum VideoPixelFormat {
    #[default]
    Unknown = 0,
    I420 = 1,
    Texture2D = 2,
    Bgra32 = 3,
}

abi_enum!(VideoPixelFormat, "pixel format" { Unknown = 0, I420 = 1, Texture2D = 2, Bgra32 = 3 });

impl VideoPixelFormat {
    /// Byte size of one packed frame, if the format lives in a byte buffer.
    pub fn frame_len(self, width: u32, height: u32) -> Option<usize> {
        let pixels = width as usize * height as usize;
        match self {
            Self::I420 => Some(pixels * 3 / 2),
            Self::Bgra32 => Some(pixels * 4),
            Self::Unknown | Self::Texture2D => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(i32)]
pub enum AudioFrameFormat {
    #[default]
    None = 0,
    /// Signed 16-bit little-endian, interleaved
    Pcm = 1,
}

abi_enum!(AudioFrameFormat, "audio format" { None = 0, Pcm = 1 });

/// Clockwise rotation to apply when presenting the frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(i32)]
pub enum VideoRotation {
    #[default]
    Deg0 = 0,
    Deg90 = 1,
    Deg180 = 2,
    Deg270 = 3,
}

abi_enum!(VideoRotation, "rotation" { Deg0 = 0, Deg90 = 1, Deg180 = 2, Deg270 = 3 });

impl VideoRotation {
    pub fn degrees(self) -> u32 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }
}

/// Bytes per interleaved PCM sample
pub const PCM_SAMPLE_BYTES: usize = 2;

/// Byte size of `duration_ms` of PCM audio.
pub fn pcm_frame_len(sample_rate: u32, channels: u32, duration_ms: u32) -> usize {
    let samples = sample_rate as usize * duration_ms as usize / 1000;
    samples * channels as usize * PCM_SAMPLE_BYTES
}

/// Copies what fits into `dst` bounded by `capacity`; returns the count.
fn fill_bounded(dst: &mut [u8], capacity: usize, src: &[u8]) -> usize {
    let n = src.len().min(capacity).min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
    n
}

/// One video frame over an engine-owned buffer.
///
/// On entry `length` is the writable capacity of `data`; on a successful pull
/// the source overwrites it with the number of bytes written.
#[derive(Debug)]
pub struct VideoFrame<'a> {
    pub pixel_format: VideoPixelFormat,
    pub buffer_kind: VideoBufferKind,
    pub data: &'a mut [u8],
    /// Unused on the byte-buffer path
    pub texture_id: i32,
    pub length: usize,
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: u64,
    pub rotation: VideoRotation,
}

impl Default for VideoFrame<'_> {
    fn default() -> Self {
        Self {
            pixel_format: VideoPixelFormat::Unknown,
            buffer_kind: VideoBufferKind::Unknown,
            data: Default::default(),
            texture_id: -1,
            length: 0,
            width: 640,
            height: 360,
            timestamp_ms: 0,
            rotation: VideoRotation::Deg0,
        }
    }
}

impl<'a> VideoFrame<'a> {
    /// Engine side: wrap a pre-allocated buffer for one pull.
    pub fn new(data: &'a mut [u8]) -> Self {
        let length = data.len();
        Self {
            buffer_kind: VideoBufferKind::Buffer,
            data,
            length,
            ..Default::default()
        }
    }

    pub fn capacity(&self) -> usize {
        self.length.min(self.data.len())
    }

    /// Source side: copy as much of `bytes` as fits and record the filled size.
    pub fn fill(&mut self, bytes: &[u8]) -> usize {
        let n = fill_bounded(self.data, self.capacity(), bytes);
        self.length = n;
        n
    }

    /// The bytes written by the last successful pull.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.capacity()]
    }
}

/// One chunk of PCM audio over an engine-owned buffer.
///
/// Same capacity-in/size-out convention as [`VideoFrame`].
#[derive(Debug)]
pub struct AudioFrame<'a> {
    pub audio_format: AudioFrameFormat,
    pub data: &'a mut [u8],
    pub length: usize,
    pub sample_rate: u32,
    pub channel_count: u32,
    pub timestamp_ms: u64,
}

impl Default for AudioFrame<'_> {
    fn default() -> Self {
        Self {
            audio_format: AudioFrameFormat::None,
            data: Default::default(),
            length: 0,
            sample_rate: 48000,
            channel_count: 1,
            timestamp_ms: 0,
        }
    }
}

impl<'a> AudioFrame<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        let length = data.len();
        Self {
            data,
            length,
            ..Default::default()
        }
    }

    pub fn capacity(&self) -> usize {
        self.length.min(self.data.len())
    }

    pub fn fill(&mut self, bytes: &[u8]) -> usize {
        let n = fill_bounded(self.data, self.capacity(), bytes);
        self.length = n;
        n
    }

    pub fn filled(&self) -> &[u8] {
        &self.data[..self.capacity()]
    }

    /// Bytes in one interleaved sample frame (all channels).
    pub fn block_align(&self) -> usize {
        self.channel_count.max(1) as usize * PCM_SAMPLE_BYTES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_abi() {
        let v = VideoFrame::default();
        assert_eq!(v.pixel_format, VideoPixelFormat::Unknown);
        assert!(v.data.is_empty());
        assert_eq!(v.texture_id, -1);
        assert_eq!(v.length, 0);
        assert_eq!((v.width, v.height), (640, 360));
        assert_eq!(v.timestamp_ms, 0);
        assert_eq!(v.rotation, VideoRotation::Deg0);

        let a = AudioFrame::default();
        assert_eq!(a.audio_format, AudioFrameFormat::None);
        assert!(a.data.is_empty());
        assert_eq!(a.sample_rate, 48000);
        assert_eq!(a.channel_count, 1);
        assert_eq!(a.timestamp_ms, 0);
    }

    #[test]
    fn discriminants_round_trip_and_reject_unknown() {
        assert_eq!(VideoBufferKind::try_from(3), Ok(VideoBufferKind::Texture));
        assert!(VideoBufferKind::try_from(2).is_err());
        assert_eq!(VideoPixelFormat::try_from(3), Ok(VideoPixelFormat::Bgra32));
        assert_eq!(i32::from(VideoRotation::Deg270), 3);
        let err = AudioFrameFormat::try_from(7).unwrap_err();
        assert_eq!(err.value, 7);
        assert_eq!(err.to_string(), "unknown audio format value: 7");
    }

    #[test]
    fn frame_len_per_format() {
        assert_eq!(VideoPixelFormat::I420.frame_len(640, 360), Some(345_600));
        assert_eq!(VideoPixelFormat::Bgra32.frame_len(2, 2), Some(16));
        assert_eq!(VideoPixelFormat::Texture2D.frame_len(2, 2), None);
        assert_eq!(VideoRotation::Deg180.degrees(), 180);
        assert_eq!(pcm_frame_len(48000, 2, 10), 1920);
    }

    #[test]
    fn fill_is_bounded_by_length_not_buffer() {
        let mut buf = [0u8; 100];
        let mut frame = VideoFrame::new(&mut buf);
        frame.length = 10;
        assert_eq!(frame.fill(&[7u8; 40]), 10);
        assert_eq!(frame.length, 10);
        assert_eq!(frame.filled(), &[7u8; 10]);
        assert_eq!(buf[10], 0);
    }

    #[test]
    fn fill_short_source_reports_actual_size() {
        let mut buf = [0u8; 100];
        let mut frame = AudioFrame::new(&mut buf);
        assert_eq!(frame.fill(&[1u8; 40]), 40);
        assert_eq!(frame.length, 40);
    }
}
