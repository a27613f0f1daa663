//! Lock-free buffers between an application producer and the pull side

use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::source::frame::{VideoPixelFormat, VideoRotation};

/// A complete video frame handed over by the application
#[derive(Debug, Clone)]
pub struct VideoSample {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,
    pub format: VideoPixelFormat,
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: u64,
    pub rotation: VideoRotation,
}

/// Bounded MPMC queue that drops the oldest frame when full
pub struct VideoSampleQueue {
    ring: ArrayQueue<VideoSample>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicUsize,
    frames_read: AtomicUsize,
    frames_dropped: AtomicUsize,
}

impl VideoSampleQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: ArrayQueue::new(capacity.max(1)),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: push a frame, evicting the oldest if the queue is full.
    ///
    /// Returns true if a frame was evicted.
    pub fn push(&self, sample: VideoSample) -> bool {
        let evicted = self.ring.force_push(sample).is_some();
        if evicted {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        evicted
    }

    /// Consumer: pop the oldest frame, never blocks
    pub fn pop(&self) -> Option<VideoSample> {
        let sample = self.ring.pop()?;
        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        Some(sample)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// (written, read, dropped)
    pub fn stats(&self) -> (usize, usize, usize) {
        (
            self.stats.frames_written.load(Ordering::Relaxed),
            self.stats.frames_read.load(Ordering::Relaxed),
            self.stats.frames_dropped.load(Ordering::Relaxed),
        )
    }
}

/// Create a PCM byte ring holding at most `capacity` bytes.
pub fn pcm_ring(capacity: usize) -> (PcmWriter, PcmReader) {
    let (prod, cons) = HeapRb::<u8>::new(capacity.max(1)).split();
    (PcmWriter { prod }, PcmReader { cons })
}

/// Producer half of a PCM ring
pub struct PcmWriter {
    prod: HeapProd<u8>,
}

impl PcmWriter {
    /// Write whole blocks of `block` bytes; returns bytes accepted.
    pub fn write(&mut self, pcm: &[u8], block: usize) -> usize {
        let block = block.max(1);
        let room = self.prod.vacant_len() / block * block;
        let n = pcm.len().min(room) / block * block;
        self.prod.push_slice(&pcm[..n])
    }

    pub fn vacant(&self) -> usize {
        self.prod.vacant_len()
    }
}

/// Consumer half of a PCM ring
pub struct PcmReader {
    cons: HeapCons<u8>,
}

impl PcmReader {
    /// Read up to `out.len()` bytes rounded down to whole blocks.
    pub fn read(&mut self, out: &mut [u8], block: usize) -> usize {
        let block = block.max(1);
        let n = out.len().min(self.cons.occupied_len()) / block * block;
        self.cons.pop_slice(&mut out[..n])
    }

    pub fn available(&self) -> usize {
        self.cons.occupied_len()
    }
}
