//! Dedicated pull threads driving one data source

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError};
use tracing::{debug, error, info, instrument, trace};

use crate::source::frame::VideoPixelFormat;
use crate::source::{AudioFrame, DataSource, StreamDataSource, VideoFrame};

/// Buffer sizes and pacing for one attached source
#[derive(Debug, Clone, Copy)]
pub struct PullPlan {
    pub video_capacity: usize,
    pub video_interval: Duration,
    pub audio_capacity: usize,
    pub audio_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    fn label(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

/// Reported to the optional event channel after every pull
#[derive(Debug, Clone)]
pub enum PullEvent {
    Video {
        bytes: usize,
        format: VideoPixelFormat,
        width: u32,
        height: u32,
        timestamp_ms: u64,
    },
    Audio {
        bytes: usize,
        sample_rate: u32,
        channels: u32,
        timestamp_ms: u64,
    },
    Miss(MediaKind),
}

#[derive(Default)]
struct Counters {
    frames: AtomicU64,
    bytes: AtomicU64,
    misses: AtomicU64,
}

impl Counters {
    fn hit(&self, kind: MediaKind, bytes: usize) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        metrics::counter!("streamsource_frames_total", "kind" => kind.label()).increment(1);
        metrics::counter!("streamsource_bytes_total", "kind" => kind.label())
            .increment(bytes as u64);
    }

    fn miss(&self, kind: MediaKind) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("streamsource_misses_total", "kind" => kind.label()).increment(1);
    }

    fn snapshot(&self) -> KindStats {
        KindStats {
            frames: self.frames.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindStats {
    pub frames: u64,
    pub bytes: u64,
    pub misses: u64,
}

/// Pull statistics collected throughout a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullStats {
    pub video: KindStats,
    pub audio: KindStats,
}

type Source = Arc<DataSource<dyn StreamDataSource>>;

/// A running pull session.
///
/// Starting calls `on_start`; [`PullDriver::stop`] (or drop) joins both pull
/// threads and then calls `on_stop` once.
pub struct PullDriver {
    source: Source,
    stop_tx: Option<channel::Sender<()>>,
    threads: Vec<JoinHandle<()>>,
    video: Arc<Counters>,
    audio: Arc<Counters>,
}

impl PullDriver {
    #[instrument(skip_all, fields(id = %source.id()))]
    pub fn start(
        source: Source,
        plan: PullPlan,
        events: Option<flume::Sender<PullEvent>>,
    ) -> std::io::Result<Self> {
        source.on_start();

        // Dropping the sender wakes both threads out of their pacing wait.
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let video = Arc::new(Counters::default());
        let audio = Arc::new(Counters::default());

        let mut driver = Self {
            source: source.clone(),
            stop_tx: Some(stop_tx),
            threads: Vec::with_capacity(2),
            video: video.clone(),
            audio: audio.clone(),
        };

        let spawn_video = {
            let (source, stop_rx, events) = (source.clone(), stop_rx.clone(), events.clone());
            thread::Builder::new()
                .name("video-pull".into())
                .spawn(move || {
                    video_loop(
                        &source,
                        plan.video_capacity,
                        plan.video_interval,
                        &stop_rx,
                        &video,
                        events.as_ref(),
                    )
                })
        };
        // On a spawn failure `driver` drops, which stops and joins what did start.
        driver.threads.push(spawn_video?);

        let spawn_audio = thread::Builder::new()
            .name("audio-pull".into())
            .spawn(move || {
                audio_loop(
                    &source,
                    plan.audio_capacity,
                    plan.audio_interval,
                    &stop_rx,
                    &audio,
                    events.as_ref(),
                )
            });
        driver.threads.push(spawn_audio?);

        info!(?plan, "pulling");
        Ok(driver)
    }

    pub fn stats(&self) -> PullStats {
        PullStats {
            video: self.video.snapshot(),
            audio: self.audio.snapshot(),
        }
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    /// Join the pull threads, then notify the source.
    pub fn stop(mut self) -> PullStats {
        self.shutdown();
        self.stats()
    }

    fn shutdown(&mut self) {
        let Some(stop_tx) = self.stop_tx.take() else {
            return;
        };
        drop(stop_tx);
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("pull").to_owned();
            if handle.join().is_err() {
                error!(thread = %name, "pull thread panicked");
            }
        }
        self.source.on_stop();
        debug!(stats = ?self.stats(), "pull session finished");
    }
}

impl Drop for PullDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Wait one interval; false once the driver is stopping.
fn pace(stop_rx: &channel::Receiver<()>, interval: Duration) -> bool {
    matches!(stop_rx.recv_timeout(interval), Err(RecvTimeoutError::Timeout))
}

fn video_loop(
    source: &Source,
    capacity: usize,
    interval: Duration,
    stop_rx: &channel::Receiver<()>,
    counters: &Counters,
    events: Option<&flume::Sender<PullEvent>>,
) {
    // Allocated once, handed to the source on every pull.
    let mut buf = vec![0u8; capacity];
    while pace(stop_rx, interval) {
        let mut frame = VideoFrame::new(&mut buf);
        let event = match source.on_request_video_frame(&mut frame) {
            Ok(bytes) => {
                counters.hit(MediaKind::Video, bytes);
                PullEvent::Video {
                    bytes,
                    format: frame.pixel_format,
                    width: frame.width,
                    height: frame.height,
                    timestamp_ms: frame.timestamp_ms,
                }
            }
            Err(err) => {
                trace!(%err, "video pull skipped");
                counters.miss(MediaKind::Video);
                PullEvent::Miss(MediaKind::Video)
            }
        };
        if let Some(tx) = events {
            let _ = tx.try_send(event);
        }
    }
}

fn audio_loop(
    source: &Source,
    capacity: usize,
    interval: Duration,
    stop_rx: &channel::Receiver<()>,
    counters: &Counters,
    events: Option<&flume::Sender<PullEvent>>,
) {
    let mut buf = vec![0u8; capacity];
    while pace(stop_rx, interval) {
        let mut frame = AudioFrame::new(&mut buf);
        let event = match source.on_request_audio_frame(&mut frame) {
            Ok(bytes) => {
                counters.hit(MediaKind::Audio, bytes);
                PullEvent::Audio {
                    bytes,
                    sample_rate: frame.sample_rate,
                    channels: frame.channel_count,
                    timestamp_ms: frame.timestamp_ms,
                }
            }
            Err(err) => {
                trace!(%err, "audio pull skipped");
                counters.miss(MediaKind::Audio);
                PullEvent::Miss(MediaKind::Audio)
            }
        };
        if let Some(tx) = events {
            let _ = tx.try_send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{FrameError, FrameResult};
    use std::sync::atomic::AtomicBool;

    /// Answers every other pull
    #[derive(Default)]
    struct Flaky {
        toggle: AtomicBool,
        stopped: AtomicBool,
    }

    impl StreamDataSource for Flaky {
        fn on_start(&self) {}
        fn on_stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
        fn on_request_video_frame(&self, frame: &mut VideoFrame<'_>) -> FrameResult {
            if self.toggle.fetch_xor(true, Ordering::SeqCst) {
                Ok(frame.fill(&[1, 2, 3]))
            } else {
                Err(FrameError::Unavailable)
            }
        }
        fn on_request_audio_frame(&self, frame: &mut AudioFrame<'_>) -> FrameResult {
            Ok(frame.fill(&[0; 2]))
        }
    }

    fn plan() -> PullPlan {
        PullPlan {
            video_capacity: 16,
            video_interval: Duration::from_millis(1),
            audio_capacity: 16,
            audio_interval: Duration::from_millis(1),
        }
    }

    #[test]
    fn misses_are_counted_and_retried() {
        let source: Source = Arc::new(DataSource::new(Flaky::default()));
        let driver = PullDriver::start(source.clone(), plan(), None).unwrap();
        thread::sleep(Duration::from_millis(50));
        let stats = driver.stop();
        assert!(stats.video.frames > 0);
        assert!(stats.video.misses > 0);
        assert_eq!(stats.video.bytes, stats.video.frames * 3);
        assert_eq!(stats.audio.misses, 0);
    }

    #[test]
    fn events_reach_the_channel() {
        let (tx, rx) = flume::bounded(256);
        let source: Source = Arc::new(DataSource::new(Flaky::default()));
        let driver = PullDriver::start(source, plan(), Some(tx)).unwrap();
        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        drop(driver);
        assert!(matches!(
            first,
            PullEvent::Video { .. } | PullEvent::Audio { .. } | PullEvent::Miss(_)
        ));
    }

    #[test]
    fn drop_stops_the_source() {
        let inner = Arc::new(DataSource::new(Flaky::default()));
        let source: Source = inner.clone();
        drop(PullDriver::start(source, plan(), None).unwrap());
        assert!(inner.inner().stopped.load(Ordering::SeqCst));
    }
}
