//! The pull contract between the engine and a custom media source

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

use super::destroy::{DestroySlot, SourceId};
use super::frame::{AudioFrame, VideoFrame};

/// A pull produced no frame. The engine skips the cycle and may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame unavailable")]
    Unavailable,
}

impl FrameError {
    /// Return code the engine ABI uses for a failed pull
    pub const CODE: i32 = -1;
}

/// Bytes written on success
pub type FrameResult = Result<usize, FrameError>;

/// Collapse a pull result into the engine's signed return code.
pub fn to_return_code(result: &FrameResult) -> i32 {
    match result {
        Ok(n) => i32::try_from(*n).unwrap_or(i32::MAX),
        Err(_) => FrameError::CODE,
    }
}

/// Every negative code is the same failure.
pub fn from_return_code(code: i32) -> FrameResult {
    usize::try_from(code).map_err(|_| FrameError::Unavailable)
}

/// A component the engine pulls raw video and audio from.
///
/// Video and audio are requested from separate engine threads, possibly at
/// the same time, so every method takes `&self`. Request methods must return
/// promptly: there is no cancellation, and a blocked pull stalls the stream.
pub trait StreamDataSource: Send + Sync {
    /// The engine reserved what it needs and is about to pull.
    fn on_start(&self);

    /// The engine no longer needs frames. Not a destruction signal.
    fn on_stop(&self);

    /// Fill `frame.data` up to `frame.length` bytes, set format, size and
    /// optionally timestamp/rotation, and overwrite `frame.length` with the
    /// bytes written.
    fn on_request_video_frame(&self, frame: &mut VideoFrame<'_>) -> FrameResult;

    /// Fill `frame.data` with PCM up to `frame.length` bytes and set rate and
    /// channel count.
    fn on_request_audio_frame(&self, frame: &mut AudioFrame<'_>) -> FrameResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Created = 0,
    Started = 1,
    Stopped = 2,
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Started,
            2 => Self::Stopped,
            _ => Self::Created,
        }
    }
}

/// A source registered with an engine.
///
/// Owns the source, its identity and its destroy slot. Dropping the last
/// handle fires the registered destroy handler before the inner source is
/// dropped.
pub struct DataSource<S: ?Sized + StreamDataSource> {
    id: SourceId,
    on_destroy: DestroySlot,
    state: AtomicU8,
    source: S,
}

impl<S: StreamDataSource> DataSource<S> {
    pub fn new(source: S) -> Self {
        let id = SourceId::next();
        debug!(%id, "data source created");
        Self {
            id,
            on_destroy: DestroySlot::new(),
            state: AtomicU8::new(LifecycleState::Created as u8),
            source,
        }
    }
}

impl<S: ?Sized + StreamDataSource> DataSource<S> {
    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn inner(&self) -> &S {
        &self.source
    }

    /// Register the handler to run when this instance is destroyed,
    /// replacing any earlier one. Safe to call from any thread.
    pub fn set_on_destroy_callback<F>(&self, handler: F)
    where
        F: FnOnce(SourceId) + Send + 'static,
    {
        self.on_destroy.set(Box::new(handler));
    }

    /// Unregister without firing.
    pub fn clear_on_destroy_callback(&self) -> bool {
        self.on_destroy.clear()
    }

    /// A claimed size beyond the supplied capacity is treated as a failed pull.
    fn within_capacity(
        &self,
        kind: &'static str,
        capacity: usize,
        result: FrameResult,
    ) -> FrameResult {
        match result {
            Ok(n) if n > capacity => {
                warn!(
                    id = %self.id,
                    kind,
                    written = n,
                    capacity,
                    "source overran pull capacity"
                );
                Err(FrameError::Unavailable)
            }
            other => other,
        }
    }

    fn transition(&self, to: LifecycleState) {
        let from = LifecycleState::from_u8(self.state.swap(to as u8, Ordering::AcqRel));
        if from == to || (to == LifecycleState::Stopped && from == LifecycleState::Created) {
            debug!(id = %self.id, ?from, ?to, "unusual lifecycle transition");
        }
    }
}

impl<S: ?Sized + StreamDataSource> StreamDataSource for DataSource<S> {
    #[instrument(skip(self), fields(id = %self.id))]
    fn on_start(&self) {
        self.transition(LifecycleState::Started);
        self.source.on_start();
        info!("source started");
    }

    #[instrument(skip(self), fields(id = %self.id))]
    fn on_stop(&self) {
        self.source.on_stop();
        self.transition(LifecycleState::Stopped);
        info!("source stopped");
    }

    fn on_request_video_frame(&self, frame: &mut VideoFrame<'_>) -> FrameResult {
        let capacity = frame.capacity();
        let result = self.source.on_request_video_frame(frame);
        trace!(id = %self.id, capacity, ?result, "video pull");
        self.within_capacity("video", capacity, result)
    }

    fn on_request_audio_frame(&self, frame: &mut AudioFrame<'_>) -> FrameResult {
        let capacity = frame.capacity();
        let result = self.source.on_request_audio_frame(frame);
        trace!(id = %self.id, capacity, ?result, "audio pull");
        self.within_capacity("audio", capacity, result)
    }
}

impl<S: ?Sized + StreamDataSource> Drop for DataSource<S> {
    fn drop(&mut self) {
        // `source` is still alive here; fields drop after this returns.
        if self.on_destroy.fire(self.id) {
            debug!(id = %self.id, "destroy handler notified");
        }
    }
}

impl<S: ?Sized + StreamDataSource> fmt::Debug for DataSource<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSource")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("on_destroy", &self.on_destroy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};

    /// Records every hook call in order.
    #[derive(Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl StreamDataSource for Recorder {
        fn on_start(&self) {
            self.calls.lock().unwrap().push("start");
        }
        fn on_stop(&self) {
            self.calls.lock().unwrap().push("stop");
        }
        fn on_request_video_frame(&self, _frame: &mut VideoFrame<'_>) -> FrameResult {
            Err(FrameError::Unavailable)
        }
        fn on_request_audio_frame(&self, frame: &mut AudioFrame<'_>) -> FrameResult {
            Ok(frame.fill(&[0u8; 4]))
        }
    }

    impl Drop for Recorder {
        fn drop(&mut self) {
            self.calls.lock().unwrap().push("inner dropped");
        }
    }

    #[test]
    fn return_codes() {
        assert_eq!(to_return_code(&Ok(40)), 40);
        assert_eq!(to_return_code(&Err(FrameError::Unavailable)), -1);
        assert_eq!(from_return_code(0), Ok(0));
        assert_eq!(from_return_code(-7), Err(FrameError::Unavailable));
    }

    #[test]
    fn handler_fires_before_inner_source_drops() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let source = DataSource::new(Recorder {
            calls: calls.clone(),
        });
        let c = calls.clone();
        source.set_on_destroy_callback(move |_| c.lock().unwrap().push("destroyed"));
        source.on_start();
        source.on_stop();
        drop(source);
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["start", "stop", "destroyed", "inner dropped"]
        );
    }

    #[test]
    fn handler_receives_own_id() {
        let source = DataSource::new(Recorder::default());
        let expected = source.id();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        source.set_on_destroy_callback(move |id| *s.lock().unwrap() = Some(id));
        drop(source);
        assert_eq!(*seen.lock().unwrap(), Some(expected));
    }

    #[test]
    fn cleared_handler_never_fires() {
        let hits = Arc::new(AtomicUsize::new(0));
        let source = DataSource::new(Recorder::default());
        let h = hits.clone();
        source.set_on_destroy_callback(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(source.clear_on_destroy_callback());
        drop(source);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn lifecycle_is_tracked_but_not_enforced() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let source = DataSource::new(Recorder {
            calls: calls.clone(),
        });
        assert_eq!(source.state(), LifecycleState::Created);
        source.on_stop();
        source.on_start();
        source.on_start();
        assert_eq!(source.state(), LifecycleState::Started);
        source.on_stop();
        assert_eq!(source.state(), LifecycleState::Stopped);
        assert_eq!(calls.lock().unwrap().len(), 4);
    }

    /// Claims more bytes than it was given room for.
    struct Overrun;

    impl StreamDataSource for Overrun {
        fn on_start(&self) {}
        fn on_stop(&self) {}
        fn on_request_video_frame(&self, frame: &mut VideoFrame<'_>) -> FrameResult {
            Ok(frame.capacity() + 1)
        }
        fn on_request_audio_frame(&self, frame: &mut AudioFrame<'_>) -> FrameResult {
            Ok(frame.fill(&[1u8; 4]))
        }
    }

    #[test]
    fn overrunning_capacity_is_reported_as_unavailable() {
        let source = DataSource::new(Overrun);
        let mut buf = [0u8; 8];
        assert_eq!(
            source.on_request_video_frame(&mut VideoFrame::new(&mut buf)),
            Err(FrameError::Unavailable)
        );
        let mut frame = AudioFrame::new(&mut buf);
        frame.length = 2;
        assert_eq!(source.on_request_audio_frame(&mut frame), Ok(2));
    }

    #[test]
    fn coerces_to_trait_object() {
        let source: Arc<DataSource<dyn StreamDataSource>> =
            Arc::new(DataSource::new(Recorder::default()));
        let mut buf = [0u8; 8];
        assert_eq!(
            source.on_request_video_frame(&mut VideoFrame::new(&mut buf)),
            Err(FrameError::Unavailable)
        );
        assert_eq!(
            source.on_request_audio_frame(&mut AudioFrame::new(&mut buf)),
            Ok(4)
        );
    }
}
