//! One-shot destruction notification

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::trace;

/// Process-unique identity of a registered source instance.
///
/// Engines key their side tables by this instead of by address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl SourceId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source#{}", self.0)
    }
}

/// Handler invoked once when a source is torn down
pub type DestroyHandler = Box<dyn FnOnce(SourceId) + Send + 'static>;

/// Single-slot holder for a [`DestroyHandler`].
///
/// Registration and firing share one lock, so a handler is either fully
/// replaced or fully fired, never split between two registrations.
#[derive(Default)]
pub struct DestroySlot {
    handler: Mutex<Option<DestroyHandler>>,
}

impl DestroySlot {
    pub fn new() -> Self {
        Self::default()
    }

    // A handler that panicked must not stop a later teardown from running.
    fn lock(&self) -> MutexGuard<'_, Option<DestroyHandler>> {
        self.handler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `handler`, dropping any previous one without calling it.
    pub fn set(&self, handler: DestroyHandler) {
        let previous = self.lock().replace(handler);
        // Drop the old closure outside the lock; its captures may have Drop impls.
        drop(previous);
    }

    /// Remove the registered handler without firing it.
    pub fn clear(&self) -> bool {
        let previous = self.lock().take();
        previous.is_some()
    }

    pub fn is_set(&self) -> bool {
        self.lock().is_some()
    }

    /// Take and run the handler while holding the lock.
    ///
    /// Returns whether a handler ran. Later calls find the slot empty.
    pub fn fire(&self, id: SourceId) -> bool {
        let mut guard = self.lock();
        match guard.take() {
            Some(handler) => {
                trace!(%id, "firing destroy handler");
                handler(id);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for DestroySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestroySlot")
            .field("registered", &self.is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn ids_are_unique() {
        let a = SourceId::next();
        let b = SourceId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn fire_runs_at_most_once() {
        let slot = DestroySlot::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        slot.set(Box::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        let id = SourceId::next();
        assert!(slot.fire(id));
        assert!(!slot.fire(id));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn replacing_drops_previous_without_calling_it() {
        let slot = DestroySlot::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let f = first.clone();
        slot.set(Box::new(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        let s = second.clone();
        slot.set(Box::new(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        }));
        // the first closure (and its Arc clone) is gone
        assert_eq!(Arc::strong_count(&first), 1);
        slot.fire(SourceId::next());
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_slot_is_a_no_op() {
        let slot = DestroySlot::new();
        assert!(!slot.fire(SourceId::next()));
        assert!(!slot.clear());
    }

    #[test]
    fn survives_a_panicking_handler() {
        let slot = Arc::new(DestroySlot::new());
        slot.set(Box::new(|_| panic!("boom")));
        let s = slot.clone();
        let joined = std::thread::spawn(move || s.fire(SourceId::next())).join();
        assert!(joined.is_err());
        // lock is poisoned but still usable
        slot.set(Box::new(|_| {}));
        assert!(slot.fire(SourceId::next()));
    }
}
