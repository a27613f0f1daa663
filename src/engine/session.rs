//! Engine-side table of attached sources, keyed by identity

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use tracing::{debug, info};

use crate::source::{DataSource, SourceId, StreamDataSource};

#[derive(Debug, Clone)]
pub struct Session {
    pub label: String,
    pub attached_at: Instant,
}

#[derive(Default)]
struct Inner {
    live: HashMap<SourceId, Session>,
    released: Vec<SourceId>,
}

/// Side table the destroy handler keeps free of dangling entries.
#[derive(Clone, Default)]
pub struct SessionTable {
    inner: Arc<Mutex<Inner>>,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `source` and register a destroy handler that removes it again.
    pub fn attach<S>(&self, source: &DataSource<S>, label: impl Into<String>)
    where
        S: ?Sized + StreamDataSource,
    {
        let id = source.id();
        let label = label.into();
        info!(%id, %label, "session attached");
        lock(&self.inner).live.insert(
            id,
            Session {
                label,
                attached_at: Instant::now(),
            },
        );

        // Weak: the table must not be kept alive by the sources it tracks.
        let table: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        source.set_on_destroy_callback(move |id| {
            if let Some(inner) = table.upgrade() {
                let mut inner = lock(&inner);
                if let Some(session) = inner.live.remove(&id) {
                    debug!(%id, label = %session.label, "session released");
                }
                inner.released.push(id);
            }
        });
    }

    pub fn get(&self, id: SourceId) -> Option<Session> {
        lock(&self.inner).live.get(&id).cloned()
    }

    pub fn contains(&self, id: SourceId) -> bool {
        lock(&self.inner).live.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identities whose destroy notification arrived, oldest first
    pub fn released(&self) -> Vec<SourceId> {
        lock(&self.inner).released.clone()
    }
}
