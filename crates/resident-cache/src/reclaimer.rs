use std::fmt;
use std::sync::{Arc, Mutex};

use crate::utils::lock;

/// Something that holds a reference which can be given back later.
pub trait Releasable: Send + Sync + 'static {
    /// Gives back one reference.
    fn release_deferred(&self);
}

/// Collects references handed out during a unit of work, and releases them when the host is done
/// with it.
///
/// The host calls [`flush`](Self::flush) once per unit of work, e.g. once per rendered frame.
/// Cloning the reclaimer shares its queue.
#[derive(Clone, Default)]
pub struct FrameReclaimer {
    queue: Arc<Mutex<Vec<Arc<dyn Releasable>>>>,
}

impl FrameReclaimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a reference to be released on the next [`flush`](Self::flush).
    pub fn enqueue(&self, releasable: Arc<dyn Releasable>) {
        lock(&self.queue).push(releasable);
    }

    /// Releases everything enqueued since the last flush and returns how many releases were made.
    ///
    /// Releasables that are enqueued while the flush is running are left for the next one.
    pub fn flush(&self) -> usize {
        let queued = std::mem::take(&mut *lock(&self.queue));
        let count = queued.len();
        for releasable in queued {
            releasable.release_deferred();
        }
        if count > 0 {
            tracing::trace!(count, "Flushed deferred releases");
        }
        count
    }

    /// The number of releases waiting for the next flush.
    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for FrameReclaimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameReclaimer")
            .field("queued", &self.len())
            .finish()
    }
}
