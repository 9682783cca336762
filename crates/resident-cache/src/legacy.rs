//! Synchronous accessors for hosts that cannot hold leases.
//!
//! These exist for callers written against an older API that expected an object which is always
//! "there" and resolves to the resource whenever it is available. Prefer
//! [`SharedResourceHandle::rent`] or [`SharedResourceHandle::try_get_immediate`].

use std::fmt;
use std::sync::Arc;

use crate::handle::SharedResourceHandle;
use crate::utils::lock;

/// A resource that is probed on every access.
///
/// While any strong reference to this accessor exists, its handle reports a revival possibility
/// and is never evicted by [`ResourceCache::maintain`](crate::ResourceCache::maintain).
pub struct AvailableOnAccess<R> {
    handle: SharedResourceHandle<R>,
}

impl<R: Send + Sync + 'static> AvailableOnAccess<R> {
    /// The resource, if it is available right now.
    ///
    /// Like [`SharedResourceHandle::try_get_immediate`], this keeps the resource alive for the
    /// rest of the unit of work.
    pub fn get(&self) -> Option<Arc<R>> {
        self.handle.try_get_immediate().available()
    }

    pub fn handle(&self) -> &SharedResourceHandle<R> {
        &self.handle
    }
}

impl<R> fmt::Debug for AvailableOnAccess<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AvailableOnAccess")
            .field(&self.handle)
            .finish()
    }
}

impl<R: Send + Sync + 'static> SharedResourceHandle<R> {
    /// Returns the legacy accessor of this handle, creating it if needed.
    ///
    /// The handle keeps only a weak reference to the accessor.
    #[deprecated = "use `rent` or `try_get_immediate` instead"]
    pub fn legacy_access(&self) -> Arc<AvailableOnAccess<R>> {
        let mut slot = lock(&self.inner.legacy);
        if let Some(existing) = slot.upgrade() {
            return existing;
        }
        let accessor = Arc::new(AvailableOnAccess {
            handle: self.clone(),
        });
        *slot = Arc::downgrade(&accessor);
        accessor
    }

    /// Whether a legacy accessor of this handle is still alive.
    pub fn has_revival_possibility(&self) -> bool {
        lock(&self.inner.legacy).strong_count() > 0
    }
}
