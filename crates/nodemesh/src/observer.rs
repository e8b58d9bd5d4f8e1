//! Observer hooks for in-process subsystems.
//!
//! Observers are called on the coordinator task and must not block.

use std::sync::Arc;

use nodemesh_proto::lock::Lock;

/// Told when a peer announces that cached data went stale.
pub trait StaleCacheObserver: Send + Sync {
    fn changed_cache_data(&self, cache: &str, payload: &[u8]);
}

/// Told when this node was forced to give up a lock it held.
pub trait DroppedLockObserver: Send + Sync {
    fn dropped_lock(&self, lock: &Lock);
}

impl<F> StaleCacheObserver for F
where
    F: Fn(&str, &[u8]) + Send + Sync,
{
    fn changed_cache_data(&self, cache: &str, payload: &[u8]) {
        self(cache, payload)
    }
}

impl<F> DroppedLockObserver for F
where
    F: Fn(&Lock) + Send + Sync,
{
    fn dropped_lock(&self, lock: &Lock) {
        self(lock)
    }
}

/// Identity comparison for registered observers.
pub(crate) fn same_observer<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
