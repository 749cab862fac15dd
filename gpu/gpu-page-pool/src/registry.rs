use crate::pool::PhysicalPagePool;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use log::debug;
use spin::Mutex;

/// Device-unique pool identifier.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PoolId(pub u32);

/// Pools of one device that hold deferred pages.
///
/// A pool registers itself when its first page is deferred and deregisters
/// once its deferral queue has drained (or when it is marked dying). The
/// central drain pass, [`drain_pending`](Self::drain_pending), visits every
/// registered pool.
///
/// # Locking
/// Pools call [`register`](Self::register) and
/// [`deregister`](Self::deregister) with their pool lock held. The registry
/// lock is therefore never held while calling into a pool.
#[derive(Debug, Default)]
pub struct DeferralRegistry {
    next_id: AtomicU32,
    pending: Mutex<Vec<(PoolId, Weak<PhysicalPagePool>)>>,
}

impl DeferralRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next_id: AtomicU32::new(0),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn allocate_id(&self) -> PoolId {
        PoolId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn register(&self, id: PoolId, pool: Weak<PhysicalPagePool>) {
        let mut pending = self.pending.lock();
        if pending.iter().any(|(p, _)| *p == id) {
            return;
        }
        pending.push((id, pool));
        debug!("pool {} pending deferred-free drain", id.0);
    }

    pub(crate) fn deregister(&self, id: PoolId) {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|(p, _)| *p != id);
        if pending.len() != before {
            debug!("pool {} no longer pending deferred-free drain", id.0);
        }
    }

    #[must_use]
    pub fn is_pending(&self, id: PoolId) -> bool {
        self.pending.lock().iter().any(|(p, _)| *p == id)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drains every registered pool; returns the number of pages released
    /// from deferral.
    ///
    /// Typically called when the secure-window scheduler reports a sequence
    /// as completed. `force` skips the completion check and is only meant
    /// for device teardown.
    #[must_use]
    pub fn drain_pending(&self, force: bool) -> usize {
        let pools: Vec<Arc<PhysicalPagePool>> = self
            .pending
            .lock()
            .iter()
            .filter_map(|(_, pool)| pool.upgrade())
            .collect();
        pools.iter().map(|pool| pool.drain_deferred(force)).sum()
    }
}
