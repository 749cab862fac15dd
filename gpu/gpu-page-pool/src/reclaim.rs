//! Glue between pools and the OS memory-pressure reclaim interface.
//!
//! The OS asks each registered [`Shrinker`] how many objects it could give
//! back ([`count_objects`](Shrinker::count_objects)) and then asks it to
//! give back some ([`scan_objects`](Shrinker::scan_objects)). A pool that
//! cannot be reclaimed right now reports zero on count and
//! [`ScanResult::Stop`] on scan.

use crate::pool::PhysicalPagePool;
use alloc::sync::{Arc, Weak};
use core::fmt;
use log::info;

/// Outcome of a reclaim scan.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ScanResult {
    /// Pages actually freed; may be fewer than requested.
    Freed(usize),
    /// Reclaim is not possible at the moment; do not retry this pass.
    Stop,
}

/// Callbacks invoked by the OS reclaim subsystem.
pub trait Shrinker: Send + Sync {
    fn count_objects(&self) -> usize;
    fn scan_objects(&self, nr_to_scan: usize) -> ScanResult;
}

/// Handle returned by a [`ReclaimSubsystem`] on registration.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ShrinkerId(pub u64);

/// The OS memory-pressure reclaim framework.
pub trait ReclaimSubsystem: Send + Sync {
    fn register(&self, shrinker: Arc<dyn Shrinker>) -> ShrinkerId;
    fn unregister(&self, id: ShrinkerId);
}

/// Exposes one pool's free list to the reclaim subsystem.
///
/// Holds the pool weakly: the registration must never keep a pool alive.
pub struct ReclaimAdapter {
    pool: Weak<PhysicalPagePool>,
}

impl ReclaimAdapter {
    #[must_use]
    pub const fn new(pool: Weak<PhysicalPagePool>) -> Self {
        Self { pool }
    }
}

impl Shrinker for ReclaimAdapter {
    fn count_objects(&self) -> usize {
        self.pool
            .upgrade()
            .map_or(0, |pool| pool.count_reclaimable())
    }

    fn scan_objects(&self, nr_to_scan: usize) -> ScanResult {
        let Some(pool) = self.pool.upgrade() else {
            return ScanResult::Stop;
        };
        let result = pool.scan(nr_to_scan);
        if let ScanResult::Freed(freed) = result
            && freed > 0
        {
            info!(
                "reclaim freed {freed} of {nr_to_scan} requested pages from pool {}",
                pool.id().0
            );
        }
        result
    }
}

/// Live registration of a pool with the reclaim subsystem.
///
/// Unregisters on drop.
pub struct ReclaimRegistration {
    subsystem: Arc<dyn ReclaimSubsystem>,
    id: ShrinkerId,
}

impl ReclaimRegistration {
    pub(crate) fn register(
        subsystem: Arc<dyn ReclaimSubsystem>,
        pool: Weak<PhysicalPagePool>,
    ) -> Self {
        let id = subsystem.register(Arc::new(ReclaimAdapter::new(pool)));
        Self { subsystem, id }
    }

    #[must_use]
    pub const fn id(&self) -> ShrinkerId {
        self.id
    }
}

impl Drop for ReclaimRegistration {
    fn drop(&mut self) {
        self.subsystem.unregister(self.id);
    }
}

impl fmt::Debug for ReclaimRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ReclaimRegistration").field(&self.id).finish()
    }
}
