//! Collaborators consumed by the pools of one device.
//!
//! The pools never talk to the OS, the secure-window scheduler or the
//! migration subsystem directly; each is injected as a trait object through
//! a [`DeviceContext`] so tests can substitute counting mocks.

use crate::reclaim::ReclaimSubsystem;
use crate::registry::DeferralRegistry;
use alloc::sync::Arc;
use gpu_page_meta::{PageHandle, PageMetadataStore};

/// Identity of the process on whose behalf pages are requested.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OwnerId(pub u32);

/// OS-level page allocator as seen through the device's allocation groups.
///
/// Implementations register fetched pages in the device's
/// [`PageMetadataStore`] and drop them from it on release.
pub trait PageProvider: Send + Sync {
    /// Allocates a fresh page of `order` for `group_id`.
    fn fetch(&self, group_id: u8, order: u8) -> Option<PageHandle>;

    /// Hands a page back to the OS.
    fn release(&self, page: PageHandle);

    /// Makes CPU writes to the page visible to the device.
    fn sync_for_device(&self, page: PageHandle);

    /// `false` once `owner` is exiting or has a fatal signal pending.
    fn can_request_allocation(&self, owner: OwnerId) -> bool;
}

/// The scheduler of the GPU's mutually exclusive secure execution window.
pub trait SecureWindow: Send + Sync {
    /// The device is inside, or about to enter, a secure window.
    fn deferral_required(&self) -> bool;

    /// Sequence number of the current (or next) secure window.
    fn current_sequence(&self) -> u64;

    /// The window identified by `seq` has fully exited, or the GPU was reset since.
    fn sequence_completed(&self, seq: u64) -> bool;

    /// Longest time a secure window may run before the scheduler intervenes.
    fn progress_timeout_ms(&self) -> u64;

    /// Longest time a device reset triggered by the scheduler may take.
    fn reset_timeout_ms(&self) -> u64;
}

/// Page migration bookkeeping.
pub trait MigrationTracker: Send + Sync {
    /// Pages currently isolated for relocation.
    fn isolation_in_progress_count(&self) -> usize;
}

/// Monotonic time source used by the bounded waits in pool teardown.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;

    /// Back off briefly inside a wait loop.
    fn relax(&self);
}

/// Returns `true` if `completed` is at or past `recorded`.
///
/// Sequence counters are compared by signed distance so the ordering
/// survives a wrap of the 64-bit counter.
#[inline]
#[must_use]
pub const fn sequence_reached(completed: u64, recorded: u64) -> bool {
    completed.wrapping_sub(recorded).cast_signed() >= 0
}

/// Shared collaborators handed to every pool of a device.
#[derive(Clone)]
pub struct DeviceContext {
    pub pages: Arc<PageMetadataStore>,
    pub provider: Arc<dyn PageProvider>,
    pub secure: Arc<dyn SecureWindow>,
    pub migration: Arc<dyn MigrationTracker>,
    pub clock: Arc<dyn Clock>,
    pub deferral: Arc<DeferralRegistry>,
    /// Absent on devices without a memory-pressure reclaim hook.
    pub reclaim: Option<Arc<dyn ReclaimSubsystem>>,
}
