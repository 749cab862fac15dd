//! The physical page pool.
//!
//! A pool caches physical pages of one size class for one allocation group
//! so that GPU allocations can be served without a round trip to the OS
//! page allocator. Frees go to the pool first and to the OS only once the
//! pool is full; allocations come from the pool first and from the OS only
//! once it is empty.
//!
//! # Locking
//! One spin lock per pool (the pool lock) guards the free list, the
//! deferral queue, `max_size`, `dying` and the reclaim gate. It is never
//! held across a call into the OS page allocator or a query of the
//! secure-window scheduler. Per-page ownership tags are updated under the
//! page's own lock, always taken after the pool lock.

use crate::config::PoolConfig;
use crate::deferral::{DeferralEntry, DeferralPhase, DeferralQueue};
use crate::device::{DeviceContext, OwnerId};
use crate::error::{PoolError, WaitTimeout};
use crate::free_list::FreeList;
use crate::reclaim::{ReclaimRegistration, ScanResult};
use crate::registry::PoolId;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use gpu_page_meta::{OwnershipTag, PageHandle};
use log::{debug, info, trace, warn};
use spin::Mutex;

#[derive(Debug)]
struct PoolState {
    free: FreeList,
    deferred: DeferralQueue,
    max_size: usize,
    dying: bool,
    /// Number of `grow` calls in flight.
    growing: usize,
}

impl PoolState {
    fn reclaim_allowed(&self) -> bool {
        !self.dying && self.growing == 0 && self.deferred.is_empty()
    }

    fn accepts(&self) -> bool {
        !self.dying && !self.free.is_full(self.max_size)
    }
}

/// Point-in-time view of a pool.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PoolStats {
    pub current_size: usize,
    pub max_size: usize,
    pub deferred: usize,
    pub deferral_phase: DeferralPhase,
    pub dying: bool,
    pub reclaim_allowed: bool,
}

/// Cache of physical pages of one order for one allocation group.
pub struct PhysicalPagePool {
    id: PoolId,
    order: u8,
    group_id: u8,
    state: Mutex<PoolState>,
    device: DeviceContext,
    /// Receives pages this pool has no room for.
    next_pool: Option<Arc<PhysicalPagePool>>,
    this: Weak<Self>,
    reclaim: Mutex<Option<ReclaimRegistration>>,
}

impl PhysicalPagePool {
    /// Creates an empty pool and, if `config.reclaim` is set and the device
    /// has a reclaim subsystem, registers it for memory-pressure reclaim.
    #[must_use]
    pub fn new(
        config: PoolConfig,
        device: DeviceContext,
        next_pool: Option<Arc<Self>>,
    ) -> Arc<Self> {
        debug_assert!(config.is_valid(), "invalid pool configuration {config:?}");
        let id = device.deferral.allocate_id();
        let pool = Arc::new_cyclic(|this| Self {
            id,
            order: config.order,
            group_id: config.group_id,
            state: Mutex::new(PoolState {
                free: FreeList::new(),
                deferred: DeferralQueue::new(),
                max_size: config.max_size,
                dying: false,
                growing: 0,
            }),
            device,
            next_pool,
            this: this.clone(),
            reclaim: Mutex::new(None),
        });

        if config.reclaim
            && let Some(subsystem) = &pool.device.reclaim
        {
            let registration =
                ReclaimRegistration::register(Arc::clone(subsystem), Arc::downgrade(&pool));
            *pool.reclaim.lock() = Some(registration);
        }

        debug!(
            "pool {} created: order {}, group {}, max {} pages",
            id.0, config.order, config.group_id, config.max_size
        );
        pool
    }

    #[must_use]
    pub const fn id(&self) -> PoolId {
        self.id
    }

    #[must_use]
    pub const fn order(&self) -> u8 {
        self.order
    }

    #[must_use]
    pub const fn group_id(&self) -> u8 {
        self.group_id
    }

    /// Number of pages on the free list.
    #[must_use]
    pub fn current_size(&self) -> usize {
        self.state.lock().free.len()
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.state.lock().max_size
    }

    #[must_use]
    pub fn is_dying(&self) -> bool {
        self.state.lock().dying
    }

    #[must_use]
    pub fn is_reclaim_registered(&self) -> bool {
        self.reclaim.lock().is_some()
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let st = self.state.lock();
        PoolStats {
            current_size: st.free.len(),
            max_size: st.max_size,
            deferred: st.deferred.len(),
            deferral_phase: st.deferred.phase(),
            dying: st.dying,
            reclaim_allowed: st.reclaim_allowed(),
        }
    }

    /// Takes the most recently pooled page.
    ///
    /// `None` when the pool is empty (or dying); the caller is expected to
    /// fall back to the OS.
    #[must_use]
    pub fn alloc_one(&self) -> Option<PageHandle> {
        let _ = self.drain_deferred(false);
        let mut st = self.state.lock();
        if st.dying {
            return None;
        }
        let page = st.free.pop()?;
        self.mark(page, OwnershipTag::AllocateInProgress);
        Some(page)
    }

    /// Returns one page, to the pool if it has room, else onward.
    ///
    /// While the GPU may be inside a secure window the page is deferred
    /// instead and the call returns immediately.
    pub fn free_one(&self, page: PageHandle, dirty: bool) {
        let _ = self.drain_deferred(false);

        if self.device.secure.deferral_required() {
            if self.defer(&[page], true, dirty) {
                return;
            }
            // Dying pools are no longer drained, so nothing may wait on them.
            self.release_to_os(page);
            return;
        }

        {
            let mut st = self.state.lock();
            if st.accepts() {
                self.admit_locked(&mut st, page, dirty);
                return;
            }
        }
        self.spill_or_release(page, dirty);
    }

    /// Allocates `count` pages, from the pool first, then from the OS.
    ///
    /// With `partial_allowed` an OS shortage yields a short result instead
    /// of an error. OS fetches are skipped entirely once `owner` is being
    /// torn down.
    ///
    /// # Errors
    /// - [`PoolError::PoolTerminating`] if the pool is dying.
    /// - [`PoolError::OutOfMemory`] if the OS could not supply the
    ///   remainder and `partial_allowed` is not set. Pages obtained so far
    ///   have been given back.
    pub fn alloc_pages(
        &self,
        count: usize,
        partial_allowed: bool,
        owner: Option<OwnerId>,
    ) -> Result<Vec<PageHandle>, PoolError> {
        let _ = self.drain_deferred(false);

        let mut pages = {
            let mut st = self.state.lock();
            if st.dying {
                return Err(PoolError::PoolTerminating);
            }
            self.take_locked(&mut st, count, OwnershipTag::AllocateInProgress)
        };

        // No pool lock across OS fetches.
        while pages.len() < count {
            if let Some(page) = self.fetch_from_os(owner) {
                pages.push(page);
                continue;
            }
            if partial_allowed {
                debug!(
                    "pool {}: partial allocation of {} of {count} pages",
                    self.id.0,
                    pages.len()
                );
                break;
            }
            self.free_pages(&pages, false, false);
            return Err(PoolError::OutOfMemory);
        }
        Ok(pages)
    }

    /// Returns a batch of pages.
    ///
    /// Unless `reclaimed` is set, pages fill this pool up to capacity, then
    /// the next pool, and only the rest go to the OS. Reclaimed pages were
    /// already subtracted from the advertised free count and go straight to
    /// the OS.
    pub fn free_pages(&self, pages: &[PageHandle], dirty: bool, reclaimed: bool) {
        if pages.is_empty() {
            return;
        }
        let _ = self.drain_deferred(false);

        if self.device.secure.deferral_required() {
            if !self.defer(pages, !reclaimed, dirty) {
                for &page in pages {
                    self.release_to_os(page);
                }
            }
            return;
        }

        if reclaimed {
            for &page in pages {
                self.release_to_os(page);
            }
            return;
        }

        // Cache maintenance runs before the pool lock is taken; only the
        // pages expected to fit are synced.
        let expected = {
            let st = self.state.lock();
            if st.dying {
                0
            } else {
                st.free.room(st.max_size).min(pages.len())
            }
        };
        if dirty {
            for &page in &pages[..expected] {
                self.device.provider.sync_for_device(page);
            }
        }

        let rest = {
            let mut st = self.state.lock();
            let admitted = if st.dying {
                0
            } else {
                st.free.room(st.max_size).min(expected)
            };
            let (to_pool, rest) = pages.split_at(admitted);
            for &page in to_pool {
                self.prepare_for_pool(page, false);
            }
            st.free.push_all(to_pool);
            rest
        };

        for &page in rest {
            self.spill_or_release(page, dirty);
        }
    }

    /// Fills the pool with `target` fresh pages from the OS.
    ///
    /// Reclaim is held off while growing. Stops early without error once
    /// the pool is full.
    ///
    /// # Errors
    /// - [`PoolError::Busy`] if the pool is, or becomes, dying. Pages added
    ///   by this call are shrunk back out.
    /// - [`PoolError::OutOfMemory`] if the OS ran out; pages added so far stay.
    pub fn grow(&self, target: usize, owner: Option<OwnerId>) -> Result<(), PoolError> {
        let _ = self.drain_deferred(false);
        {
            let mut st = self.state.lock();
            if st.dying {
                return Err(PoolError::Busy);
            }
            st.growing += 1;
        }

        let mut added = 0;
        let result = loop {
            if added == target {
                break Ok(());
            }
            let Some(page) = self.fetch_from_os(owner) else {
                break Err(PoolError::OutOfMemory);
            };
            let mut st = self.state.lock();
            if st.dying {
                drop(st);
                self.release_to_os(page);
                break Err(PoolError::Busy);
            }
            if st.free.is_full(st.max_size) {
                drop(st);
                self.release_to_os(page);
                break Ok(());
            }
            self.admit_locked(&mut st, page, false);
            added += 1;
        };

        self.state.lock().growing -= 1;

        if result == Err(PoolError::Busy) && added > 0 {
            let undone = self.shrink(added);
            debug!(
                "pool {}: growth interrupted by teardown, returned {undone} pages",
                self.id.0
            );
        }
        result
    }

    /// Returns up to `target` pooled pages to the OS; returns how many.
    pub fn shrink(&self, target: usize) -> usize {
        let pages = {
            let mut st = self.state.lock();
            self.take_locked(&mut st, target, OwnershipTag::FreeInProgress)
        };
        for &page in &pages {
            self.device.provider.release(page);
        }
        pages.len()
    }

    /// Best-effort resize of the pool towards `new_size` (capped at `max_size`).
    pub fn trim(&self, new_size: usize) {
        let (current, max) = {
            let st = self.state.lock();
            (st.free.len(), st.max_size)
        };
        let target = new_size.min(max);
        if target > current {
            if let Err(err) = self.grow(target - current, None) {
                warn!(
                    "pool {}: trim to {target} pages stopped at {}: {err}",
                    self.id.0,
                    self.current_size()
                );
            }
        } else if current > target {
            self.shrink(current - target);
        }
    }

    /// Changes the capacity ceiling, shrinking right away if needed.
    pub fn set_max_size(&self, max_size: usize) {
        let excess = {
            let mut st = self.state.lock();
            st.max_size = max_size;
            let excess = st.free.len().saturating_sub(max_size);
            self.take_locked(&mut st, excess, OwnershipTag::FreeInProgress)
        };
        if !excess.is_empty() {
            info!(
                "pool {}: max size now {max_size}, released {} pages",
                self.id.0,
                excess.len()
            );
        }
        for page in excess {
            self.device.provider.release(page);
        }
    }

    /// Starts teardown: no growth, no new deferrals, no central draining.
    pub fn mark_dying(&self) {
        let mut st = self.state.lock();
        if st.dying {
            return;
        }
        st.dying = true;
        self.device.deferral.deregister(self.id);
        debug!(
            "pool {} marked dying with {} pooled and {} deferred pages",
            self.id.0,
            st.free.len(),
            st.deferred.len()
        );
    }

    /// Tears the pool down, returning every page it holds to the OS.
    ///
    /// Waits for deferred pages to become releasable for at most the
    /// scheduler's progress timeout plus its reset timeout, after which they
    /// are released anyway: by then the scheduler has reset the GPU. Then
    /// waits for in-flight page isolations to finish.
    pub fn terminate(&self) {
        self.mark_dying();
        drop(self.reclaim.lock().take());

        if let Err(timeout) = self.wait_deferred() {
            warn!(
                "pool {}: {timeout}, forcing release of deferred pages",
                self.id.0
            );
            while !self.state.lock().deferred.is_empty() {
                if self.drain_deferred(true) == 0 {
                    self.device.clock.relax();
                }
            }
        }

        let pages = {
            let pages = self.state.lock().free.take_all();
            for &page in &pages {
                self.mark(page, OwnershipTag::FreeInProgress);
            }
            pages
        };
        for &page in &pages {
            self.device.provider.release(page);
        }

        let mut announced = false;
        while self.device.migration.isolation_in_progress_count() > 0 {
            if !announced {
                debug!("pool {}: waiting for page isolation to finish", self.id.0);
                announced = true;
            }
            self.device.clock.relax();
        }

        debug!(
            "pool {} terminated, released {} pooled pages",
            self.id.0,
            pages.len()
        );
    }

    /// Releases deferred pages whose secure sequence has completed.
    ///
    /// Cheap when there is nothing to do. `force` releases everything
    /// regardless of the scheduler and is meant for teardown only. Returns
    /// the number of pages taken off the deferral queue.
    #[must_use]
    pub fn drain_deferred(&self, force: bool) -> usize {
        let Some(window) = self.state.lock().deferred.begin_drain() else {
            return 0;
        };

        // Ask the scheduler without the pool lock held, then re-validate.
        let limit = if force {
            None
        } else if self.device.secure.sequence_completed(window.newest) {
            Some(window.newest)
        } else if window.oldest != window.newest
            && self.device.secure.sequence_completed(window.oldest)
        {
            Some(window.oldest)
        } else {
            None
        };

        let mut st = self.state.lock();
        let entries = match limit {
            _ if force => st.deferred.take_all(),
            Some(limit) => st.deferred.take_completed(limit),
            None => Vec::new(),
        };
        if st.deferred.finish_drain() {
            self.device.deferral.deregister(self.id);
        }
        if entries.is_empty() {
            return 0;
        }

        let mut overflow = Vec::new();
        for entry in &entries {
            if let Err(err) = self.device.pages.set_deferred(entry.page, false) {
                warn!("pool {}: {:?}: {err}", self.id.0, entry.page);
            }
            if entry.readmit && st.accepts() {
                self.admit_locked(&mut st, entry.page, entry.dirty);
            } else {
                overflow.push(entry);
            }
        }
        drop(st);

        for entry in &overflow {
            if entry.readmit {
                self.spill_or_release(entry.page, entry.dirty);
            } else {
                self.release_to_os(entry.page);
            }
        }
        debug!(
            "pool {}: released {} deferred pages ({} overflowed){}",
            self.id.0,
            entries.len(),
            overflow.len(),
            if force { ", forced" } else { "" }
        );
        entries.len()
    }

    /// Pages the OS may reclaim right now; zero while reclaim is held off.
    #[must_use]
    pub fn count_reclaimable(&self) -> usize {
        let st = self.state.lock();
        if st.reclaim_allowed() {
            st.free.len()
        } else {
            0
        }
    }

    /// Reclaims up to `target` pooled pages for the OS.
    pub fn scan(&self, target: usize) -> ScanResult {
        let pages = {
            let mut st = self.state.lock();
            if !st.reclaim_allowed() {
                return ScanResult::Stop;
            }
            self.take_locked(&mut st, target, OwnershipTag::FreeInProgress)
        };
        for &page in &pages {
            self.device.provider.release(page);
        }
        ScanResult::Freed(pages.len())
    }

    /// Queues pages until the current secure sequence completes.
    ///
    /// Returns `false`, deferring nothing, if the pool is dying.
    fn defer(&self, pages: &[PageHandle], readmit: bool, dirty: bool) -> bool {
        let seq = self.device.secure.current_sequence();
        let mut st = self.state.lock();
        if st.dying {
            return false;
        }
        for &page in pages {
            self.mark(page, OwnershipTag::FreeInProgress);
            let was_deferred = self.device.pages.set_deferred(page, true).unwrap_or(false);
            debug_assert!(!was_deferred, "{page:?} deferred twice");
            let first = st.deferred.push(DeferralEntry {
                page,
                seq,
                readmit,
                dirty,
            });
            if first {
                self.device.deferral.register(self.id, self.this.clone());
            }
        }
        trace!(
            "pool {}: deferred {} pages until secure sequence {seq}",
            self.id.0,
            pages.len()
        );
        true
    }

    /// Offers a page to this pool without deferral; hands it back if there
    /// is no room.
    fn try_admit(&self, page: PageHandle, dirty: bool) -> Result<(), PageHandle> {
        let mut st = self.state.lock();
        if st.accepts() {
            self.admit_locked(&mut st, page, dirty);
            Ok(())
        } else {
            Err(page)
        }
    }

    fn spill_or_release(&self, page: PageHandle, dirty: bool) {
        let page = match &self.next_pool {
            Some(next) => match next.try_admit(page, dirty) {
                Ok(()) => return,
                Err(page) => page,
            },
            None => page,
        };
        self.release_to_os(page);
    }

    fn admit_locked(&self, st: &mut PoolState, page: PageHandle, dirty: bool) {
        self.prepare_for_pool(page, dirty);
        st.free.push(page);
    }

    fn prepare_for_pool(&self, page: PageHandle, dirty: bool) {
        if dirty {
            self.device.provider.sync_for_device(page);
        }
        let previous = self.mark(page, OwnershipTag::Pooled);
        debug_assert_ne!(previous, Some(OwnershipTag::Pooled), "{page:?} pooled twice");
    }

    fn take_locked(&self, st: &mut PoolState, count: usize, tag: OwnershipTag) -> Vec<PageHandle> {
        let pages = st.free.pop_many(count);
        for &page in &pages {
            self.mark(page, tag);
        }
        pages
    }

    fn fetch_from_os(&self, owner: Option<OwnerId>) -> Option<PageHandle> {
        if let Some(owner) = owner
            && !self.device.provider.can_request_allocation(owner)
        {
            debug!(
                "pool {}: owner {} is terminating, not fetching pages",
                self.id.0, owner.0
            );
            return None;
        }
        let page = self.device.provider.fetch(self.group_id, self.order);
        trace!("pool {}: fetched {page:?} from the OS", self.id.0);
        page
    }

    fn release_to_os(&self, page: PageHandle) {
        self.mark(page, OwnershipTag::FreeInProgress);
        trace!("pool {}: returning {page:?} to the OS", self.id.0);
        self.device.provider.release(page);
    }

    fn mark(&self, page: PageHandle, tag: OwnershipTag) -> Option<OwnershipTag> {
        match self.device.pages.retag(page, tag) {
            Ok(previous) => Some(previous),
            Err(err) => {
                warn!("pool {}: cannot tag {page:?} as {tag:?}: {err}", self.id.0);
                None
            }
        }
    }

    fn wait_deferred(&self) -> Result<(), WaitTimeout> {
        let clock = &self.device.clock;
        let budget = self
            .device
            .secure
            .progress_timeout_ms()
            .saturating_add(self.device.secure.reset_timeout_ms());
        let start = clock.now_ms();
        loop {
            let _ = self.drain_deferred(false);
            if self.state.lock().deferred.is_empty() {
                return Ok(());
            }
            let waited_ms = clock.now_ms().saturating_sub(start);
            if waited_ms >= budget {
                return Err(WaitTimeout { waited_ms });
            }
            clock.relax();
        }
    }
}

impl Drop for PhysicalPagePool {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        if !st.free.is_empty() || !st.deferred.is_empty() {
            warn!(
                "pool {} dropped without terminate, leaking {} pooled and {} deferred pages",
                self.id.0,
                st.free.len(),
                st.deferred.len()
            );
        }
    }
}
