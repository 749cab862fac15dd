//! Batch facade used by the allocation-group layer.
//!
//! The allocation-group layer deals in arrays of [`TaggedAddress`] words,
//! one per base page. The manager maps those onto the pool owning each
//! `(order, group)` pair and back.

use crate::config::PoolConfig;
use crate::device::{DeviceContext, OwnerId};
use crate::error::PoolError;
use crate::pool::PhysicalPagePool;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use gpu_page_meta::{OwnershipTag, PageHandle, TaggedAddress};
use log::warn;

/// The pools of one device, keyed by `(order, group_id)`.
pub struct PoolManager {
    device: DeviceContext,
    pools: BTreeMap<(u8, u8), Arc<PhysicalPagePool>>,
}

impl PoolManager {
    /// Creates one pool per configuration. Invalid or duplicate
    /// configurations are skipped.
    pub fn new(device: DeviceContext, configs: impl IntoIterator<Item = PoolConfig>) -> Self {
        let mut pools = BTreeMap::new();
        for config in configs {
            let key = (config.order, config.group_id);
            if !config.is_valid() || pools.contains_key(&key) {
                warn!("skipping pool configuration {config:?}");
                continue;
            }
            pools.insert(key, PhysicalPagePool::new(config, device.clone(), None));
        }
        Self { device, pools }
    }

    #[must_use]
    pub fn pool(&self, order: u8, group_id: u8) -> Option<&Arc<PhysicalPagePool>> {
        self.pools.get(&(order, group_id))
    }

    pub fn pools(&self) -> impl Iterator<Item = &Arc<PhysicalPagePool>> {
        self.pools.values()
    }

    /// Allocates `nr_base_pages` worth of pages of `order` for `group_id`.
    ///
    /// Each pool page is expanded into `1 << order` entries; for large pages
    /// the head entry always directly precedes its continuations, however
    /// the request was split between pool hits and OS fetches.
    ///
    /// # Errors
    /// - [`PoolError::NoSuchPool`] if the device has no such pool.
    /// - [`PoolError::UnalignedRequest`] if `nr_base_pages` is not a
    ///   multiple of the page size of `order`.
    /// - [`PoolError::Untracked`] if a page handed out by the pool has lost
    ///   its metadata record. The remaining pages go back to the pool.
    /// - Any error of [`PhysicalPagePool::alloc_pages`].
    pub fn alloc_pages(
        &self,
        order: u8,
        group_id: u8,
        nr_base_pages: usize,
        partial_allowed: bool,
        owner: Option<OwnerId>,
    ) -> Result<Vec<TaggedAddress>, PoolError> {
        let pool = self
            .pool(order, group_id)
            .ok_or(PoolError::NoSuchPool { order, group_id })?;
        let per_entry = 1usize << order;
        if !nr_base_pages.is_multiple_of(per_entry) {
            return Err(PoolError::UnalignedRequest {
                pages: nr_base_pages,
                order,
            });
        }

        let handles = pool.alloc_pages(nr_base_pages / per_entry, partial_allowed, owner)?;
        let mut tagged = Vec::with_capacity(handles.len() * per_entry);
        let mut untracked = None;
        for &handle in &handles {
            match self.device.pages.record(handle) {
                Some(record) => tagged.extend(TaggedAddress::expand(record.phys, order)),
                None => {
                    warn!("allocated {handle:?} has no metadata record");
                    untracked = untracked.or(Some(handle));
                }
            }
        }

        if let Some(handle) = untracked {
            let tracked: Vec<PageHandle> = handles
                .into_iter()
                .filter(|&h| self.device.pages.record(h).is_some())
                .collect();
            pool.free_pages(&tracked, false, false);
            return Err(PoolError::Untracked(handle));
        }
        Ok(tagged)
    }

    /// Returns base-page entries previously handed out by
    /// [`alloc_pages`](Self::alloc_pages).
    ///
    /// Continuation entries are skipped; a large page is freed through its
    /// head. Pages are routed to the pool matching their recorded order.
    pub fn free_pages(
        &self,
        group_id: u8,
        pages: &[TaggedAddress],
        dirty: bool,
        reclaimed: bool,
    ) {
        let mut by_order: BTreeMap<u8, Vec<PageHandle>> = BTreeMap::new();
        for &addr in pages {
            if addr.is_huge_continuation() {
                continue;
            }
            let record = self
                .device
                .pages
                .lookup(addr.phys())
                .and_then(|h| self.device.pages.record(h).map(|r| (h, r)));
            let Some((handle, record)) = record else {
                warn!("freeing untracked page {addr:?}");
                continue;
            };
            by_order
                .entry(record.status.order())
                .or_default()
                .push(handle);
        }

        for (order, handles) in by_order {
            if let Some(pool) = self.pool(order, group_id) {
                pool.free_pages(&handles, dirty, reclaimed);
                continue;
            }
            warn!(
                "no pool for order {order} in group {group_id}, returning {} pages to the OS",
                handles.len()
            );
            for handle in handles {
                if let Err(err) = self.device.pages.retag(handle, OwnershipTag::FreeInProgress) {
                    warn!("{handle:?}: {err}");
                }
                self.device.provider.release(handle);
            }
        }
    }

    /// Resizes every pool towards `new_size` pool pages.
    pub fn trim_all(&self, new_size: usize) {
        for pool in self.pools.values() {
            pool.trim(new_size);
        }
    }

    /// Total pages the OS may reclaim across all pools.
    #[must_use]
    pub fn count_reclaimable(&self) -> usize {
        self.pools.values().map(|p| p.count_reclaimable()).sum()
    }

    /// Central drain pass over every pool with deferred pages.
    #[must_use]
    pub fn drain_deferred(&self) -> usize {
        self.device.deferral.drain_pending(false)
    }

    pub fn mark_dying(&self) {
        for pool in self.pools.values() {
            pool.mark_dying();
        }
    }

    /// Tears down every pool. All pools are marked dying first so that no
    /// pool keeps growing while another is being drained.
    pub fn terminate(&self) {
        self.mark_dying();
        for pool in self.pools.values() {
            pool.terminate();
        }
    }
}
