use crate::address::{DmaAddress, PhysicalAddress};
use crate::status::{OwnershipTag, PageStatus};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;
use spin::{Mutex, MutexGuard};

/// Stable index of a page record in a [`PageMetadataStore`].
///
/// Handles are plain values; free lists, deferral queues and the store all
/// refer to a page through one, so none of them owns the page memory.
/// A slot's generation advances on every removal, so a handle outliving
/// its page never resolves to the slot's next occupant.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageHandle {
    index: u32,
    generation: u32,
}

impl PageHandle {
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.index as usize
    }

    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page#{}.{}", self.index, self.generation)
    }
}

/// Metadata of one tracked page.
#[derive(Copy, Clone, Debug)]
pub struct PageRecord {
    pub phys: PhysicalAddress,
    pub dma: DmaAddress,
    pub status: PageStatus,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("page metadata arena exhausted")]
    Exhausted,
    #[error("stale or unknown page handle")]
    InvalidHandle,
    #[error("physical page {0} is already tracked")]
    AlreadyTracked(PhysicalAddress),
}

/// Fixed-capacity arena of per-page records, shared by all pools of a device.
///
/// # Locking
/// Every slot has its own lock. Pools call into the store while holding
/// their pool lock, so the order is always pool lock, then page lock. The
/// reverse-lookup lock is only ever taken before a page lock (in
/// [`insert`](Self::insert)), never while one is held.
#[derive(Default)]
struct Slot {
    generation: u32,
    record: Option<PageRecord>,
}

pub struct PageMetadataStore {
    slots: Box<[Mutex<Slot>]>,
    vacant: Mutex<Vec<u32>>,
    by_phys: Mutex<BTreeMap<PhysicalAddress, PageHandle>>,
}

impl PageMetadataStore {
    /// Creates a store able to track `capacity` pages at once.
    #[must_use]
    pub fn with_capacity(capacity: u32) -> Self {
        let slots = (0..capacity).map(|_| Mutex::new(Slot::default())).collect();
        // Reverse order so the lowest index is handed out first.
        let vacant = (0..capacity).rev().collect();
        Self {
            slots,
            vacant: Mutex::new(vacant),
            by_phys: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of pages currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_phys.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts tracking a page freshly obtained from the OS.
    ///
    /// The page starts out as [`OwnershipTag::AllocateInProgress`].
    ///
    /// # Errors
    /// [`StoreError::AlreadyTracked`] if `phys` has a live record,
    /// [`StoreError::Exhausted`] if every slot is in use.
    pub fn insert(
        &self,
        phys: PhysicalAddress,
        dma: DmaAddress,
        order: u8,
        group_id: u8,
    ) -> Result<PageHandle, StoreError> {
        let mut by_phys = self.by_phys.lock();
        if by_phys.contains_key(&phys) {
            return Err(StoreError::AlreadyTracked(phys));
        }
        let index = self.vacant.lock().pop().ok_or(StoreError::Exhausted)?;
        let status = PageStatus::new()
            .with_tag(OwnershipTag::AllocateInProgress)
            .with_order(order)
            .with_group_id(group_id);
        let mut slot = self.slots[index as usize].lock();
        slot.record = Some(PageRecord { phys, dma, status });
        let handle = PageHandle {
            index,
            generation: slot.generation,
        };
        drop(slot);
        by_phys.insert(phys, handle);
        Ok(handle)
    }

    /// Stops tracking a page and returns its last record.
    ///
    /// # Errors
    /// [`StoreError::InvalidHandle`] if the handle is not live.
    pub fn remove(&self, handle: PageHandle) -> Result<PageRecord, StoreError> {
        let record = {
            let mut slot = self.live_slot(handle)?;
            let record = slot.record.take().ok_or(StoreError::InvalidHandle)?;
            slot.generation = slot.generation.wrapping_add(1);
            record
        };
        self.by_phys.lock().remove(&record.phys);
        self.vacant.lock().push(handle.index);
        Ok(record)
    }

    #[must_use]
    pub fn record(&self, handle: PageHandle) -> Option<PageRecord> {
        self.live_slot(handle).ok().and_then(|slot| slot.record)
    }

    /// Reverse lookup from a physical address to its handle.
    #[must_use]
    pub fn lookup(&self, phys: PhysicalAddress) -> Option<PageHandle> {
        self.by_phys.lock().get(&phys).copied()
    }

    #[must_use]
    pub fn tag(&self, handle: PageHandle) -> Option<OwnershipTag> {
        self.record(handle).map(|r| r.status.tag())
    }

    /// Unconditionally sets the ownership tag.
    ///
    /// # Errors
    /// [`StoreError::InvalidHandle`] if the handle is not live.
    pub fn set_tag(&self, handle: PageHandle, tag: OwnershipTag) -> Result<(), StoreError> {
        self.update(handle, |s| s.set_tag(tag))
    }

    /// Moves a page to `tag` unless it is [`OwnershipTag::NotMovable`].
    ///
    /// Returns the tag the page had before.
    ///
    /// # Errors
    /// [`StoreError::InvalidHandle`] if the handle is not live.
    pub fn retag(&self, handle: PageHandle, tag: OwnershipTag) -> Result<OwnershipTag, StoreError> {
        let mut previous = OwnershipTag::Free;
        self.update(handle, |s| {
            previous = s.tag();
            if previous != OwnershipTag::NotMovable {
                s.set_tag(tag);
            }
        })?;
        Ok(previous)
    }

    /// Sets the deferred flag and returns its previous value.
    ///
    /// # Errors
    /// [`StoreError::InvalidHandle`] if the handle is not live.
    pub fn set_deferred(&self, handle: PageHandle, deferred: bool) -> Result<bool, StoreError> {
        let mut previous = false;
        self.update(handle, |s| {
            previous = s.deferred();
            s.set_deferred(deferred);
        })?;
        Ok(previous)
    }

    #[must_use]
    pub fn is_deferred(&self, handle: PageHandle) -> bool {
        self.record(handle).is_some_and(|r| r.status.deferred())
    }

    fn update(
        &self,
        handle: PageHandle,
        f: impl FnOnce(&mut PageStatus),
    ) -> Result<(), StoreError> {
        let mut slot = self.live_slot(handle)?;
        let record = slot.record.as_mut().ok_or(StoreError::InvalidHandle)?;
        f(&mut record.status);
        Ok(())
    }

    /// Locks the slot `handle` points at, if the handle is still current.
    fn live_slot(&self, handle: PageHandle) -> Result<MutexGuard<'_, Slot>, StoreError> {
        let slot = self
            .slots
            .get(handle.index())
            .ok_or(StoreError::InvalidHandle)?
            .lock();
        if slot.generation == handle.generation {
            Ok(slot)
        } else {
            Err(StoreError::InvalidHandle)
        }
    }
}

impl fmt::Debug for PageMetadataStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageMetadataStore")
            .field("capacity", &self.capacity())
            .field("tracked", &self.len())
            .finish()
    }
}
