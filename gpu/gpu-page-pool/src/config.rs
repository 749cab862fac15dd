//! Pool sizing constants and per-pool configuration.

use gpu_page_meta::BASE_PAGE_SHIFT;

/// Order of the large (2 MiB) size class.
pub const LARGE_PAGE_ORDER: u8 = 9;

/// Largest order representable in the page status word.
pub const MAX_ORDER: u8 = 15;

/// Number of allocation groups representable in the page status word.
pub const MAX_MEMORY_GROUPS: u8 = 16;

/// Default capacity budget of a pool, in bytes.
pub const DEFAULT_POOL_SIZE_BYTES: usize = 64 * 1024 * 1024;

/// Construction parameters of a [`PhysicalPagePool`](crate::PhysicalPagePool).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PoolConfig {
    /// Size class served by the pool.
    pub order: u8,
    /// Allocation group pages are fetched for.
    pub group_id: u8,
    /// Capacity ceiling, in pool pages.
    pub max_size: usize,
    /// Register with the OS memory-pressure reclaim subsystem.
    pub reclaim: bool,
}

impl PoolConfig {
    /// Base-page pool with the default capacity, reclaimable.
    #[must_use]
    pub const fn small(group_id: u8) -> Self {
        Self::with_order(0, group_id)
    }

    /// 2 MiB pool with the default capacity, reclaimable.
    #[must_use]
    pub const fn large(group_id: u8) -> Self {
        Self::with_order(LARGE_PAGE_ORDER, group_id)
    }

    #[must_use]
    pub const fn with_order(order: u8, group_id: u8) -> Self {
        Self {
            order,
            group_id,
            max_size: default_max_size(order),
            reclaim: true,
        }
    }

    #[must_use]
    pub const fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Pools used purely as private scratch opt out of reclaim.
    #[must_use]
    pub const fn with_reclaim(mut self, reclaim: bool) -> Self {
        self.reclaim = reclaim;
        self
    }

    /// Number of base pages in one pool page.
    #[must_use]
    pub const fn pages_per_entry(&self) -> usize {
        1 << self.order
    }

    pub(crate) const fn is_valid(&self) -> bool {
        self.order <= MAX_ORDER && self.group_id < MAX_MEMORY_GROUPS
    }
}

/// [`DEFAULT_POOL_SIZE_BYTES`] expressed in pages of `order`.
#[must_use]
pub const fn default_max_size(order: u8) -> usize {
    DEFAULT_POOL_SIZE_BYTES >> (BASE_PAGE_SHIFT + order as u32)
}
