use gpu_page_meta::PageHandle;

/// Failures surfaced by pool and pool-manager operations.
///
/// `OutOfMemory` means "try later"; `PoolTerminating` and `Busy` mean the
/// pool will never satisfy the request and the caller should go elsewhere.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("pool is terminating")]
    PoolTerminating,
    #[error("pool growth aborted by teardown")]
    Busy,
    #[error("no pool for order {order} in group {group_id}")]
    NoSuchPool { order: u8, group_id: u8 },
    #[error("{pages} base pages is not a multiple of an order {order} page")]
    UnalignedRequest { pages: usize, order: u8 },
    #[error("{0:?} has no metadata record")]
    Untracked(PageHandle),
}

/// Deferred pages did not become releasable within the terminate budget.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("deferred pages still pending after {waited_ms} ms")]
pub(crate) struct WaitTimeout {
    pub waited_ms: u64,
}
