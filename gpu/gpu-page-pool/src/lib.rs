//! # GPU Physical Page Pool
//!
//! Per-device, per-size-class caches of physical pages sitting between the
//! GPU address-space allocator and the OS page allocator.
//!
//! ## Overview
//!
//! A [`PhysicalPagePool`] serves pages of one order for one allocation
//! group. Frees land on the pool's free list until it reaches `max_size`;
//! allocations are served from the free list (most recently freed first)
//! before falling back to the OS. The OS can take pooled pages back under
//! memory pressure through a [`ReclaimAdapter`].
//!
//! While the GPU may be inside a secure execution window, freed pages are
//! parked on the pool's deferral queue together with the window's sequence
//! number and only released once the [`SecureWindow`] scheduler reports
//! that sequence as completed:
//!
//! ```text
//!  PoolManager::alloc_pages ─► PhysicalPagePool ─► free list ─► page
//!                                     │  (empty)
//!                                     └─────────► PageProvider::fetch
//!
//!  PoolManager::free_pages ──► PhysicalPagePool ─┬─► deferral queue (secure window)
//!                                                ├─► free list (room left)
//!                                                ├─► next pool (spill)
//!                                                └─► PageProvider::release
//! ```
//!
//! All collaborators (OS page provider, scheduler, migration tracker, clock,
//! reclaim subsystem) are injected through a [`DeviceContext`].
//!
//! ## Locking
//!
//! | Lock | Guards | Taken after |
//! |------|--------|-------------|
//! | pool lock | free list, deferral queue, `max_size`, `dying` | nothing |
//! | page lock | one page's metadata record | pool lock |
//! | registry lock | pools pending a deferral drain | pool lock |

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod config;
mod deferral;
mod device;
mod error;
mod free_list;
mod manager;
mod pool;
mod reclaim;
mod registry;

pub use config::{
    DEFAULT_POOL_SIZE_BYTES, LARGE_PAGE_ORDER, MAX_MEMORY_GROUPS, MAX_ORDER, PoolConfig,
};
pub use deferral::{DeferralEntry, DeferralPhase};
pub use device::{
    Clock, DeviceContext, MigrationTracker, OwnerId, PageProvider, SecureWindow,
    sequence_reached,
};
pub use error::PoolError;
pub use gpu_page_meta::{BASE_PAGE_SHIFT, BASE_PAGE_SIZE};
pub use manager::PoolManager;
pub use pool::{PhysicalPagePool, PoolStats};
pub use reclaim::{
    ReclaimAdapter, ReclaimRegistration, ReclaimSubsystem, ScanResult, Shrinker, ShrinkerId,
};
pub use registry::{DeferralRegistry, PoolId};
