//! # GPU Page Metadata
//!
//! Per-page bookkeeping shared by every physical page pool of a device.
//!
//! ## Overview
//!
//! Physical pages handed between the GPU address-space allocator, the page
//! pools and the OS page allocator are identified by a [`PageHandle`], a
//! stable index into a [`PageMetadataStore`]. The store keeps one
//! [`PageRecord`] per live page:
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `phys` | CPU [`PhysicalAddress`] of the page. |
//! | `dma` | Device-visible [`DmaAddress`]. |
//! | `status` | Packed [`PageStatus`]: [`OwnershipTag`], order, group id, deferred flag. |
//!
//! The ownership tag is what lets the migration subsystem and the pools
//! agree on who may touch a page. It is only mutated under the page's own
//! lock, which is always taken after (never before) a pool lock.
//!
//! ```text
//!   fetch from OS ─► AllocateInProgress ─► (mapped by caller)
//!                          ▲     │
//!                  pop     │     │ free into pool
//!                          │     ▼
//!                         Pooled ─────► FreeInProgress ─► returned to OS
//! ```
//!
//! Batch interfaces exchange [`TaggedAddress`] words, where a large page is
//! spelled out as a head entry followed by its continuation entries.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod address;
mod status;
mod store;
mod tagged;

pub use address::{BASE_PAGE_SHIFT, BASE_PAGE_SIZE, DmaAddress, PhysicalAddress};
pub use status::{OwnershipTag, PageStatus};
pub use store::{PageHandle, PageMetadataStore, PageRecord, StoreError};
pub use tagged::TaggedAddress;
