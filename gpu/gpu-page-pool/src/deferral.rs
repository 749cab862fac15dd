//! Pages freed while the GPU may be inside a secure window.
//!
//! Such pages cannot go back to the OS, nor be handed to another consumer,
//! until the scheduler reports the window they were freed under as complete.
//! Each pool keeps them in a [`DeferralQueue`] together with the sequence
//! number observed at the time of the free.
//!
//! Draining follows a small state machine so that the scheduler can be
//! queried without holding the pool lock:
//!
//! ```text
//!   Idle ──push──► Deferred ──begin_drain──► Draining ──finish_drain──► Idle
//!                     ▲                          │        (queue empty)
//!                     └──────────────────────────┘
//!                        finish_drain (entries left)
//! ```
//!
//! While `Draining`, new entries may still be appended; the drain only ever
//! removes entries whose sequence it validated.

use crate::device::sequence_reached;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use gpu_page_meta::PageHandle;

/// A page waiting for secure sequence `seq` to complete.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DeferralEntry {
    pub page: PageHandle,
    pub seq: u64,
    /// `false` for pages already accounted as reclaimed; those go straight
    /// back to the OS once released.
    pub readmit: bool,
    /// Synchronize for the device if the page is readmitted to the pool.
    pub dirty: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeferralPhase {
    Idle,
    Deferred,
    Draining,
}

/// Sequence range covered by a drain, captured under the pool lock.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct DrainWindow {
    pub oldest: u64,
    pub newest: u64,
}

#[derive(Debug)]
pub(crate) struct DeferralQueue {
    entries: VecDeque<DeferralEntry>,
    phase: DeferralPhase,
}

impl DeferralQueue {
    pub(crate) const fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            phase: DeferralPhase::Idle,
        }
    }

    /// Appends an entry. Returns `true` if this is the first entry since the
    /// queue was last idle, i.e. the owning pool must register for draining.
    pub(crate) fn push(&mut self, entry: DeferralEntry) -> bool {
        self.entries.push_back(entry);
        if self.phase == DeferralPhase::Idle {
            self.phase = DeferralPhase::Deferred;
            true
        } else {
            false
        }
    }

    /// Claims the queue for draining.
    ///
    /// `None` if there is nothing deferred or another drain is in flight.
    pub(crate) fn begin_drain(&mut self) -> Option<DrainWindow> {
        if self.phase != DeferralPhase::Deferred {
            return None;
        }
        let oldest = self.entries.front()?.seq;
        let newest = self.entries.back()?.seq;
        self.phase = DeferralPhase::Draining;
        Some(DrainWindow { oldest, newest })
    }

    /// Removes the leading entries whose sequence is at or before `limit`.
    pub(crate) fn take_completed(&mut self, limit: u64) -> Vec<DeferralEntry> {
        let count = self
            .entries
            .iter()
            .take_while(|e| sequence_reached(limit, e.seq))
            .count();
        self.entries.drain(..count).collect()
    }

    pub(crate) fn take_all(&mut self) -> Vec<DeferralEntry> {
        self.entries.drain(..).collect()
    }

    /// Ends a drain. Returns `true` if the queue went idle.
    pub(crate) fn finish_drain(&mut self) -> bool {
        self.phase = if self.entries.is_empty() {
            DeferralPhase::Idle
        } else {
            DeferralPhase::Deferred
        };
        self.phase == DeferralPhase::Idle
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub(crate) const fn phase(&self) -> DeferralPhase {
        self.phase
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use gpu_page_meta::{DmaAddress, PageMetadataStore, PhysicalAddress};

    fn entries(seqs: &[u64]) -> Vec<DeferralEntry> {
        let store = PageMetadataStore::with_capacity(16);
        seqs.iter()
            .enumerate()
            .map(|(i, &seq)| DeferralEntry {
                page: store
                    .insert(PhysicalAddress::from_pfn(i as u64), DmaAddress::new(0), 0, 0)
                    .unwrap(),
                seq,
                readmit: true,
                dirty: false,
            })
            .collect()
    }

    #[test]
    fn only_first_push_requests_registration() {
        let e = entries(&[1, 1]);
        let mut q = DeferralQueue::new();
        assert!(q.push(e[0]));
        assert!(!q.push(e[1]));
        assert_eq!(q.phase(), DeferralPhase::Deferred);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn begin_drain_is_exclusive() {
        let e = entries(&[3, 5]);
        let mut q = DeferralQueue::new();
        assert_eq!(q.begin_drain(), None);
        q.push(e[0]);
        q.push(e[1]);
        assert_eq!(
            q.begin_drain(),
            Some(DrainWindow {
                oldest: 3,
                newest: 5
            })
        );
        assert_eq!(q.begin_drain(), None);
        assert!(!q.finish_drain());
        assert_eq!(q.phase(), DeferralPhase::Deferred);
    }

    #[test]
    fn take_completed_releases_a_prefix() {
        let e = entries(&[3, 3, 5, 7]);
        let mut q = DeferralQueue::new();
        for x in &e {
            q.push(*x);
        }
        q.begin_drain();
        let done = q.take_completed(4);
        assert_eq!(done, [e[0], e[1]]);
        assert!(!q.finish_drain());
        q.begin_drain();
        assert_eq!(q.take_all(), [e[2], e[3]]);
        assert!(q.finish_drain());
        assert!(q.is_empty());
    }

    #[test]
    fn pushes_during_drain_are_kept() {
        let e = entries(&[1, 2]);
        let mut q = DeferralQueue::new();
        q.push(e[0]);
        q.begin_drain();
        assert!(!q.push(e[1]));
        assert_eq!(q.take_completed(1), [e[0]]);
        assert!(!q.finish_drain());
        assert_eq!(q.len(), 1);
    }
}
