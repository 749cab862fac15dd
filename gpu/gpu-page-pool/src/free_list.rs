use alloc::vec::Vec;
use gpu_page_meta::PageHandle;

/// Pooled pages of one pool, reused most-recently-freed first.
///
/// The list lives inside the pool's locked state, so every method runs
/// with the pool lock held. Its length is the pool's `current_size`, which
/// the reclaim adapter reports to the OS.
#[derive(Debug, Default)]
pub(crate) struct FreeList {
    pages: Vec<PageHandle>,
}

impl FreeList {
    pub(crate) const fn new() -> Self {
        Self { pages: Vec::new() }
    }

    #[inline]
    pub(crate) fn push(&mut self, page: PageHandle) {
        self.pages.push(page);
    }

    /// Pushes a batch so that its first page is the next one popped.
    pub(crate) fn push_all(&mut self, pages: &[PageHandle]) {
        self.pages.extend(pages.iter().rev());
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Option<PageHandle> {
        self.pages.pop()
    }

    /// Pops up to `count` pages, most recently pushed first.
    pub(crate) fn pop_many(&mut self, count: usize) -> Vec<PageHandle> {
        let keep = self.pages.len().saturating_sub(count);
        let mut taken = self.pages.split_off(keep);
        taken.reverse();
        taken
    }

    pub(crate) fn take_all(&mut self) -> Vec<PageHandle> {
        let mut taken = core::mem::take(&mut self.pages);
        taken.reverse();
        taken
    }

    #[inline]
    pub(crate) const fn len(&self) -> usize {
        self.pages.len()
    }

    #[inline]
    pub(crate) const fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    #[inline]
    pub(crate) const fn is_full(&self, max_size: usize) -> bool {
        self.pages.len() >= max_size
    }

    /// Free slots left below `max_size`.
    #[inline]
    pub(crate) const fn room(&self, max_size: usize) -> usize {
        max_size.saturating_sub(self.pages.len())
    }
}
