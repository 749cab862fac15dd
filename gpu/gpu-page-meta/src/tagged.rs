use crate::address::{BASE_PAGE_SIZE, PhysicalAddress};
use bitfield_struct::bitfield;
use core::fmt;

/// Base-page address word exchanged with the allocation-group layer.
///
/// A large (order > 0) pool page is presented as `1 << order` consecutive
/// entries: the first tagged as the huge head, the rest as continuations.
/// Small pages carry neither flag.
#[bitfield(u64, debug = false)]
pub struct TaggedAddress {
    /// Bit 0 — first base page of a large page.
    pub huge_head: bool,

    /// Bit 1 — base page belongs to a large page.
    pub huge_page: bool,

    /// Bits 2–11 — reserved (page offset bits of the address).
    #[bits(10)]
    __: u16,

    /// Bits 12–63 — base page frame number.
    #[bits(52)]
    pfn: u64,
}

impl TaggedAddress {
    #[must_use]
    pub const fn small(pa: PhysicalAddress) -> Self {
        Self::new().with_pfn(pa.pfn())
    }

    #[must_use]
    pub const fn huge_head_at(pa: PhysicalAddress) -> Self {
        Self::new()
            .with_pfn(pa.pfn())
            .with_huge_head(true)
            .with_huge_page(true)
    }

    #[must_use]
    pub const fn huge_continuation_at(pa: PhysicalAddress) -> Self {
        Self::new().with_pfn(pa.pfn()).with_huge_page(true)
    }

    /// Expands the pool page at `pa` of size class `order` into its base-page entries.
    pub fn expand(pa: PhysicalAddress, order: u8) -> impl Iterator<Item = Self> {
        let count = 1u64 << order;
        (0..count).map(move |i| match (order, i) {
            (0, _) => Self::small(pa),
            (_, 0) => Self::huge_head_at(pa),
            _ => Self::huge_continuation_at(pa + i * BASE_PAGE_SIZE),
        })
    }

    #[must_use]
    pub const fn phys(self) -> PhysicalAddress {
        PhysicalAddress::from_pfn(self.pfn())
    }

    #[must_use]
    pub const fn is_small(self) -> bool {
        !self.huge_page()
    }

    #[must_use]
    pub const fn is_huge_continuation(self) -> bool {
        self.huge_page() && !self.huge_head()
    }
}

impl PartialEq for TaggedAddress {
    fn eq(&self, other: &Self) -> bool {
        self.into_bits() == other.into_bits()
    }
}

impl Eq for TaggedAddress {}

impl fmt::Debug for TaggedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match (self.huge_head(), self.huge_page()) {
            (true, _) => "head",
            (false, true) => "cont",
            (false, false) => "small",
        };
        write!(f, "Tagged({}, {kind})", self.phys())
    }
}
