use core::fmt;
use core::ops::Add;

/// Shift of the base (order 0) page size.
pub const BASE_PAGE_SHIFT: u32 = 12;

/// Size in bytes of a base (order 0) page.
pub const BASE_PAGE_SIZE: u64 = 1 << BASE_PAGE_SHIFT;

/// CPU physical address of a page.
///
/// Carries intent only; the pool never dereferences it. Keep it apart from
/// [`DmaAddress`], which is what the GPU sees after IOMMU translation.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn from_pfn(pfn: u64) -> Self {
        Self(pfn << BASE_PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Base page frame number.
    #[inline]
    #[must_use]
    pub const fn pfn(self) -> u64 {
        self.0 >> BASE_PAGE_SHIFT
    }

    /// Whether the address is aligned to a page of the given order.
    #[inline]
    #[must_use]
    pub const fn is_aligned_to_order(self, order: u8) -> bool {
        let mask = (BASE_PAGE_SIZE << order) - 1;
        self.0 & mask == 0
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

/// Device-visible (bus) address of a page.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DmaAddress(u64);

impl DmaAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for DmaAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DMA(0x{:016X})", self.0)
    }
}
