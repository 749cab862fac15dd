use bitfield_struct::bitfield;

/// Which component logically owns a page.
///
/// List membership and tag must agree at all times: a page on a pool's free
/// list is [`Pooled`](Self::Pooled), a page handed to a caller is
/// [`AllocateInProgress`](Self::AllocateInProgress), a page on its way back
/// to the OS is [`FreeInProgress`](Self::FreeInProgress).
///
/// [`NotMovable`](Self::NotMovable) is sticky. Pages the migration subsystem
/// may never relocate keep that tag through every pool transition.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum OwnershipTag {
    /// Not tracked by any component.
    Free = 0,
    /// Handed out by a pool or fetched from the OS; the caller is about to map it.
    AllocateInProgress = 1,
    /// Being returned to the OS page allocator.
    FreeInProgress = 2,
    /// Sitting on a pool's free list.
    Pooled = 3,
    /// Excluded from migration.
    NotMovable = 4,
}

impl OwnershipTag {
    #[must_use]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    /// Decodes the 3-bit tag field. Unused encodings read as [`Free`](Self::Free).
    #[must_use]
    pub const fn from_bits(value: u8) -> Self {
        match value {
            1 => Self::AllocateInProgress,
            2 => Self::FreeInProgress,
            3 => Self::Pooled,
            4 => Self::NotMovable,
            _ => Self::Free,
        }
    }
}

/// Packed per-page status word.
///
/// Only ever read or written under the page's own lock in
/// [`PageMetadataStore`](crate::PageMetadataStore).
#[bitfield(u32)]
pub struct PageStatus {
    /// Bits 0–2 — ownership tag.
    #[bits(3)]
    pub tag: OwnershipTag,

    /// Bits 3–6 — size class (order) of the page.
    #[bits(4)]
    pub order: u8,

    /// Bits 7–10 — allocation group the page was fetched for.
    #[bits(4)]
    pub group_id: u8,

    /// Bit 11 — page sits in a deferral queue awaiting a secure sequence.
    pub deferred: bool,

    /// Bits 12–31 — reserved.
    #[bits(20)]
    __: u32,
}
