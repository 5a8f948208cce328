use crate::{PageSize, PhysicalAddress, Size4K};
use core::fmt;
use core::marker::PhantomData;

/// Physical memory page base for size `S`.
///
/// ### Invariants
/// - The low `S::SHIFT` bits of the base are always zero (page aligned).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize> {
    base: u32,
    _phantom: PhantomData<S>,
}

impl<S: PageSize> PhysicalPage<S> {
    /// Page that contains `pa` (aligns down).
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_addr(pa: PhysicalAddress) -> Self {
        Self {
            base: pa.as_u32() & !((S::SIZE - 1) as u32),
            _phantom: PhantomData,
        }
    }

    /// Create from an address that must already be aligned.
    /// Panics in debug if unaligned.
    #[inline]
    #[must_use]
    pub fn new_aligned(pa: PhysicalAddress) -> Self {
        debug_assert!(pa.is_aligned_to(S::SIZE), "unaligned page address {pa}");
        Self::from_addr(pa)
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.base)
    }

    /// Combine with an in-page offset.
    #[inline]
    #[must_use]
    pub const fn join(self, offset: u32) -> PhysicalAddress {
        PhysicalAddress::new(self.base + offset)
    }
}

impl PhysicalPage<Size4K> {
    /// Build a frame from its 20-bit frame number (address >> 12).
    #[inline]
    #[must_use]
    pub const fn from_frame_number(frame: u32) -> Self {
        Self {
            base: frame << Size4K::SHIFT,
            _phantom: PhantomData,
        }
    }

    /// The 20-bit frame number as stored in page-table entries.
    #[inline]
    #[must_use]
    pub const fn frame_number(self) -> u32 {
        self.base >> Size4K::SHIFT
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage<{}>(0x{:08X})", S::as_str(), self.base)
    }
}

impl<S: PageSize> fmt::Display for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}/{}", self.base, S::as_str())
    }
}
