//! # Virtual Memory Support
//!
//! Two-level x86 paging (32-bit, no PAE) for the kernel's address spaces.
//!
//! ## What you get
//! - Raw [`PageTableEntry`] / [`PageDirectoryEntry`] formats.
//! - A 4 KiB-aligned [`PageTable`] and an 8 KiB [`PageDirectory`] that keeps
//!   the owning table references next to the hardware entries.
//! - An [`AddressSpace`] that maps, unmaps and translates ranges of 4 KiB
//!   pages, creating page tables lazily.
//! - The seams to the rest of the kernel: [`FrameAlloc`] for frames,
//!   [`PhysMapper`] for touching physical memory, [`PagingControl`] for the
//!   processor.
//!
//! ## Virtual Address → Physical Address Walk
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  Dir  | Table | Offset |
//! ```
//!
//! ```text
//!  CR3 → Page Directory → Page Table → 4 KiB frame
//!          (1024 PDEs)     (1024 PTEs)
//! ```
//!
//! Each directory entry covers 4 MiB; each table entry one 4 KiB page. The
//! whole tree can map the full 4 GiB space with 1024 tables.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(any(test, feature = "test-util"))]
extern crate alloc;

pub mod address_space;
mod bits;
mod page_table;
mod paging;
#[cfg(any(test, feature = "test-util"))]
mod test_util;

pub use crate::address_space::{AddressSpace, MapError, PageFault};
pub use crate::bits::{MapFlags, PageDirectoryEntry, PageTableEntry};
pub use crate::page_table::{DirIndex, PageDirectory, PageTable, TableIndex, TableRef, split_indices};
pub use crate::paging::PagingControl;
#[cfg(target_arch = "x86")]
pub use crate::paging::{HardwarePaging, page_fault_address};
#[cfg(any(test, feature = "test-util"))]
pub use crate::test_util::{ArenaPhysMapper, BumpFrameAlloc, MockPaging};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Source of contiguous physical frames.
///
/// Implementations are internally synchronized, so every method takes
/// `&self`. Returned addresses are 4 KiB aligned; `None` means out of memory.
pub trait FrameAlloc {
    /// Allocate `bytes` of contiguous physical memory.
    ///
    /// `bytes` must be a positive multiple of [`info::FRAME_SIZE`]. The memory
    /// is not zeroed.
    fn alloc_frames(&self, bytes: u32) -> Option<PhysicalAddress>;

    /// Allocate one 4 KiB frame.
    #[inline]
    fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>> {
        self.alloc_frames(info::FRAME_SIZE).map(PhysicalPage::new_aligned)
    }
}

impl<A: FrameAlloc + ?Sized> FrameAlloc for &A {
    #[inline]
    fn alloc_frames(&self, bytes: u32) -> Option<PhysicalAddress> {
        (**self).alloc_frames(bytes)
    }
}

/// Converts physical addresses to pointers usable in the current address space.
///
/// The kernel identity-maps low memory, so its mapper is the identity; tests
/// back physical memory with a heap buffer.
///
/// # Safety
/// The typed views hand out references with an unbounded lifetime. Callers
/// must ensure that:
/// - `pa` lies in memory the mapper covers and that is writable,
/// - the bytes at `pa` are a valid `T`,
/// - no other live reference aliases the same bytes mutably.
pub trait PhysMapper {
    /// Pointer to the byte at `pa`.
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8;

    /// Inverse of [`phys_to_ptr`](Self::phys_to_ptr).
    fn ptr_to_phys(&self, ptr: *const u8) -> PhysicalAddress;

    /// View the bytes at `pa` as a `T`.
    ///
    /// # Safety
    /// See the trait documentation. `pa` must be aligned for `T`.
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *self.phys_to_ptr(pa).cast::<T>() }
    }

    /// View `len` bytes starting at `pa`.
    ///
    /// # Safety
    /// See the trait documentation.
    #[inline]
    unsafe fn phys_to_slice_mut<'a>(&self, pa: PhysicalAddress, len: usize) -> &'a mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.phys_to_ptr(pa), len) }
    }

    /// Fill `len` bytes at `pa` with `value`.
    ///
    /// # Safety
    /// See the trait documentation.
    #[inline]
    unsafe fn fill(&self, pa: PhysicalAddress, len: usize, value: u8) {
        unsafe { core::ptr::write_bytes(self.phys_to_ptr(pa), value, len) }
    }
}

impl<M: PhysMapper + ?Sized> PhysMapper for &M {
    #[inline]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        (**self).phys_to_ptr(pa)
    }

    #[inline]
    fn ptr_to_phys(&self, ptr: *const u8) -> PhysicalAddress {
        (**self).ptr_to_phys(ptr)
    }
}
