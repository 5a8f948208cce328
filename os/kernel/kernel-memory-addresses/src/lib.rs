//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for 32-bit protected-mode addresses and the page
//! bases derived from them.
//!
//! ## Overview
//!
//! Two address kinds are kept apart at compile time:
//!
//! | Type | Meaning |
//! |----------|----------|
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Physical RAM or MMIO, as seen by the frame allocator and the page tables. |
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Addresses translated through the two-level page directory. |
//!
//! ## Page Sizes
//!
//! Two marker types implement [`PageSize`]:
//!
//! - [`Size4K`]: one 4 KiB frame, the allocation and mapping granularity.
//! - [`Size4M`]: the span governed by one page table (one directory entry).
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0040_1234);
//! let page = va.page::<Size4K>();
//! assert_eq!(page.base().as_u32(), 0x0040_1000);
//! assert_eq!(va.offset::<Size4K>(), 0x234);
//! assert_eq!(va.page::<Size4M>().base().as_u32(), 0x0040_0000);
//! ```
//!
//! Lengths and range ends are carried as `u64` by callers so that a range
//! ending exactly at 4 GiB stays representable.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use page_size::{PageSize, Size4K, Size4M};
pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;

/// Align `x` down to the nearest multiple of `a` (`a` must be a power of two).
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a` (`a` must be a power of two).
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0, 4096), 0);
/// assert_eq!(align_up(1, 4096), 4096);
/// assert_eq!(align_up(4096, 4096), 4096);
/// assert_eq!(align_up(0x12345, 16), 0x12350);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + (a - 1)) & !(a - 1)
}

/// Whether `x` is a multiple of `a` (`a` must be a power of two).
#[inline(always)]
#[must_use]
pub const fn is_aligned(x: u64, a: u64) -> bool {
    x & (a - 1) == 0
}
