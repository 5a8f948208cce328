//! # Swap Space
//!
//! Block allocation on a backing store and page-sized transfers to and from
//! it. One swap block holds exactly one frame and spans
//! [`SECTORS_PER_PAGE`](kernel_info::memory::SECTORS_PER_PAGE) consecutive
//! sectors:
//!
//! ```text
//! block:    │      0      │      1      │      2      │ ...
//! sector:   │0 1 2 3 4 5 6 7│8 ...    15│16 ...    23│ ...
//! ```
//!
//! Free blocks are tracked in a [`BitVector`] (set = in use). Only a window of
//! the device is usable for swap; everything outside it starts out marked as
//! used and is never handed out.
//!
//! This crate provides the mechanism only. Choosing which page to evict, and
//! respecting pinned pages while doing so, is up to the caller.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod bit_vector;
pub mod device;
pub mod swap;

pub use crate::bit_vector::BitVector;
pub use crate::device::{Sector, SectorDevice};
pub use crate::swap::{Page, SwapAllocator, SwapError};
