//! # Kernel Boot Information

use crate::memory::FRAME_SIZE;
use kernel_memory_addresses::{PhysicalAddress, align_up};

/// What the boot collaborator knows about physical memory.
///
/// Supplied once; the memory core trusts these values beyond the sanity
/// checks in [`BootMemoryInfo::first_free_frame`].
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BootMemoryInfo {
    /// First byte past the loaded kernel image (`end` linker symbol).
    pub kernel_end: PhysicalAddress,

    /// Total physical memory managed by the frame allocator, in bytes,
    /// counted from [`first_free_frame`](Self::first_free_frame).
    pub total_memory: u32,
}

impl BootMemoryInfo {
    #[must_use]
    pub const fn new(kernel_end: PhysicalAddress, total_memory: u32) -> Self {
        Self {
            kernel_end,
            total_memory,
        }
    }

    /// The kernel end-of-image rounded up to the next frame boundary.
    ///
    /// Returns `None` if rounding leaves the 32-bit space.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn first_free_frame(&self) -> Option<PhysicalAddress> {
        let aligned = align_up(self.kernel_end.as_u64(), FRAME_SIZE as u64);
        if aligned > u32::MAX as u64 {
            return None;
        }
        Some(PhysicalAddress::new(aligned as u32))
    }

    /// The managed memory size truncated to whole frames.
    #[must_use]
    pub const fn usable_bytes(&self) -> u32 {
        self.total_memory & !(FRAME_SIZE - 1)
    }
}
