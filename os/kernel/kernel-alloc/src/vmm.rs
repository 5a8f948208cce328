//! Minimal Virtual Memory Manager (VMM) for the kernel.
//!
//! Bundles the active [`AddressSpace`], the [`FrameAllocator`] that feeds its
//! page tables and the processor's [`PagingControl`]. Changes to the active
//! space are followed by the TLB invalidations they need.
//!
//! # Example
//! ```ignore
//! use kernel_alloc::{frame_alloc::FrameAllocator, phys_mapper::IdentityPhysMapper, vmm::Vmm};
//! use kernel_vmem::HardwarePaging;
//!
//! static FRAMES: FrameAllocator<IdentityPhysMapper> = FrameAllocator::new(IdentityPhysMapper);
//! FRAMES.init_from_boot(&boot_info);
//! let mut vmm = Vmm::new(&FRAMES, unsafe { HardwarePaging::new() })?;
//! vmm.activate();
//! ```

use crate::frame_alloc::{DEFAULT_REGION_CAPACITY, FrameAllocator};
use kernel_info::memory::FRAME_SIZE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::{AddressSpace, MapError, MapFlags, PageFault, PageTableEntry, PagingControl, PhysMapper};
use log::{debug, error, trace};

/// Receives page-fault reports; the trap or scheduler layer decides what to
/// do with them.
pub trait FaultSink {
    fn page_fault(&mut self, fault: PageFault);
}

impl<F: FnMut(PageFault)> FaultSink for F {
    fn page_fault(&mut self, fault: PageFault) {
        self(fault);
    }
}

/// Minimal kernel virtual memory manager.
pub struct Vmm<'m, M: PhysMapper, C: PagingControl, const N: usize = DEFAULT_REGION_CAPACITY> {
    space: AddressSpace<'m, M>,
    frames: &'m FrameAllocator<M, N>,
    paging: C,
    active: bool,
}

impl<'m, M: PhysMapper, C: PagingControl, const N: usize> Vmm<'m, M, C, N> {
    /// Build the boot address space. Paging stays untouched until
    /// [`activate`](Self::activate).
    ///
    /// # Errors
    /// Frame exhaustion while building the directory or its tables.
    pub fn new(frames: &'m FrameAllocator<M, N>, paging: C) -> Result<Self, VmmError> {
        let space = AddressSpace::build_initial_directory(frames.mapper(), frames)?;
        debug!("VMM ready with {} page tables", space.table_count());
        Ok(Self {
            space,
            frames,
            paging,
            active: false,
        })
    }

    /// Load the current space into the processor, enabling paging if needed.
    pub fn activate(&mut self) {
        self.space.switch_to(&mut self.paging);
        self.active = true;
    }

    #[inline]
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    #[inline]
    #[must_use]
    pub const fn address_space(&self) -> &AddressSpace<'m, M> {
        &self.space
    }

    #[inline]
    #[must_use]
    pub const fn paging(&self) -> &C {
        &self.paging
    }

    /// A fresh, empty address space backed by the same frame allocator.
    ///
    /// # Errors
    /// [`VmmError::NoDirectory`] if the directory cannot be allocated.
    pub fn new_address_space(&self) -> Result<AddressSpace<'m, M>, VmmError> {
        Ok(AddressSpace::new(self.frames.mapper(), self.frames)?)
    }

    /// Make `space` current and activate it; returns the previous space.
    pub fn switch_to(&mut self, space: AddressSpace<'m, M>) -> AddressSpace<'m, M> {
        let previous = core::mem::replace(&mut self.space, space);
        self.activate();
        previous
    }

    /// Translate VA→PA if mapped.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.space.query(va)
    }

    /// The entry for `va`, if a table covers it.
    pub fn translate(&mut self, va: VirtualAddress) -> Option<&mut PageTableEntry> {
        self.space.translate(va)
    }

    /// Map `[virt_base, virt_base + length)` to `[phys_base, ..)`.
    ///
    /// # Errors
    /// Frame exhaustion while creating page tables.
    pub fn map_range(
        &mut self,
        phys_base: PhysicalAddress,
        virt_base: VirtualAddress,
        length: u64,
        flags: MapFlags,
    ) -> Result<u32, VmmError> {
        Ok(self
            .space
            .map_range(self.frames, phys_base, virt_base, length, flags)?)
    }

    /// Unmap a range; flushes the affected TLB entries if this space is active.
    pub fn unmap_range(&mut self, virt_base: VirtualAddress, length: u64) -> u32 {
        let pages = self.space.unmap_range(virt_base, length);
        if self.active {
            for i in 0..pages {
                self.paging.invalidate_page(virt_base + i * FRAME_SIZE);
            }
        }
        pages
    }

    /// Map `length` bytes at `virt_base` to freshly allocated, zeroed frames
    /// (no physical contiguity).
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] naming the first page that could not be
    /// backed. Pages mapped before it stay mapped.
    pub fn map_anonymous(
        &mut self,
        virt_base: VirtualAddress,
        length: u64,
        flags: MapFlags,
    ) -> Result<u32, VmmError> {
        let pages = length.div_ceil(u64::from(FRAME_SIZE));
        let frames = self.frames;
        let mut mapped = 0;
        for i in 0..pages {
            let va = VirtualAddress::from_u64(virt_base.as_u64() + i * u64::from(FRAME_SIZE));
            let frame = frames
                .allocate_zeroed(FRAME_SIZE)
                .map_err(|_| VmmError::OutOfMemory(va))?;
            mapped += self
                .map_range(frame, va, u64::from(FRAME_SIZE), flags)
                .inspect_err(|_| frames.free(frame, FRAME_SIZE))?;
        }
        trace!("Backed {mapped} pages at {virt_base} with fresh frames");
        Ok(mapped)
    }

    #[must_use]
    pub fn is_pinned(&self, va: VirtualAddress) -> Option<bool> {
        self.space.is_pinned(va)
    }

    pub fn set_pinned(&mut self, va: VirtualAddress, pinned: bool) -> bool {
        self.space.set_pinned(va, pinned)
    }

    /// Page-fault entry point for the trap layer.
    ///
    /// Builds a report for `va` in the current space and hands it to `sink`.
    /// The fault is not resolved here.
    pub fn on_page_fault(&self, va: VirtualAddress, sink: &mut impl FaultSink) {
        let fault = self.space.describe_fault(va);
        error!(
            "Page fault at {va}: table present = {}, entry = {:?}",
            fault.table_present, fault.entry
        );
        sink.page_fault(fault);
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmmError {
    #[error("out of memory allocating a page directory")]
    NoDirectory,
    #[error("out of memory mapping {0}")]
    OutOfMemory(VirtualAddress),
}

impl From<MapError> for VmmError {
    fn from(value: MapError) -> Self {
        match value {
            MapError::NoDirectory => Self::NoDirectory,
            MapError::OutOfMemory(va) => Self::OutOfMemory(va),
        }
    }
}
