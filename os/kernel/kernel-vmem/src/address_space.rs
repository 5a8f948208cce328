//! # Address Space (two-level, directory-rooted)
//!
//! One virtual address space: a [`PageDirectory`] plus the page tables it
//! owns. Page tables are created the first time anything in their 4 MiB
//! range is mapped and stay until the address space goes away.
//!
//! ## Highlights
//!
//! - [`AddressSpace::map_range`] installs 4 KiB mappings page by page.
//! - [`AddressSpace::unmap_range`] clears `present` and keeps the frames.
//! - [`AddressSpace::translate`] finds the entry for an address without
//!   allocating anything.
//! - [`AddressSpace::switch_to`] makes this space the active one.
//! - [`AddressSpace::build_initial_directory`] creates the identity-mapped
//!   kernel space used at boot.
//!
//! ## Safety
//!
//! - Changing the active space's mappings requires TLB maintenance; the
//!   `Vmm` in `kernel-alloc` does this.
//! - The [`PhysMapper`] must give writable access to every directory and
//!   table frame the [`FrameAlloc`] hands out.

use crate::bits::{MapFlags, PageTableEntry};
use crate::page_table::{DirIndex, PageDirectory, PageTable, TableIndex, split_indices};
use crate::{FrameAlloc, PagingControl, PhysMapper};
use kernel_info::memory::{
    DEVICE_IDENTITY_BASE, DEVICE_IDENTITY_BYTES, KERNEL_IDENTITY_BASE, KERNEL_IDENTITY_BYTES,
};
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size4K, Size4M, VirtualAddress,
};
use log::{debug, trace, warn};

/// Handle to a single address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalPage<Size4K>,
    mapper: &'m M,
}

/// The page directory root of an [`AddressSpace`].
pub type RootPage = PhysicalPage<Size4K>;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("out of memory allocating a page directory")]
    NoDirectory,
    #[error("out of memory allocating the page table for {0}")]
    OutOfMemory(VirtualAddress),
}

/// What a page fault found in the faulting address space.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PageFault {
    pub address: VirtualAddress,
    /// Whether a page table covers the address.
    pub table_present: bool,
    /// Snapshot of the entry, if a table covers the address.
    pub entry: Option<PageTableEntry>,
}

impl PageFault {
    /// `true` if the page was not mapped, as opposed to a protection violation.
    #[must_use]
    pub fn not_present(&self) -> bool {
        self.entry.is_none_or(|e| !e.present())
    }

    /// `true` if the page was mapped but is pinned.
    #[must_use]
    pub fn pinned(&self) -> bool {
        self.entry.is_some_and(|e| e.present() && e.pinned())
    }
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Allocate and zero a fresh 8 KiB page directory.
    ///
    /// # Errors
    /// [`MapError::NoDirectory`] if `alloc` cannot supply two contiguous frames.
    pub fn new<A: FrameAlloc>(mapper: &'m M, alloc: &A) -> Result<Self, MapError> {
        let Some(base) = alloc.alloc_frames(PageDirectory::BYTES) else {
            warn!("No memory left for a new page directory");
            return Err(MapError::NoDirectory);
        };
        // SAFETY: the allocator handed us these bytes exclusively.
        unsafe { mapper.fill(base, PageDirectory::BYTES as usize, 0) };
        debug!("Created page directory at {base}");
        Ok(Self {
            root: PhysicalPage::new_aligned(base),
            mapper,
        })
    }

    /// Wrap an existing directory.
    #[inline]
    #[must_use]
    pub const fn from_root(mapper: &'m M, root: RootPage) -> Self {
        Self { root, mapper }
    }

    /// Physical frame of the directory; what CR3 points at.
    #[inline]
    #[must_use]
    pub const fn root_page(&self) -> RootPage {
        self.root
    }

    #[inline]
    fn directory(&self) -> &PageDirectory {
        // SAFETY: `root` always refers to a directory created by `new` or
        // handed to `from_root`.
        unsafe { self.mapper.phys_to_mut::<PageDirectory>(self.root.base()) }
    }

    #[inline]
    fn directory_mut(&mut self) -> &mut PageDirectory {
        // SAFETY: as above; `&mut self` makes the borrow exclusive.
        unsafe { self.mapper.phys_to_mut::<PageDirectory>(self.root.base()) }
    }

    #[inline]
    fn table(&self, page: PhysicalPage<Size4K>) -> &PageTable {
        // SAFETY: only called with frames taken from the directory.
        unsafe { self.mapper.phys_to_mut::<PageTable>(page.base()) }
    }

    #[inline]
    fn table_mut(&mut self, page: PhysicalPage<Size4K>) -> &mut PageTable {
        // SAFETY: as above; `&mut self` makes the borrow exclusive.
        unsafe { self.mapper.phys_to_mut::<PageTable>(page.base()) }
    }

    /// The entry for `va`, or `None` when no page table covers it.
    ///
    /// The entry is returned whether or not it is present. Never allocates.
    #[must_use]
    pub fn translate(&mut self, va: VirtualAddress) -> Option<&mut PageTableEntry> {
        let (dir, idx) = split_indices(va);
        let table = self.directory().table(dir)?;
        Some(self.table_mut(table).get_mut(idx))
    }

    /// Read-only copy of the entry for `va`.
    #[must_use]
    pub fn entry(&self, va: VirtualAddress) -> Option<PageTableEntry> {
        let (dir, idx) = split_indices(va);
        let table = self.directory().table(dir)?;
        Some(self.table(table).get(idx))
    }

    /// The physical address `va` resolves to, if it is mapped.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let page = self.entry(va)?.present_page()?;
        Some(page.join(va.offset::<Size4K>()))
    }

    /// Return the table covering `va`, creating and linking it if needed.
    #[allow(clippy::cast_possible_truncation)]
    fn ensure_table<A: FrameAlloc>(
        &mut self,
        alloc: &A,
        va: VirtualAddress,
    ) -> Result<PhysicalPage<Size4K>, MapError> {
        let dir = DirIndex::from(va);
        if let Some(table) = self.directory().table(dir) {
            return Ok(table);
        }

        let Some(table) = alloc.alloc_4k() else {
            warn!("No memory left for the page table covering {va}");
            return Err(MapError::OutOfMemory(va));
        };
        // SAFETY: freshly allocated frame, exclusively ours.
        unsafe { self.mapper.fill(table.base(), Size4K::SIZE as usize, 0) };
        self.directory_mut().install(dir, table);
        debug!("Created page table {} for {} at {}", dir.as_usize(), dir.base(), table.base());
        Ok(table)
    }

    /// Map `[virt_base, virt_base + length)` onto `[phys_base, phys_base + length)`.
    ///
    /// `length` is rounded up to whole pages. Every entry is rewritten from
    /// scratch as present with `flags`, so mapping the same page twice is
    /// harmless. Returns the number of pages mapped.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] when a page table cannot be allocated. Pages
    /// mapped before the failure stay mapped.
    ///
    /// # Panics
    /// If `length` is zero or either base is not frame aligned. In debug
    /// builds, if either range reaches past 4 GiB.
    #[allow(clippy::cast_possible_truncation)]
    pub fn map_range<A: FrameAlloc>(
        &mut self,
        alloc: &A,
        phys_base: PhysicalAddress,
        virt_base: VirtualAddress,
        length: u64,
        flags: MapFlags,
    ) -> Result<u32, MapError> {
        assert!(length > 0, "map_range: empty range at {virt_base}");
        assert!(
            phys_base.is_aligned_to(Size4K::SIZE) && virt_base.is_aligned_to(Size4K::SIZE),
            "map_range: {virt_base} -> {phys_base} is not frame aligned"
        );
        let pages = length.div_ceil(Size4K::SIZE);
        debug_assert!(
            virt_base.as_u64() + pages * Size4K::SIZE <= 1 << 32,
            "map_range: virtual range from {virt_base} runs past 4 GiB"
        );
        debug_assert!(
            phys_base.as_u64() + pages * Size4K::SIZE <= 1 << 32,
            "map_range: physical range from {phys_base} runs past 4 GiB"
        );
        trace!("Mapping {pages} pages at {virt_base} to {phys_base} ({flags:?})");

        for i in 0..pages {
            let offset = (i * Size4K::SIZE) as u32;
            let va = virt_base + offset;
            let pa = phys_base + offset;
            let table = self.ensure_table(alloc, va)?;
            self.table_mut(table)
                .set(TableIndex::from(va), PageTableEntry::mapping(pa.page(), flags));
        }
        Ok(pages as u32)
    }

    /// Clear `present` on every page in `[virt_base, virt_base + length)`.
    ///
    /// Frames are not freed and tables are kept. Returns the number of pages
    /// touched.
    ///
    /// # Panics
    /// If `length` is zero, `virt_base` is not frame aligned, or any page in
    /// the range has no page table.
    #[allow(clippy::cast_possible_truncation)]
    pub fn unmap_range(&mut self, virt_base: VirtualAddress, length: u64) -> u32 {
        assert!(length > 0, "unmap_range: empty range at {virt_base}");
        assert!(
            virt_base.is_aligned_to(Size4K::SIZE),
            "unmap_range: {virt_base} is not frame aligned"
        );
        let pages = length.div_ceil(Size4K::SIZE);
        debug_assert!(
            virt_base.as_u64() + pages * Size4K::SIZE <= 1 << 32,
            "unmap_range: range from {virt_base} runs past 4 GiB"
        );
        trace!("Unmapping {pages} pages at {virt_base}");

        for i in 0..pages {
            let va = virt_base + (i * Size4K::SIZE) as u32;
            let Some(entry) = self.translate(va) else {
                panic!("unmap_range: no page table covers {va}");
            };
            entry.set_present(false);
        }
        pages as u32
    }

    /// Whether the page at `va` is pinned; `None` if it is not mapped.
    #[must_use]
    pub fn is_pinned(&self, va: VirtualAddress) -> Option<bool> {
        self.entry(va).filter(|e| e.present()).map(|e| e.pinned())
    }

    /// Pin or unpin the page at `va`. Returns `false` if it is not mapped.
    pub fn set_pinned(&mut self, va: VirtualAddress, pinned: bool) -> bool {
        match self.translate(va) {
            Some(entry) if entry.present() => {
                entry.set_pinned(pinned);
                true
            }
            _ => false,
        }
    }

    /// Number of page tables this space owns.
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.directory().table_count()
    }

    /// First page-aligned address in `[start, end)` that begins `length` bytes
    /// of unmapped pages.
    ///
    /// # Panics
    /// If `length` is zero or `start` is not frame aligned.
    #[must_use]
    pub fn find_unmapped(&self, start: VirtualAddress, end: u64, length: u64) -> Option<VirtualAddress> {
        assert!(length > 0, "find_unmapped: empty request");
        assert!(
            start.is_aligned_to(Size4K::SIZE),
            "find_unmapped: {start} is not frame aligned"
        );
        let needed = length.div_ceil(Size4K::SIZE);
        let end = end.min(1 << 32);

        let mut run_start = start.as_u64();
        let mut run = 0;
        let mut cursor = start.as_u64();
        while cursor + Size4K::SIZE <= end {
            let va = VirtualAddress::from_u64(cursor);
            let (dir, _) = split_indices(va);

            // A missing table means the rest of its 4 MiB is free.
            let free_pages = if self.directory().table(dir).is_none() {
                let table_end = dir.span().base().as_u64() + Size4M::SIZE;
                (table_end.min(end) - cursor) / Size4K::SIZE
            } else if self.entry(va).is_some_and(|e| e.present()) {
                0
            } else {
                1
            };

            if free_pages == 0 {
                run = 0;
                cursor += Size4K::SIZE;
                run_start = cursor;
                continue;
            }
            if run + free_pages >= needed {
                return Some(VirtualAddress::from_u64(run_start));
            }
            run += free_pages;
            cursor += free_pages * Size4K::SIZE;
        }
        None
    }

    /// Describe a fault at `va` in this space. Does not change anything.
    #[must_use]
    pub fn describe_fault(&self, va: VirtualAddress) -> PageFault {
        let entry = self.entry(va);
        PageFault {
            address: va,
            table_present: entry.is_some(),
            entry,
        }
    }

    /// Make this the active address space.
    ///
    /// Loads the directory into the translation root and turns paging on if
    /// it is still off.
    pub fn switch_to<C: PagingControl>(&self, control: &mut C) {
        control.load_root(self.root);
        if control.paging_enabled() {
            trace!("Switched to page directory at {}", self.root.base());
        } else {
            control.enable_paging();
            debug!("Enabled paging with page directory at {}", self.root.base());
        }
    }

    /// Build the boot address space.
    ///
    /// Identity-maps the kernel region (`[0, 64 MiB)`, supervisor only) and
    /// the memory-mapped device window (`[0xFEC0_0000, 4 GiB)`, user
    /// accessible), both writable and pinned.
    ///
    /// # Errors
    /// Propagates [`MapError`] if the directory or a table cannot be allocated.
    pub fn build_initial_directory<A: FrameAlloc>(mapper: &'m M, alloc: &A) -> Result<Self, MapError> {
        debug!("Building the initial page directory ...");
        let mut space = Self::new(mapper, alloc)?;
        space.identity_map(alloc, KERNEL_IDENTITY_BASE, KERNEL_IDENTITY_BYTES, MapFlags::KERNEL_PINNED)?;
        space.identity_map(alloc, DEVICE_IDENTITY_BASE, DEVICE_IDENTITY_BYTES, MapFlags::USER_PINNED)?;
        debug!(
            "Initial page directory at {} uses {} page tables",
            space.root.base(),
            space.table_count()
        );
        Ok(space)
    }

    fn identity_map<A: FrameAlloc>(
        &mut self,
        alloc: &A,
        base: u32,
        bytes: u32,
        flags: MapFlags,
    ) -> Result<u32, MapError> {
        self.map_range(
            alloc,
            PhysicalAddress::new(base),
            VirtualAddress::new(base),
            u64::from(bytes),
            flags,
        )
    }
}
