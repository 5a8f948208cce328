//! Host-side stand-ins for physical memory, a frame source and the MMU.

use crate::{FrameAlloc, PagingControl, PhysMapper};
use alloc::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use alloc::vec::Vec;
use core::cell::Cell;
use core::ptr::NonNull;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// Simulated physical memory: a zeroed, 4 KiB-aligned heap buffer that
/// answers for the physical range `[base, base + len)`.
pub struct ArenaPhysMapper {
    base: PhysicalAddress,
    layout: Layout,
    mem: NonNull<u8>,
}

// SAFETY: the arena is plain memory; synchronization of its contents is the
// job of whoever hands out the addresses, as with real RAM.
unsafe impl Send for ArenaPhysMapper {}
// SAFETY: see above.
unsafe impl Sync for ArenaPhysMapper {}

impl ArenaPhysMapper {
    /// # Panics
    /// If `base` is not 4 KiB aligned, `len` is zero, or the range leaves the
    /// 32-bit physical space.
    #[must_use]
    pub fn new(base: PhysicalAddress, len: u32) -> Self {
        assert!(base.is_aligned_to(4096), "arena base {base} not frame aligned");
        assert!(len > 0, "empty arena");
        assert!(
            base.as_u64() + u64::from(len) <= 1 << 32,
            "arena beyond 4 GiB"
        );
        let layout = Layout::from_size_align(len as usize, 4096)
            .unwrap_or_else(|_| panic!("arena layout of {len} bytes"));
        // SAFETY: the layout has a non-zero size.
        let mem = NonNull::new(unsafe { alloc_zeroed(layout) })
            .unwrap_or_else(|| handle_alloc_error(layout));
        Self { base, layout, mem }
    }

    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn len(&self) -> u32 {
        self.layout.size() as u32
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    /// Exclusive end of the simulated range, as `u64` so it may be 4 GiB.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.as_u64() + self.layout.size() as u64
    }

    /// Copy `len` bytes out of the arena.
    #[must_use]
    pub fn snapshot(&self, pa: PhysicalAddress, len: usize) -> Vec<u8> {
        self.check(pa, len);
        // SAFETY: range checked above.
        unsafe { core::slice::from_raw_parts(self.phys_to_ptr(pa), len) }.to_vec()
    }

    fn offset_of(&self, pa: PhysicalAddress) -> usize {
        assert!(
            pa.as_u64() >= self.base.as_u64() && pa.as_u64() < self.end(),
            "physical address {pa} outside the arena [{}, 0x{:X})",
            self.base,
            self.end()
        );
        (pa.as_u32() - self.base.as_u32()) as usize
    }

    fn check(&self, pa: PhysicalAddress, len: usize) {
        let offset = self.offset_of(pa);
        assert!(
            offset + len <= self.layout.size(),
            "range {pa}+0x{len:X} outside the arena"
        );
    }
}

impl PhysMapper for ArenaPhysMapper {
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        let offset = self.offset_of(pa);
        // SAFETY: offset is within the allocation.
        unsafe { self.mem.as_ptr().add(offset) }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn ptr_to_phys(&self, ptr: *const u8) -> PhysicalAddress {
        let start = self.mem.as_ptr() as usize;
        let addr = ptr as usize;
        assert!(
            addr >= start && addr < start + self.layout.size(),
            "pointer {ptr:p} outside the arena"
        );
        self.base + (addr - start) as u32
    }
}

impl Drop for ArenaPhysMapper {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.mem.as_ptr(), self.layout) }
    }
}

/// Hands out frames from `[next, end)` in ascending order and never reuses them.
pub struct BumpFrameAlloc {
    next: Cell<u32>,
    end: u64,
    handed_out: Cell<u32>,
}

impl BumpFrameAlloc {
    #[must_use]
    pub fn new(start: PhysicalAddress, end: u64) -> Self {
        debug_assert!(start.is_aligned_to(4096));
        Self {
            next: Cell::new(start.as_u32()),
            end,
            handed_out: Cell::new(0),
        }
    }

    /// Number of successful allocations so far.
    #[must_use]
    pub fn allocations(&self) -> u32 {
        self.handed_out.get()
    }
}

impl FrameAlloc for BumpFrameAlloc {
    fn alloc_frames(&self, bytes: u32) -> Option<PhysicalAddress> {
        let next = self.next.get();
        if u64::from(next) + u64::from(bytes) > self.end {
            return None;
        }
        self.next.set(next + bytes);
        self.handed_out.set(self.handed_out.get() + 1);
        Some(PhysicalAddress::new(next))
    }
}

/// Records what an address space asked the processor to do.
#[derive(Debug, Default)]
pub struct MockPaging {
    pub roots: Vec<PhysicalPage<Size4K>>,
    pub enabled: bool,
    pub enable_calls: u32,
    pub invalidated: Vec<VirtualAddress>,
}

impl PagingControl for MockPaging {
    fn load_root(&mut self, directory: PhysicalPage<Size4K>) {
        self.roots.push(directory);
    }

    fn paging_enabled(&self) -> bool {
        self.enabled
    }

    fn enable_paging(&mut self) {
        assert!(!self.roots.is_empty(), "paging enabled without a root");
        self.enabled = true;
        self.enable_calls += 1;
    }

    fn invalidate_page(&mut self, va: VirtualAddress) {
        self.invalidated.push(va);
    }
}
