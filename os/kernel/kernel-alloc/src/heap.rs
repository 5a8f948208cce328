//! # Kernel Heap
//!
//! A next-fit free-list allocator for small, variable-sized kernel objects,
//! growing on demand with frames from the [`FrameAllocator`].
//!
//! ## Design outline
//! - **Blocks**: every block starts with an 8-byte [`Header`] (`next`, `size`)
//!   and is measured in header units. A request of `n` bytes takes
//!   `ceil(n / 8) + 1` units.
//! - **Free list**: circular and sorted by address. A zero-sized sentinel at
//!   address `0` anchors the ring; `freep` remembers where the last search
//!   stopped.
//! - **Allocation**: next fit starting after `freep`. An exact fit is unlinked;
//!   a larger block shrinks and hands out its high end.
//! - **Growth**: after one full lap without a fit, the heap asks the frame
//!   allocator for `align_up(units * 8, FRAME_SIZE)` bytes, frees that chunk
//!   into the ring and keeps searching.
//! - **Free**: relinks in address order and merges with both neighbours.
//!
//! ```text
//! sentinel(0) ──► [hdr|···free···] ──► [hdr|·free·] ──► sentinel(0)
//!                          ▲
//!                        freep
//! ```
//!
//! ## Bounds checking
//! Headers are addressed physically and only ever read or written through
//! [`HeapState::read`] / [`HeapState::write`], which assert that the header lies
//! inside a chunk the heap obtained from the frame allocator. A stray pointer
//! handed to [`KernelHeap::free`] therefore panics instead of corrupting
//! unrelated memory.

use crate::frame_alloc::{FrameAllocError, FrameAllocator};
use arrayvec::ArrayVec;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{NonNull, null_mut};
use kernel_info::memory::FRAME_SIZE;
use kernel_memory_addresses::{PhysicalAddress, align_up};
use kernel_sync::SpinLock;
use kernel_vmem::PhysMapper;
use log::{debug, trace, warn};

/// Size of one header unit in bytes; also the allocation granularity and the
/// largest supported alignment.
#[allow(clippy::cast_possible_truncation)]
pub const UNIT: u32 = size_of::<Header>() as u32;

/// Most separate chunks the heap will track.
pub const MAX_EXTENTS: usize = 64;

/// Address of the sentinel block; never a real heap address.
const SENTINEL: u32 = 0;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("kernel heap out of memory")]
    OutOfMemory,
}

impl From<FrameAllocError> for HeapError {
    fn from(value: FrameAllocError) -> Self {
        match value {
            FrameAllocError::OutOfMemory(_) => Self::OutOfMemory,
        }
    }
}

/// Block header stored in front of every heap block.
#[repr(C, align(8))]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
struct Header {
    /// Physical address of the next free block (only meaningful while free).
    next: u32,
    /// Block size in header units, header included.
    size: u32,
}

/// A chunk of memory obtained from the frame allocator.
#[derive(Copy, Clone, Debug)]
struct Extent {
    start: u32,
    end: u64,
}

impl Extent {
    fn contains(&self, addr: u32, bytes: u64) -> bool {
        addr >= self.start && u64::from(addr) + bytes <= self.end
    }
}

struct HeapState {
    base: Header,
    freep: Option<u32>,
    extents: ArrayVec<Extent, MAX_EXTENTS>,
}

impl HeapState {
    const fn new() -> Self {
        Self {
            base: Header { next: 0, size: 0 },
            freep: None,
            extents: ArrayVec::new_const(),
        }
    }

    fn check(&self, addr: u32, units: u32) {
        let bytes = u64::from(units) * u64::from(UNIT);
        assert!(
            addr.is_multiple_of(UNIT) && self.extents.iter().any(|e| e.contains(addr, bytes)),
            "heap: block at 0x{addr:08X} (+{units} units) lies outside the heap"
        );
    }

    fn read<M: PhysMapper>(&self, mapper: &M, addr: u32) -> Header {
        if addr == SENTINEL {
            return self.base;
        }
        self.check(addr, 1);
        // SAFETY: bounds checked; heap chunks are exclusively ours.
        unsafe {
            mapper
                .phys_to_ptr(PhysicalAddress::new(addr))
                .cast::<Header>()
                .read()
        }
    }

    fn write<M: PhysMapper>(&mut self, mapper: &M, addr: u32, header: Header) {
        if addr == SENTINEL {
            self.base = header;
            return;
        }
        self.check(addr, 1);
        // SAFETY: bounds checked; heap chunks are exclusively ours.
        unsafe {
            mapper
                .phys_to_ptr(PhysicalAddress::new(addr))
                .cast::<Header>()
                .write(header);
        }
    }

    /// Free blocks of the ring in address order, sentinel excluded.
    fn blocks<'a, M: PhysMapper>(&'a self, mapper: &'a M) -> impl Iterator<Item = (u32, Header)> + 'a {
        let mut cursor = self.base.next;
        core::iter::from_fn(move || {
            if cursor == SENTINEL {
                return None;
            }
            let here = cursor;
            let header = self.read(mapper, here);
            cursor = header.next;
            Some((here, header))
        })
    }

    /// Record a new chunk, merging with the extents it touches on either side.
    fn add_extent(&mut self, start: u32, bytes: u32) -> bool {
        let mut chunk = Extent {
            start,
            end: u64::from(start) + u64::from(bytes),
        };
        if let Some(i) = self.extents.iter().position(|e| e.end == u64::from(chunk.start)) {
            chunk.start = self.extents.swap_remove(i).start;
        }
        if let Some(i) = self.extents.iter().position(|e| u64::from(e.start) == chunk.end) {
            chunk.end = self.extents.swap_remove(i).end;
        }
        self.extents.try_push(chunk).is_ok()
    }
}

/// The kernel heap.
///
/// Borrows the frame allocator it grows from; the frame allocator's mapper is
/// used to reach block headers.
pub struct KernelHeap<'f, M: PhysMapper, const N: usize> {
    frames: &'f FrameAllocator<M, N>,
    state: SpinLock<HeapState>,
}

impl<'f, M: PhysMapper, const N: usize> KernelHeap<'f, M, N> {
    /// An empty heap; the first allocation pulls in frames.
    #[must_use]
    pub const fn new(frames: &'f FrameAllocator<M, N>) -> Self {
        Self {
            frames,
            state: SpinLock::new(HeapState::new()),
        }
    }

    /// Allocate at least `bytes` bytes, aligned to 8.
    ///
    /// # Errors
    /// [`HeapError::OutOfMemory`] if the heap cannot grow.
    ///
    /// # Panics
    /// If `bytes` is zero or too large to express in header units.
    pub fn allocate(&self, bytes: usize) -> Result<NonNull<u8>, HeapError> {
        assert!(bytes > 0, "heap allocate: zero-size request");
        let Some(units) = u32::try_from(bytes)
            .ok()
            .and_then(|b| b.div_ceil(UNIT).checked_add(1))
            .filter(|&u| u64::from(u) * u64::from(UNIT) <= u64::from(u32::MAX - FRAME_SIZE))
        else {
            panic!("heap allocate: request of {bytes} bytes is too large");
        };

        let mapper = self.frames.mapper();
        let mut state = self.state.lock();
        let freep = match state.freep {
            Some(f) => f,
            None => {
                state.base = Header {
                    next: SENTINEL,
                    size: 0,
                };
                state.freep = Some(SENTINEL);
                SENTINEL
            }
        };

        let mut prev = freep;
        let mut p = state.read(mapper, prev).next;
        loop {
            let mut block = state.read(mapper, p);
            if block.size >= units {
                if block.size == units {
                    let mut before = state.read(mapper, prev);
                    before.next = block.next;
                    state.write(mapper, prev, before);
                } else {
                    block.size -= units;
                    state.write(mapper, p, block);
                    p += block.size * UNIT;
                    state.write(mapper, p, Header { next: 0, size: units });
                }
                state.freep = Some(prev);
                trace!("Heap handed out {units} units at 0x{p:08X}");
                return Ok(self.payload(p));
            }
            if p == state.freep.unwrap_or(SENTINEL) {
                p = self.morecore(&mut state, units)?;
            }
            prev = p;
            p = state.read(mapper, p).next;
        }
    }

    /// Grow by at least `units` and return the (possibly moved) `freep`.
    #[allow(clippy::cast_possible_truncation)]
    fn morecore(&self, state: &mut HeapState, units: u32) -> Result<u32, HeapError> {
        let bytes = align_up(u64::from(units) * u64::from(UNIT), u64::from(FRAME_SIZE)) as u32;
        let chunk = self.frames.allocate(bytes).inspect_err(|_| {
            warn!("Kernel heap cannot grow by 0x{bytes:X} bytes");
        })?;
        if !state.add_extent(chunk.as_u32(), bytes) {
            self.frames.free(chunk, bytes);
            warn!("Kernel heap tracks {MAX_EXTENTS} chunks already and cannot grow");
            return Err(HeapError::OutOfMemory);
        }
        debug!("Kernel heap grew by 0x{bytes:X} bytes at {chunk}");

        let mapper = self.frames.mapper();
        state.write(
            mapper,
            chunk.as_u32(),
            Header {
                next: 0,
                size: bytes / UNIT,
            },
        );
        Self::release(mapper, state, chunk.as_u32());
        Ok(state.freep.unwrap_or(SENTINEL))
    }

    fn payload(&self, block: u32) -> NonNull<u8> {
        let ptr = self.frames.mapper().phys_to_ptr(PhysicalAddress::new(block + UNIT));
        NonNull::new(ptr).unwrap_or_else(|| panic!("heap: mapper returned null for 0x{block:08X}"))
    }

    /// Return a block to the heap.
    ///
    /// # Safety
    /// `ptr` must have come from [`allocate`](Self::allocate) on this heap and
    /// must not be used afterwards.
    ///
    /// # Panics
    /// If `ptr` does not point into the heap, its header is corrupt, or the
    /// block is already free.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let mapper = self.frames.mapper();
        let addr = mapper.ptr_to_phys(ptr.as_ptr());
        let Some(block) = addr.as_u32().checked_sub(UNIT).filter(|&b| b != SENTINEL) else {
            panic!("heap free: {addr} is not a heap pointer");
        };

        let mut state = self.state.lock();
        Self::release(mapper, &mut state, block);
        trace!("Heap took back the block at 0x{block:08X}");
    }

    /// Link `block` into the ring in address order and coalesce.
    fn release(mapper: &M, state: &mut HeapState, block: u32) {
        let mut header = state.read(mapper, block);
        assert!(header.size > 0, "heap free: corrupt header at 0x{block:08X}");
        state.check(block, header.size);
        let block_end = u64::from(block) + u64::from(header.size) * u64::from(UNIT);

        let mut p = state.freep.unwrap_or(SENTINEL);
        let mut ph = state.read(mapper, p);
        loop {
            assert!(
                p == SENTINEL
                    || block < p
                    || u64::from(block) >= u64::from(p) + u64::from(ph.size) * u64::from(UNIT),
                "heap free: double free of the block at 0x{block:08X}"
            );
            let next = ph.next;
            if block > p && block < next {
                break;
            }
            if p >= next && (block > p || block < next) {
                break;
            }
            p = next;
            ph = state.read(mapper, p);
        }

        let next = ph.next;
        assert!(
            next == SENTINEL || next <= block || block_end <= u64::from(next),
            "heap free: block at 0x{block:08X} overlaps the free block at 0x{next:08X}"
        );

        if next != SENTINEL && block_end == u64::from(next) {
            let upper = state.read(mapper, next);
            header.size += upper.size;
            header.next = upper.next;
        } else {
            header.next = next;
        }

        if p != SENTINEL && u64::from(p) + u64::from(ph.size) * u64::from(UNIT) == u64::from(block) {
            ph.size += header.size;
            ph.next = header.next;
        } else {
            state.write(mapper, block, header);
            ph.next = block;
        }
        state.write(mapper, p, ph);
        state.freep = Some(p);
    }

    /// Total bytes on the free list, headers included.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        let state = self.state.lock();
        state
            .blocks(self.frames.mapper())
            .map(|(_, h)| u64::from(h.size) * u64::from(UNIT))
            .sum()
    }

    /// Visit every free block as `(address, bytes)` in address order.
    pub fn for_each_free_block(&self, mut f: impl FnMut(PhysicalAddress, u64)) {
        let state = self.state.lock();
        for (addr, h) in state.blocks(self.frames.mapper()) {
            f(PhysicalAddress::new(addr), u64::from(h.size) * u64::from(UNIT));
        }
    }

    /// Bytes obtained from the frame allocator so far.
    #[must_use]
    pub fn reserved_bytes(&self) -> u64 {
        let state = self.state.lock();
        state
            .extents
            .iter()
            .map(|e| e.end - u64::from(e.start))
            .sum()
    }
}

// SAFETY: `alloc` returns either null or an 8-aligned block of at least
// `layout.size()` bytes that no one else owns; `dealloc` only accepts such
// blocks.
unsafe impl<M: PhysMapper, const N: usize> GlobalAlloc for KernelHeap<'_, M, N> {
    /// Alignments above [`UNIT`] are not supported and yield null.
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > UNIT as usize {
            return null_mut();
        }
        self.allocate(layout.size().max(1))
            .map_or(null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            // SAFETY: the GlobalAlloc contract guarantees `ptr` came from `alloc`.
            unsafe { self.free(ptr) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_vmem::ArenaPhysMapper;

    const F: u32 = FRAME_SIZE;
    const BASE: u32 = 0x0010_0000;

    fn frames(count: u32) -> FrameAllocator<ArenaPhysMapper, 16> {
        let mapper = ArenaPhysMapper::new(PhysicalAddress::new(BASE), count * F);
        let alloc = FrameAllocator::with_reserved_frames(mapper, 0);
        alloc.init(PhysicalAddress::new(BASE), count * F);
        alloc
    }

    fn phys<M: PhysMapper, const N: usize>(heap: &KernelHeap<'_, M, N>, p: NonNull<u8>) -> u32 {
        heap.frames.mapper().ptr_to_phys(p.as_ptr()).as_u32()
    }

    fn free_blocks<M: PhysMapper, const N: usize>(heap: &KernelHeap<'_, M, N>) -> Vec<(u32, u64)> {
        let mut out = Vec::new();
        heap.for_each_free_block(|a, b| out.push((a.as_u32(), b)));
        out
    }

    #[test]
    fn first_allocation_grows_by_one_frame() {
        let frames = frames(4);
        let heap = KernelHeap::new(&frames);
        let p = heap.allocate(100).unwrap();

        // 13 units of payload + 1 header, from the top of the new frame.
        assert_eq!(heap.reserved_bytes(), u64::from(F));
        assert_eq!(phys(&heap, p), BASE + 3 * F + F - 14 * UNIT + UNIT);
        assert_eq!(heap.free_bytes(), u64::from(F - 14 * UNIT));
        assert_eq!(frames.free_bytes(), u64::from(3 * F));
    }

    #[test]
    fn block_is_writable_and_aligned() {
        let frames = frames(4);
        let heap = KernelHeap::new(&frames);
        let p = heap.allocate(24).unwrap();
        assert_eq!(p.as_ptr() as usize % UNIT as usize, 0);
        unsafe {
            core::ptr::write_bytes(p.as_ptr(), 0xAB, 24);
            assert_eq!(*p.as_ptr().add(23), 0xAB);
            heap.free(p);
        }
        assert_eq!(heap.free_bytes(), u64::from(F));
    }

    #[test]
    fn neighbours_coalesce_back_into_one_block() {
        let frames = frames(4);
        let heap = KernelHeap::new(&frames);
        let a = heap.allocate(32).unwrap();
        let b = heap.allocate(32).unwrap();
        let c = heap.allocate(32).unwrap();

        unsafe {
            heap.free(b);
            assert_eq!(free_blocks(&heap).len(), 2);
            heap.free(a);
            assert_eq!(free_blocks(&heap).len(), 2);
            heap.free(c);
        }
        assert_eq!(free_blocks(&heap), [(BASE + 3 * F, u64::from(F))]);
    }

    #[test]
    fn exact_fit_is_unlinked() {
        let frames = frames(4);
        let heap = KernelHeap::new(&frames);
        let whole = heap.allocate((F - UNIT) as usize).unwrap();
        assert_eq!(heap.free_bytes(), 0);
        assert!(free_blocks(&heap).is_empty());
        unsafe { heap.free(whole) };
        assert_eq!(heap.free_bytes(), u64::from(F));
    }

    #[test]
    fn large_request_grows_by_rounded_frames() {
        let frames = frames(8);
        let heap = KernelHeap::new(&frames);
        let p = heap.allocate(5000).unwrap();
        assert_eq!(heap.reserved_bytes(), u64::from(2 * F));
        unsafe { heap.free(p) };
        assert_eq!(heap.free_bytes(), u64::from(2 * F));
    }

    #[test]
    fn adjacent_chunks_merge() {
        let frames = frames(4);
        let heap = KernelHeap::new(&frames);
        let a = heap.allocate((F - UNIT) as usize).unwrap();
        let b = heap.allocate((F - UNIT) as usize).unwrap();
        assert_eq!(heap.reserved_bytes(), u64::from(2 * F));
        unsafe {
            heap.free(a);
            heap.free(b);
        }
        // Frames came from the top down, so the chunks touch.
        assert_eq!(free_blocks(&heap), [(BASE + 2 * F, u64::from(2 * F))]);
    }

    #[test]
    fn chunk_filling_a_gap_joins_both_neighbours() {
        let frames = frames(3);
        let heap = KernelHeap::new(&frames);
        let whole = (F - UNIT) as usize;

        let top = heap.allocate(whole).unwrap();
        let middle = frames.allocate(F).unwrap();
        let bottom = heap.allocate(whole).unwrap();
        assert_eq!(middle, PhysicalAddress::new(BASE + F));
        frames.free(middle, F);
        let gap = heap.allocate(whole).unwrap();
        assert_eq!(phys(&heap, gap), BASE + F + UNIT);
        assert_eq!(heap.state.lock().extents.len(), 1);

        unsafe {
            heap.free(top);
            heap.free(bottom);
            heap.free(gap);
        }
        assert_eq!(free_blocks(&heap), [(BASE, u64::from(3 * F))]);

        // One block across both seams.
        let all = heap.allocate((3 * F - UNIT) as usize).unwrap();
        assert_eq!(phys(&heap, all), BASE + UNIT);
        unsafe { heap.free(all) };
        assert_eq!(heap.free_bytes(), u64::from(3 * F));
        assert_eq!(heap.reserved_bytes(), u64::from(3 * F));
    }

    #[test]
    fn out_of_memory_propagates() {
        let frames = frames(1);
        let heap = KernelHeap::new(&frames);
        let _keep = heap.allocate(2000).unwrap();
        assert_eq!(heap.allocate(4000), Err(HeapError::OutOfMemory));
        // The heap is still usable for what fits.
        assert!(heap.allocate(1000).is_ok());
    }

    #[test]
    fn global_alloc_interface() {
        let frames = frames(4);
        let heap = KernelHeap::new(&frames);
        unsafe {
            let layout = Layout::from_size_align(64, 8).unwrap();
            let p = heap.alloc(layout);
            assert!(!p.is_null());
            heap.dealloc(p, layout);
            assert!(heap.alloc(Layout::from_size_align(64, 16).unwrap()).is_null());
        }
        assert_eq!(heap.free_bytes(), u64::from(F));
    }

    #[test]
    #[should_panic(expected = "zero-size request")]
    fn zero_size_panics() {
        let frames = frames(1);
        let heap = KernelHeap::new(&frames);
        let _ = heap.allocate(0);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let frames = frames(2);
        let heap = KernelHeap::new(&frames);
        let a = heap.allocate(16).unwrap();
        let _b = heap.allocate(16).unwrap();
        unsafe {
            heap.free(a);
            heap.free(a);
        }
    }

    #[test]
    #[should_panic(expected = "outside the heap")]
    fn foreign_pointer_panics() {
        let frames = frames(4);
        let heap = KernelHeap::new(&frames);
        let _a = heap.allocate(16).unwrap();
        let foreign = frames.allocate(F).unwrap();
        let ptr = NonNull::new(frames.mapper().phys_to_ptr(foreign + 64)).unwrap();
        unsafe { heap.free(ptr) };
    }
}
