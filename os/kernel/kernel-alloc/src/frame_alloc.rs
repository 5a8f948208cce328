//! # Physical Frame Allocator
//!
//! Hands out physically contiguous runs of 4 KiB frames from a single range
//! seeded at boot. Free memory is tracked by a [`FreeRegionList`]; the whole
//! state sits behind one [`SpinLock`].
//!
//! - Allocation is first fit from the lowest address and carves from the
//!   **end** of the chosen region.
//! - Freed memory is overwritten with [`JUNK_FILL`] before it is relinked, so
//!   dangling users read obvious garbage.
//! - The first [`RESERVED_BOOT_FRAMES`] frames of the range are never handed
//!   out; bootstrap structures live there.

use crate::free_regions::{FreeRegion, FreeRegionList};
use kernel_info::boot::BootMemoryInfo;
use kernel_info::memory::{FRAME_SIZE, JUNK_FILL, RESERVED_BOOT_FRAMES};
use kernel_memory_addresses::PhysicalAddress;
use kernel_sync::SpinLock;
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::{debug, trace, warn};

/// Size of the free-region node pool used when none is given.
pub const DEFAULT_REGION_CAPACITY: usize = 512;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameAllocError {
    #[error("out of physical memory: no free run of {0} bytes")]
    OutOfMemory(u32),
}

struct FrameState<const N: usize> {
    regions: FreeRegionList<N>,
    initialized: bool,
}

/// The physical frame allocator.
///
/// `M` gives access to the frames themselves (for junk filling and zeroing);
/// `N` bounds how fragmented free memory may become.
pub struct FrameAllocator<M: PhysMapper, const N: usize = DEFAULT_REGION_CAPACITY> {
    mapper: M,
    reserved_frames: u32,
    state: SpinLock<FrameState<N>>,
}

impl<M: PhysMapper, const N: usize> FrameAllocator<M, N> {
    /// An uninitialized allocator that keeps the default number of boot frames.
    #[must_use]
    pub const fn new(mapper: M) -> Self {
        Self::with_reserved_frames(mapper, RESERVED_BOOT_FRAMES)
    }

    /// An uninitialized allocator that keeps `reserved_frames` frames at the
    /// bottom of the managed range.
    #[must_use]
    pub const fn with_reserved_frames(mapper: M, reserved_frames: u32) -> Self {
        Self {
            mapper,
            reserved_frames,
            state: SpinLock::new(FrameState {
                regions: FreeRegionList::new(),
                initialized: false,
            }),
        }
    }

    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[must_use]
    pub const fn reserved_frames(&self) -> u32 {
        self.reserved_frames
    }

    /// Seed the allocator with `[base + reserved, base + total_bytes)`.
    ///
    /// The seeded range is junk filled like any freed range.
    ///
    /// # Panics
    /// - If called more than once.
    /// - If `base` or `total_bytes` is zero or not frame aligned.
    /// - If the reservation covers the whole range, or the range ends past 4 GiB.
    #[allow(clippy::cast_possible_truncation)]
    pub fn init(&self, base: PhysicalAddress, total_bytes: u32) {
        assert!(
            base.as_u32() != 0 && base.is_aligned_to(u64::from(FRAME_SIZE)),
            "frame init: base {base} must be non-zero and frame aligned"
        );
        assert!(
            total_bytes != 0 && total_bytes.is_multiple_of(FRAME_SIZE),
            "frame init: size 0x{total_bytes:X} must be a non-zero multiple of the frame size"
        );

        let start = base.as_u64() + u64::from(self.reserved_frames) * u64::from(FRAME_SIZE);
        let end = base.as_u64() + u64::from(total_bytes);
        assert!(end <= 1 << 32, "frame init: range from {base} runs past 4 GiB");
        assert!(
            start < end,
            "frame init: {} reserved frames leave nothing of 0x{total_bytes:X} bytes",
            self.reserved_frames
        );

        let mut state = self.state.lock();
        assert!(!state.initialized, "frame init: already initialized");

        let start = PhysicalAddress::new(start as u32);
        let length = (end - start.as_u64()) as u32;
        self.junk_fill(start, length);
        state.regions.release(start, length);
        state.initialized = true;
        debug!(
            "Frame allocator manages [{start}, 0x{end:08X}) ({} frames, {} reserved)",
            length / FRAME_SIZE,
            self.reserved_frames
        );
    }

    /// Seed from the boot handoff: start at the first frame past the kernel image.
    ///
    /// # Panics
    /// See [`init`](Self::init); also if the kernel end cannot be rounded up
    /// inside the 32-bit space.
    pub fn init_from_boot(&self, boot: &BootMemoryInfo) {
        let Some(base) = boot.first_free_frame() else {
            panic!("frame init: kernel end {} leaves no frames", boot.kernel_end);
        };
        self.init(base, boot.usable_bytes());
    }

    /// Allocate `bytes` of physically contiguous memory. Not zeroed.
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfMemory`] if no free region is large enough.
    ///
    /// # Panics
    /// If `bytes` is zero or not a multiple of the frame size.
    pub fn allocate(&self, bytes: u32) -> Result<PhysicalAddress, FrameAllocError> {
        assert!(
            bytes != 0 && bytes.is_multiple_of(FRAME_SIZE),
            "frame allocate: size 0x{bytes:X} must be a non-zero multiple of the frame size"
        );
        let mut state = self.state.lock();
        if let Some(pa) = state.regions.take(bytes) {
            trace!("Allocated 0x{bytes:X} bytes of frames at {pa}");
            return Ok(pa);
        }
        drop(state);
        warn!("Frame allocator is out of memory (requested 0x{bytes:X} bytes)");
        Err(FrameAllocError::OutOfMemory(bytes))
    }

    /// Like [`allocate`](Self::allocate), then zero the range.
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfMemory`] if no free region is large enough.
    ///
    /// # Panics
    /// If `bytes` is zero or not a multiple of the frame size.
    pub fn allocate_zeroed(&self, bytes: u32) -> Result<PhysicalAddress, FrameAllocError> {
        let pa = self.allocate(bytes)?;
        // SAFETY: the range was just handed to us exclusively.
        unsafe { self.mapper.fill(pa, bytes as usize, 0) };
        Ok(pa)
    }

    /// Return `[address, address + bytes)` to the allocator.
    ///
    /// # Panics
    /// - If `address` is zero or not frame aligned, or `bytes` is zero or not
    ///   a multiple of the frame size.
    /// - If any part of the range is already free.
    /// - If the free-region node pool is exhausted.
    pub fn free(&self, address: PhysicalAddress, bytes: u32) {
        assert!(
            bytes != 0 && bytes.is_multiple_of(FRAME_SIZE),
            "frame free: size 0x{bytes:X} must be a non-zero multiple of the frame size"
        );
        assert!(
            address.as_u32() != 0 && address.is_aligned_to(u64::from(FRAME_SIZE)),
            "frame free: {address} is null or not frame aligned"
        );
        assert!(
            address.as_u64() + u64::from(bytes) <= 1 << 32,
            "frame free: range at {address} runs past 4 GiB"
        );

        let mut state = self.state.lock();
        // Check before scribbling over memory that may still be on the list.
        let overlap = state
            .regions
            .iter()
            .find(|r| r.overlaps(address.as_u64(), address.as_u64() + u64::from(bytes)));
        if let Some(region) = overlap {
            panic!(
                "frame free: freeing free frames at {address} (+0x{bytes:X}) inside [{}, 0x{:X})",
                region.start,
                region.end()
            );
        }
        self.junk_fill(address, bytes);
        state.regions.release(address, bytes);
        trace!("Freed 0x{bytes:X} bytes of frames at {address}");
    }

    /// Total free bytes.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.state.lock().regions.free_bytes()
    }

    /// Number of disjoint free regions.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.state.lock().regions.len()
    }

    /// Copy the free regions into `out` in address order; returns how many
    /// were written.
    pub fn regions(&self, out: &mut [FreeRegion]) -> usize {
        let state = self.state.lock();
        out.iter_mut()
            .zip(state.regions.iter())
            .map(|(slot, region)| *slot = region)
            .count()
    }

    /// Visit every free region in address order while holding the lock.
    pub fn for_each_region(&self, mut f: impl FnMut(FreeRegion)) {
        let state = self.state.lock();
        state.regions.iter().for_each(&mut f);
    }

    fn junk_fill(&self, address: PhysicalAddress, bytes: u32) {
        // SAFETY: the caller owns the frames being released.
        unsafe { self.mapper.fill(address, bytes as usize, JUNK_FILL) };
    }
}

impl<M: PhysMapper, const N: usize> FrameAlloc for FrameAllocator<M, N> {
    fn alloc_frames(&self, bytes: u32) -> Option<PhysicalAddress> {
        self.allocate(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_vmem::ArenaPhysMapper;

    const F: u32 = FRAME_SIZE;
    const BASE: u32 = 0x0010_0000;

    fn allocator(frames: u32, reserved: u32) -> FrameAllocator<ArenaPhysMapper, 16> {
        let mapper = ArenaPhysMapper::new(PhysicalAddress::new(BASE), frames * F);
        let alloc = FrameAllocator::with_reserved_frames(mapper, reserved);
        alloc.init(PhysicalAddress::new(BASE), frames * F);
        alloc
    }

    #[test]
    fn init_skips_reserved_frames() {
        let alloc = allocator(8, 2);
        assert_eq!(alloc.region_count(), 1);
        assert_eq!(alloc.free_bytes(), u64::from(6 * F));
        let mut out = [FreeRegion::default(); 2];
        assert_eq!(alloc.regions(&mut out), 1);
        assert_eq!(out[0], FreeRegion::new(PhysicalAddress::new(BASE + 2 * F), 6 * F));
    }

    #[test]
    fn default_reservation_is_256_frames() {
        let mapper = ArenaPhysMapper::new(PhysicalAddress::new(BASE), 260 * F);
        let alloc: FrameAllocator<_> = FrameAllocator::new(mapper);
        alloc.init(PhysicalAddress::new(BASE), 260 * F);
        assert_eq!(alloc.reserved_frames(), 256);
        assert_eq!(alloc.free_bytes(), u64::from(4 * F));
    }

    #[test]
    fn allocations_come_from_the_top() {
        let alloc = allocator(8, 0);
        assert_eq!(alloc.allocate(F), Ok(PhysicalAddress::new(BASE + 7 * F)));
        assert_eq!(alloc.allocate(2 * F), Ok(PhysicalAddress::new(BASE + 5 * F)));
        assert_eq!(alloc.free_bytes(), u64::from(5 * F));
    }

    #[test]
    fn exhaustion_and_recovery() {
        let alloc = allocator(4, 0);
        let all = alloc.allocate(4 * F).unwrap();
        assert_eq!(all, PhysicalAddress::new(BASE));
        assert_eq!(alloc.region_count(), 0);
        assert_eq!(alloc.allocate(F), Err(FrameAllocError::OutOfMemory(F)));

        alloc.free(all, 4 * F);
        assert_eq!(alloc.allocate(4 * F), Ok(all));
    }

    #[test]
    fn oversized_request_fails() {
        let alloc = allocator(4, 1);
        assert_eq!(alloc.allocate(4 * F), Err(FrameAllocError::OutOfMemory(4 * F)));
        assert_eq!(alloc.free_bytes(), u64::from(3 * F));
    }

    #[test]
    fn freed_memory_is_junk_filled() {
        let alloc = allocator(4, 0);
        let pa = alloc.allocate_zeroed(F).unwrap();
        assert!(alloc.mapper().snapshot(pa, F as usize).iter().all(|&b| b == 0));
        alloc.free(pa, F);
        assert!(alloc.mapper().snapshot(pa, F as usize).iter().all(|&b| b == JUNK_FILL));
    }

    #[test]
    fn init_from_boot_rounds_kernel_end() {
        let mapper = ArenaPhysMapper::new(PhysicalAddress::new(BASE), 8 * F);
        let alloc = FrameAllocator::<_, 4>::with_reserved_frames(mapper, 1);
        alloc.init_from_boot(&BootMemoryInfo::new(PhysicalAddress::new(BASE - 0x10), 8 * F));
        let mut first = None;
        alloc.for_each_region(|r| first = first.or(Some(r)));
        assert_eq!(
            first,
            Some(FreeRegion::new(PhysicalAddress::new(BASE + F), 7 * F))
        );
    }

    #[test]
    #[should_panic(expected = "already initialized")]
    fn init_twice_panics() {
        let alloc = allocator(4, 0);
        alloc.init(PhysicalAddress::new(BASE), 4 * F);
    }

    #[test]
    #[should_panic(expected = "must be a non-zero multiple")]
    fn unaligned_size_panics() {
        let alloc = allocator(4, 0);
        let _ = alloc.allocate(100);
    }

    #[test]
    #[should_panic(expected = "must be a non-zero multiple")]
    fn zero_size_panics() {
        let alloc = allocator(4, 0);
        let _ = alloc.allocate(0);
    }

    #[test]
    #[should_panic(expected = "not frame aligned")]
    fn unaligned_free_panics() {
        let alloc = allocator(4, 0);
        let pa = alloc.allocate(F).unwrap();
        alloc.free(pa + 8, F);
    }

    #[test]
    #[should_panic(expected = "is null or not frame aligned")]
    fn freeing_address_zero_panics() {
        let alloc = allocator(4, 0);
        alloc.free(PhysicalAddress::zero(), F);
    }

    #[test]
    #[should_panic(expected = "freeing free frames")]
    fn double_free_panics() {
        let alloc = allocator(4, 0);
        let pa = alloc.allocate(F).unwrap();
        alloc.free(pa, F);
        alloc.free(pa, F);
    }

    #[test]
    #[should_panic(expected = "non-zero and frame aligned")]
    fn zero_base_panics() {
        let mapper = ArenaPhysMapper::new(PhysicalAddress::new(BASE), F);
        let alloc = FrameAllocator::<_, 4>::with_reserved_frames(mapper, 0);
        alloc.init(PhysicalAddress::zero(), F);
    }
}
