//! Swap block allocation and page transfer.

use crate::bit_vector::BitVector;
use crate::device::{Sector, SectorDevice};
use core::ops::Range;
use kernel_info::memory::{FRAME_SIZE, SECTOR_SIZE, SECTORS_PER_PAGE, SWAP_AVAILABLE_BLOCKS};
use kernel_sync::SpinLock;
use log::{debug, trace, warn};

/// One page of data as it moves to or from swap.
pub type Page = [u8; FRAME_SIZE as usize];

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SwapError {
    #[error("no free swap blocks")]
    OutOfMemory,
}

/// Swap-slot allocator over a [`SectorDevice`].
///
/// The bit vector is sized to the device; only blocks in the usable window
/// ever become free.
pub struct SwapAllocator<D: SectorDevice> {
    device: D,
    capacity: u32,
    usable: Range<u32>,
    used: SpinLock<BitVector>,
}

impl<D: SectorDevice> SwapAllocator<D> {
    /// Track `capacity_blocks` blocks, of which those in `window` are usable.
    ///
    /// The window is clipped to the capacity.
    #[must_use]
    pub fn new(device: D, capacity_blocks: u32, window: Range<u32>) -> Self {
        let mut used = BitVector::new_set(capacity_blocks as usize);
        let usable = window.start.min(capacity_blocks)..window.end.min(capacity_blocks);
        for block in usable.clone() {
            used.clear(block as usize);
        }
        debug!(
            "Swap ready: blocks {usable:?} of {capacity_blocks} usable ({} sectors per block)",
            SECTORS_PER_PAGE
        );
        Self {
            device,
            capacity: capacity_blocks,
            usable,
            used: SpinLock::new(used),
        }
    }

    /// Like [`new`](Self::new) with the first
    /// [`SWAP_AVAILABLE_BLOCKS`] blocks usable.
    #[must_use]
    pub fn with_default_window(device: D, capacity_blocks: u32) -> Self {
        Self::new(device, capacity_blocks, 0..SWAP_AVAILABLE_BLOCKS)
    }

    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Blocks that may ever be handed out.
    #[inline]
    #[must_use]
    pub fn usable(&self) -> Range<u32> {
        self.usable.clone()
    }

    #[inline]
    #[must_use]
    pub const fn device(&self) -> &D {
        &self.device
    }

    /// Number of blocks that can still be allocated.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn free_blocks(&self) -> u32 {
        self.used.lock().count_clear() as u32
    }

    /// # Panics
    /// If `block` is out of range.
    #[must_use]
    pub fn is_allocated(&self, block: u32) -> bool {
        self.check_range("is_allocated", block);
        self.used.lock().test(block as usize)
    }

    /// Reserve the lowest free block.
    ///
    /// # Errors
    /// [`SwapError::OutOfMemory`] if every block is in use.
    #[allow(clippy::cast_possible_truncation)]
    pub fn allocate_block(&self) -> Result<u32, SwapError> {
        let mut used = self.used.lock();
        let Some(block) = used.scan_first_clear(self.capacity as usize) else {
            drop(used);
            warn!("Swap space exhausted ({} blocks)", self.capacity);
            return Err(SwapError::OutOfMemory);
        };
        used.set(block);
        trace!("Allocated swap block {block}");
        Ok(block as u32)
    }

    /// Release `block`.
    ///
    /// # Panics
    /// If `block` is out of range, outside the usable window or not allocated.
    pub fn free_block(&self, block: u32) {
        self.check_usable("free", block);
        let mut used = self.used.lock();
        assert!(
            used.test(block as usize),
            "swap free: double free of block {block}"
        );
        used.clear(block as usize);
        trace!("Freed swap block {block}");
    }

    /// Write one page to `block`.
    ///
    /// # Panics
    /// If `block` is out of range, outside the usable window or was not
    /// obtained from [`allocate_block`](Self::allocate_block).
    pub fn write_page(&self, block: u32, page: &Page) {
        self.check_usable("write", block);
        let used = self.used.lock();
        assert!(
            used.test(block as usize),
            "swap write: block {block} is not allocated"
        );
        let first = block * SECTORS_PER_PAGE;
        let mut sector: Sector = [0; SECTOR_SIZE];
        for (index, chunk) in (first..).zip(page.chunks_exact(SECTOR_SIZE)) {
            sector.copy_from_slice(chunk);
            self.device.write_sector(index, &sector);
        }
        drop(used);
        trace!("Wrote page to swap block {block} (sectors {first}..{})", first + SECTORS_PER_PAGE);
    }

    /// Read the page stored in `block`.
    ///
    /// # Panics
    /// If `block` is out of range.
    pub fn read_page(&self, block: u32, page: &mut Page) {
        self.check_range("read", block);
        let used = self.used.lock();
        let first = block * SECTORS_PER_PAGE;
        let mut sector: Sector = [0; SECTOR_SIZE];
        for (index, chunk) in (first..).zip(page.chunks_exact_mut(SECTOR_SIZE)) {
            self.device.read_sector(index, &mut sector);
            chunk.copy_from_slice(&sector);
        }
        drop(used);
        trace!("Read page from swap block {block}");
    }

    fn check_range(&self, op: &str, block: u32) {
        assert!(
            block < self.capacity,
            "swap {op}: block {block} out of range (capacity {})",
            self.capacity
        );
    }

    fn check_usable(&self, op: &str, block: u32) {
        self.check_range(op, block);
        assert!(
            self.usable.contains(&block),
            "swap {op}: block {block} is outside the usable window {:?}",
            self.usable
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;

    /// Records which sectors were touched.
    #[derive(Default)]
    struct Recorder {
        reads: RefCell<Vec<u32>>,
        writes: RefCell<Vec<u32>>,
    }

    impl SectorDevice for Recorder {
        fn read_sector(&self, sector: u32, buf: &mut Sector) {
            self.reads.borrow_mut().push(sector);
            buf.fill(0);
        }

        fn write_sector(&self, sector: u32, _buf: &Sector) {
            self.writes.borrow_mut().push(sector);
        }
    }

    #[test]
    fn default_window_is_the_first_ten_blocks() {
        let swap = SwapAllocator::with_default_window(Recorder::default(), 64);
        assert_eq!(swap.capacity(), 64);
        assert_eq!(swap.free_blocks(), SWAP_AVAILABLE_BLOCKS);
        assert!(!swap.is_allocated(9));
        assert!(swap.is_allocated(10));
        assert_eq!(swap.usable(), 0..SWAP_AVAILABLE_BLOCKS);
    }

    #[test]
    fn blocks_come_out_lowest_first() {
        let swap = SwapAllocator::new(Recorder::default(), 32, 4..8);
        assert_eq!(swap.allocate_block(), Ok(4));
        assert_eq!(swap.allocate_block(), Ok(5));
        swap.free_block(4);
        assert_eq!(swap.allocate_block(), Ok(4));
        assert_eq!(swap.allocate_block(), Ok(6));
    }

    #[test]
    fn window_is_clipped_to_capacity() {
        let swap = SwapAllocator::new(Recorder::default(), 4, 2..100);
        assert_eq!(swap.free_blocks(), 2);
        assert_eq!(swap.usable(), 2..4);
        let empty = SwapAllocator::new(Recorder::default(), 4, 10..20);
        assert_eq!(empty.free_blocks(), 0);
        assert_eq!(empty.allocate_block(), Err(SwapError::OutOfMemory));
    }

    #[test]
    fn pages_span_eight_consecutive_sectors() {
        let swap = SwapAllocator::with_default_window(Recorder::default(), 16);
        swap.allocate_block().unwrap();
        swap.allocate_block().unwrap();
        let block = swap.allocate_block().unwrap();
        assert_eq!(block, 2);

        swap.write_page(block, &[0xAA; FRAME_SIZE as usize]);
        let mut page = [0xFF; FRAME_SIZE as usize];
        swap.read_page(block, &mut page);

        let expected: Vec<u32> = (16..24).collect();
        assert_eq!(*swap.device().writes.borrow(), expected);
        assert_eq!(*swap.device().reads.borrow(), expected);
        assert!(page.iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic(expected = "double free of block 3")]
    fn double_free_panics() {
        let swap = SwapAllocator::with_default_window(Recorder::default(), 16);
        swap.free_block(3);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_free_panics() {
        let swap = SwapAllocator::with_default_window(Recorder::default(), 16);
        swap.free_block(16);
    }

    #[test]
    #[should_panic(expected = "block 40 is outside the usable window")]
    fn freeing_a_block_outside_the_window_panics() {
        let swap = SwapAllocator::with_default_window(Recorder::default(), 64);
        while swap.allocate_block().is_ok() {}
        assert!(swap.is_allocated(40));
        swap.free_block(40);
    }

    #[test]
    #[should_panic(expected = "outside the usable window")]
    fn writing_outside_the_window_panics() {
        let swap = SwapAllocator::new(Recorder::default(), 16, 4..8);
        swap.write_page(2, &[0; FRAME_SIZE as usize]);
    }

    #[test]
    #[should_panic(expected = "is not allocated")]
    fn writing_an_unallocated_block_panics() {
        let swap = SwapAllocator::with_default_window(Recorder::default(), 16);
        swap.write_page(0, &[0; FRAME_SIZE as usize]);
    }
}
