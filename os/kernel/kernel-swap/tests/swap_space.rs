use kernel_info::memory::{FRAME_SIZE, SECTOR_SIZE};
use kernel_swap::{Page, Sector, SectorDevice, SwapAllocator, SwapError};
use kernel_sync::SpinLock;
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

/// Sector store backed by host memory.
struct MemoryDisk {
    sectors: SpinLock<Vec<Sector>>,
}

impl MemoryDisk {
    fn new(sectors: usize) -> Self {
        Self {
            sectors: SpinLock::new(vec![[0; SECTOR_SIZE]; sectors]),
        }
    }
}

impl SectorDevice for MemoryDisk {
    fn read_sector(&self, sector: u32, buf: &mut Sector) {
        buf.copy_from_slice(&self.sectors.lock()[sector as usize]);
    }

    fn write_sector(&self, sector: u32, buf: &Sector) {
        self.sectors.lock()[sector as usize] = *buf;
    }
}

fn pattern(seed: usize) -> Box<Page> {
    let mut page = Box::new([0; FRAME_SIZE as usize]);
    for (i, b) in page.iter_mut().enumerate() {
        *b = ((i + seed) % 256) as u8;
    }
    page
}

#[test]
fn exactly_k_blocks_can_be_allocated() {
    let swap = SwapAllocator::with_default_window(MemoryDisk::new(64 * 8), 64);
    let k = swap.free_blocks();

    let blocks: Vec<u32> = (0..k).map(|_| swap.allocate_block().unwrap()).collect();
    assert_eq!(blocks, (0..k).collect::<Vec<_>>());
    assert_eq!(swap.allocate_block(), Err(SwapError::OutOfMemory));

    swap.free_block(blocks[4]);
    assert_eq!(swap.allocate_block(), Ok(blocks[4]));
    assert_eq!(swap.allocate_block(), Err(SwapError::OutOfMemory));
}

#[test]
fn pages_survive_the_round_trip() {
    let swap = SwapAllocator::with_default_window(MemoryDisk::new(10 * 8), 10);
    let a = swap.allocate_block().unwrap();
    let b = swap.allocate_block().unwrap();

    let data_a = pattern(0);
    let data_b = pattern(7);
    swap.write_page(a, &data_a);
    swap.write_page(b, &data_b);

    let mut buf = Box::new([0; FRAME_SIZE as usize]);
    swap.read_page(a, &mut buf);
    assert_eq!(buf, data_a);
    swap.read_page(b, &mut buf);
    assert_eq!(buf, data_b);
}

#[test]
fn freed_blocks_can_be_rewritten() {
    let swap = SwapAllocator::with_default_window(MemoryDisk::new(10 * 8), 10);
    let block = swap.allocate_block().unwrap();
    swap.write_page(block, &pattern(1));
    swap.free_block(block);
    assert!(!swap.is_allocated(block));

    let again = swap.allocate_block().unwrap();
    assert_eq!(again, block);
    swap.write_page(again, &pattern(99));
    let mut buf = Box::new([0; FRAME_SIZE as usize]);
    swap.read_page(again, &mut buf);
    assert_eq!(buf, pattern(99));
}

#[test]
fn concurrent_allocation_hands_out_each_block_once() {
    const THREADS: usize = 4;
    let swap = Arc::new(SwapAllocator::new(MemoryDisk::new(128 * 8), 128, 0..100));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let swap = Arc::clone(&swap);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut mine = Vec::new();
                while let Ok(block) = swap.allocate_block() {
                    mine.push(block);
                }
                mine
            })
        })
        .collect();

    let all: Vec<u32> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    let unique: HashSet<u32> = all.iter().copied().collect();
    assert_eq!(all.len(), 100);
    assert_eq!(unique.len(), 100);
    assert!(unique.iter().all(|&b| b < 100));
    assert_eq!(swap.free_blocks(), 0);
}

#[test]
#[should_panic(expected = "double free")]
fn double_free_is_fatal() {
    let swap = SwapAllocator::with_default_window(MemoryDisk::new(10 * 8), 10);
    let block = swap.allocate_block().unwrap();
    swap.free_block(block);
    swap.free_block(block);
}

#[test]
#[should_panic(expected = "out of range")]
fn reading_past_the_device_is_fatal() {
    let swap = SwapAllocator::with_default_window(MemoryDisk::new(10 * 8), 10);
    let mut buf = Box::new([0; FRAME_SIZE as usize]);
    swap.read_page(10, &mut buf);
}
