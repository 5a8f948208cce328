use kernel_alloc::frame_alloc::{FrameAllocError, FrameAllocator};
use kernel_alloc::free_regions::FreeRegion;
use kernel_info::memory::{FRAME_SIZE, JUNK_FILL};
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::ArenaPhysMapper;
use std::sync::{Arc, Barrier};
use std::thread;

const BASE: u32 = 0x0040_0000;

fn allocator(frames: u32) -> FrameAllocator<ArenaPhysMapper, 64> {
    let mapper = ArenaPhysMapper::new(PhysicalAddress::new(BASE), frames * FRAME_SIZE);
    let alloc = FrameAllocator::with_reserved_frames(mapper, 0);
    alloc.init(PhysicalAddress::new(BASE), frames * FRAME_SIZE);
    alloc
}

#[test]
fn concurrent_allocations_never_overlap() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 16;

    let alloc = Arc::new(allocator((THREADS * PER_THREAD) as u32));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let alloc = Arc::clone(&alloc);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                (0..PER_THREAD)
                    .map(|_| alloc.allocate(FRAME_SIZE).unwrap().as_u32())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut all: Vec<u32> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), THREADS * PER_THREAD);
    assert_eq!(alloc.free_bytes(), 0);
    assert_eq!(alloc.allocate(FRAME_SIZE), Err(FrameAllocError::OutOfMemory(FRAME_SIZE)));
}

#[test]
fn concurrent_frees_merge_back_into_one_region() {
    const THREADS: usize = 4;

    let alloc = Arc::new(allocator(32));
    let frames: Vec<_> = (0..32).map(|_| alloc.allocate(FRAME_SIZE).unwrap()).collect();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = frames
        .chunks(32 / THREADS)
        .map(|chunk| {
            let chunk = chunk.to_vec();
            let alloc = Arc::clone(&alloc);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for pa in chunk {
                    alloc.free(pa, FRAME_SIZE);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let mut regions = [FreeRegion::default(); 4];
    assert_eq!(alloc.regions(&mut regions), 1);
    assert_eq!(regions[0], FreeRegion::new(PhysicalAddress::new(BASE), 32 * FRAME_SIZE));
}

#[test]
fn gaps_are_filled_in_any_order() {
    let alloc = allocator(8);
    let frames: Vec<_> = (0..8).map(|_| alloc.allocate(FRAME_SIZE).unwrap()).collect();

    for i in [1, 5, 3, 7] {
        alloc.free(frames[i], FRAME_SIZE);
    }
    assert_eq!(alloc.region_count(), 4);
    for i in [0, 2, 4, 6] {
        alloc.free(frames[i], FRAME_SIZE);
    }
    assert_eq!(alloc.region_count(), 1);
    assert_eq!(alloc.free_bytes(), 8 * u64::from(FRAME_SIZE));

    let mut seen = Vec::new();
    alloc.for_each_region(|r| seen.push(r));
    assert_eq!(seen, [FreeRegion::new(PhysicalAddress::new(BASE), 8 * FRAME_SIZE)]);
}

#[test]
fn multi_frame_allocations_are_contiguous_and_junk_filled() {
    let alloc = allocator(8);
    let pa = alloc.allocate(3 * FRAME_SIZE).unwrap();
    assert_eq!(pa.as_u32(), BASE + 5 * FRAME_SIZE);
    let bytes = alloc.mapper().snapshot(pa, 3 * FRAME_SIZE as usize);
    assert!(bytes.iter().all(|&b| b == JUNK_FILL));

    let zeroed = alloc.allocate_zeroed(2 * FRAME_SIZE).unwrap();
    let bytes = alloc.mapper().snapshot(zeroed, 2 * FRAME_SIZE as usize);
    assert!(bytes.iter().all(|&b| b == 0));
}

#[test]
#[should_panic(expected = "freeing free frames")]
fn freeing_across_a_free_region_panics() {
    let alloc = allocator(8);
    let a = alloc.allocate(2 * FRAME_SIZE).unwrap();
    alloc.free(a, FRAME_SIZE);
    alloc.free(a, 2 * FRAME_SIZE);
}
