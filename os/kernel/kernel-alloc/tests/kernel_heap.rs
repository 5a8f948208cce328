use core::alloc::{GlobalAlloc, Layout};
use kernel_alloc::frame_alloc::FrameAllocator;
use kernel_alloc::heap::{HeapError, KernelHeap, UNIT};
use kernel_info::memory::FRAME_SIZE;
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::ArenaPhysMapper;
use std::sync::{Arc, Barrier};
use std::thread;

const BASE: u32 = 0x0080_0000;

fn frames(count: u32) -> FrameAllocator<ArenaPhysMapper, 32> {
    let mapper = ArenaPhysMapper::new(PhysicalAddress::new(BASE), count * FRAME_SIZE);
    let alloc = FrameAllocator::with_reserved_frames(mapper, 0);
    alloc.init(PhysicalAddress::new(BASE), count * FRAME_SIZE);
    alloc
}

fn free_list<M: kernel_vmem::PhysMapper, const N: usize>(heap: &KernelHeap<'_, M, N>) -> Vec<u64> {
    let mut sizes = Vec::new();
    heap.for_each_free_block(|_, bytes| sizes.push(bytes));
    sizes
}

#[test]
fn three_blocks_coalesce_regardless_of_free_order() {
    let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
    for order in orders {
        let frames = frames(4);
        let heap = KernelHeap::new(&frames);
        let blocks = [
            heap.allocate(40).unwrap(),
            heap.allocate(40).unwrap(),
            heap.allocate(40).unwrap(),
        ];
        for i in order {
            unsafe { heap.free(blocks[i]) };
        }
        assert_eq!(free_list(&heap), [u64::from(FRAME_SIZE)], "order {order:?}");
    }
}

#[test]
fn blocks_do_not_overlap() {
    let frames = frames(16);
    let heap = KernelHeap::new(&frames);
    let sizes = [1_usize, 7, 8, 9, 100, 1000, 4000, 3, 250];
    let blocks: Vec<_> = sizes.iter().map(|&s| (heap.allocate(s).unwrap(), s)).collect();

    for (i, &(p, s)) in blocks.iter().enumerate() {
        unsafe { core::ptr::write_bytes(p.as_ptr(), i as u8, s) };
    }
    for (i, &(p, s)) in blocks.iter().enumerate() {
        let data = unsafe { core::slice::from_raw_parts(p.as_ptr(), s) };
        assert!(data.iter().all(|&b| b == i as u8), "block {i} was clobbered");
        assert_eq!(p.as_ptr() as usize % UNIT as usize, 0);
    }
    for (p, _) in blocks {
        unsafe { heap.free(p) };
    }
    assert_eq!(heap.free_bytes(), heap.reserved_bytes());
}

#[test]
fn heap_grows_until_the_frames_run_out() {
    let frames = frames(4);
    let heap = KernelHeap::new(&frames);
    let mut blocks = Vec::new();
    loop {
        match heap.allocate(1024) {
            Ok(p) => blocks.push(p),
            Err(e) => {
                assert_eq!(e, HeapError::OutOfMemory);
                break;
            }
        }
    }
    // 129 units per block; each new frame merges with the leftover below it,
    // so only the final 113 units go unused.
    assert_eq!(blocks.len(), 15);
    assert_eq!(heap.free_bytes(), 113 * u64::from(UNIT));
    assert_eq!(frames.free_bytes(), 0);
    assert_eq!(heap.reserved_bytes(), 4 * u64::from(FRAME_SIZE));

    for p in blocks {
        unsafe { heap.free(p) };
    }
    // Frames were taken top-down and merged into one extent.
    assert_eq!(free_list(&heap), [4 * u64::from(FRAME_SIZE)]);
}

#[test]
fn global_alloc_round_trip() {
    let frames = frames(8);
    let heap = KernelHeap::new(&frames);
    let layouts = [
        Layout::new::<u64>(),
        Layout::new::<[u32; 33]>(),
        Layout::from_size_align(1, 1).unwrap(),
        Layout::from_size_align(2048, 8).unwrap(),
    ];
    unsafe {
        let ptrs: Vec<_> = layouts.iter().map(|&l| heap.alloc(l)).collect();
        assert!(ptrs.iter().all(|p| !p.is_null()));
        ptrs[0].cast::<u64>().write(0xDEAD_BEEF_F00D_CAFE);
        assert_eq!(ptrs[0].cast::<u64>().read(), 0xDEAD_BEEF_F00D_CAFE);

        let grown = heap.realloc(ptrs[1], layouts[1], 512);
        assert!(!grown.is_null());

        heap.dealloc(ptrs[0], layouts[0]);
        heap.dealloc(grown, Layout::from_size_align(512, layouts[1].align()).unwrap());
        heap.dealloc(ptrs[2], layouts[2]);
        heap.dealloc(ptrs[3], layouts[3]);

        assert!(heap.alloc(Layout::from_size_align(8, 4096).unwrap()).is_null());
    }
    assert_eq!(heap.free_bytes(), heap.reserved_bytes());
}

#[test]
fn shared_heap_across_threads() {
    const THREADS: usize = 4;
    let frames: &'static FrameAllocator<ArenaPhysMapper, 32> = Box::leak(Box::new(frames(32)));
    let heap: &'static KernelHeap<'static, ArenaPhysMapper, 32> = Box::leak(Box::new(KernelHeap::new(frames)));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for round in 0..50 {
                    let size = 16 + (t * 50 + round) % 200;
                    let p = heap.allocate(size).unwrap();
                    unsafe {
                        core::ptr::write_bytes(p.as_ptr(), t as u8, size);
                        assert_eq!(*p.as_ptr().add(size - 1), t as u8);
                        heap.free(p);
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(heap.free_bytes(), heap.reserved_bytes());
}

#[test]
#[should_panic(expected = "double free")]
fn freeing_into_a_merged_block_panics() {
    let frames = frames(2);
    let heap = KernelHeap::new(&frames);
    let a = heap.allocate(16).unwrap();
    let b = heap.allocate(16).unwrap();
    unsafe {
        heap.free(a);
        heap.free(b);
        heap.free(a);
    }
}

#[test]
#[should_panic(expected = "zero-size request")]
fn zero_byte_request_panics() {
    let frames = frames(1);
    let heap = KernelHeap::new(&frames);
    let _ = heap.allocate(0);
}
