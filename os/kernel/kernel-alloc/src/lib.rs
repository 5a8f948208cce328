//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! Physical frame allocation, the kernel heap and the virtual memory manager
//! for a 32-bit, two-level paged kernel.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                Virtual Memory Manager (VMM)         │
//! │    • Active address space + paging control          │
//! │    • TLB invalidation on unmap                      │
//! │    • Page-fault entry point                         │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ page tables
//! ┌─────────────────▼───────────────────────────────────┐
//! │              Kernel Heap                            │
//! │    • Next-fit free list of headered blocks          │
//! │    • GlobalAlloc                                    │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ frame-sized chunks
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Physical Frame Allocator                  │
//! │    • Sorted, merged free regions                    │
//! │    • First fit, carved from the region end          │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Every layer reaches physical memory through a [`kernel_vmem::PhysMapper`];
//! the kernel uses [`phys_mapper::IdentityPhysMapper`], host tests use the
//! arena mapper from `kernel-vmem`'s `test-util` feature.
//!
//! ## Components
//!
//! ### Physical Frame Allocator ([`frame_alloc`])
//! Hands out physically contiguous multiples of 4 KiB. The free regions live
//! in a fixed node pool ([`free_regions`]) so the allocator never needs a heap.
//! Freed memory is filled with a junk pattern to expose use-after-free.
//!
//! ### Kernel Heap ([`heap`])
//! Small allocations for kernel objects. Grows by whole frames and keeps its
//! headers inside the memory it manages, behind bounds-checked accessors.
//!
//! ### Virtual Memory Manager ([`vmm`])
//! Owns the active address space and the paging control, builds the boot
//! directory and forwards page faults to a [`vmm::FaultSink`].
//!
//! ## Concurrency
//! The frame allocator and the heap each guard their state with one
//! [`kernel_sync::SpinLock`] and take `&self`. The heap calls into the frame
//! allocator while holding its own lock, never the other way round.
//!
//! ## Usage
//! ```rust
//! use kernel_alloc::frame_alloc::FrameAllocator;
//! use kernel_alloc::heap::KernelHeap;
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmem::ArenaPhysMapper;
//!
//! let base = PhysicalAddress::new(0x0010_0000);
//! let frames: FrameAllocator<_, 16> =
//!     FrameAllocator::with_reserved_frames(ArenaPhysMapper::new(base, 16 * 4096), 0);
//! frames.init(base, 16 * 4096);
//!
//! let heap = KernelHeap::new(&frames);
//! let block = heap.allocate(64).unwrap();
//! unsafe { heap.free(block) };
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod frame_alloc;
pub mod free_regions;
pub mod heap;
pub mod phys_mapper;
pub mod vmm;
