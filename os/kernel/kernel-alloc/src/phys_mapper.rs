//! # Identity PhysMapper
//!
//! The kernel identity-maps its own region and the device window (see
//! [`AddressSpace::build_initial_directory`](kernel_vmem::AddressSpace::build_initial_directory)),
//! so inside those ranges a physical address is also its virtual address.
//! Before paging is switched on every address is an identity mapping.
//!
//! ## Example
//! ```rust
//! use kernel_alloc::phys_mapper::IdentityPhysMapper;
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmem::PhysMapper;
//!
//! let mapper = IdentityPhysMapper;
//! let ptr = mapper.phys_to_ptr(PhysicalAddress::new(0x0020_0000));
//! assert_eq!(mapper.ptr_to_phys(ptr).as_u32(), 0x0020_0000);
//! ```

use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for identity-mapped physical memory.
///
/// # Safety
/// Dereferencing the returned pointers is only sound for physical memory
/// covered by the identity mapping of the active address space.
#[derive(Debug, Default, Copy, Clone)]
pub struct IdentityPhysMapper;

impl PhysMapper for IdentityPhysMapper {
    #[inline]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        core::ptr::with_exposed_provenance_mut(pa.as_u32() as usize)
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn ptr_to_phys(&self, ptr: *const u8) -> PhysicalAddress {
        PhysicalAddress::new(ptr.expose_provenance() as u32)
    }
}
