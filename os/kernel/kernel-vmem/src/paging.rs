//! Processor paging control.

use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};

/// The processor-side operations address-space switching needs.
pub trait PagingControl {
    /// Load `directory` as the translation root (CR3).
    fn load_root(&mut self, directory: PhysicalPage<Size4K>);

    /// Whether paging is currently on (CR0.PG).
    fn paging_enabled(&self) -> bool;

    /// Turn paging on with supervisor write protection.
    ///
    /// Only called after a root has been loaded.
    fn enable_paging(&mut self);

    /// Drop any cached translation for `va`.
    fn invalidate_page(&mut self, va: VirtualAddress);
}

/// [`PagingControl`] backed by the real control registers.
#[cfg(target_arch = "x86")]
pub struct HardwarePaging {
    _private: (),
}

#[cfg(target_arch = "x86")]
impl HardwarePaging {
    /// # Safety
    /// Must only be constructed in ring 0. Whoever owns the value may switch
    /// the active address space, so the kernel must keep exactly one.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

#[cfg(target_arch = "x86")]
impl PagingControl for HardwarePaging {
    fn load_root(&mut self, directory: PhysicalPage<Size4K>) {
        use kernel_registers::StoreRegisterUnsafe;
        use kernel_registers::cr3::Cr3;

        // SAFETY: ring 0 is guaranteed by construction; the directory is
        // provided by an AddressSpace and identity-maps the kernel.
        unsafe { Cr3::from_directory(directory).store_unsafe() }
    }

    fn paging_enabled(&self) -> bool {
        use kernel_registers::LoadRegisterUnsafe;
        use kernel_registers::cr0::Cr0;

        // SAFETY: reading CR0 has no side effects in ring 0.
        unsafe { Cr0::load_unsafe() }.pg_paging()
    }

    fn enable_paging(&mut self) {
        use kernel_registers::cr0::Cr0;
        use kernel_registers::cr4::Cr4;
        use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};

        // SAFETY: a root with the kernel identity-mapped is already in CR3.
        unsafe {
            let cr4 = Cr4::load_unsafe().with_pae(false);
            cr4.store_unsafe();
            let cr0 = Cr0::load_unsafe()
                .with_pg_paging(true)
                .with_wp_write_protect(true);
            cr0.store_unsafe();
        }
    }

    fn invalidate_page(&mut self, va: VirtualAddress) {
        // SAFETY: invlpg only drops a TLB entry.
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_u32(), options(nostack, preserves_flags));
        }
    }
}

/// The faulting linear address of the most recent page fault.
///
/// # Safety
/// Must run in ring 0, inside the page-fault handler before anything else can
/// fault.
#[cfg(target_arch = "x86")]
#[must_use]
pub unsafe fn page_fault_address() -> VirtualAddress {
    use kernel_registers::LoadRegisterUnsafe;
    use kernel_registers::cr2::Cr2;

    unsafe { Cr2::load_unsafe() }.fault_address()
}
