use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// CR3: Page Directory Base Register (32-bit paging, no PAE).
#[bitfield(u32)]
pub struct Cr3 {
    /// Bits 0–2: Reserved.
    #[bits(3)]
    pub reserved0: u8,

    /// Bit 3: PWT: write-through for page directory accesses.
    pub pwt: bool,

    /// Bit 4: PCD: cache disable for page directory accesses.
    pub pcd: bool,

    /// Bits 5–11: Reserved.
    #[bits(7)]
    pub reserved1: u8,

    /// Bits 12–31: page directory physical base >> 12.
    #[bits(20)]
    directory_frame: u32,
}

impl Cr3 {
    /// Build a `Cr3` value pointing at the page directory frame `dir`.
    #[must_use]
    pub const fn from_directory(dir: PhysicalPage<Size4K>) -> Self {
        Self::new().with_directory_frame(dir.frame_number())
    }

    /// Physical base of the page directory.
    #[must_use]
    pub const fn directory_phys(&self) -> PhysicalAddress {
        PhysicalPage::<Size4K>::from_frame_number(self.directory_frame()).base()
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl crate::LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let cr3: u32;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl crate::StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}
