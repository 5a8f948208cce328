use bitfield_struct::bitfield;

/// CR4: Control Register 4 (32-bit protected mode subset).
#[bitfield(u32)]
pub struct Cr4 {
    /// Bit 0: VME: Virtual-8086 Mode Extensions.
    pub vme: bool,

    /// Bit 1: PVI: Protected-Mode Virtual Interrupts.
    pub pvi: bool,

    /// Bit 2: TSD: Time Stamp Disable.
    pub tsd: bool,

    /// Bit 3: DE: Debugging Extensions.
    pub de: bool,

    /// Bit 4: PSE: Page Size Extensions (4 MiB directory leaves).
    pub pse: bool,

    /// Bit 5: PAE: Physical Address Extension.
    ///
    /// Must be clear for the two-level 32-bit table format.
    pub pae: bool,

    /// Bit 6: MCE: Machine-Check Enable.
    pub mce: bool,

    /// Bit 7: PGE: Page Global Enable.
    pub pge: bool,

    /// Bits 8–31: not modeled.
    #[bits(24)]
    pub upper: u32,
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl crate::LoadRegisterUnsafe for Cr4 {
    unsafe fn load_unsafe() -> Self {
        let cr4: u32;
        unsafe {
            core::arch::asm!("mov {}, cr4", out(reg) cr4, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr4)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl crate::StoreRegisterUnsafe for Cr4 {
    unsafe fn store_unsafe(self) {
        let cr4 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr4, {}", in(reg) cr4, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pae_is_bit_5() {
        let cr4 = Cr4::from_bits(0x0000_00B0);
        assert!(cr4.pae());
        assert_eq!(cr4.with_pae(false).into_bits(), 0x0000_0090);
    }
}
