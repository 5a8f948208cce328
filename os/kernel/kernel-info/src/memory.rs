//! # Memory Layout

/// Size of one physical frame and one virtual page.
pub const FRAME_SIZE: u32 = 4096;

/// Number of entries in a page table and in a page directory.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Frames at the bottom of the managed range kept away from the frame
/// allocator for bootstrap kernel structures.
pub const RESERVED_BOOT_FRAMES: u32 = 256;

/// Byte pattern written over every range handed back to the frame allocator,
/// so stale references read obvious garbage.
pub const JUNK_FILL: u8 = 0x01;

/// Start of the kernel identity map (boot sector, kernel image, frame pool).
pub const KERNEL_IDENTITY_BASE: u32 = 0x0000_0000;

/// Length of the kernel identity map (64 MiB).
pub const KERNEL_IDENTITY_BYTES: u32 = 0x0400_0000;

/// Lowest address available to user mappings.
pub const USER_BASE: u32 = KERNEL_IDENTITY_BASE + KERNEL_IDENTITY_BYTES;

/// Start of the memory-mapped device window (I/O APIC and up).
pub const DEVICE_IDENTITY_BASE: u32 = 0xFEC0_0000;

/// Length of the device window; it runs to the very top of the 4 GiB space.
pub const DEVICE_IDENTITY_BYTES: u32 = 0x0140_0000;

/// Backing-store sector size in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Sectors needed to hold one frame.
pub const SECTORS_PER_PAGE: u32 = FRAME_SIZE / SECTOR_SIZE as u32;

/// Blocks at the start of the swap device that are usable for swap.
pub const SWAP_AVAILABLE_BLOCKS: u32 = 10;

const _: () = {
    assert!(FRAME_SIZE.is_power_of_two());
    assert!(FRAME_SIZE as usize % SECTOR_SIZE == 0);
    assert!(KERNEL_IDENTITY_BYTES.is_multiple_of(FRAME_SIZE));
    assert!(DEVICE_IDENTITY_BASE.is_multiple_of(FRAME_SIZE));
    assert!(DEVICE_IDENTITY_BASE as u64 + DEVICE_IDENTITY_BYTES as u64 == 1 << 32);
    assert!(USER_BASE < DEVICE_IDENTITY_BASE);
};
