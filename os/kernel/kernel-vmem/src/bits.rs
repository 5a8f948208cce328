//! # Two-Level Paging Entry Formats
//!
//! Raw 32-bit encodings of the two entry kinds used by non-PAE protected-mode
//! paging:
//!
//! - [`PageTableEntry`] (PTE): maps one 4 KiB frame.
//! - [`PageDirectoryEntry`] (PDE): points to one page table covering 4 MiB.
//!
//! Both are plain `u32` bitfields with explicit [`into_bits`](PageTableEntry::into_bits) /
//! [`from_bits`](PageTableEntry::from_bits) conversions, so the in-memory layout is
//! exactly what the MMU walks.

use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalPage, Size4K};

/// A 32-bit page table entry.
///
/// ### Bit layout
///
/// | Bits   | Name        | Meaning |
/// |--------|-------------|---------|
/// | 0      | `P`         | Present; clear entries fault on access |
/// | 1      | `RW`        | Writable |
/// | 2      | `US`        | User-mode accessible |
/// | 3      | `PWT`       | Write-through caching |
/// | 4      | `PCD`       | Cache disable |
/// | 5      | `A`         | Accessed (set by the CPU) |
/// | 6      | `D`         | Dirty (set by the CPU on write) |
/// | 7      | `PAT`       | Page attribute table index |
/// | 8      | `G`         | Global (survives CR3 reloads when CR4.PGE is set) |
/// | 9      | pinned      | OS-available: page must never be evicted |
/// | 10–11  | OS avail    | Ignored by the CPU |
/// | 12–31  | frame       | Physical frame number (address >> 12) |
///
/// ### Example
/// ```rust
/// # use kernel_vmem::PageTableEntry;
/// let e = PageTableEntry::new()
///     .with_present(true)
///     .with_writable(true)
///     .with_frame(0x12345);
/// assert_eq!(e.into_bits(), 0x1234_5003);
/// ```
#[doc(alias = "PTE")]
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    /// Bit 0: Present.
    pub present: bool,
    /// Bit 1: Writable.
    pub writable: bool,
    /// Bit 2: User/Supervisor.
    pub user: bool,
    /// Bit 3: Page-level write-through.
    pub write_through: bool,
    /// Bit 4: Page-level cache disable.
    pub cache_disabled: bool,
    /// Bit 5: Accessed.
    pub accessed: bool,
    /// Bit 6: Dirty.
    pub dirty: bool,
    /// Bit 7: PAT.
    pub pat: bool,
    /// Bit 8: Global.
    pub global: bool,
    /// Bit 9: Pinned. Pinned pages are excluded from eviction.
    pub pinned: bool,
    /// Bits 10–11: available to the OS.
    #[bits(2)]
    pub os_available: u8,
    /// Bits 12–31: physical frame number.
    #[bits(20)]
    pub frame: u32,
}

impl PageTableEntry {
    /// Build a present entry for `page` with the given mapping flags.
    ///
    /// Starts from a zero entry, so accessed/dirty and cache bits are clear.
    #[inline]
    #[must_use]
    pub const fn mapping(page: PhysicalPage<Size4K>, flags: MapFlags) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(flags.writable)
            .with_user(flags.user)
            .with_pinned(flags.pinned)
            .with_frame(page.frame_number())
    }

    /// The frame this entry refers to, regardless of whether it is present.
    #[inline]
    #[must_use]
    pub const fn frame_page(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_frame_number(self.frame())
    }

    /// The mapped frame if the entry is present.
    #[inline]
    #[must_use]
    pub const fn present_page(self) -> Option<PhysicalPage<Size4K>> {
        if self.present() {
            Some(self.frame_page())
        } else {
            None
        }
    }
}

/// A 32-bit page directory entry referencing a 4 KiB-page table.
///
/// Bit 7 (`PS`) selects 4 MiB pages when CR4.PSE is set. This kernel never
/// uses them, so it is always written as zero.
///
/// | Bits   | Name     | Meaning |
/// |--------|----------|---------|
/// | 0      | `P`      | Present |
/// | 1      | `RW`     | Writable (combined with the PTE) |
/// | 2      | `US`     | User accessible (combined with the PTE) |
/// | 3      | `PWT`    | Write-through for the table |
/// | 4      | `PCD`    | Cache disable for the table |
/// | 5      | `A`      | Accessed |
/// | 6      |:        | Ignored |
/// | 7      | `PS`     | Page size; must be 0 |
/// | 8–11   | OS avail | Ignored by the CPU |
/// | 12–31  | table    | Frame number of the page table |
#[doc(alias = "PDE")]
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageDirectoryEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    #[bits(default = false)]
    _ignored: bool,
    /// Must stay clear for 4 KiB tables.
    #[bits(default = false)]
    pub page_size: bool,
    #[bits(4)]
    pub os_available: u8,
    #[bits(20)]
    pub table_frame: u32,
}

impl PageDirectoryEntry {
    /// A present, writable, user-accessible link to `table`.
    ///
    /// Access rights are narrowed per page in the PTE; the directory level
    /// stays permissive.
    #[inline]
    #[must_use]
    pub const fn link(table: PhysicalPage<Size4K>) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(true)
            .with_table_frame(table.frame_number())
    }

    /// The linked table frame if the entry is present.
    #[inline]
    #[must_use]
    pub const fn table(self) -> Option<PhysicalPage<Size4K>> {
        if self.present() {
            Some(PhysicalPage::from_frame_number(self.table_frame()))
        } else {
            None
        }
    }
}

/// Access flags applied to every page of a `map_range` call.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MapFlags {
    pub writable: bool,
    pub user: bool,
    pub pinned: bool,
}

impl MapFlags {
    /// Writable supervisor memory that may later be evicted.
    pub const KERNEL_RW: Self = Self {
        writable: true,
        user: false,
        pinned: false,
    };

    /// Writable supervisor memory that must stay resident.
    pub const KERNEL_PINNED: Self = Self {
        writable: true,
        user: false,
        pinned: true,
    };

    /// Writable, user-visible memory that must stay resident (device windows).
    pub const USER_PINNED: Self = Self {
        writable: true,
        user: true,
        pinned: true,
    };

    #[inline]
    #[must_use]
    pub const fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    #[inline]
    #[must_use]
    pub const fn user(mut self, user: bool) -> Self {
        self.user = user;
        self
    }

    #[inline]
    #[must_use]
    pub const fn pinned(mut self, pinned: bool) -> Self {
        self.pinned = pinned;
        self
    }
}

const _: () = {
    assert!(size_of::<PageTableEntry>() == 4);
    assert!(size_of::<PageDirectoryEntry>() == 4);
};
