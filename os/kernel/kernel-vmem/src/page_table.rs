//! # Page Table and Page Directory
//!
//! - [`TableIndex`]: index from VA bits `[21:12]`.
//! - [`DirIndex`]: index from VA bits `[31:22]`.
//! - [`PageTable`]: a 4 KiB-aligned array of 1024 [`PageTableEntry`] values.
//! - [`PageDirectory`]: two consecutive frames. The first holds the 1024
//!   hardware [`PageDirectoryEntry`] values the MMU walks, the second holds the
//!   owning [`TableRef`] for each slot.
//!
//! ## Invariants
//!
//! - A directory entry is present iff its table reference is non-null.
//! - Both indices are derived by masking, so they are always `< 1024`.

use crate::bits::{PageDirectoryEntry, PageTableEntry};
use kernel_info::memory::ENTRIES_PER_TABLE;
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size4K, Size4M, VirtualAddress, VirtualPage,
};

/// Index into a [`PageTable`] (VA bits `[21:12]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

/// Index into a [`PageDirectory`] (VA bits `[31:22]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DirIndex(u16);

impl TableIndex {
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from(va: VirtualAddress) -> Self {
        Self(((va.as_u32() >> 12) & 0x3FF) as u16)
    }

    /// ### Debug assertions
    /// - Asserts `v < 1024`.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES_PER_TABLE);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl DirIndex {
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from(va: VirtualAddress) -> Self {
        Self((va.as_u32() >> 22) as u16)
    }

    /// ### Debug assertions
    /// - Asserts `v < 1024`.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES_PER_TABLE);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// The 4 MiB span of virtual addresses this directory slot covers.
    #[inline]
    #[must_use]
    pub const fn span(self) -> VirtualPage<Size4M> {
        VirtualPage::containing(VirtualAddress::new((self.0 as u32) << Size4M::SHIFT))
    }

    /// First virtual address covered by this directory slot.
    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        self.span().base()
    }
}

/// Split a virtual address into its directory and table indices.
#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (DirIndex, TableIndex) {
    (DirIndex::from(va), TableIndex::from(va))
}

/// Owning reference to a page table frame, as stored beside the directory.
///
/// Zero means "no table".
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TableRef(u32);

impl TableRef {
    pub const NONE: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn to(table: PhysicalPage<Size4K>) -> Self {
        Self(table.base().as_u32())
    }

    #[inline]
    #[must_use]
    pub const fn page(self) -> Option<PhysicalPage<Size4K>> {
        if self.0 == 0 {
            None
        } else {
            Some(PhysicalPage::from_addr(PhysicalAddress::new(self.0)))
        }
    }
}

/// One page table: 1024 entries covering 4 MiB.
#[doc(alias = "PT")]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// A table with every entry non-present.
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageTableEntry::new(); ENTRIES_PER_TABLE],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: TableIndex) -> PageTableEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn get_mut(&mut self, i: TableIndex) -> &mut PageTableEntry {
        &mut self.entries[i.as_usize()]
    }

    /// Write the entry at `i`. TLB maintenance is the caller's job.
    #[inline]
    pub const fn set(&mut self, i: TableIndex, e: PageTableEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// Number of present entries.
    #[must_use]
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.present()).count()
    }
}

/// The page directory of one address space.
///
/// The CPU only ever sees `entries`; CR3 points at the first frame. `tables`
/// lives in the immediately following frame, hence the 8 KiB allocation.
#[doc(alias = "PD")]
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PageDirectoryEntry; ENTRIES_PER_TABLE],
    tables: [TableRef; ENTRIES_PER_TABLE],
}

impl PageDirectory {
    /// Size of the directory allocation in bytes.
    #[allow(clippy::cast_possible_truncation)]
    pub const BYTES: u32 = size_of::<Self>() as u32;

    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageDirectoryEntry::new(); ENTRIES_PER_TABLE],
            tables: [TableRef::NONE; ENTRIES_PER_TABLE],
        }
    }

    /// Raw hardware entry at `i`.
    #[inline]
    #[must_use]
    pub const fn entry(&self, i: DirIndex) -> PageDirectoryEntry {
        self.entries[i.as_usize()]
    }

    /// The table owned by slot `i`, if any.
    ///
    /// # Panics
    /// If the hardware entry and the table reference disagree.
    #[must_use]
    pub fn table(&self, i: DirIndex) -> Option<PhysicalPage<Size4K>> {
        let entry = self.entries[i.as_usize()].table();
        let owned = self.tables[i.as_usize()].page();
        match (entry, owned) {
            (Some(linked), Some(owned)) if linked == owned => Some(owned),
            (None, None) => None,
            _ => panic!(
                "page directory: slot {} out of sync (entry {:?}, table {:?})",
                i.as_usize(),
                entry,
                owned
            ),
        }
    }

    /// Record `table` as the owner of slot `i` and link it.
    ///
    /// # Panics
    /// If the slot already owns a table.
    pub fn install(&mut self, i: DirIndex, table: PhysicalPage<Size4K>) {
        assert!(
            self.tables[i.as_usize()].page().is_none(),
            "page directory: slot {} already owns a table",
            i.as_usize()
        );
        self.tables[i.as_usize()] = TableRef::to(table);
        self.entries[i.as_usize()] = PageDirectoryEntry::link(table);
    }

    /// Number of slots that own a table.
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.tables.iter().filter(|t| t.page().is_some()).count()
    }
}

const _: () = {
    assert!(size_of::<PageTable>() == 4096);
    assert!(align_of::<PageTable>() == 4096);
    assert!(size_of::<PageDirectory>() == 8192);
    assert!(align_of::<PageDirectory>() == 4096);
};
