//! # Sorted Free-Region List
//!
//! The bookkeeping half of the frame allocator: a singly linked list of free
//! physical ranges, kept in ascending address order with adjacent ranges
//! merged. Nodes live in a fixed pool addressed by index, so the list never
//! touches the memory it describes.
//!
//! ```text
//! head ─► [0x0020_0000, +0x3000) ─► [0x0040_0000, +0x1_0000) ─► ∅
//!
//! spare ─► slot 5 ─► slot 6 ─► … ─► ∅
//! ```
//!
//! ## Invariants
//! - Regions are ascending and pairwise non-overlapping.
//! - No two regions touch; touching ranges are merged on insert.
//! - Every length is a positive multiple of the frame size.

use kernel_info::memory::FRAME_SIZE;
use kernel_memory_addresses::PhysicalAddress;

/// A run of free physical memory.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FreeRegion {
    pub start: PhysicalAddress,
    pub length: u32,
}

impl FreeRegion {
    #[inline]
    #[must_use]
    pub const fn new(start: PhysicalAddress, length: u32) -> Self {
        Self { start, length }
    }

    /// Exclusive end; may be exactly 4 GiB.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start.as_u64() + self.length as u64
    }

    #[inline]
    #[must_use]
    pub const fn overlaps(&self, start: u64, end: u64) -> bool {
        start < self.end() && self.start.as_u64() < end
    }
}

#[derive(Copy, Clone, Debug)]
struct Node {
    region: FreeRegion,
    next: Option<u16>,
}

impl Node {
    const EMPTY: Self = Self {
        region: FreeRegion::new(PhysicalAddress::zero(), 0),
        next: None,
    };
}

/// Free-region list backed by a pool of `N` nodes.
pub struct FreeRegionList<const N: usize> {
    nodes: [Node; N],
    head: Option<u16>,
    spare: Option<u16>,
    len: usize,
}

impl<const N: usize> Default for FreeRegionList<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> FreeRegionList<N> {
    const CAPACITY_FITS: () = assert!(N > 0 && N <= u16::MAX as usize, "node pool size out of range");

    /// An empty list with every node on the spare list.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new() -> Self {
        let () = Self::CAPACITY_FITS;
        let mut nodes = [Node::EMPTY; N];
        let mut i = 0;
        while i + 1 < N {
            nodes[i].next = Some((i + 1) as u16);
            i += 1;
        }
        Self {
            nodes,
            head: None,
            spare: Some(0),
            len: 0,
        }
    }

    /// Number of regions in the list.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of nodes the pool can hold.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Sum of all region lengths.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.iter().map(|r| u64::from(r.length)).sum()
    }

    /// Regions in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = FreeRegion> + '_ {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            let node = self.nodes[usize::from(cursor?)];
            cursor = node.next;
            Some(node.region)
        })
    }

    #[inline]
    const fn node(&self, i: u16) -> &Node {
        &self.nodes[i as usize]
    }

    #[inline]
    const fn node_mut(&mut self, i: u16) -> &mut Node {
        &mut self.nodes[i as usize]
    }

    const fn next_of(&self, prev: Option<u16>) -> Option<u16> {
        match prev {
            Some(p) => self.node(p).next,
            None => self.head,
        }
    }

    const fn set_next_of(&mut self, prev: Option<u16>, next: Option<u16>) {
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
    }

    /// Link a new node holding `region` behind `prev`.
    ///
    /// # Panics
    /// If the node pool is exhausted.
    fn insert_after(&mut self, prev: Option<u16>, region: FreeRegion) {
        let Some(slot) = self.spare else {
            panic!("frame free: free-region pool of {N} nodes exhausted");
        };
        self.spare = self.node(slot).next;
        let next = self.next_of(prev);
        *self.node_mut(slot) = Node { region, next };
        self.set_next_of(prev, Some(slot));
        self.len += 1;
    }

    /// Unlink the node behind `prev` and return it to the spare list.
    fn remove_after(&mut self, prev: Option<u16>) {
        let Some(victim) = self.next_of(prev) else {
            return;
        };
        let next = self.node(victim).next;
        self.set_next_of(prev, next);
        *self.node_mut(victim) = Node {
            next: self.spare,
            ..Node::EMPTY
        };
        self.spare = Some(victim);
        self.len -= 1;
    }

    /// First fit: carve `bytes` off the **end** of the lowest region that is
    /// large enough. Returns `None` if no region fits.
    #[allow(clippy::cast_possible_truncation)]
    pub fn take(&mut self, bytes: u32) -> Option<PhysicalAddress> {
        debug_assert!(bytes > 0 && bytes.is_multiple_of(FRAME_SIZE));
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(i) = cursor {
            let region = self.node(i).region;
            if region.length >= bytes {
                let start = (region.end() - u64::from(bytes)) as u32;
                if region.length == bytes {
                    self.remove_after(prev);
                } else {
                    self.node_mut(i).region.length -= bytes;
                }
                return Some(PhysicalAddress::new(start));
            }
            prev = cursor;
            cursor = self.node(i).next;
        }
        None
    }

    /// Return `[start, start + bytes)` to the list, merging with neighbours.
    ///
    /// # Panics
    /// If the range overlaps a free region ("freeing free frames"), or the
    /// node pool is exhausted.
    pub fn release(&mut self, start: PhysicalAddress, bytes: u32) {
        debug_assert!(bytes > 0 && bytes.is_multiple_of(FRAME_SIZE));
        let new_start = start.as_u64();
        let new_end = new_start + u64::from(bytes);

        // Find the first region at or past `start`.
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(i) = cursor {
            if self.node(i).region.start.as_u64() >= new_start {
                break;
            }
            prev = cursor;
            cursor = self.node(i).next;
        }

        let before = prev.map(|p| self.node(p).region);
        let after = cursor.map(|c| self.node(c).region);
        for neighbour in [before, after].into_iter().flatten() {
            assert!(
                !neighbour.overlaps(new_start, new_end),
                "frame free: freeing free frames at {start} (+0x{bytes:X}) inside [{}, 0x{:X})",
                neighbour.start,
                neighbour.end()
            );
        }

        let joins_before = before.is_some_and(|r| r.end() == new_start);
        let joins_after = after.is_some_and(|r| new_end == r.start.as_u64());

        match (prev, cursor) {
            (Some(p), Some(c)) if joins_before && joins_after => {
                let merged = bytes + self.node(c).region.length;
                self.node_mut(p).region.length += merged;
                self.remove_after(Some(p));
            }
            (Some(p), _) if joins_before => {
                self.node_mut(p).region.length += bytes;
            }
            (_, Some(c)) if joins_after => {
                let region = &mut self.node_mut(c).region;
                region.start = start;
                region.length += bytes;
            }
            _ => self.insert_after(prev, FreeRegion::new(start, bytes)),
        }
    }
}
