//! Fixed-size bit vector. Bit `i` lives in byte `i / 8` at position `i % 8`.

use alloc::boxed::Box;
use alloc::vec;

/// A heap-allocated vector of `len` bits. Callers serialize access.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BitVector {
    bytes: Box<[u8]>,
    len: usize,
}

impl BitVector {
    /// `len` bits, all set.
    #[must_use]
    pub fn new_set(len: usize) -> Self {
        Self::filled(len, 0xFF)
    }

    /// `len` bits, all clear.
    #[must_use]
    pub fn new_clear(len: usize) -> Self {
        Self::filled(len, 0)
    }

    fn filled(len: usize, byte: u8) -> Self {
        Self {
            bytes: vec![byte; len.div_ceil(8)].into_boxed_slice(),
            len,
        }
    }

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

    #[inline]
    fn locate(&self, bit: usize) -> (usize, u8) {
        assert!(bit < self.len, "bit vector: bit {bit} out of range (len {})", self.len);
        (bit / 8, 1 << (bit % 8))
    }

    /// # Panics
    /// If `bit` is out of range.
    #[must_use]
    pub fn test(&self, bit: usize) -> bool {
        let (byte, mask) = self.locate(bit);
        self.bytes[byte] & mask != 0
    }

    /// # Panics
    /// If `bit` is out of range.
    pub fn set(&mut self, bit: usize) {
        let (byte, mask) = self.locate(bit);
        self.bytes[byte] |= mask;
    }

    /// # Panics
    /// If `bit` is out of range.
    pub fn clear(&mut self, bit: usize) {
        let (byte, mask) = self.locate(bit);
        self.bytes[byte] &= !mask;
    }

    /// Index of the first clear bit below `limit`, scanning up from bit 0.
    #[must_use]
    pub fn scan_first_clear(&self, limit: usize) -> Option<usize> {
        (0..limit.min(self.len)).find(|&bit| !self.test(bit))
    }

    /// Number of clear bits.
    #[must_use]
    pub fn count_clear(&self) -> usize {
        (0..self.len).filter(|&bit| !self.test(bit)).count()
    }
}
