//! Fixed-size bitmap
//!
//! Inline bitmap used for SPI allocation tables and per-vCPU interrupt
//! bitfields. Storage is an array of 32-bit words so that a word index maps
//! directly onto the matching GIC register word.

/// Bitmap with `WORDS * 32` bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bitmap<const WORDS: usize> {
    words: [u32; WORDS],
}

impl<const WORDS: usize> Default for Bitmap<WORDS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const WORDS: usize> Bitmap<WORDS> {
    /// Number of bits held by the bitmap
    pub const BITS: usize = WORDS * 32;

    /// Create an empty bitmap
    pub const fn new() -> Self {
        Self { words: [0; WORDS] }
    }

    /// Get the number of bits
    pub const fn bits(&self) -> usize {
        Self::BITS
    }

    /// Test if a bit is set
    pub fn test(&self, index: usize) -> bool {
        if index >= Self::BITS {
            return false;
        }
        (self.words[index / 32] >> (index % 32)) & 1 == 1
    }

    /// Set a bit to the given value, returns false if out of range
    pub fn set(&mut self, index: usize, value: bool) -> bool {
        if index >= Self::BITS {
            return false;
        }
        let mask = 1u32 << (index % 32);
        if value {
            self.words[index / 32] |= mask;
        } else {
            self.words[index / 32] &= !mask;
        }
        true
    }

    /// Set a bit to 1
    pub fn set_bit(&mut self, index: usize) -> bool {
        self.set(index, true)
    }

    /// Clear a bit to 0
    pub fn clear_bit(&mut self, index: usize) -> bool {
        self.set(index, false)
    }

    /// Clear every bit
    pub fn clear_all(&mut self) {
        self.words = [0; WORDS];
    }

    /// Raw word access
    pub fn word(&self, index: usize) -> u32 {
        self.words.get(index).copied().unwrap_or(0)
    }

    /// Find the first set bit
    pub fn find_first_set(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, w)| **w != 0)
            .map(|(i, w)| i * 32 + w.trailing_zeros() as usize)
    }

    /// Find the first zero bit
    pub fn find_first_zero(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, w)| **w != u32::MAX)
            .map(|(i, w)| i * 32 + (!*w).trailing_zeros() as usize)
    }

    /// Count the number of set bits
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterate over the indexes of set bits
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..Self::BITS).filter(move |&i| self.test(i))
    }

    /// First bit set in both bitmaps
    pub fn first_common(&self, other: &Self) -> Option<usize> {
        self.words
            .iter()
            .zip(other.words.iter())
            .enumerate()
            .find(|(_, (a, b))| **a & **b != 0)
            .map(|(i, (a, b))| i * 32 + (a & b).trailing_zeros() as usize)
    }

    /// Bitwise AND of two bitmaps
    pub fn and(&self, other: &Self) -> Self {
        let mut out = *self;
        for (w, o) in out.words.iter_mut().zip(other.words.iter()) {
            *w &= *o;
        }
        out
    }

    /// Merge `other` into `self`
    pub fn union_with(&mut self, other: &Self) {
        for (w, o) in self.words.iter_mut().zip(other.words.iter()) {
            *w |= *o;
        }
    }
}
