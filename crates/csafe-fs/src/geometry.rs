//! Block geometry derived from the block size.

use csafe_core::constants::{BLOCK_SIZE, IV_SIZE};

use crate::root_entry::ROOT_ENTRY_SIZE;

/// Width of one block pointer.
pub const POINTER_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    block_size: usize,
}

impl Default for Geometry {
    fn default() -> Self {
        Self::new(BLOCK_SIZE)
    }
}

impl Geometry {
    /// `block_size` must already be validated (multiple of 16, >= 128).
    pub const fn new(block_size: usize) -> Self {
        Self { block_size }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Plaintext bytes per data block.
    pub fn capacity(&self) -> usize {
        self.block_size - IV_SIZE
    }

    pub fn pointers_per_block(&self) -> usize {
        self.block_size / POINTER_SIZE
    }

    pub fn entries_per_block(&self) -> usize {
        self.block_size / ROOT_ENTRY_SIZE
    }

    pub fn max_file_size(&self) -> u64 {
        let ppb = self.pointers_per_block() as u64;
        ppb * ppb * self.capacity() as u64
    }

    pub fn data_blocks(&self, file_size: u64) -> u64 {
        file_size.div_ceil(self.capacity() as u64)
    }

    /// Plaintext length of data block `index` in a file of `file_size`
    /// bytes. Zero past the end.
    pub fn chunk_len(&self, index: u64, file_size: u64) -> usize {
        let cap = self.capacity() as u64;
        let start = index.saturating_mul(cap);
        if start >= file_size {
            return 0;
        }
        (file_size - start).min(cap) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_blocks() {
        let g = Geometry::new(512);
        assert_eq!(g.capacity(), 496);
        assert_eq!(g.pointers_per_block(), 128);
        assert_eq!(g.entries_per_block(), 7);
        assert_eq!(g.max_file_size(), 128 * 128 * 496);
        assert_eq!(g.data_blocks(1000), 3);
        assert_eq!(
            (0..4).map(|i| g.chunk_len(i, 1000)).collect::<Vec<_>>(),
            vec![496, 496, 8, 0]
        );
    }

    #[test]
    fn exact_multiple_has_no_short_tail() {
        let g = Geometry::new(512);
        assert_eq!(g.data_blocks(992), 2);
        assert_eq!(g.chunk_len(1, 992), 496);
        assert_eq!(g.data_blocks(0), 0);
    }
}
