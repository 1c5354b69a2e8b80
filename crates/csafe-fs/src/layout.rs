//! Pointer blocks: arrays of big-endian `u32` block numbers.
//!
//! Block 0 is always part of the root region, so `0` doubles as the
//! "no pointer" sentinel. Unused trailing slots are zero.

use crate::error::{FsError, Result};
use crate::geometry::{Geometry, POINTER_SIZE};

pub const NO_BLOCK: u32 = 0;

/// Pointer at `index`, or `None` past the end of the block or at a sentinel.
pub fn pointer_at(block: &[u8], index: usize) -> Option<u32> {
    let at = index.checked_mul(POINTER_SIZE)?;
    let bytes = block.get(at..at + POINTER_SIZE)?;
    let mut raw = [0u8; POINTER_SIZE];
    raw.copy_from_slice(bytes);
    match u32::from_be_bytes(raw) {
        NO_BLOCK => None,
        n => Some(n),
    }
}

pub fn encode_pointers(pointers: &[u32], geometry: Geometry) -> Result<Vec<u8>> {
    if pointers.len() > geometry.pointers_per_block() {
        return Err(FsError::Corrupt(format!(
            "{} pointers exceed block capacity {}",
            pointers.len(),
            geometry.pointers_per_block()
        )));
    }
    let mut block = vec![0u8; geometry.block_size()];
    for (slot, p) in block.chunks_exact_mut(POINTER_SIZE).zip(pointers) {
        slot.copy_from_slice(&p.to_be_bytes());
    }
    Ok(block)
}
