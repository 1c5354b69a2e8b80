//! `BlockStore` — the block device's backing file.
//!
//! A regular file pre-sized to `blocks * block_size` and addressed by block
//! index with positional I/O (`pread`/`pwrite`), so no shared seek cursor.
//! The file is extended sparsely with one write at the last block; regions
//! never written read back as zeros.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("block {block} out of range (device has {blocks} blocks)")]
    OutOfRange { block: u32, blocks: u32 },
    #[error("write of {len} bytes exceeds block size {block_size}")]
    TooLarge { len: usize, block_size: usize },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug)]
pub struct BlockStore {
    file: File,
    blocks: u32,
    block_size: usize,
}

impl BlockStore {
    /// Open (creating if absent) and pre-size the backing file.
    pub fn open(path: &Path, blocks: u32, block_size: usize) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        ensure_capacity(&file, blocks, block_size)?;
        info!(path = %path.display(), blocks, block_size, "block store ready");
        Ok(Self {
            file,
            blocks,
            block_size,
        })
    }

    pub fn blocks(&self) -> u32 {
        self.blocks
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn offset(&self, block: u32) -> Result<u64, StoreError> {
        if block >= self.blocks {
            return Err(StoreError::OutOfRange {
                block,
                blocks: self.blocks,
            });
        }
        Ok(block as u64 * self.block_size as u64)
    }

    /// Exactly `block_size` bytes.
    pub fn read_block(&self, block: u32) -> Result<Vec<u8>, StoreError> {
        let offset = self.offset(block)?;
        let mut buf = vec![0u8; self.block_size];
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break, // past EOF: leave zeros
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(buf)
    }

    /// Writes exactly `block_size` bytes, zero-padding short input.
    pub fn write_block(&self, block: u32, data: &[u8]) -> Result<(), StoreError> {
        let offset = self.offset(block)?;
        if data.len() > self.block_size {
            return Err(StoreError::TooLarge {
                len: data.len(),
                block_size: self.block_size,
            });
        }
        if data.len() == self.block_size {
            self.file.write_all_at(data, offset)?;
        } else {
            let mut padded = vec![0u8; self.block_size];
            padded[..data.len()].copy_from_slice(data);
            self.file.write_all_at(&padded, offset)?;
        }
        debug!(block, "block written");
        Ok(())
    }
}

fn ensure_capacity(file: &File, blocks: u32, block_size: usize) -> io::Result<()> {
    let capacity = blocks as u64 * block_size as u64;
    let len = file.metadata()?.len();
    if len >= capacity || blocks == 0 {
        return Ok(());
    }
    let last = capacity - block_size as u64;
    match file.write_all_at(&vec![0u8; block_size], last) {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!(error = %e, "sparse extension failed, materializing backing file");
            materialize(file, len, capacity, block_size)
        }
    }
}

/// Zero-fill `from..capacity`, leaving existing bytes untouched.
fn materialize(file: &File, from: u64, capacity: u64, block_size: usize) -> io::Result<()> {
    let zeros = vec![0u8; block_size];
    let mut offset = from;
    let partial = (from % block_size as u64) as usize;
    if partial != 0 && offset < capacity {
        file.write_all_at(&zeros[partial..], offset)?;
        offset += (block_size - partial) as u64;
    }
    while offset < capacity {
        file.write_all_at(&zeros, offset)?;
        offset += block_size as u64;
    }
    Ok(())
}
