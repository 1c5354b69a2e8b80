//! Write path: lay a plaintext file out as encrypted blocks.
//!
//! The encoder only produces blocks; callers write them to the devices and
//! then store `entry` in a root block. Concurrent writers to one file are
//! not supported.

use tracing::debug;

use crate::cipher::seal_block;
use crate::error::{FsError, Result};
use crate::geometry::Geometry;
use crate::key::UserKey;
use crate::layout::{encode_pointers, NO_BLOCK};
use crate::root_entry::RootEntry;

/// Hands out free global block numbers.
pub trait BlockAllocator {
    fn allocate(&mut self) -> Result<u32>;
}

/// Allocates `[next, end)` in order.
#[derive(Debug, Clone)]
pub struct SequentialAllocator {
    next: u32,
    end: u32,
}

impl SequentialAllocator {
    pub fn new(first: u32, end: u32) -> Self {
        Self { next: first, end }
    }

    pub fn next_free(&self) -> u32 {
        self.next
    }
}

impl BlockAllocator for SequentialAllocator {
    fn allocate(&mut self) -> Result<u32> {
        if self.next >= self.end {
            return Err(FsError::NoSpace);
        }
        let n = self.next;
        self.next += 1;
        Ok(n)
    }
}

#[derive(Debug, Clone)]
pub struct EncodedFile {
    pub entry: RootEntry,
    /// `(global block number, block bytes)` for every block of the file.
    pub blocks: Vec<(u32, Vec<u8>)>,
}

pub struct FileWriter;

impl FileWriter {
    pub fn encode(
        key: &UserKey,
        filename: &str,
        data: &[u8],
        geometry: Geometry,
        allocator: &mut dyn BlockAllocator,
    ) -> Result<EncodedFile> {
        let size = data.len() as u64;
        if size > geometry.max_file_size() {
            return Err(FsError::FileTooLarge {
                size,
                max: geometry.max_file_size(),
            });
        }
        if data.is_empty() {
            return Ok(EncodedFile {
                entry: RootEntry::new(key, filename, NO_BLOCK, 0)?,
                blocks: Vec::new(),
            });
        }

        let main_block = allocator.allocate()?;
        let mut blocks = Vec::new();
        let mut dir_pointers = Vec::new();
        for group in data
            .chunks(geometry.capacity())
            .collect::<Vec<_>>()
            .chunks(geometry.pointers_per_block())
        {
            let dir_block = allocator.allocate()?;
            dir_pointers.push(dir_block);
            let mut data_pointers = Vec::with_capacity(group.len());
            for chunk in group {
                let n = allocator.allocate()?;
                blocks.push((n, seal_block(key, chunk, geometry)?));
                data_pointers.push(n);
            }
            blocks.push((dir_block, encode_pointers(&data_pointers, geometry)?));
        }
        blocks.push((main_block, encode_pointers(&dir_pointers, geometry)?));
        debug!(filename, size, main_block, blocks = blocks.len(), "file encoded");

        Ok(EncodedFile {
            entry: RootEntry::new(key, filename, main_block, size)?,
            blocks,
        })
    }
}
