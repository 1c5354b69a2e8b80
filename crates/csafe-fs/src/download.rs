//! `Download` — socket-free read path.
//!
//! The caller alternates between `poll()` and `resume()`:
//!
//! ```text
//! poll ─► Fetch(n) ─► (caller reads block n) ─► resume(bytes) ─► poll ...
//! ```
//!
//! `poll()` never asks for more than one block before the matching
//! `resume()`; the next pointer is only known once the current block is in.
//! Lookup order is root blocks `0..root_blocks`, then the main block, then
//! for each directory block its data blocks in file order.

use tracing::trace;

use crate::cipher::open_block;
use crate::error::{FsError, Result};
use crate::geometry::Geometry;
use crate::key::{NameMatcher, UserKey};
use crate::layout::pointer_at;
use crate::root_entry::{RootEntry, ROOT_ENTRY_SIZE};

/// What the traversal needs next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Read this global block and hand it to `resume()`.
    Fetch(u32),
    /// The root entry was found. Reported once, before any data.
    Located { file_size: u64 },
    /// Decrypted plaintext, in file order.
    Data(Vec<u8>),
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ScanRoot(u32),
    AwaitingRootBlock(u32),
    Located(u32),
    FetchMain(u32),
    AwaitingMainBlock,
    NextBlock,
    AwaitingDirectoryBlock,
    AwaitingDataBlock,
    Done,
}

pub struct Download {
    key: UserKey,
    matcher: NameMatcher,
    filename: String,
    geometry: Geometry,
    root_blocks: u32,
    state: State,
    file_size: u64,
    remaining: u64,
    data_index: u64,
    main: Vec<u8>,
    main_index: usize,
    dir: Vec<u8>,
    dir_index: usize,
    ready: Option<Vec<u8>>,
}

impl Download {
    pub fn new(key: UserKey, filename: &str, geometry: Geometry, root_blocks: u32) -> Result<Self> {
        let matcher = key.name_matcher(filename)?;
        Ok(Self {
            key,
            matcher,
            filename: filename.to_string(),
            geometry,
            root_blocks,
            state: State::ScanRoot(0),
            file_size: 0,
            remaining: 0,
            data_index: 0,
            main: Vec::new(),
            main_index: 0,
            dir: Vec::new(),
            dir_index: 0,
            ready: None,
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Bytes not yet returned through `Step::Data`.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Done && self.ready.is_none()
    }

    pub fn poll(&mut self) -> Result<Step> {
        if let Some(chunk) = self.ready.take() {
            return Ok(Step::Data(chunk));
        }
        match self.state {
            State::ScanRoot(block) => {
                if block >= self.root_blocks {
                    return Err(FsError::NotFound {
                        filename: self.filename.clone(),
                    });
                }
                self.state = State::AwaitingRootBlock(block);
                Ok(Step::Fetch(block))
            }
            State::Located(main) => {
                self.state = if self.file_size == 0 {
                    State::Done
                } else {
                    State::FetchMain(main)
                };
                Ok(Step::Located {
                    file_size: self.file_size,
                })
            }
            State::FetchMain(main) => {
                if main < self.root_blocks {
                    return Err(FsError::Corrupt(format!(
                        "main block {} inside root region",
                        main
                    )));
                }
                self.state = State::AwaitingMainBlock;
                Ok(Step::Fetch(main))
            }
            State::NextBlock => self.next_block(),
            State::Done => Ok(Step::Finished),
            State::AwaitingRootBlock(_)
            | State::AwaitingMainBlock
            | State::AwaitingDirectoryBlock
            | State::AwaitingDataBlock => Err(FsError::Pending),
        }
    }

    fn next_block(&mut self) -> Result<Step> {
        if self.remaining == 0 {
            self.state = State::Done;
            return Ok(Step::Finished);
        }
        let dir_exhausted =
            self.dir.is_empty() || self.dir_index >= self.geometry.pointers_per_block();
        if dir_exhausted {
            let dir = pointer_at(&self.main, self.main_index).ok_or_else(|| {
                FsError::Corrupt(format!(
                    "main block ends with {} bytes undelivered",
                    self.remaining
                ))
            })?;
            self.main_index += 1;
            self.state = State::AwaitingDirectoryBlock;
            return Ok(Step::Fetch(dir));
        }
        let data = pointer_at(&self.dir, self.dir_index).ok_or_else(|| {
            FsError::Corrupt(format!(
                "directory block ends with {} bytes undelivered",
                self.remaining
            ))
        })?;
        self.dir_index += 1;
        self.state = State::AwaitingDataBlock;
        Ok(Step::Fetch(data))
    }

    /// Deliver the block requested by the last `Step::Fetch`.
    pub fn resume(&mut self, block: Vec<u8>) -> Result<()> {
        if block.len() != self.geometry.block_size() {
            return Err(FsError::Corrupt(format!(
                "block of {} bytes, expected {}",
                block.len(),
                self.geometry.block_size()
            )));
        }
        match self.state {
            State::AwaitingRootBlock(n) => {
                self.state = match self.scan(&block)? {
                    Some(entry) => {
                        let size = entry.file_size(&self.key)?;
                        if size > self.geometry.max_file_size() {
                            return Err(FsError::Corrupt(format!(
                                "file size {} exceeds maximum {}",
                                size,
                                self.geometry.max_file_size()
                            )));
                        }
                        trace!(root_block = n, main_block = entry.main_block, size, "root entry found");
                        self.file_size = size;
                        self.remaining = size;
                        State::Located(entry.main_block)
                    }
                    None => State::ScanRoot(n + 1),
                };
            }
            State::AwaitingMainBlock => {
                self.main = block;
                self.main_index = 0;
                self.state = State::NextBlock;
            }
            State::AwaitingDirectoryBlock => {
                self.dir = block;
                self.dir_index = 0;
                self.state = State::NextBlock;
            }
            State::AwaitingDataBlock => {
                let len = self.geometry.chunk_len(self.data_index, self.file_size);
                let plain = open_block(&self.key, &block, len)?;
                self.data_index += 1;
                self.remaining -= plain.len() as u64;
                self.ready = Some(plain);
                self.state = State::NextBlock;
            }
            _ => return Err(FsError::UnexpectedBlock),
        }
        Ok(())
    }

    fn scan(&self, block: &[u8]) -> Result<Option<RootEntry>> {
        for slot in block.chunks_exact(ROOT_ENTRY_SIZE) {
            let entry = RootEntry::parse(slot)?;
            if !entry.is_empty() && self.matcher.matches(&entry.keyed_hash) {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{FileWriter, SequentialAllocator};
    use std::collections::HashMap;

    struct Disk {
        geometry: Geometry,
        blocks: HashMap<u32, Vec<u8>>,
        reads: usize,
    }

    impl Disk {
        fn new(geometry: Geometry) -> Self {
            Self {
                geometry,
                blocks: HashMap::new(),
                reads: 0,
            }
        }

        fn read(&mut self, n: u32) -> Vec<u8> {
            self.reads += 1;
            self.blocks
                .get(&n)
                .cloned()
                .unwrap_or_else(|| vec![0u8; self.geometry.block_size()])
        }

        fn put(&mut self, secret: &str, name: &str, data: &[u8], alloc: &mut SequentialAllocator, root: u32) {
            let key = UserKey::derive(secret.as_bytes());
            let file = FileWriter::encode(&key, name, data, self.geometry, alloc).unwrap();
            for (n, b) in file.blocks {
                self.blocks.insert(n, b);
            }
            let mut root_block = self.read(root);
            file.entry.insert_into(&mut root_block).unwrap();
            self.blocks.insert(root, root_block);
        }
    }

    /// Drive a download to the end. Returns (located size, bytes, chunks).
    fn fetch_all(disk: &mut Disk, secret: &str, name: &str, root_blocks: u32) -> Result<(u64, Vec<u8>, usize)> {
        let key = UserKey::derive(secret.as_bytes());
        let mut dl = Download::new(key, name, disk.geometry, root_blocks)?;
        let mut out = Vec::new();
        let mut located = None;
        let mut chunks = 0;
        loop {
            match dl.poll()? {
                Step::Fetch(n) => {
                    assert_eq!(dl.poll(), Err(FsError::Pending));
                    dl.resume(disk.read(n))?;
                }
                Step::Located { file_size } => {
                    assert!(located.is_none());
                    located = Some(file_size);
                }
                Step::Data(chunk) => {
                    chunks += 1;
                    out.extend_from_slice(&chunk);
                }
                Step::Finished => break,
            }
        }
        assert!(dl.is_finished());
        assert_eq!(dl.remaining(), 0);
        Ok((located.unwrap_or(0), out, chunks))
    }

    #[test]
    fn thousand_bytes_at_512_emit_exactly_1000() {
        let g = Geometry::new(512);
        let mut disk = Disk::new(g);
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        disk.put("alice:pw", "report.txt", &data, &mut SequentialAllocator::new(1, 64), 0);

        let (size, bytes, chunks) = fetch_all(&mut disk, "alice:pw", "report.txt", 1).unwrap();
        assert_eq!(size, 1000);
        assert_eq!(chunks, 3);
        assert_eq!(bytes, data);
    }

    #[test]
    fn wrong_credential_looks_like_missing_file() {
        let g = Geometry::new(512);
        let mut disk = Disk::new(g);
        disk.put("alice:pw", "report.txt", b"top secret", &mut SequentialAllocator::new(1, 64), 0);

        let wrong = fetch_all(&mut disk, "alice:guess", "report.txt", 1).unwrap_err();
        let missing = fetch_all(&mut disk, "alice:pw", "nothing.txt", 1).unwrap_err();
        assert_eq!(wrong.to_string(), missing.to_string().replace("nothing.txt", "report.txt"));
        assert!(matches!(wrong, FsError::NotFound { .. }));
    }

    #[test]
    fn later_root_block_and_multiple_directories() {
        let g = Geometry::new(128);
        let mut disk = Disk::new(g);
        let mut alloc = SequentialAllocator::new(2, 200);
        // fill root block 0 with foreign entries so the match lands in block 1
        for i in 0..g.entries_per_block() {
            disk.put("bob:pw", &format!("f{}", i), b"x", &mut alloc, 0);
        }
        let data: Vec<u8> = (0..(40 * 112 + 5)).map(|i| i as u8).collect();
        disk.put("alice:pw", "big.bin", &data, &mut alloc, 1);

        let (size, bytes, chunks) = fetch_all(&mut disk, "alice:pw", "big.bin", 2).unwrap();
        assert_eq!(size, data.len() as u64);
        assert_eq!(chunks, 41);
        assert_eq!(bytes, data);
    }

    #[test]
    fn empty_file_finishes_without_fetching_data() {
        let g = Geometry::new(128);
        let mut disk = Disk::new(g);
        disk.put("a:b", "empty", b"", &mut SequentialAllocator::new(1, 10), 0);
        disk.reads = 0;
        let (size, bytes, chunks) = fetch_all(&mut disk, "a:b", "empty", 1).unwrap();
        assert_eq!((size, bytes.len(), chunks), (0, 0, 0));
        assert_eq!(disk.reads, 1);
    }

    #[test]
    fn out_of_order_resume_is_rejected() {
        let g = Geometry::new(128);
        let mut dl = Download::new(UserKey::derive(b"k"), "f", g, 1).unwrap();
        assert_eq!(dl.resume(vec![0u8; 128]), Err(FsError::UnexpectedBlock));
        assert_eq!(dl.poll(), Ok(Step::Fetch(0)));
        assert!(matches!(dl.resume(vec![0u8; 64]), Err(FsError::Corrupt(_))));
    }

    #[test]
    fn truncated_pointer_chain_is_corrupt() {
        let g = Geometry::new(128);
        let mut disk = Disk::new(g);
        disk.put("a:b", "f", &[3u8; 300], &mut SequentialAllocator::new(1, 10), 0);
        // wipe the directory block (main=1, dir=2)
        disk.blocks.insert(2, vec![0u8; 128]);
        assert!(matches!(
            fetch_all(&mut disk, "a:b", "f", 1),
            Err(FsError::Corrupt(_))
        ));
    }
}
