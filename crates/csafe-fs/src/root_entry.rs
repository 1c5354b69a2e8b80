//! Root directory slots.
//!
//! ```text
//! 0        32          36         40        56        72
//! | hash   | main (BE) | reserved | meta_iv | meta_ct |
//! ```
//!
//! `meta_ct` is one AES block: `file_size u64 BE | 8 random bytes`.
//! A slot whose hash is all zeros is empty. Slots never straddle blocks;
//! trailing bytes of a root block are unused.

use rand::RngCore;

use crate::cipher::{decrypt_in_place, encrypt_in_place, random_iv, Iv};
use crate::error::{FsError, Result};
use crate::key::{UserKey, HASH_SIZE};

pub const ROOT_ENTRY_SIZE: usize = 72;

const MAIN_OFFSET: usize = HASH_SIZE;
const IV_OFFSET: usize = 40;
const META_OFFSET: usize = 56;
const META_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootEntry {
    pub keyed_hash: [u8; HASH_SIZE],
    pub main_block: u32,
    meta_iv: Iv,
    meta_ct: [u8; META_SIZE],
}

impl RootEntry {
    pub fn new(key: &UserKey, filename: &str, main_block: u32, file_size: u64) -> Result<Self> {
        let mut meta = [0u8; META_SIZE];
        meta[..8].copy_from_slice(&file_size.to_be_bytes());
        rand::thread_rng().fill_bytes(&mut meta[8..]);
        let meta_iv = random_iv();
        encrypt_in_place(key, &meta_iv, &mut meta)?;
        Ok(Self {
            keyed_hash: key.keyed_hash(filename)?,
            main_block,
            meta_iv,
            meta_ct: meta,
        })
    }

    /// `bytes` must hold at least `ROOT_ENTRY_SIZE` bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ROOT_ENTRY_SIZE {
            return Err(FsError::Corrupt(format!("root entry of {} bytes", bytes.len())));
        }
        let mut keyed_hash = [0u8; HASH_SIZE];
        keyed_hash.copy_from_slice(&bytes[..HASH_SIZE]);
        let mut main = [0u8; 4];
        main.copy_from_slice(&bytes[MAIN_OFFSET..MAIN_OFFSET + 4]);
        let mut meta_iv = [0u8; 16];
        meta_iv.copy_from_slice(&bytes[IV_OFFSET..META_OFFSET]);
        let mut meta_ct = [0u8; META_SIZE];
        meta_ct.copy_from_slice(&bytes[META_OFFSET..ROOT_ENTRY_SIZE]);
        Ok(Self {
            keyed_hash,
            main_block: u32::from_be_bytes(main),
            meta_iv,
            meta_ct,
        })
    }

    pub fn encode(&self) -> [u8; ROOT_ENTRY_SIZE] {
        let mut out = [0u8; ROOT_ENTRY_SIZE];
        out[..HASH_SIZE].copy_from_slice(&self.keyed_hash);
        out[MAIN_OFFSET..MAIN_OFFSET + 4].copy_from_slice(&self.main_block.to_be_bytes());
        out[IV_OFFSET..META_OFFSET].copy_from_slice(&self.meta_iv);
        out[META_OFFSET..].copy_from_slice(&self.meta_ct);
        out
    }

    pub fn is_empty(&self) -> bool {
        self.keyed_hash.iter().all(|&b| b == 0)
    }

    /// Decrypt the stored file size.
    pub fn file_size(&self, key: &UserKey) -> Result<u64> {
        let mut meta = self.meta_ct;
        decrypt_in_place(key, &self.meta_iv, &mut meta)?;
        let mut size = [0u8; 8];
        size.copy_from_slice(&meta[..8]);
        Ok(u64::from_be_bytes(size))
    }

    /// Store this entry in the first empty slot of `root_block`. Returns the
    /// slot index.
    pub fn insert_into(&self, root_block: &mut [u8]) -> Result<usize> {
        let slots = root_block.len() / ROOT_ENTRY_SIZE;
        for slot in 0..slots {
            let at = slot * ROOT_ENTRY_SIZE;
            if root_block[at..at + HASH_SIZE].iter().all(|&b| b == 0) {
                root_block[at..at + ROOT_ENTRY_SIZE].copy_from_slice(&self.encode());
                return Ok(slot);
            }
        }
        Err(FsError::RootFull)
    }
}

/// Scan one root block for `filename` under `key`.
///
/// Empty slots are skipped; the scan stops at the first match. Hashes are
/// compared in constant time.
pub fn find_entry(root_block: &[u8], key: &UserKey, filename: &str) -> Result<Option<RootEntry>> {
    let matcher = key.name_matcher(filename)?;
    for slot in root_block.chunks_exact(ROOT_ENTRY_SIZE) {
        let entry = RootEntry::parse(slot)?;
        if entry.is_empty() {
            continue;
        }
        if matcher.matches(&entry.keyed_hash) {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}
