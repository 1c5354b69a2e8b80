//! Per-user key material.
//!
//! `user_key = SHA-256(secret)[..16]`, an AES-128 key.
//! Filenames are identified by `HMAC-SHA256(key = user_key, msg = filename)`
//! so an entry is unrecognizable without the key.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{FsError, Result};

type HmacSha256 = Hmac<Sha256>;

pub const KEY_SIZE: usize = 16;
pub const HASH_SIZE: usize = 32;

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct UserKey([u8; KEY_SIZE]);

impl UserKey {
    pub fn derive(secret: &[u8]) -> Self {
        let mut digest = Sha256::digest(secret);
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&digest[..KEY_SIZE]);
        digest.as_mut_slice().zeroize();
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    fn mac(&self, filename: &str) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.0).map_err(|_| FsError::Cipher)?;
        mac.update(filename.as_bytes());
        Ok(mac)
    }

    pub fn keyed_hash(&self, filename: &str) -> Result<[u8; HASH_SIZE]> {
        let digest = self.mac(filename)?.finalize().into_bytes();
        let mut out = [0u8; HASH_SIZE];
        out.copy_from_slice(&digest);
        Ok(out)
    }

    /// Matcher for repeated comparisons against root slots.
    pub fn name_matcher(&self, filename: &str) -> Result<NameMatcher> {
        Ok(NameMatcher(self.mac(filename)?))
    }
}

impl std::fmt::Debug for UserKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("UserKey(..)")
    }
}

/// Compares candidate hashes in constant time.
#[derive(Clone)]
pub struct NameMatcher(HmacSha256);

impl NameMatcher {
    pub fn matches(&self, candidate: &[u8]) -> bool {
        self.0.clone().verify_slice(candidate).is_ok()
    }
}
