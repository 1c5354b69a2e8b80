//! AES-128-CBC over whole blocks.
//!
//! Inputs are always a multiple of the AES block, so no padding scheme is
//! applied. Data blocks pad their plaintext with random bytes instead and
//! the reader truncates by the known chunk length.

use aes::Aes128;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use csafe_core::constants::IV_SIZE;
use rand::RngCore;

use crate::error::{FsError, Result};
use crate::geometry::Geometry;
use crate::key::UserKey;

type Encryptor = cbc::Encryptor<Aes128>;
type Decryptor = cbc::Decryptor<Aes128>;

pub type Iv = [u8; IV_SIZE];

pub fn random_iv() -> Iv {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// Encrypt `buf` in place. `buf.len()` must be a multiple of 16.
pub fn encrypt_in_place(key: &UserKey, iv: &Iv, buf: &mut [u8]) -> Result<()> {
    let len = buf.len();
    Encryptor::new_from_slices(key.as_bytes(), iv)
        .map_err(|_| FsError::Cipher)?
        .encrypt_padded_mut::<NoPadding>(buf, len)
        .map_err(|_| FsError::Cipher)?;
    Ok(())
}

/// Decrypt `buf` in place. `buf.len()` must be a multiple of 16.
pub fn decrypt_in_place(key: &UserKey, iv: &Iv, buf: &mut [u8]) -> Result<()> {
    Decryptor::new_from_slices(key.as_bytes(), iv)
        .map_err(|_| FsError::Cipher)?
        .decrypt_padded_mut::<NoPadding>(buf)
        .map_err(|_| FsError::Cipher)?;
    Ok(())
}

/// Build one on-disk data block: `iv | E(plaintext | random pad)`.
pub fn seal_block(key: &UserKey, plaintext: &[u8], geometry: Geometry) -> Result<Vec<u8>> {
    if plaintext.len() > geometry.capacity() {
        return Err(FsError::Corrupt(format!(
            "chunk of {} bytes exceeds block capacity {}",
            plaintext.len(),
            geometry.capacity()
        )));
    }
    let iv = random_iv();
    let mut block = vec![0u8; geometry.block_size()];
    block[..IV_SIZE].copy_from_slice(&iv);
    let body = &mut block[IV_SIZE..];
    body[..plaintext.len()].copy_from_slice(plaintext);
    rand::thread_rng().fill_bytes(&mut body[plaintext.len()..]);
    encrypt_in_place(key, &iv, body)?;
    Ok(block)
}

/// Recover the first `plain_len` plaintext bytes of an on-disk data block.
pub fn open_block(key: &UserKey, block: &[u8], plain_len: usize) -> Result<Vec<u8>> {
    if block.len() <= IV_SIZE || (block.len() - IV_SIZE) % IV_SIZE != 0 {
        return Err(FsError::Corrupt(format!("data block of {} bytes", block.len())));
    }
    if plain_len > block.len() - IV_SIZE {
        return Err(FsError::Corrupt(format!(
            "chunk of {} bytes exceeds block capacity {}",
            plain_len,
            block.len() - IV_SIZE
        )));
    }
    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&block[..IV_SIZE]);
    let mut body = block[IV_SIZE..].to_vec();
    decrypt_in_place(key, &iv, &mut body)?;
    body.truncate(plain_len);
    Ok(body)
}
