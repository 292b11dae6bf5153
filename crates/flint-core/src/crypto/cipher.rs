//! AES-256-GCM sealing of the directory blob.
//!
//! The vault reuses one `(key, nonce)` pair for every rewrite of the
//! directory. This is sound only because the whole directory is re-encrypted
//! from scratch each time; partial in-place updates of the ciphertext would
//! amount to nonce reuse across distinct plaintexts and are not offered by
//! this API.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use tracing::warn;

use super::{CryptoError, DerivedKey};
use crate::format::NONCE_LEN;

/// Seal `plaintext` into `ciphertext || tag` (tag is the trailing 16 bytes).
pub fn seal(
    key: &DerivedKey,
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.bytes()));
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| CryptoError::Seal(e.to_string()))
}

/// Open a sealed blob, verifying the trailing GCM tag.
pub fn open(
    key: &DerivedKey,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.bytes()));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| {
            warn!("directory decryption failed - authentication tag mismatch");
            CryptoError::DecryptAuth
        })
}
