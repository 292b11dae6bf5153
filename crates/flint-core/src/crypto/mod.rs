//! Cryptographic primitives for the vault envelope.
//!
//! The directory blob is the only encrypted region of a vault file: it is
//! sealed with AES-256-GCM under a key derived from the password via
//! PBKDF2-HMAC-SHA256. Data-region blobs are plaintext gzip streams whose
//! integrity is bound by the per-entry SHA-256 digests stored inside the
//! encrypted directory.

pub mod cipher;
pub mod keys;

use thiserror::Error;

/// Errors from the crypto layer.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Cipher construction failed. Not recoverable.
    #[error("cipher initialization failed")]
    Init,

    /// GCM tag verification failed.
    ///
    /// A wrong password and a tampered vault both land here; the two are
    /// cryptographically indistinguishable and callers must not be told
    /// which occurred.
    #[error("authentication failed")]
    DecryptAuth,

    /// Sealing the directory failed unexpectedly.
    #[error("encryption failed: {0}")]
    Seal(String),
}

pub use keys::{DerivedKey, KEY_LEN, digests_match};
