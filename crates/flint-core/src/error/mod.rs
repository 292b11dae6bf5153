//! Error types for the vault storage engine.
//!
//! Every fallible operation in this crate surfaces a [`VaultError`]. The
//! variants are deliberately coarse: callers (a CLI, a library user) need to
//! distinguish wrong-password from not-found from I/O, not the precise
//! internal step that failed. Finer-grained causes live in the per-module
//! error types ([`FormatError`], [`CryptoError`]) and are carried as sources.

use std::path::PathBuf;

use thiserror::Error;

pub use crate::crypto::CryptoError;
pub use crate::format::FormatError;

/// Convenience alias used throughout the crate.
pub type Result<T, E = VaultError> = std::result::Result<T, E>;

/// Top-level error taxonomy for vault operations.
#[derive(Error, Debug)]
pub enum VaultError {
    /// A caller-supplied argument was unusable (empty password, empty path,
    /// non-existent source, non-UTF-8 path).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Vault creation targeted a path that already exists.
    #[error("vault already exists at {0}")]
    AlreadyExists(PathBuf),

    /// A requested path matched no entry in the vault.
    #[error("no entry matches '{0}'")]
    NotFound(String),

    /// The file is not a vault, or is a vault this build cannot read.
    #[error("bad vault format: {0}")]
    BadFormat(#[from] FormatError),

    /// Directory decryption or post-decrypt parsing failed.
    ///
    /// Wrong password and a tampered vault are cryptographically
    /// indistinguishable here, and this variant intentionally does not say
    /// which occurred.
    #[error("wrong password or corrupted vault")]
    AuthOrCorrupt,

    /// An extracted entry's bytes did not match its stored SHA-256.
    #[error("integrity check failed for '{path}'")]
    IntegrityFailed { path: String },

    /// An underlying filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation was cancelled or its deadline expired.
    #[error("operation cancelled")]
    Cancelled,
}

impl From<CryptoError> for VaultError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::DecryptAuth => VaultError::AuthOrCorrupt,
            CryptoError::Init | CryptoError::Seal(_) => {
                VaultError::Io(std::io::Error::other(err.to_string()))
            }
        }
    }
}
