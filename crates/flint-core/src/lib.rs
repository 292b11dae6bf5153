//! flint-core: storage engine for single-file encrypted archives.
//!
//! A vault is one file: a fixed header, an AES-256-GCM sealed directory of
//! entry metadata, and a data region of gzip-compressed blobs addressed by
//! `(offset, compressed_size)`. Mutations never edit in place; they stream
//! a complete new vault into a sibling temp file and atomically rename it
//! over the original. Extraction verifies every entry's plaintext SHA-256.
//!
//! The front end (argument parsing, password prompting, progress display)
//! is a separate concern; this crate exposes the operations it needs:
//! create, add, list, extract, remove, info and validate.

pub mod cancel;
pub mod codec;
pub mod crypto;
pub mod directory;
pub mod error;
pub mod format;
pub mod vault;

pub use cancel::CancelToken;
pub use directory::{Directory, Entry};
pub use error::{Result, VaultError};
pub use format::{FORMAT_VERSION, FormatError, VaultHeader};
pub use vault::{
    AddOptions, ExtractOptions, PathPolicy, ProgressEvent, Vault, VaultCreator, VaultInfo,
};
