//! On-disk container layout.
//!
//! A vault file is `header || encrypted directory || data region`. The
//! header is a 96-byte packed little-endian record:
//!
//! | offset | size | field |
//! |-------:|-----:|-------|
//! | 0      | 8    | magic `FLINT001` |
//! | 8      | 4    | format version (u32) |
//! | 12     | 4    | PBKDF2 iterations (u32) |
//! | 16     | 32   | salt |
//! | 48     | 12   | nonce |
//! | 60     | 4    | padding (zero) |
//! | 64     | 8    | directory size (u64) |
//! | 72     | 24   | reserved (zero) |
//!
//! Padding and reserved bytes are written as zero and ignored on read. The
//! salt and nonce are generated once at creation and reused verbatim by
//! every rewrite; regenerating either would desynchronize the derived key
//! from the stored content.

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use rand::RngCore;
use thiserror::Error;
use tracing::debug;

use crate::error::{Result, VaultError};

/// File magic, first 8 bytes of every vault.
pub const MAGIC: [u8; 8] = *b"FLINT001";

/// Current container format version.
pub const FORMAT_VERSION: u32 = 2;

/// Fixed header length in bytes.
pub const HEADER_SIZE: u64 = 96;

/// Salt length for key derivation.
pub const SALT_LEN: usize = 32;

/// AES-GCM nonce length.
pub const NONCE_LEN: usize = 12;

/// PBKDF2 cost used when creating new vaults.
pub const DEFAULT_ITERATIONS: u32 = 100_000;

/// Lowest iteration count accepted when opening a vault.
pub const MIN_ITERATIONS: u32 = 10_000;

/// Highest iteration count accepted when opening a vault.
pub const MAX_ITERATIONS: u32 = 10_000_000;

/// Trailing GCM tag length of the encrypted directory blob.
pub(crate) const GCM_TAG_LEN: u64 = 16;

/// Structural errors detected before any cryptography runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// The first 8 bytes are not `FLINT001`.
    #[error("magic mismatch - not a vault file")]
    BadMagic,

    /// The header declares a format newer than this build understands.
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u32),

    /// The iteration count is outside `[10_000, 10_000_000]`, which points
    /// at corruption or a crafted file rather than a real vault.
    #[error("suspicious PBKDF2 iteration count {0}")]
    SuspiciousCost(u32),

    /// The file ended before a full header could be read.
    #[error("truncated header")]
    TruncatedHeader,

    /// The file is shorter than a header plus an empty sealed directory.
    #[error("file too small to be a vault ({len} bytes)")]
    TooSmall { len: u64 },
}

/// The fixed-size vault header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultHeader {
    pub version: u32,
    pub iterations: u32,
    pub salt: [u8; SALT_LEN],
    pub nonce: [u8; NONCE_LEN],
    /// Size in bytes of the encrypted directory blob that follows the header.
    pub directory_size: u64,
}

impl VaultHeader {
    /// Fresh header for a new vault: random salt and nonce from the OS RNG,
    /// current format version, directory size filled in once the directory
    /// is sealed.
    pub fn generate(iterations: u32) -> Self {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut salt);
        rand::rng().fill_bytes(&mut nonce);
        Self {
            version: FORMAT_VERSION,
            iterations,
            salt,
            nonce,
            directory_size: 0,
        }
    }

    /// Absolute offset of the first data-region byte.
    pub fn data_region_offset(&self) -> u64 {
        HEADER_SIZE + self.directory_size
    }

    /// Serialize the header into its 96-byte on-disk form.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.iterations.to_le_bytes());
        buf[16..48].copy_from_slice(&self.salt);
        buf[48..60].copy_from_slice(&self.nonce);
        // 60..64 padding, 72..96 reserved: already zero
        buf[64..72].copy_from_slice(&self.directory_size.to_le_bytes());
        writer.write_all(&buf)
    }

    /// Read and validate a header.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE as usize];
        reader.read_exact(&mut buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                VaultError::from(FormatError::TruncatedHeader)
            } else {
                VaultError::Io(e)
            }
        })?;

        if buf[0..8] != MAGIC {
            return Err(FormatError::BadMagic.into());
        }

        let version = u32::from_le_bytes(buf[8..12].try_into().expect("slice length"));
        if version > FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion(version).into());
        }

        let iterations = u32::from_le_bytes(buf[12..16].try_into().expect("slice length"));
        if !(MIN_ITERATIONS..=MAX_ITERATIONS).contains(&iterations) {
            return Err(FormatError::SuspiciousCost(iterations).into());
        }

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&buf[16..48]);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&buf[48..60]);
        let directory_size = u64::from_le_bytes(buf[64..72].try_into().expect("slice length"));

        Ok(Self {
            version,
            iterations,
            salt,
            nonce,
            directory_size,
        })
    }
}

/// Structural validation of a vault file without touching the directory
/// blob or the data region. No password required.
pub fn validate_file(path: &Path) -> Result<VaultHeader> {
    let len = fs::metadata(path)?.len();
    if len < HEADER_SIZE + GCM_TAG_LEN {
        return Err(FormatError::TooSmall { len }.into());
    }
    let mut file = fs::File::open(path)?;
    let header = VaultHeader::read_from(&mut file)?;
    debug!(
        version = header.version,
        iterations = header.iterations,
        directory_size = header.directory_size,
        "vault header validated"
    );
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_header() -> VaultHeader {
        VaultHeader {
            version: FORMAT_VERSION,
            iterations: DEFAULT_ITERATIONS,
            salt: [0x11; SALT_LEN],
            nonce: [0x22; NONCE_LEN],
            directory_size: 1234,
        }
    }

    #[test]
    fn test_header_round_trip() {
        let header = sample_header();
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, HEADER_SIZE);

        let parsed = VaultHeader::read_from(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.data_region_offset(), HEADER_SIZE + 1234);
    }

    #[test]
    fn test_padding_and_reserved_are_zero() {
        let mut buf = Vec::new();
        sample_header().write_to(&mut buf).unwrap();
        assert!(buf[60..64].iter().all(|&b| b == 0));
        assert!(buf[72..96].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = Vec::new();
        sample_header().write_to(&mut buf).unwrap();
        buf[0] = b'X';
        let err = VaultHeader::read_from(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(
            err,
            VaultError::BadFormat(FormatError::BadMagic)
        ));
    }

    #[test]
    fn test_future_version_rejected() {
        let mut header = sample_header();
        header.version = FORMAT_VERSION + 1;
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        let err = VaultHeader::read_from(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(
            err,
            VaultError::BadFormat(FormatError::UnsupportedVersion(v)) if v == FORMAT_VERSION + 1
        ));
    }

    #[test]
    fn test_suspicious_iteration_counts() {
        for iterations in [0, MIN_ITERATIONS - 1, MAX_ITERATIONS + 1] {
            let mut header = sample_header();
            header.iterations = iterations;
            let mut buf = Vec::new();
            header.write_to(&mut buf).unwrap();
            let err = VaultHeader::read_from(&mut Cursor::new(&buf)).unwrap_err();
            assert!(matches!(
                err,
                VaultError::BadFormat(FormatError::SuspiciousCost(_))
            ));
        }
    }

    #[test]
    fn test_truncated_header() {
        let mut buf = Vec::new();
        sample_header().write_to(&mut buf).unwrap();
        buf.truncate(40);
        let err = VaultHeader::read_from(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(
            err,
            VaultError::BadFormat(FormatError::TruncatedHeader)
        ));
    }

    #[test]
    fn test_generate_uses_fresh_randomness() {
        let a = VaultHeader::generate(DEFAULT_ITERATIONS);
        let b = VaultHeader::generate(DEFAULT_ITERATIONS);
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.nonce, b.nonce);
        assert_eq!(a.version, FORMAT_VERSION);
        assert_eq!(a.directory_size, 0);
    }

    #[test]
    fn test_validate_file_too_small() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.dat");
        std::fs::write(&path, b"FLINT001 but short").unwrap();
        let err = validate_file(&path).unwrap_err();
        assert!(matches!(
            err,
            VaultError::BadFormat(FormatError::TooSmall { .. })
        ));
    }
}
