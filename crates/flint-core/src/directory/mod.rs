//! The encrypted directory: entry metadata and its serialization pipeline.
//!
//! The directory is the only authenticated region of a vault file. It is
//! materialized fully in memory (its size is proportional to the entry
//! count, never to payload sizes) and serialized as
//! `JSON -> gzip -> AES-256-GCM` on every rewrite.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_with::base64::Base64;
use serde_with::serde_as;
use tracing::trace;

use crate::codec;
use crate::crypto::{DerivedKey, cipher};
use crate::error::{Result, VaultError};
use crate::format::{FORMAT_VERSION, NONCE_LEN};

/// One stored file or stored directory node.
///
/// `offset` addresses the entry's gzip blob relative to the first byte of
/// the data region; it is meaningless (zero) for directories, as are
/// `size`, `compressed_size` and `sha256_hash`.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Forward-slash path, unique across the vault.
    pub path: String,
    /// Basename of `path`.
    pub name: String,
    pub is_dir: bool,
    /// Plaintext size in bytes.
    pub size: u64,
    /// Gzipped size of the blob in the data region.
    pub compressed_size: u64,
    /// POSIX mode bits.
    pub mode: u32,
    /// Modification time, Unix nanoseconds.
    pub mod_time: i64,
    /// Byte offset within the data region.
    pub offset: u64,
    /// SHA-256 of the plaintext; zeroed for directories.
    #[serde_as(as = "Base64")]
    pub sha256_hash: [u8; 32],
}

impl Entry {
    /// Directory node with metadata but no payload.
    pub fn directory(path: String, mode: u32, mod_time: i64) -> Self {
        let name = basename(&path).to_owned();
        Self {
            path,
            name,
            is_dir: true,
            size: 0,
            compressed_size: 0,
            mode,
            mod_time,
            offset: 0,
            sha256_hash: [0u8; 32],
        }
    }

    /// File node; `offset` is assigned by [`Directory::recompute_offsets`].
    pub fn file(
        path: String,
        size: u64,
        compressed_size: u64,
        mode: u32,
        mod_time: i64,
        sha256_hash: [u8; 32],
    ) -> Self {
        let name = basename(&path).to_owned();
        Self {
            path,
            name,
            is_dir: false,
            size,
            compressed_size,
            mode,
            mod_time,
            offset: 0,
            sha256_hash,
        }
    }
}

/// The in-memory directory: ordered entries plus document-level fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directory {
    pub version: u32,
    pub entries: Vec<Entry>,
    /// Creation time of the vault, Unix nanoseconds.
    pub created_at: i64,
    pub comment: String,
}

impl Directory {
    /// Empty directory for a freshly created vault.
    pub fn new(comment: String) -> Self {
        Self {
            version: FORMAT_VERSION,
            entries: Vec::new(),
            created_at: timestamp_now(),
            comment,
        }
    }

    /// Linear scan by exact path.
    pub fn find_by_path(&self, path: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.path == path)
    }

    /// Replace the entry with an equal path, or append.
    pub fn upsert(&mut self, entry: Entry) {
        match self.find_by_path(&entry.path) {
            Some(i) => self.entries[i] = entry,
            None => self.entries.push(entry),
        }
    }

    /// Remove `path` and everything beneath it. Returns how many entries
    /// were dropped.
    pub fn remove_subtree(&mut self, path: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !path_matches(&e.path, path));
        before - self.entries.len()
    }

    /// Reassign every non-directory entry's offset to the running sum of
    /// preceding compressed sizes. Must run before the directory is
    /// serialized for a rewrite: the data region's layout is a function of
    /// the current entry order.
    pub fn recompute_offsets(&mut self) {
        let mut offset = 0u64;
        for entry in &mut self.entries {
            if entry.is_dir {
                entry.offset = 0;
            } else {
                entry.offset = offset;
                offset += entry.compressed_size;
            }
        }
    }

    /// Total compressed size of all blobs, i.e. the data region length.
    pub fn data_region_len(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| !e.is_dir)
            .map(|e| e.compressed_size)
            .sum()
    }

    /// Serialize, compress and seal the directory.
    pub(crate) fn encode(&self, key: &DerivedKey, nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let packed = codec::gzip_bytes(&json)?;
        trace!(
            entries = self.entries.len(),
            json_len = json.len(),
            packed_len = packed.len(),
            "directory encoded"
        );
        Ok(cipher::seal(key, nonce, &packed)?)
    }

    /// Open, decompress and parse a sealed directory blob.
    ///
    /// Post-decrypt failures (bad gzip, bad JSON) are reported as
    /// [`VaultError::AuthOrCorrupt`] just like a tag mismatch: a caller
    /// must not be able to tell tampering from a wrong password.
    pub(crate) fn decode(
        blob: &[u8],
        key: &DerivedKey,
        nonce: &[u8; NONCE_LEN],
    ) -> Result<Self> {
        let packed = cipher::open(key, nonce, blob)?;
        let json = codec::gunzip_bytes(&packed).map_err(|_| VaultError::AuthOrCorrupt)?;
        let directory: Directory =
            serde_json::from_slice(&json).map_err(|_| VaultError::AuthOrCorrupt)?;
        Ok(directory)
    }
}

/// Prefix match as used by remove and selective extract: `path` is selected
/// by `target` when it equals the target or lives beneath it.
pub fn path_matches(path: &str, target: &str) -> bool {
    path == target
        || path
            .strip_prefix(target)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Basename of a forward-slash path.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Current wall-clock time as Unix nanoseconds.
pub fn timestamp_now() -> i64 {
    system_time_to_timestamp(SystemTime::now())
}

/// Convert a [`SystemTime`] to Unix nanoseconds, saturating on overflow.
pub fn system_time_to_timestamp(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_nanos()).unwrap_or(i64::MAX),
    }
}

/// Convert Unix nanoseconds back to a [`SystemTime`].
pub fn timestamp_to_system_time(nanos: i64) -> SystemTime {
    if nanos >= 0 {
        UNIX_EPOCH + Duration::from_nanos(nanos as u64)
    } else {
        UNIX_EPOCH - Duration::from_nanos(nanos.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SALT_LEN;

    fn file_entry(path: &str, compressed_size: u64) -> Entry {
        Entry::file(path.to_owned(), 100, compressed_size, 0o644, 0, [1u8; 32])
    }

    #[test]
    fn test_upsert_replaces_by_path() {
        let mut dir = Directory::new(String::new());
        dir.upsert(file_entry("a.txt", 10));
        dir.upsert(file_entry("b.txt", 20));
        assert_eq!(dir.entries.len(), 2);

        let mut replacement = file_entry("a.txt", 99);
        replacement.size = 7;
        dir.upsert(replacement);
        assert_eq!(dir.entries.len(), 2);
        // Replacement keeps the original position.
        assert_eq!(dir.entries[0].path, "a.txt");
        assert_eq!(dir.entries[0].compressed_size, 99);
        assert_eq!(dir.entries[0].size, 7);
    }

    #[test]
    fn test_remove_subtree_prefix_semantics() {
        let mut dir = Directory::new(String::new());
        dir.upsert(Entry::directory("proj".into(), 0o755, 0));
        dir.upsert(file_entry("proj/a.txt", 1));
        dir.upsert(file_entry("proj/sub/b.txt", 2));
        dir.upsert(file_entry("project.txt", 3));

        let removed = dir.remove_subtree("proj");
        assert_eq!(removed, 3);
        // "project.txt" shares the string prefix but not the path prefix.
        assert_eq!(dir.entries.len(), 1);
        assert_eq!(dir.entries[0].path, "project.txt");

        assert_eq!(dir.remove_subtree("nothing"), 0);
    }

    #[test]
    fn test_recompute_offsets_skips_directories() {
        let mut dir = Directory::new(String::new());
        dir.upsert(file_entry("a", 10));
        dir.upsert(Entry::directory("d".into(), 0o755, 0));
        dir.upsert(file_entry("b", 30));
        dir.upsert(file_entry("c", 5));

        dir.recompute_offsets();
        assert_eq!(dir.entries[0].offset, 0);
        assert_eq!(dir.entries[1].offset, 0);
        assert_eq!(dir.entries[2].offset, 10);
        assert_eq!(dir.entries[3].offset, 40);
        assert_eq!(dir.data_region_len(), 45);
    }

    #[test]
    fn test_path_matches() {
        assert!(path_matches("proj", "proj"));
        assert!(path_matches("proj/a.txt", "proj"));
        assert!(path_matches("proj/sub/b.txt", "proj"));
        assert!(!path_matches("project.txt", "proj"));
        assert!(!path_matches("pro", "proj"));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let key = DerivedKey::derive("pw", &[3u8; SALT_LEN], 10_000);
        let nonce = [5u8; NONCE_LEN];

        let mut dir = Directory::new("release artifacts".into());
        dir.upsert(Entry::directory("proj".into(), 0o755, timestamp_now()));
        dir.upsert(Entry::file(
            "proj/a.txt".into(),
            6,
            26,
            0o600,
            1_700_000_000_123_456_789,
            [0xAB; 32],
        ));
        dir.recompute_offsets();

        let blob = dir.encode(&key, &nonce).unwrap();
        let decoded = Directory::decode(&blob, &key, &nonce).unwrap();
        assert_eq!(decoded.version, FORMAT_VERSION);
        assert_eq!(decoded.comment, "release artifacts");
        assert_eq!(decoded.entries, dir.entries);
        assert_eq!(decoded.created_at, dir.created_at);
    }

    #[test]
    fn test_decode_with_wrong_password_is_auth_or_corrupt() {
        let key = DerivedKey::derive("pw", &[3u8; SALT_LEN], 10_000);
        let nonce = [5u8; NONCE_LEN];
        let blob = Directory::new(String::new()).encode(&key, &nonce).unwrap();

        let wrong = DerivedKey::derive("nope", &[3u8; SALT_LEN], 10_000);
        assert!(matches!(
            Directory::decode(&blob, &wrong, &nonce),
            Err(VaultError::AuthOrCorrupt)
        ));
    }

    #[test]
    fn test_tampered_blob_is_auth_or_corrupt() {
        let key = DerivedKey::derive("pw", &[3u8; SALT_LEN], 10_000);
        let nonce = [5u8; NONCE_LEN];
        let mut blob = Directory::new(String::new()).encode(&key, &nonce).unwrap();
        let last = blob.len() - 1; // inside the GCM tag
        blob[last] ^= 0x80;
        assert!(matches!(
            Directory::decode(&blob, &key, &nonce),
            Err(VaultError::AuthOrCorrupt)
        ));
    }

    #[test]
    fn test_json_keys_match_schema() {
        let entry = Entry::file("x".into(), 1, 2, 0o644, 3, [0u8; 32]);
        let value = serde_json::to_value(&entry).unwrap();
        for key in [
            "path",
            "name",
            "is_dir",
            "size",
            "compressed_size",
            "mode",
            "mod_time",
            "offset",
            "sha256_hash",
        ] {
            assert!(value.get(key).is_some(), "missing key {key}");
        }
        // Digest travels as base64 text.
        assert!(value["sha256_hash"].is_string());
    }

    #[test]
    fn test_timestamp_round_trip_preserves_instant() {
        let now = SystemTime::now();
        let nanos = system_time_to_timestamp(now);
        let back = timestamp_to_system_time(nanos);
        // SystemTime on all supported platforms carries at least nanosecond
        // precision, so the round-trip is exact.
        assert_eq!(back, now);
    }
}
