#![allow(dead_code)]

//! Shared helpers for integration tests.

use std::fs;
use std::path::{Path, PathBuf};

use flint_core::{Vault, VaultCreator};
use tempfile::TempDir;

/// A scratch area holding one vault plus room for sources and outputs.
pub struct VaultFixture {
    pub temp: TempDir,
    pub vault_path: PathBuf,
}

impl VaultFixture {
    pub fn new(password: &str) -> (Self, Vault) {
        let temp = TempDir::new().unwrap();
        let vault_path = temp.path().join("test.flint");
        let vault = VaultCreator::new(&vault_path, password).create().unwrap();
        (Self { temp, vault_path }, vault)
    }

    /// Write a source file under the scratch area and return its path.
    pub fn source_file(&self, rel: &str, contents: &[u8]) -> PathBuf {
        let path = self.temp.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }

    /// Fresh empty output directory.
    pub fn out_dir(&self, name: &str) -> PathBuf {
        let path = self.temp.path().join(name);
        fs::create_dir_all(&path).unwrap();
        path
    }
}

/// Stored path for a source added by absolute path: forward slashes, no
/// leading `/`.
pub fn stored_path(source: &Path) -> String {
    source
        .to_str()
        .unwrap()
        .trim_start_matches('/')
        .to_owned()
}

/// Flip one bit inside the vault's data region at `region_offset`.
pub fn flip_data_region_bit(vault_path: &Path, region_offset: u64) {
    let header = Vault::validate(vault_path).unwrap();
    let mut bytes = fs::read(vault_path).unwrap();
    let index = usize::try_from(header.data_region_offset() + region_offset).unwrap();
    assert!(index < bytes.len(), "offset beyond data region");
    bytes[index] ^= 0x01;
    fs::write(vault_path, &bytes).unwrap();
}

/// Flip one bit inside the encrypted directory blob.
pub fn flip_directory_bit(vault_path: &Path) {
    let header = Vault::validate(vault_path).unwrap();
    assert!(header.directory_size > 0);
    let mut bytes = fs::read(vault_path).unwrap();
    let index = usize::try_from(flint_core::format::HEADER_SIZE + header.directory_size / 2).unwrap();
    bytes[index] ^= 0x01;
    fs::write(vault_path, &bytes).unwrap();
}
