//! The vault operations handle.
//!
//! [`Vault`] owns a path, the password, and the per-path lock from the
//! global registry. Every operation re-derives the key from the header's
//! salt and iteration count; nothing cryptographic is cached between
//! operations, and derived keys are zeroized on drop.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

use crate::cancel::CancelToken;
use crate::codec;
use crate::crypto::DerivedKey;
use crate::directory::{self, Directory, Entry};
use crate::error::{Result, VaultError};
use crate::format::{self, FormatError, VaultHeader};
use crate::vault::creator::VaultCreator;
use crate::vault::extract::{self, ExtractOptions};
use crate::vault::locks::VaultLockRegistry;
use crate::vault::rewrite::{BlobSource, rewrite_vault};

/// Options for add operations.
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    pub cancel: CancelToken,
}

/// Password-free facts about a vault file.
#[derive(Debug, Clone)]
pub struct VaultInfo {
    pub path: PathBuf,
    pub is_vault: bool,
    pub version: u32,
    pub iterations: u32,
    pub file_size: u64,
}

/// Header, key and directory loaded together under the vault lock.
pub(crate) struct LoadedVault {
    pub file: File,
    pub header: VaultHeader,
    pub key: DerivedKey,
    pub directory: Directory,
}

/// Handle to one vault file.
pub struct Vault {
    path: PathBuf,
    password: SecretString,
    lock: Arc<RwLock<()>>,
}

impl Vault {
    /// Open a handle to an existing vault.
    ///
    /// Validates the header structurally; the password is only proven
    /// right or wrong when an operation decrypts the directory.
    pub fn open(path: impl AsRef<Path>, password: &str) -> Result<Self> {
        if password.is_empty() {
            return Err(VaultError::InvalidArgument("empty password".into()));
        }
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(VaultError::InvalidArgument("empty vault path".into()));
        }
        format::validate_file(path)?;
        let lock = VaultLockRegistry::global().get_or_create(path);
        Ok(Self {
            path: path.to_path_buf(),
            password: SecretString::from(password.to_owned()),
            lock,
        })
    }

    /// Create a new vault at `path`. Shorthand for [`VaultCreator`].
    pub fn create(path: impl AsRef<Path>, password: &str) -> Result<Self> {
        VaultCreator::new(path, password).create()
    }

    pub(crate) fn from_parts(path: PathBuf, password: SecretString, lock: Arc<RwLock<()>>) -> Self {
        Self {
            path,
            password,
            lock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// List all entries in stored order.
    #[instrument(level = "debug", skip(self), fields(vault = %self.path.display()))]
    pub fn list(&self) -> Result<Vec<Entry>> {
        let _guard = self.lock.read().unwrap_or_else(|e| e.into_inner());
        let state = self.load_state()?;
        Ok(state.directory.entries)
    }

    /// Password-free header facts. A structurally broken file reports
    /// `is_vault: false` rather than an error; only I/O failures propagate.
    pub fn info(path: impl AsRef<Path>) -> Result<VaultInfo> {
        let path = path.as_ref();
        let lock = VaultLockRegistry::global().get_or_create(path);
        let _guard = lock.read().unwrap_or_else(|e| e.into_inner());

        let file_size = fs::metadata(path)?.len();
        match format::validate_file(path) {
            Ok(header) => Ok(VaultInfo {
                path: path.to_path_buf(),
                is_vault: true,
                version: header.version,
                iterations: header.iterations,
                file_size,
            }),
            Err(VaultError::BadFormat(_)) => Ok(VaultInfo {
                path: path.to_path_buf(),
                is_vault: false,
                version: 0,
                iterations: 0,
                file_size,
            }),
            Err(err) => Err(err),
        }
    }

    /// Structural validation without the password: size floor plus header
    /// checks. The directory blob and data region are not touched.
    pub fn validate(path: impl AsRef<Path>) -> Result<VaultHeader> {
        let path = path.as_ref();
        let lock = VaultLockRegistry::global().get_or_create(path);
        let _guard = lock.read().unwrap_or_else(|e| e.into_inner());
        format::validate_file(path)
    }

    /// Add a file or a directory tree to the vault.
    pub fn add(&self, source: impl AsRef<Path>) -> Result<()> {
        self.add_with(source, &AddOptions::default())
    }

    /// Add with explicit options (cancellation / deadline).
    #[instrument(level = "info", skip_all, fields(vault = %self.path.display(), source = %source.as_ref().display()))]
    pub fn add_with(&self, source: impl AsRef<Path>, options: &AddOptions) -> Result<()> {
        let source = source.as_ref();
        if source.as_os_str().is_empty() {
            return Err(VaultError::InvalidArgument("empty source path".into()));
        }
        let meta = fs::metadata(source).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VaultError::InvalidArgument(format!("source '{}' does not exist", source.display()))
            } else {
                VaultError::Io(e)
            }
        })?;

        if meta.is_dir() {
            self.add_directory(source, options)
        } else if meta.is_file() {
            self.add_file(source, options)
        } else {
            Err(VaultError::InvalidArgument(format!(
                "source '{}' is not a regular file or directory",
                source.display()
            )))
        }
    }

    /// Remove every entry matching any of `targets` (exact path or subtree
    /// prefix). Targets are applied in order and each must still match at
    /// least one entry when its turn comes, or the whole operation fails
    /// `NotFound` and the vault file is left unchanged.
    #[instrument(level = "info", skip(self, targets), fields(vault = %self.path.display()))]
    pub fn remove<S: AsRef<str>>(&self, targets: &[S]) -> Result<()> {
        if targets.is_empty() {
            return Err(VaultError::InvalidArgument("no targets given".into()));
        }
        let cancel = CancelToken::new();
        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());
        let mut state = self.load_state()?;

        // Snapshot first: survivors are sourced by their pre-removal offsets.
        let old_blobs = blob_snapshot(&state.directory);

        let mut removed = 0usize;
        for target in targets {
            let target = normalize_target(target.as_ref())?;
            let dropped = state.directory.remove_subtree(&target);
            if dropped == 0 {
                return Err(VaultError::NotFound(target));
            }
            removed += dropped;
        }
        info!(removed, "removing entries");

        let mut sources = HashMap::new();
        for entry in state.directory.entries.iter().filter(|e| !e.is_dir) {
            let (offset, compressed_size) = old_blob_of(&old_blobs, &entry.path)?;
            sources.insert(
                entry.path.clone(),
                BlobSource::OldRegion {
                    offset,
                    compressed_size,
                },
            );
        }
        rewrite_vault(
            &self.path,
            &mut state.file,
            &state.header,
            &state.key,
            &mut state.directory,
            &sources,
            &cancel,
        )
    }

    /// Extract every entry into `output_root`.
    pub fn extract_all(&self, output_root: impl AsRef<Path>, options: &ExtractOptions) -> Result<()> {
        let (handles, header, entries) = self.read_phase(None, options)?;
        extract::run(handles, &header, entries, output_root.as_ref(), options)
    }

    /// Extract the entries selected by `targets` (exact path or subtree
    /// prefix). Each target must match at least one entry; overlapping
    /// selections are deduplicated.
    pub fn extract_selected<S: AsRef<str>>(
        &self,
        output_root: impl AsRef<Path>,
        targets: &[S],
        options: &ExtractOptions,
    ) -> Result<()> {
        if targets.is_empty() {
            return Err(VaultError::InvalidArgument("no targets given".into()));
        }
        let mut normalized = Vec::with_capacity(targets.len());
        for target in targets {
            normalized.push(normalize_target(target.as_ref())?);
        }
        let (handles, header, entries) = self.read_phase(Some(&normalized), options)?;
        extract::run(handles, &header, entries, output_root.as_ref(), options)
    }

    /// Header + directory phase of a read, under the read lock. Also opens
    /// one vault handle per extraction worker while the lock is held, so
    /// every handle is guaranteed to reference the same inode as the
    /// directory that was just decrypted.
    fn read_phase(
        &self,
        targets: Option<&[String]>,
        options: &ExtractOptions,
    ) -> Result<(Vec<File>, VaultHeader, Vec<Entry>)> {
        let _guard = self.lock.read().unwrap_or_else(|e| e.into_inner());
        let state = self.load_state()?;

        let entries = match targets {
            None => state.directory.entries,
            Some(targets) => {
                for target in targets {
                    if !state
                        .directory
                        .entries
                        .iter()
                        .any(|e| directory::path_matches(&e.path, target))
                    {
                        return Err(VaultError::NotFound(target.clone()));
                    }
                }
                state
                    .directory
                    .entries
                    .into_iter()
                    .filter(|e| targets.iter().any(|t| directory::path_matches(&e.path, t)))
                    .collect()
            }
        };

        let mut handles = vec![state.file];
        for _ in 1..options.workers.max(1).min(entries.len().max(1)) {
            handles.push(File::open(&self.path)?);
        }
        Ok((handles, state.header, entries))
    }

    /// Read header, derive key, decrypt directory.
    pub(crate) fn load_state(&self) -> Result<LoadedVault> {
        let mut file = File::open(&self.path)?;
        let file_len = file.metadata()?.len();
        let header = VaultHeader::read_from(&mut file)?;
        if header.directory_size > file_len.saturating_sub(format::HEADER_SIZE) {
            return Err(FormatError::TooSmall { len: file_len }.into());
        }

        let key = DerivedKey::derive(
            self.password.expose_secret(),
            &header.salt,
            header.iterations,
        );

        let mut blob = vec![0u8; header.directory_size as usize];
        file.read_exact(&mut blob)?;
        let directory = Directory::decode(&blob, &key, &header.nonce)?;
        if directory.version != header.version {
            return Err(FormatError::UnsupportedVersion(directory.version).into());
        }
        debug!(entries = directory.entries.len(), "directory loaded");

        Ok(LoadedVault {
            file,
            header,
            key,
            directory,
        })
    }

    fn add_file(&self, source: &Path, options: &AddOptions) -> Result<()> {
        let stored_path = stored_path_for(source)?;

        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());
        let mut state = self.load_state()?;

        // Metadata pre-pass: hash and compressed size in one streamed pass,
        // retaining none of the bytes.
        let meta = fs::metadata(source)?;
        let summary = codec::scan_stream(File::open(source)?, &options.cancel)?;
        let entry = Entry::file(
            stored_path.clone(),
            summary.size,
            summary.compressed_size,
            mode_of(&meta),
            mtime_of(&meta),
            summary.sha256,
        );
        info!(
            path = %stored_path,
            size = summary.size,
            compressed = summary.compressed_size,
            "adding file"
        );

        // Offsets must come from the pre-upsert snapshot: the replaced
        // entry's blob address is only known to the old directory.
        let old_blobs = blob_snapshot(&state.directory);
        state.directory.upsert(entry);

        let mut sources = HashMap::new();
        for entry in state.directory.entries.iter().filter(|e| !e.is_dir) {
            if entry.path == stored_path {
                sources.insert(entry.path.clone(), BlobSource::NewFile(source.to_path_buf()));
            } else {
                let (offset, compressed_size) = old_blob_of(&old_blobs, &entry.path)?;
                sources.insert(
                    entry.path.clone(),
                    BlobSource::OldRegion {
                        offset,
                        compressed_size,
                    },
                );
            }
        }
        rewrite_vault(
            &self.path,
            &mut state.file,
            &state.header,
            &state.key,
            &mut state.directory,
            &sources,
            &options.cancel,
        )
    }

    /// Batched directory add: one walk collects directory nodes and
    /// per-file pre-pass metadata, then a single rewrite inserts everything.
    fn add_directory(&self, source: &Path, options: &AddOptions) -> Result<()> {
        let walk_root = fs::canonicalize(source)?;
        let base = walk_root
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_owned)
            .ok_or_else(|| {
                VaultError::InvalidArgument(format!(
                    "source '{}' has no usable name",
                    source.display()
                ))
            })?;

        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());
        let mut state = self.load_state()?;
        let old_blobs = blob_snapshot(&state.directory);

        let mut new_files: HashMap<String, PathBuf> = HashMap::new();
        let mut added = 0usize;
        for walked in WalkDir::new(&walk_root).follow_links(false).sort_by_file_name() {
            options.cancel.check()?;
            let walked = walked.map_err(std::io::Error::from)?;
            let rel = walked
                .path()
                .strip_prefix(&walk_root)
                .expect("walk stays under its root");
            let stored = if rel.as_os_str().is_empty() {
                base.clone()
            } else {
                format!("{base}/{}", path_to_slash(rel)?)
            };

            let file_type = walked.file_type();
            if file_type.is_dir() {
                let meta = walked.metadata().map_err(std::io::Error::from)?;
                state
                    .directory
                    .upsert(Entry::directory(stored, mode_of(&meta), mtime_of(&meta)));
                added += 1;
            } else if file_type.is_file() {
                let meta = walked.metadata().map_err(std::io::Error::from)?;
                let summary =
                    codec::scan_stream(File::open(walked.path())?, &options.cancel)?;
                state.directory.upsert(Entry::file(
                    stored.clone(),
                    summary.size,
                    summary.compressed_size,
                    mode_of(&meta),
                    mtime_of(&meta),
                    summary.sha256,
                ));
                new_files.insert(stored, walked.path().to_path_buf());
                added += 1;
            } else {
                // Symlinks and special files are not archived.
                debug!(path = %walked.path().display(), "skipping non-regular entry");
            }
        }
        info!(base = %base, entries = added, "adding directory tree");

        let mut sources = HashMap::new();
        for entry in state.directory.entries.iter().filter(|e| !e.is_dir) {
            if let Some(fs_path) = new_files.get(&entry.path) {
                sources.insert(entry.path.clone(), BlobSource::NewFile(fs_path.clone()));
            } else {
                let (offset, compressed_size) = old_blob_of(&old_blobs, &entry.path)?;
                sources.insert(
                    entry.path.clone(),
                    BlobSource::OldRegion {
                        offset,
                        compressed_size,
                    },
                );
            }
        }
        rewrite_vault(
            &self.path,
            &mut state.file,
            &state.header,
            &state.key,
            &mut state.directory,
            &sources,
            &options.cancel,
        )
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("path", &self.path)
            .field("password", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

fn old_blob_of(snapshot: &HashMap<String, (u64, u64)>, path: &str) -> Result<(u64, u64)> {
    snapshot.get(path).copied().ok_or_else(|| {
        VaultError::Io(std::io::Error::other(format!(
            "entry '{path}' has no blob in the old data region"
        )))
    })
}

/// Pre-mutation `(offset, compressed_size)` per non-directory path.
fn blob_snapshot(directory: &Directory) -> HashMap<String, (u64, u64)> {
    directory
        .entries
        .iter()
        .filter(|e| !e.is_dir)
        .map(|e| (e.path.clone(), (e.offset, e.compressed_size)))
        .collect()
}

/// Stored path for a single-file add: the path as given, with forward
/// slashes and no leading `/` or `./`.
fn stored_path_for(source: &Path) -> Result<String> {
    let raw = path_to_slash(source)?;
    let mut trimmed = raw.as_str();
    loop {
        if let Some(rest) = trimmed.strip_prefix("./") {
            trimmed = rest;
        } else if let Some(rest) = trimmed.strip_prefix('/') {
            trimmed = rest;
        } else {
            break;
        }
    }
    if trimmed.is_empty() {
        return Err(VaultError::InvalidArgument(format!(
            "source '{}' normalizes to an empty path",
            source.display()
        )));
    }
    Ok(trimmed.to_owned())
}

/// Normalize a remove/extract target the same way stored paths are
/// normalized, plus trailing-slash tolerance.
fn normalize_target(target: &str) -> Result<String> {
    let mut t = target;
    loop {
        if let Some(rest) = t.strip_prefix("./") {
            t = rest;
        } else if let Some(rest) = t.strip_prefix('/') {
            t = rest;
        } else {
            break;
        }
    }
    let t = t.trim_end_matches('/');
    if t.is_empty() {
        return Err(VaultError::InvalidArgument("empty target path".into()));
    }
    Ok(t.to_owned())
}

/// Forward-slash rendition of a filesystem path. Non-UTF-8 names are
/// rejected rather than lossily renamed.
fn path_to_slash(path: &Path) -> Result<String> {
    let s = path.to_str().ok_or_else(|| {
        VaultError::InvalidArgument(format!("path '{}' is not valid UTF-8", path.display()))
    })?;
    if std::path::MAIN_SEPARATOR == '/' {
        Ok(s.to_owned())
    } else {
        Ok(s.replace(std::path::MAIN_SEPARATOR, "/"))
    }
}

#[cfg(unix)]
fn mode_of(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn mode_of(meta: &fs::Metadata) -> u32 {
    if meta.is_dir() { 0o755 } else { 0o644 }
}

fn mtime_of(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .map(directory::system_time_to_timestamp)
        .unwrap_or_else(|_| directory::timestamp_now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_path_normalization() {
        assert_eq!(stored_path_for(Path::new("greet.txt")).unwrap(), "greet.txt");
        assert_eq!(
            stored_path_for(Path::new("./docs/a.txt")).unwrap(),
            "docs/a.txt"
        );
        assert_eq!(
            stored_path_for(Path::new("/var/log/x.log")).unwrap(),
            "var/log/x.log"
        );
        assert!(stored_path_for(Path::new("/")).is_err());
    }

    #[test]
    fn test_target_normalization() {
        assert_eq!(normalize_target("proj/").unwrap(), "proj");
        assert_eq!(normalize_target("./proj/sub").unwrap(), "proj/sub");
        assert_eq!(normalize_target("/proj").unwrap(), "proj");
        assert!(normalize_target("/").is_err());
        assert!(normalize_target("").is_err());
    }

    #[test]
    fn test_open_requires_password_and_vault() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.flint");

        let err = Vault::open(&path, "").unwrap_err();
        assert!(matches!(err, VaultError::InvalidArgument(_)));

        std::fs::write(&path, vec![0u8; 200]).unwrap();
        let err = Vault::open(&path, "pw").unwrap_err();
        assert!(matches!(err, VaultError::BadFormat(FormatError::BadMagic)));
    }
}
