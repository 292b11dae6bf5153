//! The copy-on-write rewrite protocol.
//!
//! Every mutation produces a complete new vault in a sibling `<path>.tmp`
//! file and atomically renames it over the original. A crash at any point
//! leaves either the old vault or the new one on disk, never a hybrid; at
//! worst a stale temp file survives, to be truncated by the next mutation.
//!
//! The caller supplies the new directory plus one [`BlobSource`] per
//! non-directory entry describing where that entry's compressed bytes come
//! from: the old data region (surviving entries, addressed by their
//! pre-mutation offsets) or a filesystem file (added or replaced entries,
//! gzip-streamed on the fly).

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::codec::{self, COPY_BUF_SIZE};
use crate::crypto::DerivedKey;
use crate::directory::Directory;
use crate::error::{Result, VaultError};
use crate::format::VaultHeader;

/// Where one blob's bytes come from during a rewrite.
pub(crate) enum BlobSource {
    /// Copy `compressed_size` bytes starting at `offset` in the old data
    /// region. Offsets are the pre-mutation ones.
    OldRegion { offset: u64, compressed_size: u64 },
    /// Open this file and gzip-stream it into the new data region.
    NewFile(PathBuf),
}

/// Sibling temp path used by the rewrite.
pub(crate) fn temp_path(vault_path: &Path) -> PathBuf {
    let mut os = vault_path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Execute the rewrite protocol. `directory` is the post-mutation directory;
/// its offsets are recomputed here, then it is sealed with the old header's
/// key and nonce and written ahead of the blobs.
///
/// On any failure the temp file is unlinked and the original vault is left
/// untouched. The caller must hold the vault's write lock.
pub(crate) fn rewrite_vault(
    vault_path: &Path,
    old_file: &mut File,
    old_header: &VaultHeader,
    key: &DerivedKey,
    directory: &mut Directory,
    sources: &HashMap<String, BlobSource>,
    cancel: &CancelToken,
) -> Result<()> {
    directory.recompute_offsets();
    let sealed = directory.encode(key, &old_header.nonce)?;

    let mut new_header = old_header.clone();
    new_header.directory_size = sealed.len() as u64;

    let tmp = temp_path(vault_path);
    let outcome = write_temp(
        &tmp,
        old_file,
        old_header,
        &new_header,
        &sealed,
        directory,
        sources,
        cancel,
    )
    .and_then(|()| fs::rename(&tmp, vault_path).map_err(VaultError::Io));

    match outcome {
        Ok(()) => {
            debug!(
                vault = %vault_path.display(),
                entries = directory.entries.len(),
                data_region = directory.data_region_len(),
                "vault rewritten"
            );
            Ok(())
        }
        Err(err) => {
            if let Err(cleanup) = fs::remove_file(&tmp) {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!(tmp = %tmp.display(), error = %cleanup, "failed to remove temp file");
                }
            }
            Err(err)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn write_temp(
    tmp: &Path,
    old_file: &mut File,
    old_header: &VaultHeader,
    new_header: &VaultHeader,
    sealed_directory: &[u8],
    directory: &Directory,
    sources: &HashMap<String, BlobSource>,
    cancel: &CancelToken,
) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(tmp)?;
    let mut writer = BufWriter::new(file);

    new_header.write_to(&mut writer)?;
    writer.write_all(sealed_directory)?;

    let old_data_start = old_header.data_region_offset();
    for entry in directory.entries.iter().filter(|e| !e.is_dir) {
        cancel.check()?;
        let source = sources.get(&entry.path).ok_or_else(|| {
            VaultError::Io(io::Error::other(format!(
                "no blob source for '{}'",
                entry.path
            )))
        })?;
        match source {
            BlobSource::OldRegion {
                offset,
                compressed_size,
            } => {
                old_file.seek(SeekFrom::Start(old_data_start + offset))?;
                codec::copy_exact(old_file, &mut writer, *compressed_size, COPY_BUF_SIZE, cancel)?;
            }
            BlobSource::NewFile(path) => {
                let source_file = File::open(path)?;
                let written = codec::compress_stream(source_file, &mut writer, cancel)?;
                // Gzip at a fixed level is deterministic, so a mismatch with
                // the pre-pass means the source changed under us.
                if written != entry.compressed_size {
                    return Err(VaultError::Io(io::Error::other(format!(
                        "source '{}' changed during add: expected {} compressed bytes, wrote {}",
                        path.display(),
                        entry.compressed_size,
                        written
                    ))));
                }
            }
        }
    }

    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| VaultError::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(())
}
