//! The extraction engine.
//!
//! The single-entry extractor is the primitive everything else reuses:
//! seek to the blob, bound the reader by the compressed size, gunzip, and
//! stream into the output file while hashing the plaintext. The computed
//! digest is compared against the stored one in constant time; a mismatch
//! deletes the partial output and fails that entry alone.
//!
//! Bulk extraction creates directories in a single-threaded pre-pass, then
//! runs the per-entry extractor either serially or on a worker pool where
//! every worker owns its own read handle on the vault file.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;

use filetime::FileTime;
use flate2::read::GzDecoder;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::codec;
use crate::crypto::digests_match;
use crate::directory::{Entry, timestamp_to_system_time};
use crate::error::{Result, VaultError};
use crate::format::VaultHeader;

/// Output layout for extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathPolicy {
    /// Recreate the stored tree under the output root.
    #[default]
    Preserve,
    /// Drop all directory structure; every file lands in the output root
    /// under its basename. Last writer wins on collisions.
    Flat,
}

/// Per-entry lifecycle notifications for progress display.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Started { path: String },
    Finished { path: String },
}

/// Options for bulk extraction.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub policy: PathPolicy,
    /// Worker threads; `0` or `1` extracts serially.
    pub workers: usize,
    pub cancel: CancelToken,
    pub progress: Option<Sender<ProgressEvent>>,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            policy: PathPolicy::Preserve,
            workers: 1,
            cancel: CancelToken::new(),
            progress: None,
        }
    }
}

/// Default worker count for parallel extraction.
pub fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(2, |n| n.get() * 2)
}

/// Extract `entries` using `handles` (one open vault handle per worker;
/// the first is reused for serial runs). All handles must reference the
/// same inode as the directory the entries came from.
pub(crate) fn run(
    mut handles: Vec<File>,
    header: &VaultHeader,
    entries: Vec<Entry>,
    output_root: &Path,
    options: &ExtractOptions,
) -> Result<()> {
    fs::create_dir_all(output_root)?;
    let data_start = header.data_region_offset();

    // Directory pre-pass, single-threaded, parent-before-child.
    if options.policy == PathPolicy::Preserve {
        for entry in entries.iter().filter(|e| e.is_dir) {
            options.cancel.check()?;
            let path = output_path(output_root, entry, options.policy)?;
            fs::create_dir_all(&path)?;
            apply_mode(&path, entry.mode)?;
        }
    }

    let files: Vec<Entry> = entries.into_iter().filter(|e| !e.is_dir).collect();
    debug!(files = files.len(), workers = options.workers, "extracting");

    if options.workers <= 1 || files.len() <= 1 {
        let file = handles
            .first_mut()
            .ok_or_else(|| VaultError::Io(std::io::Error::other("no vault handle")))?;
        for entry in &files {
            options.cancel.check()?;
            notify(&options.progress, ProgressEvent::Started { path: entry.path.clone() });
            let out = output_path(output_root, entry, options.policy)?;
            extract_entry(file, data_start, entry, &out, &options.cancel)?;
            notify(&options.progress, ProgressEvent::Finished { path: entry.path.clone() });
        }
        return Ok(());
    }

    run_parallel(handles, data_start, &files, output_root, options)
}

fn run_parallel(
    handles: Vec<File>,
    data_start: u64,
    files: &[Entry],
    output_root: &Path,
    options: &ExtractOptions,
) -> Result<()> {
    let next = AtomicUsize::new(0);
    let abort = AtomicBool::new(false);
    let failures: Mutex<Vec<VaultError>> = Mutex::new(Vec::new());

    std::thread::scope(|scope| {
        for mut file in handles {
            let next = &next;
            let abort = &abort;
            let failures = &failures;
            let cancel = &options.cancel;
            let progress = options.progress.clone();
            let policy = options.policy;
            scope.spawn(move || {
                loop {
                    if abort.load(Ordering::Acquire) || cancel.is_cancelled() {
                        break;
                    }
                    let i = next.fetch_add(1, Ordering::SeqCst);
                    let Some(entry) = files.get(i) else { break };
                    notify(&progress, ProgressEvent::Started { path: entry.path.clone() });
                    let outcome = output_path(output_root, entry, policy).and_then(|out| {
                        extract_entry(&mut file, data_start, entry, &out, cancel)
                    });
                    match outcome {
                        Ok(()) => {
                            notify(&progress, ProgressEvent::Finished { path: entry.path.clone() });
                        }
                        Err(err) => {
                            warn!(path = %entry.path, error = %err, "extraction failed");
                            failures.lock().unwrap_or_else(|e| e.into_inner()).push(err);
                            // Let in-flight entries finish, start no new ones.
                            abort.store(true, Ordering::Release);
                        }
                    }
                }
            });
        }
    });

    options.cancel.check()?;
    let mut failures = failures.into_inner().unwrap_or_else(|e| e.into_inner());
    match failures.is_empty() {
        true => Ok(()),
        false => Err(failures.swap_remove(0)),
    }
}

/// Extract one entry to `out_path`.
///
/// Streams `compressed_size` bytes through a gzip decoder into the output
/// file, hashing the plaintext on the way. The buffer is sized by the
/// plaintext size heuristic. On digest or length mismatch the output file
/// is removed and `IntegrityFailed` returned.
pub(crate) fn extract_entry(
    vault_file: &mut File,
    data_start: u64,
    entry: &Entry,
    out_path: &Path,
    cancel: &CancelToken,
) -> Result<()> {
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)?;
    }

    vault_file.seek(SeekFrom::Start(data_start + entry.offset))?;
    let limited = vault_file.take(entry.compressed_size);
    let mut decoder = GzDecoder::new(limited);

    let mut out_file = File::create(out_path)?;
    let buf_size = codec::buffer_size_for(entry.size);
    let copied = codec::hashing_copy(&mut decoder, &mut out_file, buf_size, cancel)
        .and_then(|(n, digest)| {
            out_file.flush()?;
            Ok((n, digest))
        });

    match copied {
        Ok((n, digest)) => {
            if n != entry.size || !digests_match(&digest, &entry.sha256_hash) {
                warn!(
                    path = %entry.path,
                    expected = %hex::encode(entry.sha256_hash),
                    actual = %hex::encode(digest),
                    "integrity check failed"
                );
                drop(out_file);
                let _ = fs::remove_file(out_path);
                return Err(VaultError::IntegrityFailed {
                    path: entry.path.clone(),
                });
            }
            drop(out_file);
            apply_mode(out_path, entry.mode)?;
            filetime::set_file_mtime(
                out_path,
                FileTime::from_system_time(timestamp_to_system_time(entry.mod_time)),
            )?;
            Ok(())
        }
        Err(VaultError::Io(e)) if is_corrupt_stream(&e) => {
            // A blob that no longer parses as gzip is corrupted data, the
            // same failure class as a digest mismatch.
            warn!(path = %entry.path, error = %e, "blob stream corrupted");
            drop(out_file);
            let _ = fs::remove_file(out_path);
            Err(VaultError::IntegrityFailed {
                path: entry.path.clone(),
            })
        }
        Err(err) => {
            drop(out_file);
            let _ = fs::remove_file(out_path);
            Err(err)
        }
    }
}

fn is_corrupt_stream(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::InvalidData
            | std::io::ErrorKind::InvalidInput
            | std::io::ErrorKind::UnexpectedEof
    )
}

/// Output location for an entry under the chosen policy. Entry paths are
/// required to stay inside the output root: absolute paths, drive prefixes
/// and `..` components are refused.
fn output_path(output_root: &Path, entry: &Entry, policy: PathPolicy) -> Result<PathBuf> {
    match policy {
        PathPolicy::Preserve => {
            let mut out = output_root.to_path_buf();
            for component in Path::new(&entry.path).components() {
                match component {
                    Component::Normal(part) => out.push(part),
                    Component::CurDir => {}
                    Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                        return Err(VaultError::InvalidArgument(format!(
                            "entry path '{}' escapes the output root",
                            entry.path
                        )));
                    }
                }
            }
            Ok(out)
        }
        PathPolicy::Flat => {
            if entry.name.is_empty() || entry.name == ".." || entry.name.contains('/') {
                return Err(VaultError::InvalidArgument(format!(
                    "entry name '{}' is not extractable flat",
                    entry.name
                )));
            }
            Ok(output_root.join(&entry.name))
        }
    }
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

fn notify(progress: &Option<Sender<ProgressEvent>>, event: ProgressEvent) {
    if let Some(tx) = progress {
        let _ = tx.send(event);
    }
}
