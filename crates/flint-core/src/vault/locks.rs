//! Process-wide serialization of vault access.
//!
//! Mutations to a vault file must not interleave within a process, while
//! reads only need the header + directory phase to be consistent. A global
//! registry hands out one `RwLock` per canonical vault path; mutators take
//! the write side for the whole rewrite, readers take the read side while
//! they load the header and directory. Lock handles live for the process
//! lifetime.
//!
//! Cross-process exclusion is not provided; the rename-based rewrite keeps
//! readers in other processes safe (they hold the old inode), but two
//! writing processes are outside the supported model.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use tracing::trace;

/// Registry mapping canonical vault paths to their locks.
pub struct VaultLockRegistry {
    locks: Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>,
}

impl VaultLockRegistry {
    /// The process-wide registry.
    pub fn global() -> &'static Self {
        static REGISTRY: OnceLock<VaultLockRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| VaultLockRegistry {
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Lock handle for `path`, created on first access.
    ///
    /// Paths are canonicalized so that two spellings of the same file share
    /// a lock. For a file that does not exist yet (creation), the parent is
    /// canonicalized instead and the file name re-appended.
    pub fn get_or_create(&self, path: &Path) -> Arc<RwLock<()>> {
        let key = canonical_key(path);
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let lock = locks.entry(key.clone()).or_insert_with(|| {
            trace!(path = %key.display(), "registering vault lock");
            Arc::new(RwLock::new(()))
        });
        Arc::clone(lock)
    }
}

fn canonical_key(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    // Not created yet: resolve the parent, keep the file name.
    let file_name = path.file_name().map(PathBuf::from).unwrap_or_default();
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent
            .canonicalize()
            .unwrap_or_else(|_| parent.to_path_buf())
            .join(file_name),
        _ => std::env::current_dir()
            .map(|cwd| cwd.join(&file_name))
            .unwrap_or(file_name),
    }
}
