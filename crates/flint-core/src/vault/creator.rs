//! Vault creation.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use tracing::{info, instrument};

use crate::crypto::DerivedKey;
use crate::directory::Directory;
use crate::error::{Result, VaultError};
use crate::format::{DEFAULT_ITERATIONS, MAX_ITERATIONS, MIN_ITERATIONS, VaultHeader};
use crate::vault::locks::VaultLockRegistry;
use crate::vault::operations::Vault;

/// Builder for new vault files.
///
/// # Example
///
/// ```no_run
/// use flint_core::vault::VaultCreator;
///
/// let vault = VaultCreator::new("/backups/photos.flint", "correct horse")
///     .with_comment("family photos")
///     .create()?;
/// vault.add("album/")?;
/// # Ok::<(), flint_core::VaultError>(())
/// ```
pub struct VaultCreator {
    path: PathBuf,
    password: SecretString,
    iterations: u32,
    comment: String,
}

impl VaultCreator {
    pub fn new(path: impl AsRef<Path>, password: &str) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            password: SecretString::from(password.to_owned()),
            iterations: DEFAULT_ITERATIONS,
            comment: String::new(),
        }
    }

    /// Override the PBKDF2 cost. Must stay within the bounds the reader
    /// accepts, or `create` fails with `InvalidArgument`.
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    /// Free-form comment stored inside the encrypted directory.
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    /// Create the vault file and return an operations handle for it.
    ///
    /// The file is written as `header || sealed empty directory` with a
    /// fresh random salt and nonce, then fsynced. Fails with
    /// `AlreadyExists` if the path is occupied.
    #[instrument(level = "info", skip(self), fields(path = %self.path.display()))]
    pub fn create(self) -> Result<Vault> {
        if self.password.expose_secret().is_empty() {
            return Err(VaultError::InvalidArgument("empty password".into()));
        }
        if !(MIN_ITERATIONS..=MAX_ITERATIONS).contains(&self.iterations) {
            return Err(VaultError::InvalidArgument(format!(
                "iteration count {} outside [{MIN_ITERATIONS}, {MAX_ITERATIONS}]",
                self.iterations
            )));
        }

        let lock = VaultLockRegistry::global().get_or_create(&self.path);
        let guard = lock.write().unwrap_or_else(|e| e.into_inner());

        let mut header = VaultHeader::generate(self.iterations);
        let key = DerivedKey::derive(self.password.expose_secret(), &header.salt, header.iterations);
        let directory = Directory::new(self.comment);
        let sealed = directory.encode(&key, &header.nonce)?;
        header.directory_size = sealed.len() as u64;

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    VaultError::AlreadyExists(self.path.clone())
                } else {
                    VaultError::Io(e)
                }
            })?;
        header.write_to(&mut file)?;
        file.write_all(&sealed)?;
        file.sync_all()?;
        drop(guard);

        info!(iterations = self.iterations, "vault created");
        Ok(Vault::from_parts(self.path, self.password, lock))
    }
}
