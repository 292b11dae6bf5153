//! Vault-level operations: creation, mutation, extraction, locking.

pub mod creator;
pub mod extract;
pub mod locks;
pub mod operations;

pub(crate) mod rewrite;

pub use crate::cancel::CancelToken;
pub use creator::VaultCreator;
pub use extract::{ExtractOptions, PathPolicy, ProgressEvent, default_workers};
pub use locks::VaultLockRegistry;
pub use operations::{AddOptions, Vault, VaultInfo};
