//! Cooperative cancellation for streaming operations.
//!
//! Every streaming loop in the engine checks a [`CancelToken`] at buffer
//! boundaries, and bulk operations check it between entries. A token can be
//! cancelled explicitly or carry a deadline; both surface as
//! [`VaultError::Cancelled`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Result, VaultError};

/// Shared cancellation signal.
///
/// Cloning is cheap and all clones observe the same flag, so a token can be
/// handed to a worker pool while the caller retains the ability to cancel.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// A token that never fires unless [`cancel`](Self::cancel) is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that fires once `timeout` has elapsed, in addition to
    /// explicit cancellation.
    pub fn with_deadline(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: Some(Instant::now() + timeout),
            }),
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// Whether the token has fired (explicitly or via deadline).
    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return true;
        }
        match self.inner.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// Checkpoint for streaming loops.
    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(VaultError::Cancelled)
        } else {
            Ok(())
        }
    }
}
