//! Password-based key derivation and digest comparison.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::format::SALT_LEN;

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

/// A key derived from the vault password.
///
/// The backing buffer is zeroized when the value is dropped, and the `Debug`
/// implementation redacts it. Each operation derives its own key and drops
/// it on every exit path; keys are never shared across operations.
pub struct DerivedKey(Zeroizing<[u8; KEY_LEN]>);

impl DerivedKey {
    /// Derive a key with PBKDF2-HMAC-SHA256.
    ///
    /// `iterations` comes from the vault header so that existing vaults
    /// keep deriving the same key regardless of the current default cost.
    pub fn derive(password: &str, salt: &[u8; SALT_LEN], iterations: u32) -> Self {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, key.as_mut());
        Self(key)
    }

    pub(crate) fn bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DerivedKey").field(&"[REDACTED]").finish()
    }
}

/// Constant-time comparison of two SHA-256 digests.
pub fn digests_match(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.ct_eq(b).into()
}
