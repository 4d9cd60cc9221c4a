//! Encryption key provisioning.
//!
//! The credentials store obtains its symmetric key exactly once, at startup,
//! from an [`EncryptionKeyProvider`]. Production gateways back this with a
//! secure key-provisioning service (an HSM or workload identity daemon); the
//! [`StaticKeyProvider`] serves keys that were already loaded by the caller.

use std::fmt;

use async_trait::async_trait;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{StorageError, StorageResult};

/// Length in bytes of an at-rest encryption key (AES-256).
pub const ENCRYPTION_KEY_LEN: usize = 32;

/// Symmetric key used to seal values at rest.
///
/// The key bytes are held in a [`Zeroizing`] buffer so they are scrubbed from
/// memory when the last copy is dropped. `Debug` never prints key material.
#[derive(Clone)]
pub struct EncryptionKey(Zeroizing<[u8; ENCRYPTION_KEY_LEN]>);

impl EncryptionKey {
    /// Builds a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Encryption`] if `bytes` is not exactly
    /// [`ENCRYPTION_KEY_LEN`] bytes long.
    pub fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        let array: [u8; ENCRYPTION_KEY_LEN] = bytes.try_into().map_err(|_| {
            StorageError::encryption(format!(
                "expected {ENCRYPTION_KEY_LEN}-byte key, got {} bytes",
                bytes.len()
            ))
        })?;
        Ok(Self(Zeroizing::new(array)))
    }

    /// Generates a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; ENCRYPTION_KEY_LEN]);
        rand::thread_rng().fill_bytes(&mut *bytes);
        Self(bytes)
    }

    /// Returns the raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; ENCRYPTION_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// Source of the at-rest encryption key.
///
/// Invoked once during startup. Failing to produce a key when encrypted
/// persistence is required is fatal; it is never retried per call.
#[async_trait]
pub trait EncryptionKeyProvider: Send + Sync {
    /// Returns the symmetric key used to seal stored values.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] if the key cannot be provisioned.
    async fn encryption_key(&self) -> StorageResult<EncryptionKey>;
}

/// Provider that hands out a key already held in memory.
#[derive(Debug, Clone)]
pub struct StaticKeyProvider {
    key: EncryptionKey,
}

impl StaticKeyProvider {
    /// Creates a provider that always returns `key`.
    #[must_use]
    pub fn new(key: EncryptionKey) -> Self {
        Self { key }
    }
}

#[async_trait]
impl EncryptionKeyProvider for StaticKeyProvider {
    async fn encryption_key(&self) -> StorageResult<EncryptionKey> {
        Ok(self.key.clone())
    }
}
