//! Encryption-at-rest decorator for storage backends.
//!
//! [`EncryptedBackend`] wraps any [`StorageBackend`] and seals every value with
//! AES-256-GCM before it reaches the inner engine. Callers above it see plain
//! bytes; the engine only ever sees ciphertext.
//!
//! # Sealed Value Layout
//!
//! ```text
//! ┌─────────┬──────────────┬──────────────────────────────┐
//! │ version │ nonce (12 B) │ ciphertext ‖ tag (16 B)      │
//! │  (1 B)  │              │                              │
//! └─────────┴──────────────┴──────────────────────────────┘
//! ```
//!
//! The storage key is bound as associated data, so a sealed value copied
//! under a different key fails to open.
//!
//! # Unreadable Values
//!
//! - [`get`](StorageBackend::get) surfaces a value that fails to open as
//!   [`StorageError::Encryption`]
//! - [`get_prefix`](StorageBackend::get_prefix) skips such values and logs them,
//!   so one corrupted entry never hides the rest

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use async_trait::async_trait;
use bytes::Bytes;
use rand::RngCore;

use crate::{
    backend::StorageBackend,
    error::{StorageError, StorageResult},
    key_provider::{EncryptionKey, EncryptionKeyProvider},
    types::KeyValue,
};

/// Format version of sealed values.
const SEALED_VERSION: u8 = 1;

/// AES-GCM nonce length (96 bits).
const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length.
const TAG_LEN: usize = 16;

/// A storage decorator that encrypts values before delegating to `S`.
pub struct EncryptedBackend<S> {
    inner: S,
    cipher: Aes256Gcm,
}

impl<S: StorageBackend> EncryptedBackend<S> {
    /// Wraps `inner` with encryption under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Encryption`] if the cipher cannot be initialized
    /// from the key.
    pub fn new(inner: S, key: &EncryptionKey) -> StorageResult<Self> {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| StorageError::encryption(format!("cipher init: {e}")))?;
        Ok(Self { inner, cipher })
    }

    /// Obtains the key from `provider` once and wraps `inner` with it.
    ///
    /// # Errors
    ///
    /// Propagates the provider's error unchanged; a missing key is never
    /// papered over with a plaintext fallback.
    pub async fn from_provider(
        inner: S,
        provider: &dyn EncryptionKeyProvider,
    ) -> StorageResult<Self> {
        let key = provider.encryption_key().await?;
        Self::new(inner, &key)
    }

    /// Returns a reference to the inner backend.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn seal(&self, key: &[u8], plaintext: &[u8]) -> StorageResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, Payload { msg: plaintext, aad: key })
            .map_err(|e| StorageError::encryption(format!("seal failed: {e}")))?;

        let mut sealed = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        sealed.push(SEALED_VERSION);
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, key: &[u8], sealed: &[u8]) -> StorageResult<Vec<u8>> {
        if sealed.len() < 1 + NONCE_LEN + TAG_LEN {
            return Err(StorageError::encryption(format!(
                "sealed value too short: {} bytes",
                sealed.len()
            )));
        }
        let (version, rest) = sealed.split_at(1);
        if version[0] != SEALED_VERSION {
            return Err(StorageError::encryption(format!(
                "unsupported sealed value version {}",
                version[0]
            )));
        }
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), Payload { msg: ciphertext, aad: key })
            .map_err(|_| StorageError::encryption("authentication tag mismatch"))
    }
}

#[async_trait]
impl<S: StorageBackend> StorageBackend for EncryptedBackend<S> {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        match self.inner.get(key).await? {
            Some(sealed) => Ok(Some(Bytes::from(self.open(key, &sealed)?))),
            None => Ok(None),
        }
    }

    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        let sealed = self.seal(&key, &value)?;
        self.inner.set(key, sealed).await
    }

    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn get_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<KeyValue>> {
        let sealed_pairs = self.inner.get_prefix(prefix).await?;
        let mut pairs = Vec::with_capacity(sealed_pairs.len());
        for kv in sealed_pairs {
            match self.open(&kv.key, &kv.value) {
                Ok(plaintext) => pairs.push(KeyValue::new(kv.key, Bytes::from(plaintext))),
                Err(err) => {
                    tracing::warn!(
                        key = %String::from_utf8_lossy(&kv.key),
                        error = %err,
                        "skipping undecryptable stored value"
                    );
                },
            }
        }
        Ok(pairs)
    }

    async fn clear_prefix(&self, prefix: &[u8]) -> StorageResult<()> {
        self.inner.clear_prefix(prefix).await
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.inner.health_check().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::{MemoryBackend, key_provider::StaticKeyProvider};

    fn encrypted() -> (EncryptedBackend<MemoryBackend>, MemoryBackend) {
        let engine = MemoryBackend::new();
        let backend =
            EncryptedBackend::new(engine.clone(), &EncryptionKey::generate()).expect("cipher");
        (backend, engine)
    }

    #[tokio::test]
    async fn test_round_trip_hides_plaintext() {
        let (backend, engine) = encrypted();
        backend.set(b"credentials/dev-1".to_vec(), b"secret-proof".to_vec()).await.expect("set");

        let raw = engine.raw(b"credentials/dev-1").expect("engine holds sealed value");
        assert_eq!(raw[0], SEALED_VERSION);
        assert!(!raw.windows(b"secret-proof".len()).any(|w| w == b"secret-proof"));

        let value = backend.get(b"credentials/dev-1").await.expect("get");
        assert_eq!(value, Some(Bytes::from("secret-proof")));
    }

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let (backend, _) = encrypted();
        assert!(backend.get(b"absent").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_nonces_differ_per_write() {
        let (backend, engine) = encrypted();
        backend.set(b"a".to_vec(), b"same".to_vec()).await.expect("set");
        let first = engine.raw(b"a").expect("sealed");
        backend.set(b"a".to_vec(), b"same".to_vec()).await.expect("set");
        let second = engine.raw(b"a").expect("sealed");
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_tampered_value_fails_to_open() {
        let (backend, engine) = encrypted();
        backend.set(b"k".to_vec(), b"value".to_vec()).await.expect("set");

        let mut raw = engine.raw(b"k").expect("sealed").to_vec();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        engine.set(b"k".to_vec(), raw).await.expect("overwrite");

        let err = backend.get(b"k").await.expect_err("tampered value must not open");
        assert!(matches!(err, StorageError::Encryption { .. }));
    }

    #[tokio::test]
    async fn test_value_moved_to_other_key_fails_to_open() {
        let (backend, engine) = encrypted();
        backend.set(b"credentials/a".to_vec(), b"proof-a".to_vec()).await.expect("set");

        let raw = engine.raw(b"credentials/a").expect("sealed");
        engine.set(b"credentials/b".to_vec(), raw.to_vec()).await.expect("copy");

        assert!(backend.get(b"credentials/b").await.is_err());
    }

    #[tokio::test]
    async fn test_wrong_key_fails_to_open() {
        let engine = MemoryBackend::new();
        let writer = EncryptedBackend::new(engine.clone(), &EncryptionKey::generate()).expect("c");
        let reader = EncryptedBackend::new(engine.clone(), &EncryptionKey::generate()).expect("c");

        writer.set(b"k".to_vec(), b"value".to_vec()).await.expect("set");
        assert!(reader.get(b"k").await.is_err());
    }

    #[tokio::test]
    async fn test_prefix_scan_skips_corrupted_values() {
        let (backend, engine) = encrypted();
        backend.set(b"credentials/a".to_vec(), b"one".to_vec()).await.expect("set");
        backend.set(b"credentials/b".to_vec(), b"two".to_vec()).await.expect("set");
        engine.set(b"credentials/c".to_vec(), b"garbage".to_vec()).await.expect("raw set");

        let pairs = backend.get_prefix(b"credentials/").await.expect("scan");
        let values: Vec<_> = pairs.iter().map(|kv| kv.value.clone()).collect();
        assert_eq!(values, vec![Bytes::from("one"), Bytes::from("two")]);
    }

    #[tokio::test]
    async fn test_from_provider_uses_provided_key() {
        let key = EncryptionKey::generate();
        let engine = MemoryBackend::new();
        let provider = StaticKeyProvider::new(key.clone());
        let via_provider =
            EncryptedBackend::from_provider(engine.clone(), &provider).await.expect("backend");
        let direct = EncryptedBackend::new(engine, &key).expect("backend");

        via_provider.set(b"k".to_vec(), b"v".to_vec()).await.expect("set");
        assert_eq!(direct.get(b"k").await.expect("get"), Some(Bytes::from("v")));
    }
}
