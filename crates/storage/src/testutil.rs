//! Shared test utilities for storage backend testing.
//!
//! This module is feature-gated behind `testutil` to prevent leaking into
//! production builds.
//!
//! ```toml
//! [dev-dependencies]
//! edgegate-storage = { path = "../storage", features = ["testutil"] }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    StorageBackend,
    error::{StorageError, StorageResult},
    memory::MemoryBackend,
    types::KeyValue,
};

/// A backend that can be switched into a failing state.
///
/// While healthy it delegates to an inner [`MemoryBackend`]; while failing
/// every operation returns a [`StorageError::Connection`]. Counts writes so
/// tests can assert on what reached the engine.
#[derive(Default)]
pub struct FailingBackend {
    inner: MemoryBackend,
    failing: AtomicBool,
    writes: AtomicU64,
}

impl FailingBackend {
    /// Creates a backend that starts out healthy.
    #[must_use]
    pub fn healthy() -> Self {
        Self::default()
    }

    /// Creates a backend that starts out failing.
    #[must_use]
    pub fn failing() -> Self {
        let backend = Self::default();
        backend.set_failing(true);
        backend
    }

    /// Switches the failing state.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns the number of successful `set` calls.
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Returns the healthy inner backend.
    #[must_use]
    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    fn check(&self) -> StorageResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::connection("injected storage failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FailingBackend {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        self.check()?;
        self.inner.set(key, value).await?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn get_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<KeyValue>> {
        self.check()?;
        self.inner.get_prefix(prefix).await
    }

    async fn clear_prefix(&self, prefix: &[u8]) -> StorageResult<()> {
        self.check()?;
        self.inner.clear_prefix(prefix).await
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.check()
    }
}

/// Create a deterministic test key from a prefix and index.
///
/// Produces keys like `"prefix/000042"`, zero-padded so lexicographic order
/// matches numeric order.
#[must_use]
pub fn make_key(prefix: &str, idx: usize) -> Vec<u8> {
    format!("{prefix}/{idx:06}").into_bytes()
}
