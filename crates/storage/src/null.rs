//! No-op storage backend.
//!
//! [`NullBackend`] accepts every write and forgets it immediately. It stands in
//! for the persistent engine when credential persistence is disabled, so the
//! credentials cache can be wired identically in both configurations.

use async_trait::async_trait;
use bytes::Bytes;

use crate::{backend::StorageBackend, error::StorageResult, types::KeyValue};

/// A storage backend that stores nothing.
///
/// Reads always miss, writes and deletes always succeed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBackend;

impl NullBackend {
    /// Creates a new null backend.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StorageBackend for NullBackend {
    async fn get(&self, _key: &[u8]) -> StorageResult<Option<Bytes>> {
        Ok(None)
    }

    async fn set(&self, _key: Vec<u8>, _value: Vec<u8>) -> StorageResult<()> {
        Ok(())
    }

    async fn delete(&self, _key: &[u8]) -> StorageResult<()> {
        Ok(())
    }

    async fn get_prefix(&self, _prefix: &[u8]) -> StorageResult<Vec<KeyValue>> {
        Ok(Vec::new())
    }

    async fn clear_prefix(&self, _prefix: &[u8]) -> StorageResult<()> {
        Ok(())
    }

    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writes_are_discarded() {
        let backend = NullBackend::new();
        backend.set(b"credentials/dev-1".to_vec(), b"entry".to_vec()).await.expect("set");

        assert!(backend.get(b"credentials/dev-1").await.expect("get").is_none());
        assert!(backend.get_prefix(b"credentials/").await.expect("scan").is_empty());
        backend.delete(b"credentials/dev-1").await.expect("delete");
        backend.clear_prefix(b"credentials/").await.expect("clear");
    }
}
