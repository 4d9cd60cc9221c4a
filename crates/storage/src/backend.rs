//! Storage backend trait definition.
//!
//! [`StorageBackend`] is the keyed byte storage interface shared by the
//! physical engine, the [`NullBackend`](crate::NullBackend) used when
//! persistence is disabled, and the [`EncryptedBackend`](crate::EncryptedBackend)
//! decorator that provides secrecy at rest.
//!
//! # Design Philosophy
//!
//! - **Keys and values are bytes**: No assumptions about serialization format
//! - **Async by default**: All operations are async for non-blocking I/O
//! - **Object safe**: Decorators are composed once at construction time over
//!   `Arc<dyn StorageBackend>` and never re-wrapped at runtime
//!
//! The engine is expected to provide its own concurrency safety. A write is
//! either fully applied or not observed.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{error::StorageResult, types::KeyValue};

/// Abstract storage backend for key-value operations.
///
/// # Key Operations
///
/// | Method | Description |
/// |--------|-------------|
/// | [`get`](StorageBackend::get) | Retrieve a single value by key |
/// | [`set`](StorageBackend::set) | Store a key-value pair, overwriting any prior value |
/// | [`delete`](StorageBackend::delete) | Remove a key |
/// | [`get_prefix`](StorageBackend::get_prefix) | Retrieve every pair whose key starts with a prefix |
/// | [`clear_prefix`](StorageBackend::clear_prefix) | Delete every key that starts with a prefix |
/// | [`health_check`](StorageBackend::health_check) | Verify backend availability |
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use edgegate_storage::{MemoryBackend, StorageBackend};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let backend = MemoryBackend::new();
///
/// backend.set(b"key".to_vec(), b"value".to_vec()).await.unwrap();
/// let value = backend.get(b"key").await.unwrap();
/// assert_eq!(value, Some(Bytes::from("value")));
/// # });
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Retrieves a value by key.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(bytes))` if the key exists
    /// - `Ok(None)` if the key doesn't exist
    /// - `Err(...)` on storage errors
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Stores a key-value pair. If the key already exists, its value is overwritten.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()>;

    /// Deletes a key. Deleting a missing key is not an error.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn delete(&self, key: &[u8]) -> StorageResult<()>;

    /// Retrieves every key-value pair whose key starts with `prefix`, in key order.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<KeyValue>>;

    /// Deletes every key that starts with `prefix`.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn clear_prefix(&self, prefix: &[u8]) -> StorageResult<()>;

    /// Verifies that the backend is reachable and able to serve requests.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn health_check(&self) -> StorageResult<()>;
}

#[async_trait]
impl<T: StorageBackend + ?Sized> StorageBackend for Arc<T> {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        (**self).get(key).await
    }

    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        (**self).set(key, value).await
    }

    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        (**self).delete(key).await
    }

    async fn get_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<KeyValue>> {
        (**self).get_prefix(prefix).await
    }

    async fn clear_prefix(&self, prefix: &[u8]) -> StorageResult<()> {
        (**self).clear_prefix(prefix).await
    }

    async fn health_check(&self) -> StorageResult<()> {
        (**self).health_check().await
    }
}
