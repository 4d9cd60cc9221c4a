//! In-memory storage backend implementation.
//!
//! [`MemoryBackend`] keeps entries in a [`BTreeMap`] behind a
//! [`parking_lot::RwLock`]. It backs tests and is the degraded engine the
//! credentials store falls back to when the persistent engine cannot be opened.
//!
//! # Limitations
//!
//! - Data is not persisted; all data is lost when the process exits
//! - No replication or distributed features

use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::{backend::StorageBackend, error::StorageResult, types::KeyValue};

/// In-memory storage backend using [`BTreeMap`].
///
/// # Cloning
///
/// `MemoryBackend` is cheaply cloneable via [`Arc`]. All clones share the
/// same underlying data store.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Bytes>>>,
}

impl MemoryBackend {
    /// Creates a new, empty in-memory storage backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns `true` if no keys are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Returns the raw stored bytes for `key`, bypassing any decorator.
    ///
    /// Lets tests inspect what actually reached the engine.
    #[must_use]
    pub fn raw(&self, key: &[u8]) -> Option<Bytes> {
        self.data.read().get(key).cloned()
    }

    fn prefix_keys(data: &BTreeMap<Vec<u8>, Bytes>, prefix: &[u8]) -> Vec<Vec<u8>> {
        data.range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    #[tracing::instrument(skip(self, key), fields(key_len = key.len()))]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        Ok(self.data.read().get(key).cloned())
    }

    #[tracing::instrument(skip(self, key, value), fields(key_len = key.len(), value_len = value.len()))]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        self.data.write().insert(key, Bytes::from(value));
        Ok(())
    }

    #[tracing::instrument(skip(self, key), fields(key_len = key.len()))]
    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        self.data.write().remove(key);
        Ok(())
    }

    #[tracing::instrument(skip(self, prefix))]
    async fn get_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<KeyValue>> {
        let data = self.data.read();
        let pairs = data
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| KeyValue::new(Bytes::copy_from_slice(key), value.clone()))
            .collect();
        Ok(pairs)
    }

    #[tracing::instrument(skip(self, prefix))]
    async fn clear_prefix(&self, prefix: &[u8]) -> StorageResult<()> {
        let mut data = self.data.write();
        for key in Self::prefix_keys(&data, prefix) {
            data.remove(&key);
        }
        Ok(())
    }

    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}
