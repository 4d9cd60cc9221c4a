//! Memoized record of previously validated client credentials.
//!
//! The in-memory map is authoritative for reads. Persistence happens behind
//! it: every mutation is queued, in order, to a single writer task that applies
//! it to the backing [`StorageBackend`]. When persistence is disabled the
//! backing store is a [`NullBackend`](edgegate_storage::NullBackend) and the
//! writer's work is a no-op.
//!
//! On [`open`](CredentialsCache::open) the cache preloads every entry the
//! store holds, so a restarted gateway can serve repeat clients without
//! recontacting the cloud.

use std::{collections::HashMap, sync::Arc};

use edgegate_storage::{StorageBackend, StorageError, StorageResult};
use fail::fail_point;
use parking_lot::{Mutex, RwLock};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::{error::Result, identity::CachedCredentialEntry};

/// Key prefix under which entries are persisted.
pub const CREDENTIALS_PREFIX: &[u8] = b"credentials/";

enum PersistOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Remove { key: Vec<u8> },
    Clear,
    Sync(oneshot::Sender<()>),
}

/// The credentials cache.
pub struct CredentialsCache {
    entries: RwLock<HashMap<String, CachedCredentialEntry>>,
    writer: Mutex<Option<mpsc::UnboundedSender<PersistOp>>>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl CredentialsCache {
    /// Opens the cache over `store`, preloading its entries.
    ///
    /// Entries that cannot be read back are skipped and logged. A store that
    /// fails the preload leaves the cache empty but usable.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    #[tracing::instrument(skip_all)]
    pub async fn open(store: Arc<dyn StorageBackend>) -> Self {
        let entries = match store.get_prefix(CREDENTIALS_PREFIX).await {
            Ok(stored) => {
                let mut entries = HashMap::with_capacity(stored.len());
                for kv in stored {
                    match decode(&kv.key, &kv.value) {
                        Ok(entry) => {
                            entries.insert(entry.key().to_owned(), entry);
                        },
                        Err(err) => {
                            tracing::warn!(
                                key = %String::from_utf8_lossy(&kv.key),
                                error = %err,
                                "skipping unreadable cached credentials"
                            );
                        },
                    }
                }
                entries
            },
            Err(err) => {
                tracing::warn!(error = %err, "credentials preload failed, starting empty");
                HashMap::new()
            },
        };
        tracing::debug!(entries = entries.len(), "credentials cache opened");

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_writer(store, rx));

        Self {
            entries: RwLock::new(entries),
            writer: Mutex::new(Some(tx)),
            writer_handle: Mutex::new(Some(handle)),
        }
    }

    /// Returns the entry cached for `key`, if any. Never performs I/O.
    pub fn try_get(&self, key: &str) -> Option<CachedCredentialEntry> {
        self.entries.read().get(key).cloned()
    }

    /// Inserts or replaces the entry for the entry's identity.
    ///
    /// The stored timestamp never moves backwards: if the cache already holds
    /// a later validation time for the identity, that time is kept.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidProof`](crate::AuthError::InvalidProof) if
    /// the entry cannot be encoded for persistence. The cache is unchanged.
    pub fn put(&self, mut entry: CachedCredentialEntry) -> Result<()> {
        let key = entry.key().to_owned();
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&key)
            && existing.validated_at() > entry.validated_at()
        {
            entry.set_validated_at(existing.validated_at());
        }
        let value = entry.to_bytes()?;
        entries.insert(key.clone(), entry);
        // Enqueued under the map lock so the store sees writes in map order.
        self.enqueue(PersistOp::Put { key: storage_key(&key), value });
        Ok(())
    }

    /// Removes the entry for `key`. Returns `true` if one was present.
    #[tracing::instrument(skip(self))]
    pub fn invalidate(&self, key: &str) -> bool {
        let mut entries = self.entries.write();
        let removed = entries.remove(key).is_some();
        if removed {
            self.enqueue(PersistOp::Remove { key: storage_key(key) });
        }
        drop(entries);

        tracing::info!(
            audit.action = "invalidate_credentials",
            audit.resource = %key,
            audit.result = if removed { "success" } else { "absent" },
            "audit_event"
        );
        removed
    }

    /// Removes every entry from the cache and the store.
    #[tracing::instrument(skip(self))]
    pub fn flush(&self) {
        let mut entries = self.entries.write();
        let evicted = entries.len();
        entries.clear();
        self.enqueue(PersistOp::Clear);
        drop(entries);

        tracing::info!(
            audit.action = "flush_credentials",
            audit.resource = "all_credentials",
            audit.result = "success",
            audit.evicted = evicted,
            "audit_event"
        );
    }

    /// Waits until every mutation queued so far has reached the store.
    pub async fn sync(&self) {
        let (tx, rx) = oneshot::channel();
        let queued = self.writer.lock().as_ref().is_some_and(|writer| writer.send(PersistOp::Sync(tx)).is_ok());
        if queued {
            let _ = rx.await;
        }
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drains queued writes and stops the writer task.
    ///
    /// Mutations after shutdown still update the in-memory map but are no
    /// longer persisted.
    pub async fn shutdown(&self) {
        drop(self.writer.lock().take());
        let handle = self.writer_handle.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            tracing::warn!(error = %err, "credentials writer task panicked");
        }
    }

    fn enqueue(&self, op: PersistOp) {
        let writer = self.writer.lock();
        let sent = writer.as_ref().is_some_and(|writer| writer.send(op).is_ok());
        if !sent {
            tracing::debug!("credentials writer stopped, change not persisted");
        }
    }
}

fn storage_key(identity_key: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(CREDENTIALS_PREFIX.len() + identity_key.len());
    key.extend_from_slice(CREDENTIALS_PREFIX);
    key.extend_from_slice(identity_key.as_bytes());
    key
}

fn decode(key: &[u8], value: &[u8]) -> Result<CachedCredentialEntry> {
    let entry = CachedCredentialEntry::from_bytes(value)?;
    if storage_key(entry.key()) != key {
        return Err(crate::AuthError::invalid_proof(format!(
            "entry for {} stored under another key",
            entry.key()
        )));
    }
    Ok(entry)
}

async fn run_writer(store: Arc<dyn StorageBackend>, mut rx: mpsc::UnboundedReceiver<PersistOp>) {
    while let Some(op) = rx.recv().await {
        if let PersistOp::Sync(done) = op {
            let _ = done.send(());
            continue;
        }
        if let Err(err) = persist(store.as_ref(), op).await {
            tracing::warn!(error = %err, "failed to persist credentials change");
        }
    }
    tracing::debug!("credentials writer drained");
}

async fn persist(store: &dyn StorageBackend, op: PersistOp) -> StorageResult<()> {
    fail_point!("credentials-before-persist", |_| {
        Err(StorageError::internal("injected failure before credentials persist"))
    });
    match op {
        PersistOp::Put { key, value } => store.set(key, value).await,
        PersistOp::Remove { key } => store.delete(&key).await,
        PersistOp::Clear => store.clear_prefix(CREDENTIALS_PREFIX).await,
        PersistOp::Sync(done) => {
            let _ = done.send(());
            Ok(())
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use chrono::{Duration, Utc};
    use edgegate_storage::{EncryptedBackend, EncryptionKey, MemoryBackend, NullBackend};

    use super::*;
    use crate::identity::{CertificateProof, ClientCredentials, Identity};

    fn entry(device: &str, leaf: u8) -> CachedCredentialEntry {
        let identity = Identity::device("hub", device).expect("identity");
        let creds = ClientCredentials::with_certificate(
            identity,
            CertificateProof { leaf: vec![leaf], chain: Vec::new(), common_name: None },
        );
        CachedCredentialEntry::new(&creds, Utc::now()).expect("entry")
    }

    #[tokio::test]
    async fn test_put_get_invalidate() {
        let cache = CredentialsCache::open(Arc::new(NullBackend::new())).await;
        assert!(cache.try_get("device-1").is_none());

        cache.put(entry("device-1", 1)).expect("put");
        assert_eq!(cache.try_get("device-1").expect("hit").key(), "device-1");
        assert_eq!(cache.len(), 1);

        assert!(cache.invalidate("device-1"));
        assert!(!cache.invalidate("device-1"));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_put_overwrites_and_keeps_latest_timestamp() {
        let cache = CredentialsCache::open(Arc::new(NullBackend::new())).await;
        let later = entry("device-1", 1);
        let later_at = later.validated_at();
        cache.put(later).expect("put");

        let mut earlier = entry("device-1", 2);
        earlier.set_validated_at(later_at - Duration::minutes(5));
        cache.put(earlier).expect("put");

        let stored = cache.try_get("device-1").expect("hit");
        assert_eq!(stored.validated_at(), later_at);
        let creds = stored.to_credentials().expect("credentials");
        assert!(matches!(creds.proof(), crate::identity::Proof::Certificate(c) if c.leaf == vec![2]));
    }

    #[tokio::test]
    async fn test_writes_reach_store_in_order() {
        let store = MemoryBackend::new();
        let cache = CredentialsCache::open(Arc::new(store.clone())).await;

        cache.put(entry("device-1", 1)).expect("put");
        cache.put(entry("device-2", 2)).expect("put");
        cache.invalidate("device-1");
        cache.sync().await;

        assert!(store.get(b"credentials/device-1").await.expect("get").is_none());
        assert!(store.get(b"credentials/device-2").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn test_preload_survives_restart() {
        let store = MemoryBackend::new();
        let key = EncryptionKey::generate();

        let first =
            CredentialsCache::open(Arc::new(EncryptedBackend::new(store.clone(), &key).expect("wrap")))
                .await;
        first.put(entry("device-1", 1)).expect("put");
        first.shutdown().await;

        let second =
            CredentialsCache::open(Arc::new(EncryptedBackend::new(store.clone(), &key).expect("wrap")))
                .await;
        assert!(second.try_get("device-1").is_some());
    }

    #[tokio::test]
    async fn test_preload_skips_unreadable_entries() {
        let store = MemoryBackend::new();
        store.set(b"credentials/garbage".to_vec(), b"not json".to_vec()).await.expect("set");
        store
            .set(b"credentials/elsewhere".to_vec(), entry("device-9", 9).to_bytes().expect("encode"))
            .await
            .expect("set");
        store
            .set(b"credentials/device-1".to_vec(), entry("device-1", 1).to_bytes().expect("encode"))
            .await
            .expect("set");

        let cache = CredentialsCache::open(Arc::new(store)).await;
        assert_eq!(cache.len(), 1);
        assert!(cache.try_get("device-1").is_some());
    }

    #[tokio::test]
    async fn test_preload_with_wrong_key_starts_empty() {
        let store = MemoryBackend::new();
        let first = CredentialsCache::open(Arc::new(
            EncryptedBackend::new(store.clone(), &EncryptionKey::generate()).expect("wrap"),
        ))
        .await;
        first.put(entry("device-1", 1)).expect("put");
        first.shutdown().await;

        let second = CredentialsCache::open(Arc::new(
            EncryptedBackend::new(store, &EncryptionKey::generate()).expect("wrap"),
        ))
        .await;
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_flush_clears_cache_and_store() {
        let store = MemoryBackend::new();
        let cache = CredentialsCache::open(Arc::new(store.clone())).await;
        cache.put(entry("device-1", 1)).expect("put");
        cache.put(entry("device-2", 2)).expect("put");

        cache.flush();
        cache.sync().await;
        assert!(cache.is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending_writes() {
        let store = MemoryBackend::new();
        let cache = CredentialsCache::open(Arc::new(store.clone())).await;
        for i in 0..50u8 {
            cache.put(entry(&format!("device-{i}"), i)).expect("put");
        }
        cache.shutdown().await;
        assert_eq!(store.len(), 50);

        cache.put(entry("late", 0)).expect("put after shutdown");
        assert!(cache.try_get("late").is_some());
        cache.sync().await;
        assert_eq!(store.len(), 50);
    }
}
