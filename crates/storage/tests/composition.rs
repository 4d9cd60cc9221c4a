//! Decorator composition: the stacks the credentials cache is built from.

#![allow(clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use edgegate_storage::{
    EncryptedBackend, EncryptionKey, MemoryBackend, NullBackend, StaticKeyProvider,
    StorageBackend, StorageError, testutil::FailingBackend,
};
use rstest::rstest;

fn encrypted_over(inner: Arc<dyn StorageBackend>) -> EncryptedBackend<Arc<dyn StorageBackend>> {
    EncryptedBackend::new(inner, &EncryptionKey::generate()).expect("backend")
}

#[tokio::test]
async fn encrypted_over_shared_engine_hides_plaintext() {
    let engine = MemoryBackend::new();
    let store = encrypted_over(Arc::new(engine.clone()));

    store.set(b"credentials/dev-1".to_vec(), b"secret-proof".to_vec()).await.expect("set");

    let raw = engine.raw(b"credentials/dev-1").expect("stored");
    assert!(!raw.windows(b"secret-proof".len()).any(|w| w == b"secret-proof"));
    let plain = store.get(b"credentials/dev-1").await.expect("get").expect("present");
    assert_eq!(&plain[..], b"secret-proof");
}

#[tokio::test]
async fn encrypted_propagates_engine_failures() {
    let engine = Arc::new(FailingBackend::healthy());
    let store = encrypted_over(Arc::clone(&engine) as Arc<dyn StorageBackend>);
    store.set(b"credentials/dev-1".to_vec(), b"proof".to_vec()).await.expect("set");
    assert_eq!(engine.writes(), 1);

    engine.set_failing(true);
    assert!(matches!(store.get(b"credentials/dev-1").await, Err(StorageError::Connection { .. })));
    assert!(matches!(
        store.set(b"credentials/dev-2".to_vec(), b"proof".to_vec()).await,
        Err(StorageError::Connection { .. })
    ));
    assert!(store.health_check().await.is_err());
    assert_eq!(engine.writes(), 1);

    engine.set_failing(false);
    assert!(store.get(b"credentials/dev-1").await.expect("get").is_some());
}

#[tokio::test]
async fn keys_from_different_stores_do_not_open_each_other() {
    let engine = MemoryBackend::new();
    let writer = encrypted_over(Arc::new(engine.clone()));
    let reader = encrypted_over(Arc::new(engine.clone()));

    writer.set(b"credentials/dev-1".to_vec(), b"proof".to_vec()).await.expect("set");

    assert!(matches!(
        reader.get(b"credentials/dev-1").await,
        Err(StorageError::Encryption { .. })
    ));
    assert!(reader.get_prefix(b"credentials/").await.expect("prefix").is_empty());
}

#[tokio::test]
async fn from_provider_uses_provisioned_key() {
    let key = EncryptionKey::generate();
    let provider = StaticKeyProvider::new(EncryptionKey::from_bytes(key.as_bytes()).expect("key"));
    let engine = MemoryBackend::new();

    let first = EncryptedBackend::from_provider(engine.clone(), &provider).await.expect("first");
    first.set(b"credentials/dev-1".to_vec(), b"proof".to_vec()).await.expect("set");

    let second = EncryptedBackend::new(engine, &key).expect("second");
    let value = second.get(b"credentials/dev-1").await.expect("get").expect("present");
    assert_eq!(&value[..], b"proof");
}

#[rstest]
#[case::null(Arc::new(NullBackend::new()) as Arc<dyn StorageBackend>, 0)]
#[case::memory(Arc::new(MemoryBackend::new()) as Arc<dyn StorageBackend>, 3)]
#[tokio::test]
async fn prefix_scan_through_trait_object(
    #[case] backend: Arc<dyn StorageBackend>,
    #[case] expected: usize,
) {
    for i in 0..3 {
        let key = edgegate_storage::testutil::make_key("credentials", i);
        backend.set(key, b"proof".to_vec()).await.expect("set");
    }
    backend.set(b"other/key".to_vec(), b"x".to_vec()).await.expect("set");

    let found = backend.get_prefix(b"credentials/").await.expect("prefix");
    assert_eq!(found.len(), expected);

    backend.clear_prefix(b"credentials/").await.expect("clear");
    assert!(backend.get_prefix(b"credentials/").await.expect("prefix").is_empty());
    assert_eq!(backend.get(b"other/key").await.expect("get").is_some(), expected > 0);
}
