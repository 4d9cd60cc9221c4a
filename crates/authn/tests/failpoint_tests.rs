#![allow(clippy::expect_used, clippy::panic)]
//! Integration tests for fail-point injection in the authn crate.
//!
//! These tests require both `failpoints` and `testutil` features:
//! ```bash
//! cargo test -p edgegate-authn --features failpoints,testutil --test failpoint_tests
//! ```

use std::sync::Arc;

use chrono::Utc;
use edgegate_authn::{
    AuthError, CachedCredentialEntry, ClientCredentials, CredentialsCache, Identity,
    RefreshOutcome, ScopeCache, ScopeDirectory,
    testutil::{StaticDirectory, sas_record},
};
use edgegate_storage::{MemoryBackend, StorageBackend};

fn scope_cache() -> (Arc<StaticDirectory>, ScopeCache) {
    let directory = Arc::new(StaticDirectory::new(vec![
        sas_record("device-1", "AAEC", None),
        sas_record("device-2", "AAEC", None),
    ]));
    let cache = ScopeCache::new("hub", Arc::clone(&directory) as Arc<dyn ScopeDirectory>);
    (directory, cache)
}

fn entry(device: &str) -> CachedCredentialEntry {
    let identity = Identity::device("hub", device).expect("identity");
    let creds = ClientCredentials::with_token(identity, "SharedAccessSignature sr=x&sig=AA%3D%3D&se=1");
    CachedCredentialEntry::new(&creds, Utc::now()).expect("entry")
}

#[tokio::test]
async fn page_fetch_failpoint_fails_refresh() {
    let scenario = fail::FailScenario::setup();
    let (directory, cache) = scope_cache();

    fail::cfg("scope-before-page-fetch", "return").expect("failed to configure fail point");

    let result = cache.refresh().await;
    assert!(matches!(result, Err(AuthError::Directory(_))), "refresh should fail: {result:?}");
    assert!(!cache.is_ready());
    assert_eq!(directory.page_fetches(), 0, "directory must not be contacted");
    assert_eq!(cache.metrics().failures, 1);

    scenario.teardown();
}

#[tokio::test]
async fn page_fetch_failpoint_keeps_previous_snapshot() {
    let scenario = fail::FailScenario::setup();
    let (directory, cache) = scope_cache();
    cache.refresh().await.expect("first refresh");

    directory.remove("device-1");
    fail::cfg("scope-before-page-fetch", "return").expect("failed to configure fail point");
    assert!(cache.refresh().await.is_err());
    assert!(cache.lookup("device-1").is_some(), "stale but available");
    assert_eq!(cache.snapshot().generation(), 1);

    fail::remove("scope-before-page-fetch");
    assert!(matches!(cache.refresh().await, Ok(RefreshOutcome::Refreshed(_))));
    assert!(cache.lookup("device-1").is_none());

    scenario.teardown();
}

#[tokio::test]
async fn failure_mid_pagination_discards_partial_snapshot() {
    let scenario = fail::FailScenario::setup();
    let directory = Arc::new(
        StaticDirectory::new(vec![
            sas_record("device-1", "AAEC", None),
            sas_record("device-2", "AAEC", None),
        ])
        .with_page_size(1),
    );
    let cache = ScopeCache::new("hub", Arc::clone(&directory) as Arc<dyn ScopeDirectory>);

    // First page passes, second fails.
    fail::cfg("scope-before-page-fetch", "1*off->return").expect("failed to configure fail point");
    assert!(cache.refresh().await.is_err());
    assert_eq!(directory.page_fetches(), 1);
    assert!(cache.lookup("device-1").is_none(), "no partial snapshot is published");

    scenario.teardown();
}

#[tokio::test]
async fn persist_failpoint_keeps_cache_authoritative() {
    let scenario = fail::FailScenario::setup();
    let store = MemoryBackend::new();
    let cache = CredentialsCache::open(Arc::new(store.clone())).await;

    fail::cfg("credentials-before-persist", "return").expect("failed to configure fail point");
    cache.put(entry("device-1")).expect("put");
    cache.sync().await;

    assert!(cache.try_get("device-1").is_some(), "in-memory entry survives a failed write");
    assert!(store.get(b"credentials/device-1").await.expect("get").is_none());

    fail::remove("credentials-before-persist");
    cache.put(entry("device-2")).expect("put");
    cache.sync().await;
    assert!(store.get(b"credentials/device-2").await.expect("get").is_some());

    cache.shutdown().await;
    scenario.teardown();
}
