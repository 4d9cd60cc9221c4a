//! Test doubles for the authentication core's collaborators.
//!
//! Feature-gated behind `testutil` to prevent leaking into production builds.
//!
//! ```toml
//! [dev-dependencies]
//! edgegate-authn = { path = "../authn", features = ["testutil"] }
//! ```
//!
//! - [`StaticDirectory`]: in-memory scope directory with paging, a fail
//!   switch, fetch counters, and an optional gate that holds fetches open
//! - [`StaticCloudValidator`]: allow-list cloud validator with a call counter
//! - [`MemoryConnectionRegistry`]: open connections tracked in a map
//! - [`create_sas_token`] / [`generate_symmetric_key`]: token minting

use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use tokio::sync::Notify;

use crate::{
    cloud::CloudValidator,
    directory::{AuthenticationRecord, ScopeDirectory, ScopePage, ScopeRecord},
    error::{AuthError, Result},
    identity::{ClientCredentials, Identity},
    outcome::{AuthResult, DenyReason},
    registry::{ConnectionHandle, ConnectionRegistry, OpenConnection},
    token::{SasToken, resource_uri},
};

/// Generates a random 32-byte symmetric key, base64 encoded.
pub fn generate_symmetric_key() -> String {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    STANDARD.encode(key)
}

/// Mints a token for `identity` signed with the base64 `key`, expiring
/// `lifetime` from now. A negative lifetime yields an expired token.
///
/// # Panics
///
/// Panics if `key` is not valid base64.
pub fn create_sas_token(identity: &Identity, key: &str, lifetime: chrono::Duration) -> String {
    let key = STANDARD.decode(key).expect("test key must be base64");
    SasToken::sign(&resource_uri(identity), &key, Utc::now() + lifetime).expect("sign test token")
}

/// An enabled device record with symmetric keys.
pub fn sas_record(device_id: &str, primary: &str, secondary: Option<&str>) -> ScopeRecord {
    ScopeRecord {
        device_id: device_id.to_owned(),
        module_id: None,
        generation_id: "1".to_owned(),
        status: "enabled".to_owned(),
        authentication: AuthenticationRecord::sas(primary, secondary.map(str::to_owned)),
    }
}

/// An enabled module record with symmetric keys.
pub fn module_record(device_id: &str, module_id: &str, primary: &str) -> ScopeRecord {
    ScopeRecord { module_id: Some(module_id.to_owned()), ..sas_record(device_id, primary, None) }
}

/// In-memory scope directory.
///
/// Continuation tokens are record offsets. Records can be edited between
/// refreshes to simulate directory changes.
pub struct StaticDirectory {
    records: RwLock<Vec<ScopeRecord>>,
    page_size: usize,
    failing: AtomicBool,
    looping: AtomicBool,
    gate: Mutex<Option<Arc<Notify>>>,
    traversals: AtomicU64,
    page_fetches: AtomicU64,
}

impl StaticDirectory {
    /// Creates a directory serving `records`, all in one page.
    pub fn new(records: Vec<ScopeRecord>) -> Self {
        Self {
            records: RwLock::new(records),
            page_size: usize::MAX,
            failing: AtomicBool::new(false),
            looping: AtomicBool::new(false),
            gate: Mutex::new(None),
            traversals: AtomicU64::new(0),
            page_fetches: AtomicU64::new(0),
        }
    }

    /// Serves at most `page_size` records per page.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Makes every fetch fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Makes every page point back at the first one.
    pub fn set_looping(&self, looping: bool) {
        self.looping.store(looping, Ordering::SeqCst);
    }

    /// Installs a gate: each fetch waits for one `notify_one` on it.
    pub fn gate(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Replaces every record.
    pub fn set_records(&self, records: Vec<ScopeRecord>) {
        *self.records.write() = records;
    }

    /// Inserts a record, replacing one with the same key.
    pub fn upsert(&self, record: ScopeRecord) {
        let mut records = self.records.write();
        let key = record.describe();
        records.retain(|existing| existing.describe() != key);
        records.push(record);
    }

    /// Removes the record with `key`.
    pub fn remove(&self, key: &str) {
        self.records.write().retain(|record| record.describe() != key);
    }

    /// Edits the record with `key` and bumps its generation.
    pub fn update(&self, key: &str, edit: impl FnOnce(&mut ScopeRecord)) {
        let mut records = self.records.write();
        if let Some(record) = records.iter_mut().find(|record| record.describe() == key) {
            edit(record);
            let next = record.generation_id.parse::<u64>().unwrap_or(0) + 1;
            record.generation_id = next.to_string();
        }
    }

    /// Number of traversals started (first-page fetches).
    pub fn traversals(&self) -> u64 {
        self.traversals.load(Ordering::SeqCst)
    }

    /// Number of pages requested.
    pub fn page_fetches(&self) -> u64 {
        self.page_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScopeDirectory for StaticDirectory {
    async fn fetch_page(&self, continuation: Option<String>) -> Result<ScopePage> {
        self.page_fetches.fetch_add(1, Ordering::SeqCst);
        if continuation.is_none() {
            self.traversals.fetch_add(1, Ordering::SeqCst);
        }

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuthError::directory("injected directory failure"));
        }

        let start = match continuation {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| AuthError::directory(format!("bad continuation {token:?}")))?,
            None => 0,
        };
        let records = self.records.read();
        let end = start.saturating_add(self.page_size).min(records.len());
        let page = records.get(start..end).map(<[ScopeRecord]>::to_vec).unwrap_or_default();

        let continuation = if self.looping.load(Ordering::SeqCst) {
            Some("0".to_owned())
        } else {
            (end < records.len()).then(|| end.to_string())
        };
        Ok(ScopePage { records: page, continuation })
    }
}

/// Cloud validator that allows a fixed set of identities, whatever their proof.
#[derive(Default)]
pub struct StaticCloudValidator {
    allowed: RwLock<HashSet<String>>,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
    calls: AtomicU64,
}

impl StaticCloudValidator {
    /// Creates a validator that allows nobody.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allows `identity`.
    pub fn allow(&self, identity: &Identity) {
        self.allowed.write().insert(identity.key().to_owned());
    }

    /// Stops allowing `identity`.
    pub fn revoke(&self, identity: &Identity) {
        self.allowed.write().remove(identity.key());
    }

    /// Makes every call fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delays every call by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Number of validation calls received.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CloudValidator for StaticCloudValidator {
    async fn validate(&self, credentials: &ClientCredentials) -> Result<AuthResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuthError::cloud("injected cloud failure"));
        }
        if self.allowed.read().contains(credentials.identity().key()) {
            Ok(AuthResult::Allowed)
        } else {
            Ok(AuthResult::Denied(DenyReason::CloudRejected))
        }
    }
}

/// Connection registry over an in-memory map.
#[derive(Default)]
pub struct MemoryConnectionRegistry {
    connections: Mutex<BTreeMap<ConnectionHandle, Identity>>,
    next_handle: AtomicU64,
    failing: AtomicBool,
    failing_closes: AtomicBool,
    disconnect_after_listing: AtomicBool,
    listings: AtomicU64,
}

impl MemoryConnectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an open connection for `identity`.
    pub fn connect(&self, identity: Identity) -> ConnectionHandle {
        let handle = ConnectionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.connections.lock().insert(handle, identity);
        handle
    }

    /// Drops a connection as if the client went away.
    pub fn disconnect(&self, handle: ConnectionHandle) {
        self.connections.lock().remove(&handle);
    }

    /// Returns `true` if `handle` is still open.
    pub fn is_open(&self, handle: ConnectionHandle) -> bool {
        self.connections.lock().contains_key(&handle)
    }

    /// Number of open connections.
    pub fn open_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Makes every call fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Makes `close` fail while listing keeps working.
    pub fn set_failing_closes(&self, failing: bool) {
        self.failing_closes.store(failing, Ordering::SeqCst);
    }

    /// Number of times the open connections were listed.
    pub fn listings(&self) -> u64 {
        self.listings.load(Ordering::SeqCst)
    }

    /// Drops every connection right after it is listed, simulating clients
    /// that disconnect while a scan is running.
    pub fn disconnect_after_listing(&self, enabled: bool) {
        self.disconnect_after_listing.store(enabled, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionRegistry for MemoryConnectionRegistry {
    async fn list_open_connections(&self) -> Result<Vec<OpenConnection>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuthError::registry("injected registry failure"));
        }
        self.listings.fetch_add(1, Ordering::SeqCst);
        let mut connections = self.connections.lock();
        let listed = connections
            .iter()
            .map(|(handle, identity)| OpenConnection { identity: identity.clone(), handle: *handle })
            .collect();
        if self.disconnect_after_listing.load(Ordering::SeqCst) {
            connections.clear();
        }
        Ok(listed)
    }

    async fn close(&self, handle: ConnectionHandle) -> Result<bool> {
        if self.failing.load(Ordering::SeqCst) || self.failing_closes.load(Ordering::SeqCst) {
            return Err(AuthError::registry("injected registry failure"));
        }
        Ok(self.connections.lock().remove(&handle).is_some())
    }
}
