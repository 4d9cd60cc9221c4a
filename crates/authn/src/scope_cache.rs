//! Periodically refreshed snapshot of the identities the directory authorizes.
//!
//! Readers never block on a refresh: [`ScopeCache::lookup`] reads the current
//! [`ScopeSnapshot`] through a short read lock and an `Arc` clone, while a
//! refresh builds the next snapshot off to the side and swaps it in whole.
//!
//! ```text
//!  directory pages ──► refresh (single-flight) ──► Arc<ScopeSnapshot> ──► lookup
//!                                 │
//!                                 └──► ScopeChange broadcast ──► reauthenticator
//! ```

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use fail::fail_point;
use parking_lot::{Mutex, RwLock};
use tokio::{sync::broadcast, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    directory::ScopeDirectory,
    error::{AuthError, Result},
    identity::{Identity, ServiceIdentity},
};

/// Capacity of the scope change broadcast channel.
///
/// A subscriber that falls further behind than this observes a lag and
/// should treat it as "everything may have changed".
pub const SCOPE_CHANGE_CAPACITY: usize = 1024;

/// An immutable view of the directory at one point in time.
#[derive(Debug, Default)]
pub struct ScopeSnapshot {
    generation: u64,
    refreshed_at: Option<DateTime<Utc>>,
    identities: HashMap<String, Arc<ServiceIdentity>>,
}

impl ScopeSnapshot {
    /// Generation number; `0` until the first successful refresh.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// When the snapshot was built.
    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.refreshed_at
    }

    /// Looks up an identity by key.
    pub fn get(&self, key: &str) -> Option<&Arc<ServiceIdentity>> {
        self.identities.get(key)
    }

    /// Number of identities in the snapshot.
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    /// Returns `true` if the snapshot holds no identities.
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Iterates over every identity in the snapshot.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServiceIdentity>> {
        self.identities.values()
    }
}

/// A change to one identity between two consecutive snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeChange {
    /// The identity's record changed generation or status.
    Updated(Identity),
    /// The identity is no longer in the directory.
    Removed(Identity),
}

impl ScopeChange {
    /// The identity the change concerns.
    pub fn identity(&self) -> &Identity {
        match self {
            Self::Updated(identity) | Self::Removed(identity) => identity,
        }
    }
}

/// Statistics from one successful refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshStats {
    /// Generation of the snapshot that was swapped in.
    pub generation: u64,
    /// Identities in the new snapshot.
    pub records: usize,
    /// Malformed records that were skipped.
    pub skipped: usize,
    /// Pages fetched from the directory.
    pub pages: usize,
    /// Identities not present in the previous snapshot.
    pub added: usize,
    /// Identities whose record changed.
    pub updated: usize,
    /// Identities dropped from the previous snapshot.
    pub removed: usize,
    /// Wall time spent in the refresh.
    pub elapsed: Duration,
}

/// Result of triggering a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new snapshot was swapped in.
    Refreshed(RefreshStats),
    /// Another refresh was already in flight; this trigger did nothing.
    Coalesced,
}

/// Point-in-time scope cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScopeCacheMetrics {
    /// Successful refreshes.
    pub refreshes: u64,
    /// Failed refreshes.
    pub failures: u64,
    /// Triggers coalesced into an in-flight refresh.
    pub coalesced: u64,
    /// Current snapshot generation.
    pub generation: u64,
}

/// The scope cache.
pub struct ScopeCache {
    hub_name: String,
    directory: Arc<dyn ScopeDirectory>,
    snapshot: RwLock<Arc<ScopeSnapshot>>,
    refresh_guard: tokio::sync::Mutex<()>,
    changes: broadcast::Sender<ScopeChange>,
    cancel_token: CancellationToken,
    refresh_handle: Mutex<Option<JoinHandle<()>>>,
    refreshes: AtomicU64,
    failures: AtomicU64,
    coalesced: AtomicU64,
}

impl ScopeCache {
    /// Creates an empty scope cache for `hub_name`.
    ///
    /// The cache holds generation `0` until [`refresh`](Self::refresh) first
    /// succeeds; lookups against it always miss.
    pub fn new(hub_name: impl Into<String>, directory: Arc<dyn ScopeDirectory>) -> Self {
        let (changes, _) = broadcast::channel(SCOPE_CHANGE_CAPACITY);
        Self {
            hub_name: hub_name.into(),
            directory,
            snapshot: RwLock::new(Arc::new(ScopeSnapshot::default())),
            refresh_guard: tokio::sync::Mutex::new(()),
            changes,
            cancel_token: CancellationToken::new(),
            refresh_handle: Mutex::new(None),
            refreshes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    /// Hub the cached identities belong to.
    pub fn hub_name(&self) -> &str {
        &self.hub_name
    }

    /// Looks up an identity in the current snapshot.
    pub fn lookup(&self, key: &str) -> Option<Arc<ServiceIdentity>> {
        self.snapshot.read().get(key).cloned()
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> Arc<ScopeSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Returns `true` once a refresh has succeeded.
    pub fn is_ready(&self) -> bool {
        self.snapshot.read().generation > 0
    }

    /// Subscribes to per-identity change events.
    pub fn subscribe(&self) -> broadcast::Receiver<ScopeChange> {
        self.changes.subscribe()
    }

    /// Returns the cache counters.
    pub fn metrics(&self) -> ScopeCacheMetrics {
        ScopeCacheMetrics {
            refreshes: self.refreshes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            generation: self.snapshot.read().generation,
        }
    }

    /// Drains the directory and swaps in a new snapshot.
    ///
    /// If a refresh is already running, returns [`RefreshOutcome::Coalesced`]
    /// immediately without contacting the directory.
    ///
    /// # Errors
    ///
    /// Returns the directory's error if any page fails. The previous snapshot
    /// stays in place.
    #[tracing::instrument(skip(self), fields(hub = %self.hub_name))]
    pub async fn refresh(&self) -> Result<RefreshOutcome> {
        let Ok(_guard) = self.refresh_guard.try_lock() else {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("refresh already in flight, coalescing");
            return Ok(RefreshOutcome::Coalesced);
        };

        let started = Instant::now();
        let collected = match self.collect().await {
            Ok(collected) => collected,
            Err(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %err, "scope refresh failed, keeping previous snapshot");
                return Err(err);
            },
        };

        let previous = self.snapshot();
        let changes = diff(&previous, &collected.identities);
        let mut stats = RefreshStats {
            generation: previous.generation + 1,
            records: collected.identities.len(),
            skipped: collected.skipped,
            pages: collected.pages,
            ..RefreshStats::default()
        };
        for change in &changes {
            match change {
                Change::Added => stats.added += 1,
                Change::Event(ScopeChange::Updated(_)) => stats.updated += 1,
                Change::Event(ScopeChange::Removed(_)) => stats.removed += 1,
            }
        }

        let next = ScopeSnapshot {
            generation: stats.generation,
            refreshed_at: Some(Utc::now()),
            identities: collected.identities,
        };
        *self.snapshot.write() = Arc::new(next);
        self.refreshes.fetch_add(1, Ordering::Relaxed);

        for change in changes {
            if let Change::Event(event) = change {
                // No subscribers is fine.
                let _ = self.changes.send(event);
            }
        }

        stats.elapsed = started.elapsed();
        tracing::info!(
            generation = stats.generation,
            records = stats.records,
            skipped = stats.skipped,
            pages = stats.pages,
            added = stats.added,
            updated = stats.updated,
            removed = stats.removed,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "scope refreshed"
        );
        Ok(RefreshOutcome::Refreshed(stats))
    }

    async fn collect(&self) -> Result<Collected> {
        let mut collected = Collected::default();
        let mut seen_tokens = HashSet::new();
        let mut continuation = None;

        loop {
            fail_point!("scope-before-page-fetch", |_| {
                Err(AuthError::directory("injected failure before page fetch"))
            });
            let page = self.directory.fetch_page(continuation.take()).await?;
            collected.pages += 1;

            for record in page.records {
                let described = record.describe();
                match record.into_service_identity(&self.hub_name) {
                    Ok(identity) => {
                        let key = identity.identity().key().to_owned();
                        if collected.identities.insert(key, Arc::new(identity)).is_some() {
                            tracing::warn!(identity = %described, "duplicate directory record, keeping the last");
                        }
                    },
                    Err(err) => {
                        collected.skipped += 1;
                        tracing::warn!(identity = %described, error = %err, "skipping malformed directory record");
                    },
                }
            }

            match page.continuation {
                Some(token) => {
                    if !seen_tokens.insert(token.clone()) {
                        return Err(AuthError::directory(format!(
                            "directory repeated continuation token {token:?}"
                        )));
                    }
                    continuation = Some(token);
                },
                None => return Ok(collected),
            }
        }
    }

    /// Starts the periodic refresh loop.
    ///
    /// The first refresh runs immediately; later ones every `period`. A tick
    /// that lands while a refresh is still running is skipped.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    #[must_use]
    pub fn spawn_refresh(self: Arc<Self>, period: Duration) -> Arc<Self> {
        let cache = Arc::clone(&self);
        let token = self.cancel_token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        tracing::info!("scope refresh task shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        // Failures are logged and counted by refresh itself.
                        let _ = cache.refresh().await;
                    }
                }
            }
        });

        *self.refresh_handle.lock() = Some(handle);
        self
    }

    /// Stops the refresh loop, letting an in-flight refresh finish.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let handle = self.refresh_handle.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            tracing::warn!(error = %err, "scope refresh task panicked");
        }
    }
}

#[derive(Default)]
struct Collected {
    identities: HashMap<String, Arc<ServiceIdentity>>,
    pages: usize,
    skipped: usize,
}

enum Change {
    Added,
    Event(ScopeChange),
}

fn diff(previous: &ScopeSnapshot, next: &HashMap<String, Arc<ServiceIdentity>>) -> Vec<Change> {
    let mut changes = Vec::new();
    for (key, identity) in next {
        match previous.identities.get(key) {
            None => changes.push(Change::Added),
            Some(old) if old.differs_from(identity) => {
                changes.push(Change::Event(ScopeChange::Updated(identity.identity().clone())));
            },
            Some(_) => {},
        }
    }
    for (key, old) in &previous.identities {
        if !next.contains_key(key) {
            changes.push(Change::Event(ScopeChange::Removed(old.identity().clone())));
        }
    }
    changes
}
