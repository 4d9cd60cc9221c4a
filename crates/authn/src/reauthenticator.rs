//! Background revalidation of open connections.
//!
//! A [`ConnectionReauthenticator`] moves through `Idle -> Scanning -> Idle`
//! once per period. Each scan lists the open connections, groups them by
//! identity, rebuilds the credentials that identity authenticated with from
//! the credentials cache, and runs them once through
//! [`Authenticator::reauthenticate`]. A conclusive denial closes every
//! connection of the identity and then invalidates its cached entry; an
//! inconclusive one leaves them alone until the next scan.
//!
//! Scope change events trigger the same revalidation immediately for the
//! affected identities, whether or not they are connected, so a revoked
//! identity's cached credentials never outlive the change.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::{
    sync::broadcast::{
        self,
        error::{RecvError, TryRecvError},
    },
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::{
    authenticator::Authenticator,
    error::Result,
    identity::Identity,
    outcome::{AuthResult, DenyReason},
    registry::{ConnectionHandle, ConnectionRegistry, OpenConnection},
    scope_cache::ScopeChange,
};

/// Per-scan tallies, counted in connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Connections looked at.
    pub examined: usize,
    /// Connections that revalidated successfully.
    pub kept: usize,
    /// Connections closed after a conclusive denial.
    pub closed: usize,
    /// Connections passed over: the service identity, no cached credentials,
    /// or not closable when the close was issued.
    pub skipped: usize,
    /// Connections left open after an inconclusive denial.
    pub inconclusive: usize,
}

impl ScanStats {
    fn merge(&mut self, other: ScanStats) {
        self.examined += other.examined;
        self.kept += other.kept;
        self.closed += other.closed;
        self.skipped += other.skipped;
        self.inconclusive += other.inconclusive;
    }
}

/// Result of triggering a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// The scan ran to completion.
    Completed(ScanStats),
    /// Another scan was running; this trigger did nothing.
    Coalesced,
}

/// Point-in-time reauthenticator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReauthMetrics {
    /// Completed scans.
    pub scans: u64,
    /// Connections closed, by scans and change events together.
    pub closed: u64,
    /// Scan triggers skipped because a scan was running.
    pub skipped_ticks: u64,
}

/// Periodically revalidates every open connection.
pub struct ConnectionReauthenticator {
    authenticator: Arc<Authenticator>,
    registry: Arc<dyn ConnectionRegistry>,
    service_identity: Option<String>,
    /// Denied identities with connections the registry failed to close. Their
    /// cached entries are already gone, so the denial is remembered here.
    pending_close: Mutex<HashMap<String, DenyReason>>,
    scan_guard: tokio::sync::Mutex<()>,
    cancel_token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    scans: AtomicU64,
    closed: AtomicU64,
    skipped_ticks: AtomicU64,
}

impl ConnectionReauthenticator {
    /// Creates a reauthenticator. Connections authenticated as
    /// `service_identity` are never revalidated.
    pub fn new(
        authenticator: Arc<Authenticator>,
        registry: Arc<dyn ConnectionRegistry>,
        service_identity: Option<String>,
    ) -> Self {
        Self {
            authenticator,
            registry,
            service_identity,
            pending_close: Mutex::new(HashMap::new()),
            scan_guard: tokio::sync::Mutex::new(()),
            cancel_token: CancellationToken::new(),
            handle: Mutex::new(None),
            scans: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            skipped_ticks: AtomicU64::new(0),
        }
    }

    /// Returns the reauthenticator counters.
    pub fn metrics(&self) -> ReauthMetrics {
        ReauthMetrics {
            scans: self.scans.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            skipped_ticks: self.skipped_ticks.load(Ordering::Relaxed),
        }
    }

    /// Revalidates every open connection once.
    ///
    /// If a scan is already running, returns [`ScanOutcome::Coalesced`].
    ///
    /// # Errors
    ///
    /// Returns the registry's error if the open connections cannot be listed.
    /// Failures revalidating a single identity never abort the scan.
    #[tracing::instrument(skip(self))]
    pub async fn scan(&self) -> Result<ScanOutcome> {
        let Ok(_guard) = self.scan_guard.try_lock() else {
            self.skipped_ticks.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("scan already running, skipping tick");
            return Ok(ScanOutcome::Coalesced);
        };

        let started = Instant::now();
        let connections = self.registry.list_open_connections().await?;
        let mut stats = ScanStats::default();
        for (identity, handles) in group_by_identity(connections).into_values() {
            stats.merge(self.revalidate(&identity, &handles).await);
        }
        self.scans.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            examined = stats.examined,
            kept = stats.kept,
            closed = stats.closed,
            skipped = stats.skipped,
            inconclusive = stats.inconclusive,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "reauthentication scan complete"
        );
        Ok(ScanOutcome::Completed(stats))
    }

    /// Revalidates one identity and its open connections.
    ///
    /// # Errors
    ///
    /// Returns the registry's error if the open connections cannot be listed.
    pub async fn reauthenticate_identity(&self, identity: &Identity) -> Result<ScanStats> {
        self.reauthenticate_identities(std::slice::from_ref(identity)).await
    }

    /// Revalidates each of `identities` against a single listing of the open
    /// connections.
    ///
    /// An identity is revalidated from its cached credentials even when it
    /// has no open connection, so a denial still invalidates the entry.
    ///
    /// # Errors
    ///
    /// Returns the registry's error if the open connections cannot be listed.
    #[tracing::instrument(skip_all, fields(identities = identities.len()))]
    pub async fn reauthenticate_identities(&self, identities: &[Identity]) -> Result<ScanStats> {
        let mut stats = ScanStats::default();
        if identities.is_empty() {
            return Ok(stats);
        }

        let mut groups = group_by_identity(self.registry.list_open_connections().await?);
        let mut seen = HashSet::new();
        for identity in identities {
            if !seen.insert(identity.key()) {
                continue;
            }
            let handles = groups.remove(identity.key()).map(|(_, handles)| handles).unwrap_or_default();
            stats.merge(self.revalidate(identity, &handles).await);
        }
        Ok(stats)
    }

    async fn revalidate(&self, identity: &Identity, handles: &[ConnectionHandle]) -> ScanStats {
        let mut stats = ScanStats { examined: handles.len(), ..ScanStats::default() };
        let key = identity.key();

        if self.service_identity.as_deref() == Some(key) {
            stats.skipped = handles.len();
            return stats;
        }

        let cache = self.authenticator.credentials_cache();
        let Some(entry) = cache.try_get(key) else {
            let pending = self.pending_close.lock().get(key).copied();
            match pending {
                Some(reason) if !handles.is_empty() => {
                    self.close_all(key, handles, reason, &mut stats).await;
                },
                _ => {
                    if !handles.is_empty() {
                        tracing::debug!(identity = %key, "no cached credentials, skipping");
                    }
                    stats.skipped = handles.len();
                },
            }
            return stats;
        };
        let credentials = match entry.to_credentials() {
            Ok(credentials) => credentials,
            Err(err) => {
                tracing::warn!(identity = %key, error = %err, "cached credentials unreadable, skipping");
                stats.skipped = handles.len();
                return stats;
            },
        };

        match self.authenticator.reauthenticate(&credentials).await {
            AuthResult::Allowed => {
                self.pending_close.lock().remove(key);
                stats.kept = handles.len();
            },
            AuthResult::Denied(reason) if !reason.is_conclusive() => {
                tracing::debug!(identity = %key, reason = %reason, "inconclusive, keeping connections");
                stats.inconclusive = handles.len();
            },
            AuthResult::Denied(reason) => {
                self.close_all(key, handles, reason, &mut stats).await;
                cache.invalidate(key);
            },
        }
        stats
    }

    async fn close_all(
        &self,
        key: &str,
        handles: &[ConnectionHandle],
        reason: DenyReason,
        stats: &mut ScanStats,
    ) {
        let mut unclosed = false;
        for &handle in handles {
            match self.registry.close(handle).await {
                Ok(true) => {
                    self.closed.fetch_add(1, Ordering::Relaxed);
                    stats.closed += 1;
                    tracing::info!(
                        audit.action = "close_connection",
                        audit.resource = %key,
                        audit.result = "success",
                        audit.reason = %reason,
                        handle = %handle,
                        "audit_event"
                    );
                },
                Ok(false) => {
                    tracing::debug!(identity = %key, handle = %handle, "connection already closed");
                    stats.skipped += 1;
                },
                Err(err) => {
                    tracing::warn!(identity = %key, handle = %handle, error = %err, "failed to close revoked connection");
                    stats.skipped += 1;
                    unclosed = true;
                },
            }
        }

        let mut pending = self.pending_close.lock();
        if unclosed {
            pending.insert(key.to_owned(), reason);
        } else {
            pending.remove(key);
        }
    }

    /// Starts the periodic scan loop.
    ///
    /// The first scan runs one `period` after spawning. When `changes` is
    /// given, scope changes revalidate the affected identities right away;
    /// changes already queued are handled together, and a lagged subscription
    /// falls back to a full scan.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    #[must_use]
    pub fn spawn(
        self: Arc<Self>,
        period: Duration,
        changes: Option<broadcast::Receiver<ScopeChange>>,
    ) -> Arc<Self> {
        let this = Arc::clone(&self);
        let token = self.cancel_token.clone();

        let handle = tokio::spawn(async move {
            let mut changes = changes;
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        tracing::info!("reauthentication task shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = this.scan().await {
                            tracing::warn!(error = %err, "reauthentication scan failed");
                        }
                    }
                    signal = next_change(&mut changes) => {
                        let mut changed = Vec::new();
                        let lagged = match signal {
                            ChangeSignal::Changed(change) => {
                                changed.push(change.identity().clone());
                                drain_queued(&mut changes, &mut changed)
                            },
                            ChangeSignal::Lagged(missed) => Some(missed),
                        };
                        if let Err(err) = this.reauthenticate_identities(&changed).await {
                            tracing::warn!(error = %err, "reauthentication after scope change failed");
                        }
                        if let Some(missed) = lagged {
                            tracing::warn!(missed, "scope change subscription lagged, scanning everything");
                            if let Err(err) = this.scan().await {
                                tracing::warn!(error = %err, "reauthentication scan failed");
                            }
                        }
                    }
                }
            }
        });

        *self.handle.lock() = Some(handle);
        self
    }

    /// Stops the scan loop, letting an in-flight scan finish.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            tracing::warn!(error = %err, "reauthentication task panicked");
        }
    }
}

fn group_by_identity(
    connections: Vec<OpenConnection>,
) -> BTreeMap<String, (Identity, Vec<ConnectionHandle>)> {
    let mut groups: BTreeMap<String, (Identity, Vec<ConnectionHandle>)> = BTreeMap::new();
    for OpenConnection { identity, handle } in connections {
        groups
            .entry(identity.key().to_owned())
            .or_insert_with(|| (identity, Vec::new()))
            .1
            .push(handle);
    }
    groups
}

enum ChangeSignal {
    Changed(ScopeChange),
    Lagged(u64),
}

/// Resolves with the next change, or never once the subscription is gone.
async fn next_change(slot: &mut Option<broadcast::Receiver<ScopeChange>>) -> ChangeSignal {
    loop {
        let Some(rx) = slot.as_mut() else {
            return std::future::pending().await;
        };
        let received = rx.recv().await;
        match received {
            Ok(change) => return ChangeSignal::Changed(change),
            Err(RecvError::Lagged(missed)) => return ChangeSignal::Lagged(missed),
            Err(RecvError::Closed) => *slot = None,
        }
    }
}

/// Moves every change already queued into `changed`. Returns the number of
/// missed changes if the subscription lagged.
fn drain_queued(
    slot: &mut Option<broadcast::Receiver<ScopeChange>>,
    changed: &mut Vec<Identity>,
) -> Option<u64> {
    let rx = slot.as_mut()?;
    loop {
        match rx.try_recv() {
            Ok(change) => changed.push(change.identity().clone()),
            Err(TryRecvError::Lagged(missed)) => return Some(missed),
            Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
        }
    }
}
