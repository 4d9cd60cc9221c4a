//! Ordered initialization of the authentication core.
//!
//! Each function takes already-constructed collaborators and returns an
//! explicit result, so the composition root wires the core in one visible
//! order:
//!
//! ```text
//! init_credentials_store ─► init_credentials_cache ─┐
//! init_scope_cache ─────────────────────────────────┼─► init_authenticator ─► init_reauthenticator
//! cloud validator ──────────────────────────────────┘
//! ```
//!
//! Configuration mistakes (a missing collaborator the mode needs, missing
//! encryption material) fail here, before anything serves traffic. A storage
//! engine that cannot be opened does not: the store degrades to memory and
//! says so.

use std::sync::Arc;

use edgegate_storage::{
    EncryptedBackend, EncryptionKeyProvider, MemoryBackend, NullBackend, StorageBackend,
    StorageResult,
};

use crate::{
    authenticator::{
        AuthStrategy, Authenticator, CloudAuthenticator, FallbackAuthenticator, ScopeAuthenticator,
    },
    cloud::CloudValidator,
    config::{AuthConfig, AuthMode},
    credentials_cache::CredentialsCache,
    directory::ScopeDirectory,
    error::{AuthError, Result},
    reauthenticator::ConnectionReauthenticator,
    registry::ConnectionRegistry,
    scope_cache::ScopeCache,
};

/// How the credentials store ended up being backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// Persistence disabled by configuration; writes are discarded.
    Disabled,
    /// The persistent engine.
    Persistent,
    /// The engine could not be opened; an in-memory store stands in.
    InMemoryFallback,
}

/// The keyed byte store underneath the credentials cache.
pub struct CredentialsStore {
    backend: Arc<dyn StorageBackend>,
    kind: StoreKind,
    encrypted: bool,
}

impl CredentialsStore {
    /// The composed backend.
    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        Arc::clone(&self.backend)
    }

    /// How the store is backed.
    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    /// Whether values are encrypted before reaching the backend.
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }
}

/// Composes the credentials store.
///
/// `engine` is the outcome of opening the persistent engine; it is only
/// consulted when persistence is enabled. The encryption key is obtained
/// before the engine is looked at, so missing key material fails even when the
/// engine would have fallen back to memory.
///
/// # Errors
///
/// - [`AuthError::MissingCollaborator`] if encryption is required and no key
///   provider is wired.
/// - [`AuthError::EncryptionKeyUnavailable`] if the provider fails.
#[tracing::instrument(skip_all, fields(
    persist = config.persist_credentials(),
    encrypt = config.encrypt_at_rest()
))]
pub async fn init_credentials_store(
    config: &AuthConfig,
    engine: StorageResult<Arc<dyn StorageBackend>>,
    key_provider: Option<&dyn EncryptionKeyProvider>,
) -> Result<CredentialsStore> {
    if !config.persist_credentials() {
        tracing::info!("credential persistence disabled by configuration");
        return Ok(CredentialsStore {
            backend: Arc::new(NullBackend::new()),
            kind: StoreKind::Disabled,
            encrypted: false,
        });
    }

    let key = if config.encrypt_at_rest() {
        let provider = key_provider.ok_or(AuthError::MissingCollaborator("encryption key provider"))?;
        Some(provider.encryption_key().await.map_err(AuthError::EncryptionKeyUnavailable)?)
    } else {
        tracing::info!("persisted credentials are unencrypted by configuration");
        None
    };

    let opened = match engine {
        Ok(engine) => engine.health_check().await.map(|()| engine),
        Err(err) => Err(err),
    };
    let (engine, kind) = match opened {
        Ok(engine) => (engine, StoreKind::Persistent),
        Err(err) => {
            tracing::warn!(
                error = %err,
                "credentials store unavailable, falling back to in-memory store; \
                 validated credentials will not survive a restart"
            );
            (Arc::new(MemoryBackend::new()) as Arc<dyn StorageBackend>, StoreKind::InMemoryFallback)
        },
    };

    let (backend, encrypted): (Arc<dyn StorageBackend>, bool) = match key {
        Some(key) => (Arc::new(EncryptedBackend::new(engine, &key)?), true),
        None => (engine, false),
    };
    tracing::info!(kind = ?kind, encrypted, "credentials store ready");
    Ok(CredentialsStore { backend, kind, encrypted })
}

/// Opens the credentials cache over `store`, preloading persisted entries.
pub async fn init_credentials_cache(store: &CredentialsStore) -> Arc<CredentialsCache> {
    Arc::new(CredentialsCache::open(store.backend()).await)
}

/// Creates the scope cache and starts its refresh loop, if the mode needs one.
///
/// Returns `None` in cloud-only mode. The first refresh runs immediately in
/// the background; until it succeeds, scope lookups fail closed.
///
/// # Errors
///
/// Returns [`AuthError::MissingCollaborator`] if the mode needs a directory
/// and none is wired.
///
/// # Panics
///
/// Must be called within a Tokio runtime context.
pub fn init_scope_cache(
    config: &AuthConfig,
    directory: Option<Arc<dyn ScopeDirectory>>,
) -> Result<Option<Arc<ScopeCache>>> {
    if !config.mode().requires_scope() {
        return Ok(None);
    }
    let directory = directory.ok_or(AuthError::MissingCollaborator("scope directory"))?;
    let cache = Arc::new(ScopeCache::new(config.hub_name(), directory))
        .spawn_refresh(config.scope_refresh_period());
    Ok(Some(cache))
}

/// Builds the authenticator for the configured mode.
///
/// # Errors
///
/// Returns [`AuthError::MissingCollaborator`] if the mode needs a scope cache
/// or cloud validator that was not supplied.
pub fn init_authenticator(
    config: &AuthConfig,
    scope: Option<Arc<ScopeCache>>,
    cloud: Option<Arc<dyn CloudValidator>>,
    credentials: Arc<CredentialsCache>,
) -> Result<Arc<Authenticator>> {
    let scope_validator = || {
        scope
            .clone()
            .map(|scope| ScopeAuthenticator::new(scope, config.trusted_ca_thumbprints().to_vec()))
            .ok_or(AuthError::MissingCollaborator("scope cache"))
    };
    let cloud_validator = || {
        cloud
            .clone()
            .map(|cloud| CloudAuthenticator::new(cloud, config.cloud_timeout()))
            .ok_or(AuthError::MissingCollaborator("cloud validator"))
    };

    let strategy = match config.mode() {
        AuthMode::CloudOnly => AuthStrategy::CloudOnly(cloud_validator()?),
        AuthMode::ScopeOnly => AuthStrategy::ScopeOnly(scope_validator()?),
        AuthMode::ScopeThenCloud => AuthStrategy::ScopeThenCloud(FallbackAuthenticator::new(
            scope_validator()?,
            cloud_validator()?,
        )),
    };
    tracing::info!(mode = ?config.mode(), "authenticator ready");
    Ok(Arc::new(Authenticator::new(strategy, credentials)))
}

/// Creates the connection reauthenticator and starts its scan loop.
///
/// When a scope cache is given, the reauthenticator also reacts to its change
/// events.
///
/// # Panics
///
/// Must be called within a Tokio runtime context.
pub fn init_reauthenticator(
    config: &AuthConfig,
    authenticator: Arc<Authenticator>,
    registry: Arc<dyn ConnectionRegistry>,
    scope: Option<&ScopeCache>,
) -> Arc<ConnectionReauthenticator> {
    let reauthenticator = ConnectionReauthenticator::new(
        authenticator,
        registry,
        config.service_identity().map(str::to_owned),
    );
    Arc::new(reauthenticator).spawn(config.reauth_period(), scope.map(ScopeCache::subscribe))
}
