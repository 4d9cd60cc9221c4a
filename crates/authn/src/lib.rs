//! # Edge Gateway Authentication
//!
//! Identity and trust core of the edge gateway: decides whether a connecting
//! client's credentials are valid, keeps that decision cheap to repeat, and
//! keeps already-open connections honest as trust changes.
//!
//! This crate provides:
//! - **Scope cache**: periodically refreshed snapshot of the identities the remote directory
//!   authorizes, with single-flight refresh and change notifications
//! - **Authenticator**: cloud-only, scope-only, or scope-then-cloud validation behind a
//!   write-through credentials cache
//! - **Credentials cache**: validated credentials, optionally persisted through encrypted storage
//! - **Connection reauthenticator**: background revalidation of open connections, closing those
//!   whose trust was revoked
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use edgegate_authn::{AuthConfig, AuthMode, init};
//! use edgegate_authn::{CloudValidator, ConnectionRegistry, ScopeDirectory};
//! use edgegate_storage::{MemoryBackend, StorageBackend, StaticKeyProvider, EncryptionKey};
//!
//! # async fn example(
//! #     directory: Arc<dyn ScopeDirectory>,
//! #     cloud: Arc<dyn CloudValidator>,
//! #     registry: Arc<dyn ConnectionRegistry>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = AuthConfig::builder()
//!     .hub_name("hub.example.net")
//!     .mode(AuthMode::ScopeThenCloud)
//!     .persist_credentials(true)
//!     .build()?;
//!
//! let engine: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
//! let keys = StaticKeyProvider::new(EncryptionKey::generate());
//!
//! let store = init::init_credentials_store(&config, Ok(engine), Some(&keys)).await?;
//! let credentials = init::init_credentials_cache(&store).await;
//! let scope = init::init_scope_cache(&config, Some(directory))?;
//! let authenticator =
//!     init::init_authenticator(&config, scope.clone(), Some(cloud), credentials)?;
//! let reauthenticator =
//!     init::init_reauthenticator(&config, Arc::clone(&authenticator), registry, scope.as_deref());
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **`testutil`**: test doubles for every collaborator
//! - **`failpoints`**: `fail` injection points on the refresh and persistence paths

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Authenticator strategies.
pub mod authenticator;
/// Certificate thumbprint matching.
pub mod certificate;
/// Cloud validator contract.
pub mod cloud;
/// Configuration.
pub mod config;
/// Credentials cache.
pub mod credentials_cache;
/// Scope directory contract.
pub mod directory;
/// Authentication error types.
pub mod error;
/// Identity and credential types.
pub mod identity;
/// Ordered initialization.
pub mod init;
/// Authentication outcomes.
pub mod outcome;
/// Connection reauthentication.
pub mod reauthenticator;
/// Connection registry contract.
pub mod registry;
/// Scope cache.
pub mod scope_cache;
/// Shared test utilities.
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
/// Shared access signature tokens.
pub mod token;

// Re-export key types for convenience
pub use authenticator::{
    AuthStrategy, Authenticator, CloudAuthenticator, CredentialsValidator, FallbackAuthenticator,
    ScopeAuthenticator,
};
pub use cloud::CloudValidator;
pub use config::{AuthConfig, AuthMode};
pub use credentials_cache::CredentialsCache;
pub use directory::{ScopeDirectory, ScopePage, ScopeRecord};
pub use error::{AuthError, Result};
pub use identity::{
    AuthenticationInfo, CachedCredentialEntry, CertificateProof, ClientCredentials, Identity,
    IdentityStatus, Proof, ServiceIdentity,
};
pub use outcome::{AuthResult, DenyReason};
pub use reauthenticator::{ConnectionReauthenticator, ScanOutcome, ScanStats};
pub use registry::{ConnectionHandle, ConnectionRegistry, OpenConnection};
pub use scope_cache::{RefreshOutcome, RefreshStats, ScopeCache, ScopeChange, ScopeSnapshot};
pub use token::SasToken;
