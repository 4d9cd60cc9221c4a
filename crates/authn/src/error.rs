//! Authentication error types.
//!
//! [`AuthError`] covers construction-time misconfiguration and collaborator
//! failures. Expected authentication failures (bad credentials, unknown
//! identity, stale directory) are not errors: they are reported as
//! [`AuthResult::Denied`](crate::AuthResult::Denied) with a
//! [`DenyReason`](crate::DenyReason).

use edgegate_storage::{ConfigError, StorageError};
use thiserror::Error;

/// Authentication core errors.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]`. Downstream match expressions must
/// include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// A collaborator required by the selected mode was not wired.
    #[error("Missing collaborator: {0}")]
    MissingCollaborator(&'static str),

    /// The at-rest encryption key could not be provisioned.
    #[error("Encryption key unavailable: {0}")]
    EncryptionKeyUnavailable(#[source] StorageError),

    /// Configuration failed validation.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The remote scope directory failed or returned an unusable page.
    #[error("Directory error: {0}")]
    Directory(String),

    /// The cloud validator could not be reached or failed.
    #[error("Cloud validation error: {0}")]
    Cloud(String),

    /// The connection registry failed.
    #[error("Connection registry error: {0}")]
    Registry(String),

    /// A directory record could not be turned into a service identity.
    #[error("Malformed directory record {record}: {reason}")]
    MalformedRecord {
        /// Identity key (or best-effort description) of the offending record.
        record: String,
        /// Why the record was rejected.
        reason: String,
    },

    /// An identity could not be constructed from its parts.
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// A presented proof could not be parsed.
    #[error("Invalid proof: {0}")]
    InvalidProof(String),

    /// Storage error while reading or writing cached credentials.
    ///
    /// Wraps the original [`StorageError`] to preserve the full error source chain.
    #[error("Credential storage error: {0}")]
    Storage(#[source] StorageError),
}

impl AuthError {
    /// Creates a new `Directory` error.
    #[must_use]
    pub fn directory(message: impl Into<String>) -> Self {
        Self::Directory(message.into())
    }

    /// Creates a new `Cloud` error.
    #[must_use]
    pub fn cloud(message: impl Into<String>) -> Self {
        Self::Cloud(message.into())
    }

    /// Creates a new `Registry` error.
    #[must_use]
    pub fn registry(message: impl Into<String>) -> Self {
        Self::Registry(message.into())
    }

    /// Creates a new `MalformedRecord` error.
    #[must_use]
    pub fn malformed_record(record: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedRecord { record: record.into(), reason: reason.into() }
    }

    /// Creates a new `InvalidIdentity` error.
    #[must_use]
    pub fn invalid_identity(message: impl Into<String>) -> Self {
        Self::InvalidIdentity(message.into())
    }

    /// Creates a new `InvalidProof` error.
    #[must_use]
    pub fn invalid_proof(message: impl Into<String>) -> Self {
        Self::InvalidProof(message.into())
    }
}

impl From<StorageError> for AuthError {
    fn from(err: StorageError) -> Self {
        AuthError::Storage(err)
    }
}

/// Result type alias for authentication operations.
pub type Result<T> = std::result::Result<T, AuthError>;
