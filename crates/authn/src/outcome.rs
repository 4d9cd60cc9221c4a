//! Authentication outcomes and denial reasons.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why an authentication attempt was denied.
///
/// Every denial carries one of these so the transport layer can log and act
/// on it. [`code`](Self::code) gives a stable machine-readable form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// The identity is not present in the scope snapshot.
    UnknownIdentity,
    /// The presented proof does not match the identity's authentication material.
    ProofMismatch,
    /// The identity is present but disabled.
    IdentityDisabled,
    /// The cloud validator rejected the credentials.
    CloudRejected,
    /// The scope cache has never completed a refresh.
    DirectoryUnavailable,
    /// The cloud validator could not be reached or timed out.
    CloudUnavailable,
    /// The presented token has expired.
    TokenExpired,
    /// The presented proof could not be parsed.
    MalformedProof,
}

impl DenyReason {
    /// Returns the stable snake_case code for this reason.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::UnknownIdentity => "unknown_identity",
            Self::ProofMismatch => "proof_mismatch",
            Self::IdentityDisabled => "identity_disabled",
            Self::CloudRejected => "cloud_rejected",
            Self::DirectoryUnavailable => "directory_unavailable",
            Self::CloudUnavailable => "cloud_unavailable",
            Self::TokenExpired => "token_expired",
            Self::MalformedProof => "malformed_proof",
        }
    }

    /// Returns `false` when the denial reflects missing information rather
    /// than a definitive verdict.
    ///
    /// Inconclusive denials still fail closed for new connections, but never
    /// cause an already-open connection to be dropped.
    #[must_use]
    pub fn is_conclusive(self) -> bool {
        !matches!(self, Self::DirectoryUnavailable | Self::CloudUnavailable)
    }

    /// Returns `true` when a scope-first strategy may retry through the cloud.
    ///
    /// The scope directory may lag behind the cloud, so an identity it does not
    /// know, or whose key it has not yet rotated, is worth a cloud check. A
    /// disabled identity, an expired token, or an unparseable proof are final.
    #[must_use]
    pub fn permits_fallback(self) -> bool {
        matches!(self, Self::UnknownIdentity | Self::ProofMismatch | Self::DirectoryUnavailable)
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Result of authenticating a set of client credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum AuthResult {
    /// The credentials are trusted.
    Allowed,
    /// The credentials are not trusted.
    Denied(DenyReason),
}

impl AuthResult {
    /// Returns `true` if access was granted.
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Returns the denial reason, if any.
    pub fn deny_reason(self) -> Option<DenyReason> {
        match self {
            Self::Allowed => None,
            Self::Denied(reason) => Some(reason),
        }
    }
}
