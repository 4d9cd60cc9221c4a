//! Identity and credential value types shared by every component.
//!
//! ```text
//! Identity ──► ServiceIdentity   (what the directory authorizes)
//!          └─► ClientCredentials (what a connecting client presents)
//!                 └─► CachedCredentialEntry (what the credentials cache remembers)
//! ```

use std::{
    fmt,
    hash::{Hash, Hasher},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::{
    error::{AuthError, Result},
    token::SasToken,
};

/// A device or module identity within a hub.
///
/// Equality and hashing use only the derived key (`device` or
/// `device/module`); the hub name is carried along for token audience checks.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "IdentityParts", into = "IdentityParts")]
pub struct Identity {
    hub_name: String,
    device_id: String,
    module_id: Option<String>,
    key: String,
}

#[derive(Serialize, Deserialize)]
struct IdentityParts {
    hub_name: String,
    device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    module_id: Option<String>,
}

impl Identity {
    /// Creates an identity, validating its parts.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidIdentity`] if the hub or device id is empty,
    /// a supplied module id is empty, or either id contains `/`.
    pub fn new(
        hub_name: impl Into<String>,
        device_id: impl Into<String>,
        module_id: Option<String>,
    ) -> Result<Self> {
        let hub_name = hub_name.into();
        let device_id = device_id.into();

        if hub_name.is_empty() {
            return Err(AuthError::invalid_identity("hub name is empty"));
        }
        if device_id.is_empty() {
            return Err(AuthError::invalid_identity("device id is empty"));
        }
        if device_id.contains('/') {
            return Err(AuthError::invalid_identity(format!("device id {device_id:?} contains '/'")));
        }
        let key = match &module_id {
            Some(module) if module.is_empty() => {
                return Err(AuthError::invalid_identity("module id is empty"));
            },
            Some(module) if module.contains('/') => {
                return Err(AuthError::invalid_identity(format!("module id {module:?} contains '/'")));
            },
            Some(module) => format!("{device_id}/{module}"),
            None => device_id.clone(),
        };

        Ok(Self { hub_name, device_id, module_id, key })
    }

    /// Creates a device identity.
    ///
    /// # Errors
    ///
    /// See [`Identity::new`].
    pub fn device(hub_name: impl Into<String>, device_id: impl Into<String>) -> Result<Self> {
        Self::new(hub_name, device_id, None)
    }

    /// Creates a module identity.
    ///
    /// # Errors
    ///
    /// See [`Identity::new`].
    pub fn module(
        hub_name: impl Into<String>,
        device_id: impl Into<String>,
        module_id: impl Into<String>,
    ) -> Result<Self> {
        Self::new(hub_name, device_id, Some(module_id.into()))
    }

    /// Hub (directory) name.
    pub fn hub_name(&self) -> &str {
        &self.hub_name
    }

    /// Device id.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Module id, present only for module identities.
    pub fn module_id(&self) -> Option<&str> {
        self.module_id.as_deref()
    }

    /// Unique key: `device` or `device/module`.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns `true` for module identities.
    pub fn is_module(&self) -> bool {
        self.module_id.is_some()
    }
}

impl TryFrom<IdentityParts> for Identity {
    type Error = AuthError;

    fn try_from(parts: IdentityParts) -> Result<Self> {
        Self::new(parts.hub_name, parts.device_id, parts.module_id)
    }
}

impl From<Identity> for IdentityParts {
    fn from(identity: Identity) -> Self {
        Self {
            hub_name: identity.hub_name,
            device_id: identity.device_id,
            module_id: identity.module_id,
        }
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({}@{})", self.key, self.hub_name)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Symmetric key material, decoded from its base64 form.
///
/// Zeroed on drop; `Debug` never prints it.
#[derive(Clone)]
pub struct SymmetricKey(Zeroizing<Vec<u8>>);

impl SymmetricKey {
    /// Wraps decoded key bytes.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(<redacted>)")
    }
}

/// The proof an identity is expected to present.
///
/// Reference material only; never a live proof.
#[derive(Debug, Clone)]
pub enum AuthenticationInfo {
    /// Shared access signature tokens signed with either key.
    SymmetricKey {
        /// Primary key.
        primary: SymmetricKey,
        /// Secondary key, used during key rotation.
        secondary: Option<SymmetricKey>,
    },
    /// A self-signed client certificate pinned by thumbprint.
    X509Thumbprint {
        /// Primary thumbprint (SHA-1 or SHA-256, hex).
        primary: String,
        /// Secondary thumbprint, used during certificate rotation.
        secondary: Option<String>,
    },
    /// A client certificate issued by a trusted certificate authority.
    X509CertificateAuthority,
}

impl AuthenticationInfo {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SymmetricKey { .. } => "symmetric_key",
            Self::X509Thumbprint { .. } => "x509_thumbprint",
            Self::X509CertificateAuthority => "x509_ca",
        }
    }
}

/// Membership status of a service identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStatus {
    /// The identity may connect.
    Enabled,
    /// The identity is known but may not connect.
    Disabled,
}

/// An identity as authorized by the scope directory.
///
/// Produced only by a scope refresh and superseded, never mutated, by the next one.
#[derive(Debug, Clone)]
pub struct ServiceIdentity {
    identity: Identity,
    authentication: AuthenticationInfo,
    status: IdentityStatus,
    generation_id: String,
}

impl ServiceIdentity {
    /// Creates a service identity.
    #[must_use]
    pub fn new(
        identity: Identity,
        authentication: AuthenticationInfo,
        status: IdentityStatus,
        generation_id: impl Into<String>,
    ) -> Self {
        Self { identity, authentication, status, generation_id: generation_id.into() }
    }

    /// The identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Expected authentication material.
    pub fn authentication(&self) -> &AuthenticationInfo {
        &self.authentication
    }

    /// Membership status.
    pub fn status(&self) -> IdentityStatus {
        self.status
    }

    /// Returns `true` if the identity may connect.
    pub fn is_enabled(&self) -> bool {
        self.status == IdentityStatus::Enabled
    }

    /// Freshness marker assigned by the directory.
    pub fn generation_id(&self) -> &str {
        &self.generation_id
    }

    /// Returns `true` if `other` describes a different version of this record.
    pub fn differs_from(&self, other: &ServiceIdentity) -> bool {
        self.generation_id != other.generation_id || self.status != other.status
    }
}

/// A client certificate as extracted by the transport during the TLS handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateProof {
    /// DER encoding of the leaf certificate.
    pub leaf: Vec<u8>,
    /// DER encodings of the remaining chain certificates, leaf-adjacent first.
    #[serde(default)]
    pub chain: Vec<Vec<u8>>,
    /// Subject common name of the leaf certificate.
    #[serde(default)]
    pub common_name: Option<String>,
}

/// A live proof presented by a connecting client.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Proof {
    /// A shared access signature token.
    Token {
        /// The raw token string.
        token: String,
    },
    /// A client certificate chain.
    Certificate(CertificateProof),
}

impl fmt::Debug for Proof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token { .. } => f.write_str("Proof::Token(<redacted>)"),
            Self::Certificate(cert) => f
                .debug_struct("Proof::Certificate")
                .field("common_name", &cert.common_name)
                .field("chain_len", &cert.chain.len())
                .finish(),
        }
    }
}

/// Credentials presented by a connecting client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    identity: Identity,
    proof: Proof,
    product_info: String,
}

impl ClientCredentials {
    /// Creates client credentials.
    #[must_use]
    pub fn new(identity: Identity, proof: Proof, product_info: impl Into<String>) -> Self {
        Self { identity, proof, product_info: product_info.into() }
    }

    /// Credentials carrying a token proof.
    #[must_use]
    pub fn with_token(identity: Identity, token: impl Into<String>) -> Self {
        Self::new(identity, Proof::Token { token: token.into() }, String::new())
    }

    /// Credentials carrying a certificate proof.
    #[must_use]
    pub fn with_certificate(identity: Identity, certificate: CertificateProof) -> Self {
        Self::new(identity, Proof::Certificate(certificate), String::new())
    }

    /// Sets the declared product/client metadata string.
    #[must_use]
    pub fn product_info(mut self, product_info: impl Into<String>) -> Self {
        self.product_info = product_info.into();
        self
    }

    /// The claimed identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The presented proof.
    pub fn proof(&self) -> &Proof {
        &self.proof
    }

    /// Declared product/client metadata.
    pub fn declared_product_info(&self) -> &str {
        &self.product_info
    }
}

/// What the credentials cache remembers about a successful validation.
///
/// The proof is held in opaque serialized form; it is compared, never interpreted,
/// except when the reauthenticator rebuilds credentials from it.
#[derive(Clone, Serialize, Deserialize)]
pub struct CachedCredentialEntry {
    identity: Identity,
    proof: Vec<u8>,
    #[serde(default)]
    product_info: String,
    validated_at: DateTime<Utc>,
}

impl CachedCredentialEntry {
    /// Builds an entry for credentials validated at `validated_at`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidProof`] if the proof cannot be serialized.
    pub fn new(credentials: &ClientCredentials, validated_at: DateTime<Utc>) -> Result<Self> {
        Ok(Self {
            identity: credentials.identity.clone(),
            proof: encode_proof(&credentials.proof)?,
            product_info: credentials.product_info.clone(),
            validated_at,
        })
    }

    /// The cached identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Identity key the entry is stored under.
    pub fn key(&self) -> &str {
        self.identity.key()
    }

    /// When the credentials were last validated.
    pub fn validated_at(&self) -> DateTime<Utc> {
        self.validated_at
    }

    pub(crate) fn set_validated_at(&mut self, validated_at: DateTime<Utc>) {
        self.validated_at = validated_at;
    }

    /// Returns `true` if `credentials` present the same proof that was
    /// validated for this entry and that proof is still usable at `now`.
    pub fn matches(&self, credentials: &ClientCredentials, now: DateTime<Utc>) -> bool {
        if credentials.identity != self.identity {
            return false;
        }
        let Ok(presented) = encode_proof(&credentials.proof) else {
            return false;
        };
        if !bool::from(presented.ct_eq(&self.proof)) {
            return false;
        }
        match &credentials.proof {
            Proof::Token { token } => {
                SasToken::parse(token).map(|t| !t.is_expired_at(now)).unwrap_or(false)
            },
            Proof::Certificate(_) => true,
        }
    }

    /// Rebuilds the credentials that were validated for this entry.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidProof`] if the stored proof cannot be decoded.
    pub fn to_credentials(&self) -> Result<ClientCredentials> {
        let proof: Proof = serde_json::from_slice(&self.proof)
            .map_err(|e| AuthError::invalid_proof(format!("cached proof: {e}")))?;
        Ok(ClientCredentials::new(self.identity.clone(), proof, self.product_info.clone()))
    }

    /// Encodes the entry for persistence.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidProof`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| AuthError::invalid_proof(format!("encode entry: {e}")))
    }

    /// Decodes a persisted entry.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidProof`] if the bytes are not a valid entry.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| AuthError::invalid_proof(format!("decode entry: {e}")))
    }
}

impl fmt::Debug for CachedCredentialEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedCredentialEntry")
            .field("identity", &self.identity)
            .field("validated_at", &self.validated_at)
            .finish_non_exhaustive()
    }
}

fn encode_proof(proof: &Proof) -> Result<Vec<u8>> {
    serde_json::to_vec(proof).map_err(|e| AuthError::invalid_proof(format!("encode proof: {e}")))
}
