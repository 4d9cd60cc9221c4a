//! Remote scope directory contract.
//!
//! The directory returns bounded pages of identity records. Records arrive in
//! the directory's own loose shape and are converted to [`ServiceIdentity`]
//! values one by one, so a single bad record never spoils a page.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};

use crate::{
    error::{AuthError, Result},
    identity::{AuthenticationInfo, Identity, IdentityStatus, ServiceIdentity, SymmetricKey},
};

/// A source of identity records for the scope cache.
///
/// Implementations must be cheap to call repeatedly; the scope cache drains
/// every page on each refresh.
#[async_trait]
pub trait ScopeDirectory: Send + Sync {
    /// Fetches the page following `continuation`, or the first page when `None`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Directory`] when the directory cannot be reached
    /// or the page cannot be read.
    async fn fetch_page(&self, continuation: Option<String>) -> Result<ScopePage>;
}

/// One page of directory records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopePage {
    /// Records in this page.
    pub records: Vec<ScopeRecord>,
    /// Token for the next page; `None` on the last page.
    #[serde(default)]
    pub continuation: Option<String>,
}

/// A directory record as delivered over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeRecord {
    /// Device id.
    pub device_id: String,
    /// Module id for module records.
    #[serde(default)]
    pub module_id: Option<String>,
    /// Freshness marker assigned by the directory.
    #[serde(default)]
    pub generation_id: String,
    /// `enabled` or `disabled`.
    pub status: String,
    /// Expected authentication material.
    pub authentication: AuthenticationRecord,
}

/// Authentication material of a directory record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationRecord {
    /// `sas`, `selfSigned`, or `certificateAuthority`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Base64 primary symmetric key.
    #[serde(default)]
    pub primary_key: Option<String>,
    /// Base64 secondary symmetric key.
    #[serde(default)]
    pub secondary_key: Option<String>,
    /// Primary certificate thumbprint.
    #[serde(default)]
    pub primary_thumbprint: Option<String>,
    /// Secondary certificate thumbprint.
    #[serde(default)]
    pub secondary_thumbprint: Option<String>,
}

impl AuthenticationRecord {
    /// Symmetric-key material.
    pub fn sas(primary: impl Into<String>, secondary: Option<String>) -> Self {
        Self {
            kind: "sas".to_owned(),
            primary_key: Some(primary.into()),
            secondary_key: secondary,
            primary_thumbprint: None,
            secondary_thumbprint: None,
        }
    }

    /// Self-signed certificate pinned by thumbprint.
    pub fn self_signed(primary: impl Into<String>, secondary: Option<String>) -> Self {
        Self {
            kind: "selfSigned".to_owned(),
            primary_key: None,
            secondary_key: None,
            primary_thumbprint: Some(primary.into()),
            secondary_thumbprint: secondary,
        }
    }

    /// Certificate issued by a trusted authority.
    pub fn certificate_authority() -> Self {
        Self {
            kind: "certificateAuthority".to_owned(),
            primary_key: None,
            secondary_key: None,
            primary_thumbprint: None,
            secondary_thumbprint: None,
        }
    }
}

impl ScopeRecord {
    /// Best-effort key for log messages, valid even for malformed records.
    pub fn describe(&self) -> String {
        match &self.module_id {
            Some(module) => format!("{}/{module}", self.device_id),
            None => self.device_id.clone(),
        }
    }

    /// Converts the record into a service identity within `hub_name`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MalformedRecord`] for an invalid identity, an
    /// unknown status or authentication type, missing material, or a key
    /// that is not base64.
    pub fn into_service_identity(self, hub_name: &str) -> Result<ServiceIdentity> {
        let record = self.describe();
        let malformed = |reason: String| AuthError::malformed_record(record.clone(), reason);

        let identity = Identity::new(hub_name, self.device_id, self.module_id)
            .map_err(|e| malformed(e.to_string()))?;

        let status = match self.status.to_ascii_lowercase().as_str() {
            "enabled" => IdentityStatus::Enabled,
            "disabled" => IdentityStatus::Disabled,
            other => return Err(malformed(format!("unknown status {other:?}"))),
        };

        let auth = self.authentication;
        let authentication = match auth.kind.as_str() {
            "sas" => {
                let primary = auth
                    .primary_key
                    .as_deref()
                    .ok_or_else(|| malformed("sas record without primary key".to_owned()))?;
                AuthenticationInfo::SymmetricKey {
                    primary: decode_key(primary).map_err(&malformed)?,
                    secondary: auth
                        .secondary_key
                        .as_deref()
                        .map(decode_key)
                        .transpose()
                        .map_err(&malformed)?,
                }
            },
            "selfSigned" => AuthenticationInfo::X509Thumbprint {
                primary: auth
                    .primary_thumbprint
                    .ok_or_else(|| malformed("selfSigned record without thumbprint".to_owned()))?,
                secondary: auth.secondary_thumbprint,
            },
            "certificateAuthority" => AuthenticationInfo::X509CertificateAuthority,
            other => return Err(malformed(format!("unknown authentication type {other:?}"))),
        };

        Ok(ServiceIdentity::new(identity, authentication, status, self.generation_id))
    }
}

fn decode_key(encoded: &str) -> std::result::Result<SymmetricKey, String> {
    let bytes = STANDARD.decode(encoded).map_err(|e| format!("key is not base64: {e}"))?;
    if bytes.is_empty() {
        return Err("key is empty".to_owned());
    }
    Ok(SymmetricKey::new(bytes))
}
