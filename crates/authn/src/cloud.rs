//! Cloud validation contract.

use async_trait::async_trait;

use crate::{error::Result, identity::ClientCredentials, outcome::AuthResult};

/// Delegates a trust decision to the cloud backend.
///
/// Used when local scope data is insufficient, or as the only source of trust
/// in cloud-only mode. Calls are bounded by the configured cloud timeout.
#[async_trait]
pub trait CloudValidator: Send + Sync {
    /// Validates `credentials` against the cloud.
    ///
    /// A definitive verdict is returned as an [`AuthResult`], including
    /// [`DenyReason::CloudRejected`](crate::DenyReason::CloudRejected).
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Cloud`](crate::AuthError::Cloud) when the cloud
    /// could not be asked. Callers fail closed.
    async fn validate(&self, credentials: &ClientCredentials) -> Result<AuthResult>;
}
