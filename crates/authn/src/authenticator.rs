//! Strategy-selected credential validation.
//!
//! Each source of trust is a [`CredentialsValidator`]. The configured
//! [`AuthMode`] picks one of them, or composes the scope and cloud validators
//! with [`FallbackAuthenticator`]. [`Authenticator`] puts the credentials
//! cache in front of whichever strategy was chosen:
//!
//! ```text
//! authenticate ──► credentials cache ──hit──► Allowed
//!                        │ miss
//!                        ▼
//!                  AuthStrategy::{CloudOnly, ScopeOnly, ScopeThenCloud}
//!                        │ Allowed
//!                        ▼
//!                  write-through to credentials cache
//! ```

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    certificate,
    cloud::CloudValidator,
    config::AuthMode,
    credentials_cache::CredentialsCache,
    identity::{
        AuthenticationInfo, CachedCredentialEntry, ClientCredentials, Identity, Proof, SymmetricKey,
    },
    outcome::{AuthResult, DenyReason},
    scope_cache::ScopeCache,
    token::SasToken,
};

/// One way of deciding whether credentials are trustworthy.
#[async_trait]
pub trait CredentialsValidator: Send + Sync {
    /// Validates `credentials`. Never fails: problems are denials.
    async fn validate(&self, credentials: &ClientCredentials) -> AuthResult;
}

/// Validates credentials against the local scope snapshot.
pub struct ScopeAuthenticator {
    scope: Arc<ScopeCache>,
    trusted_ca_thumbprints: Vec<String>,
}

impl ScopeAuthenticator {
    /// Creates a scope validator. `trusted_ca_thumbprints` anchors
    /// certificate-authority identities.
    pub fn new(scope: Arc<ScopeCache>, trusted_ca_thumbprints: Vec<String>) -> Self {
        Self { scope, trusted_ca_thumbprints }
    }

    /// The scope cache consulted.
    pub fn scope(&self) -> &Arc<ScopeCache> {
        &self.scope
    }
}

#[async_trait]
impl CredentialsValidator for ScopeAuthenticator {
    async fn validate(&self, credentials: &ClientCredentials) -> AuthResult {
        if !self.scope.is_ready() {
            return AuthResult::Denied(DenyReason::DirectoryUnavailable);
        }
        let Some(service) = self.scope.lookup(credentials.identity().key()) else {
            return AuthResult::Denied(DenyReason::UnknownIdentity);
        };
        if !service.is_enabled() {
            return AuthResult::Denied(DenyReason::IdentityDisabled);
        }

        match (service.authentication(), credentials.proof()) {
            (AuthenticationInfo::SymmetricKey { primary, secondary }, Proof::Token { token }) => {
                verify_token(service.identity(), token, primary, secondary.as_ref())
            },
            (AuthenticationInfo::X509Thumbprint { primary, secondary }, Proof::Certificate(cert)) => {
                if certificate::matches_pinned(cert, primary, secondary.as_deref()) {
                    AuthResult::Allowed
                } else {
                    AuthResult::Denied(DenyReason::ProofMismatch)
                }
            },
            (AuthenticationInfo::X509CertificateAuthority, Proof::Certificate(cert)) => {
                if certificate::matches_authority(cert, service.identity(), &self.trusted_ca_thumbprints)
                {
                    AuthResult::Allowed
                } else {
                    AuthResult::Denied(DenyReason::ProofMismatch)
                }
            },
            (expected, _) => {
                tracing::debug!(expected = expected.kind(), "proof type does not match identity");
                AuthResult::Denied(DenyReason::ProofMismatch)
            },
        }
    }
}

fn verify_token(
    identity: &Identity,
    raw: &str,
    primary: &SymmetricKey,
    secondary: Option<&SymmetricKey>,
) -> AuthResult {
    let token = match SasToken::parse(raw) {
        Ok(token) => token,
        Err(err) => {
            tracing::debug!(error = %err, "unparseable token");
            return AuthResult::Denied(DenyReason::MalformedProof);
        },
    };
    if !token.is_for(identity) {
        return AuthResult::Denied(DenyReason::ProofMismatch);
    }
    if token.is_expired_at(Utc::now()) {
        return AuthResult::Denied(DenyReason::TokenExpired);
    }
    if token.verify(primary.as_bytes()) || secondary.is_some_and(|key| token.verify(key.as_bytes())) {
        AuthResult::Allowed
    } else {
        AuthResult::Denied(DenyReason::ProofMismatch)
    }
}

/// Validates credentials through the cloud, bounded by a timeout.
pub struct CloudAuthenticator {
    cloud: Arc<dyn CloudValidator>,
    timeout: Duration,
}

impl CloudAuthenticator {
    /// Creates a cloud validator that gives up after `timeout`.
    pub fn new(cloud: Arc<dyn CloudValidator>, timeout: Duration) -> Self {
        Self { cloud, timeout }
    }
}

#[async_trait]
impl CredentialsValidator for CloudAuthenticator {
    async fn validate(&self, credentials: &ClientCredentials) -> AuthResult {
        match tokio::time::timeout(self.timeout, self.cloud.validate(credentials)).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "cloud validation failed");
                AuthResult::Denied(DenyReason::CloudUnavailable)
            },
            Err(_) => {
                tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "cloud validation timed out");
                AuthResult::Denied(DenyReason::CloudUnavailable)
            },
        }
    }
}

/// Tries `primary`, then `secondary` when the primary's denial permits it.
///
/// See [`DenyReason::permits_fallback`] for which denials are retried.
pub struct FallbackAuthenticator<P, S> {
    primary: P,
    secondary: S,
}

impl<P, S> FallbackAuthenticator<P, S> {
    /// Composes two validators.
    pub fn new(primary: P, secondary: S) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl<P, S> CredentialsValidator for FallbackAuthenticator<P, S>
where
    P: CredentialsValidator,
    S: CredentialsValidator,
{
    async fn validate(&self, credentials: &ClientCredentials) -> AuthResult {
        let result = self.primary.validate(credentials).await;
        match result.deny_reason() {
            Some(reason) if reason.permits_fallback() => {
                tracing::debug!(reason = %reason, "primary validator denied, falling back");
                self.secondary.validate(credentials).await
            },
            _ => result,
        }
    }
}

/// The validation strategy selected at construction.
pub enum AuthStrategy {
    /// Cloud validator only.
    CloudOnly(CloudAuthenticator),
    /// Scope cache only.
    ScopeOnly(ScopeAuthenticator),
    /// Scope cache first, then the cloud validator.
    ScopeThenCloud(FallbackAuthenticator<ScopeAuthenticator, CloudAuthenticator>),
}

impl AuthStrategy {
    /// The mode this strategy implements.
    pub fn mode(&self) -> AuthMode {
        match self {
            Self::CloudOnly(_) => AuthMode::CloudOnly,
            Self::ScopeOnly(_) => AuthMode::ScopeOnly,
            Self::ScopeThenCloud(_) => AuthMode::ScopeThenCloud,
        }
    }
}

#[async_trait]
impl CredentialsValidator for AuthStrategy {
    async fn validate(&self, credentials: &ClientCredentials) -> AuthResult {
        match self {
            Self::CloudOnly(cloud) => cloud.validate(credentials).await,
            Self::ScopeOnly(scope) => scope.validate(credentials).await,
            Self::ScopeThenCloud(fallback) => fallback.validate(credentials).await,
        }
    }
}

/// Entry point for the transport layer.
pub struct Authenticator {
    strategy: AuthStrategy,
    credentials: Arc<CredentialsCache>,
}

impl Authenticator {
    /// Puts `credentials` in front of `strategy`.
    pub fn new(strategy: AuthStrategy, credentials: Arc<CredentialsCache>) -> Self {
        Self { strategy, credentials }
    }

    /// The configured mode.
    pub fn mode(&self) -> AuthMode {
        self.strategy.mode()
    }

    /// The credentials cache written through on success.
    pub fn credentials_cache(&self) -> &Arc<CredentialsCache> {
        &self.credentials
    }

    /// Decides whether `credentials` may connect.
    ///
    /// Credentials matching a cached entry are allowed without consulting the
    /// strategy. Otherwise the strategy decides, and an `Allowed` verdict is
    /// written through to the cache.
    #[tracing::instrument(skip_all, fields(identity = %credentials.identity(), mode = ?self.mode()))]
    pub async fn authenticate(&self, credentials: &ClientCredentials) -> AuthResult {
        if let Some(entry) = self.credentials.try_get(credentials.identity().key())
            && entry.matches(credentials, Utc::now())
        {
            tracing::debug!("credentials cache hit");
            return AuthResult::Allowed;
        }
        self.validate_and_record(credentials).await
    }

    /// Re-derives trust for `credentials` without consulting the cache.
    ///
    /// Used by the reauthenticator; an `Allowed` verdict refreshes the cached
    /// entry's timestamp.
    #[tracing::instrument(skip_all, fields(identity = %credentials.identity(), mode = ?self.mode()))]
    pub async fn reauthenticate(&self, credentials: &ClientCredentials) -> AuthResult {
        self.validate_and_record(credentials).await
    }

    async fn validate_and_record(&self, credentials: &ClientCredentials) -> AuthResult {
        let result = self.strategy.validate(credentials).await;
        match result {
            AuthResult::Allowed => {
                let recorded = CachedCredentialEntry::new(credentials, Utc::now())
                    .and_then(|entry| self.credentials.put(entry));
                if let Err(err) = recorded {
                    tracing::warn!(error = %err, "failed to cache validated credentials");
                }
            },
            AuthResult::Denied(reason) => {
                tracing::debug!(reason = %reason, "authentication denied");
            },
        }
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use edgegate_storage::NullBackend;
    use rstest::rstest;

    use super::*;
    use crate::{
        directory::{AuthenticationRecord, ScopeDirectory},
        identity::CertificateProof,
        testutil::{StaticCloudValidator, StaticDirectory, create_sas_token, generate_symmetric_key, sas_record},
    };

    const HUB: &str = "hub.example.net";

    fn device(id: &str) -> Identity {
        Identity::device(HUB, id).expect("identity")
    }

    async fn ready_scope(directory: &Arc<StaticDirectory>) -> Arc<ScopeCache> {
        let scope = Arc::new(ScopeCache::new(HUB, Arc::clone(directory) as Arc<dyn ScopeDirectory>));
        scope.refresh().await.expect("refresh");
        scope
    }

    async fn scope_validator(records: Vec<crate::directory::ScopeRecord>) -> ScopeAuthenticator {
        let directory = Arc::new(StaticDirectory::new(records));
        ScopeAuthenticator::new(ready_scope(&directory).await, Vec::new())
    }

    #[tokio::test]
    async fn test_scope_never_refreshed_is_directory_unavailable() {
        let directory = Arc::new(StaticDirectory::new(Vec::new()));
        let scope = Arc::new(ScopeCache::new(HUB, directory as Arc<dyn ScopeDirectory>));
        let validator = ScopeAuthenticator::new(scope, Vec::new());

        let creds = ClientCredentials::with_token(device("device-1"), "SharedAccessSignature sr=x");
        assert_eq!(
            validator.validate(&creds).await,
            AuthResult::Denied(DenyReason::DirectoryUnavailable)
        );
    }

    #[tokio::test]
    async fn test_token_signed_with_either_key() {
        let (k1, k2) = (generate_symmetric_key(), generate_symmetric_key());
        let validator = scope_validator(vec![sas_record("device-1", &k1, Some(&k2))]).await;

        for key in [&k1, &k2] {
            let token = create_sas_token(&device("device-1"), key, ChronoDuration::hours(1));
            let creds = ClientCredentials::with_token(device("device-1"), token);
            assert_eq!(validator.validate(&creds).await, AuthResult::Allowed);
        }

        let stranger = create_sas_token(&device("device-1"), &generate_symmetric_key(), ChronoDuration::hours(1));
        let creds = ClientCredentials::with_token(device("device-1"), stranger);
        assert_eq!(validator.validate(&creds).await, AuthResult::Denied(DenyReason::ProofMismatch));
    }

    #[rstest]
    #[case::expired(ChronoDuration::seconds(-10), "device-1", DenyReason::TokenExpired)]
    #[case::other_audience(ChronoDuration::hours(1), "device-2", DenyReason::ProofMismatch)]
    #[tokio::test]
    async fn test_token_denials(
        #[case] lifetime: ChronoDuration,
        #[case] audience: &str,
        #[case] expected: DenyReason,
    ) {
        let key = generate_symmetric_key();
        let validator = scope_validator(vec![
            sas_record("device-1", &key, None),
            sas_record("device-2", &key, None),
        ])
        .await;
        let token = create_sas_token(&device(audience), &key, lifetime);
        let creds = ClientCredentials::with_token(device("device-1"), token);
        assert_eq!(validator.validate(&creds).await, AuthResult::Denied(expected));
    }

    #[tokio::test]
    async fn test_unknown_disabled_and_malformed() {
        let key = generate_symmetric_key();
        let mut disabled = sas_record("device-2", &key, None);
        disabled.status = "disabled".to_owned();
        let validator = scope_validator(vec![sas_record("device-1", &key, None), disabled]).await;

        let token = create_sas_token(&device("device-9"), &key, ChronoDuration::hours(1));
        let creds = ClientCredentials::with_token(device("device-9"), token);
        assert_eq!(validator.validate(&creds).await, AuthResult::Denied(DenyReason::UnknownIdentity));

        let token = create_sas_token(&device("device-2"), &key, ChronoDuration::hours(1));
        let creds = ClientCredentials::with_token(device("device-2"), token);
        assert_eq!(validator.validate(&creds).await, AuthResult::Denied(DenyReason::IdentityDisabled));

        let creds = ClientCredentials::with_token(device("device-1"), "Bearer abc");
        assert_eq!(validator.validate(&creds).await, AuthResult::Denied(DenyReason::MalformedProof));
    }

    #[tokio::test]
    async fn test_certificate_proofs() {
        let leaf = b"device-3 leaf".to_vec();
        let root = b"root ca".to_vec();
        let mut pinned = sas_record("device-3", "AA==", None);
        pinned.authentication =
            AuthenticationRecord::self_signed(certificate::sha256_thumbprint(&leaf), None);
        let mut issued = sas_record("device-4", "AA==", None);
        issued.authentication = AuthenticationRecord::certificate_authority();

        let directory = Arc::new(StaticDirectory::new(vec![pinned, issued]));
        let validator = ScopeAuthenticator::new(
            ready_scope(&directory).await,
            vec![certificate::sha1_thumbprint(&root)],
        );

        let creds = ClientCredentials::with_certificate(
            device("device-3"),
            CertificateProof { leaf: leaf.clone(), chain: Vec::new(), common_name: None },
        );
        assert_eq!(validator.validate(&creds).await, AuthResult::Allowed);

        let creds = ClientCredentials::with_certificate(
            device("device-4"),
            CertificateProof { leaf, chain: vec![root], common_name: Some("device-4".to_owned()) },
        );
        assert_eq!(validator.validate(&creds).await, AuthResult::Allowed);

        let creds = ClientCredentials::with_token(device("device-3"), "SharedAccessSignature sr=a");
        assert_eq!(validator.validate(&creds).await, AuthResult::Denied(DenyReason::ProofMismatch));
    }

    #[tokio::test]
    async fn test_cloud_errors_fail_closed() {
        let cloud = Arc::new(StaticCloudValidator::new());
        cloud.set_failing(true);
        let validator = CloudAuthenticator::new(cloud, Duration::from_secs(1));
        let creds = ClientCredentials::with_token(device("device-1"), "t");
        assert_eq!(validator.validate(&creds).await, AuthResult::Denied(DenyReason::CloudUnavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cloud_timeout_fails_closed() {
        let cloud = Arc::new(StaticCloudValidator::new());
        cloud.allow(&device("device-1"));
        cloud.set_delay(Duration::from_secs(60));
        let validator = CloudAuthenticator::new(cloud, Duration::from_secs(5));
        let creds = ClientCredentials::with_token(device("device-1"), "t");
        assert_eq!(validator.validate(&creds).await, AuthResult::Denied(DenyReason::CloudUnavailable));
    }

    #[tokio::test]
    async fn test_fallback_only_on_permitted_reasons() {
        let key = generate_symmetric_key();
        let mut disabled = sas_record("device-2", &key, None);
        disabled.status = "disabled".to_owned();
        let scope = scope_validator(vec![disabled]).await;

        let cloud = Arc::new(StaticCloudValidator::new());
        cloud.allow(&device("device-1"));
        cloud.allow(&device("device-2"));
        let fallback = FallbackAuthenticator::new(
            scope,
            CloudAuthenticator::new(Arc::clone(&cloud) as Arc<dyn CloudValidator>, Duration::from_secs(1)),
        );

        let unknown = ClientCredentials::with_token(
            device("device-1"),
            create_sas_token(&device("device-1"), &key, ChronoDuration::hours(1)),
        );
        assert_eq!(fallback.validate(&unknown).await, AuthResult::Allowed);
        assert_eq!(cloud.calls(), 1);

        let disabled = ClientCredentials::with_token(
            device("device-2"),
            create_sas_token(&device("device-2"), &key, ChronoDuration::hours(1)),
        );
        assert_eq!(fallback.validate(&disabled).await, AuthResult::Denied(DenyReason::IdentityDisabled));
        assert_eq!(cloud.calls(), 1, "disabled identities are final");
    }

    #[tokio::test]
    async fn test_write_through_and_cache_hit() {
        let cloud = Arc::new(StaticCloudValidator::new());
        cloud.allow(&device("device-1"));
        let cache = Arc::new(CredentialsCache::open(Arc::new(NullBackend::new())).await);
        let authenticator = Authenticator::new(
            AuthStrategy::CloudOnly(CloudAuthenticator::new(
                Arc::clone(&cloud) as Arc<dyn CloudValidator>,
                Duration::from_secs(1),
            )),
            Arc::clone(&cache),
        );
        assert_eq!(authenticator.mode(), AuthMode::CloudOnly);

        let key = generate_symmetric_key();
        let creds = ClientCredentials::with_token(
            device("device-1"),
            create_sas_token(&device("device-1"), &key, ChronoDuration::hours(1)),
        );
        assert_eq!(authenticator.authenticate(&creds).await, AuthResult::Allowed);
        let first = cache.try_get("device-1").expect("cached").validated_at();
        assert_eq!(authenticator.authenticate(&creds).await, AuthResult::Allowed);

        assert_eq!(cloud.calls(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.try_get("device-1").expect("cached").validated_at(), first);

        assert_eq!(authenticator.reauthenticate(&creds).await, AuthResult::Allowed);
        assert_eq!(cloud.calls(), 2, "reauthentication bypasses the cache");
    }

    #[tokio::test]
    async fn test_different_proof_is_a_cache_miss() {
        let cloud = Arc::new(StaticCloudValidator::new());
        cloud.allow(&device("device-1"));
        let cache = Arc::new(CredentialsCache::open(Arc::new(NullBackend::new())).await);
        let authenticator = Authenticator::new(
            AuthStrategy::CloudOnly(CloudAuthenticator::new(
                Arc::clone(&cloud) as Arc<dyn CloudValidator>,
                Duration::from_secs(1),
            )),
            cache,
        );

        let key = generate_symmetric_key();
        for hours in [1, 2] {
            let creds = ClientCredentials::with_token(
                device("device-1"),
                create_sas_token(&device("device-1"), &key, ChronoDuration::hours(hours)),
            );
            assert_eq!(authenticator.authenticate(&creds).await, AuthResult::Allowed);
        }
        assert_eq!(cloud.calls(), 2);
    }
}
