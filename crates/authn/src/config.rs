//! Authentication core configuration.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use edgegate_authn::{AuthConfig, AuthMode};
//!
//! let config = AuthConfig::builder()
//!     .hub_name("hub.example.net")
//!     .mode(AuthMode::ScopeOnly)
//!     .reauth_period(Duration::from_secs(120))
//!     .build()
//!     .expect("valid config");
//! assert!(!config.persist_credentials());
//! ```
//!
//! Deserialized configuration uses human-readable durations:
//!
//! ```
//! use edgegate_authn::AuthConfig;
//!
//! let config: AuthConfig = serde_json::from_str(r#"{
//!     "hub_name": "hub.example.net",
//!     "mode": "cloud_only",
//!     "scope_refresh_period": "30m",
//!     "persist_credentials": true
//! }"#).expect("valid json");
//! config.validate().expect("valid config");
//! ```

use std::time::Duration;

use edgegate_storage::ConfigError;
use serde::{Deserialize, Serialize};

/// Default scope refresh period (1 hour).
pub const DEFAULT_SCOPE_REFRESH_PERIOD: Duration = Duration::from_secs(60 * 60);

/// Default reauthentication period (5 minutes).
pub const DEFAULT_REAUTH_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Default cloud validation timeout (30 seconds).
pub const DEFAULT_CLOUD_TIMEOUT: Duration = Duration::from_secs(30);

/// Shortest accepted refresh or reauthentication period.
pub const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Which sources of trust the authenticator consults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Only the cloud validator.
    #[serde(alias = "CloudOnly")]
    CloudOnly,
    /// Only the local scope cache.
    #[serde(alias = "ScopeOnly")]
    ScopeOnly,
    /// The scope cache, falling back to the cloud validator.
    #[default]
    #[serde(alias = "ScopeThenCloud")]
    ScopeThenCloud,
}

impl AuthMode {
    /// Returns `true` if the mode needs a scope directory.
    pub fn requires_scope(self) -> bool {
        matches!(self, Self::ScopeOnly | Self::ScopeThenCloud)
    }

    /// Returns `true` if the mode needs a cloud validator.
    pub fn requires_cloud(self) -> bool {
        matches!(self, Self::CloudOnly | Self::ScopeThenCloud)
    }
}

/// Configuration for the authentication core.
///
/// # Validation
///
/// - `hub_name` must be non-empty
/// - `scope_refresh_period` and `reauth_period` must be `>= 1s`
/// - `cloud_timeout` must be non-zero
///
/// Fields are snake_case; the camelCase names used by the gateway's settings
/// documents are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(alias = "hubName")]
    hub_name: String,
    #[serde(default)]
    mode: AuthMode,
    #[serde(
        default = "default_scope_refresh_period",
        with = "humantime_serde",
        alias = "scopeRefreshPeriod"
    )]
    scope_refresh_period: Duration,
    #[serde(default = "default_reauth_period", with = "humantime_serde", alias = "reauthPeriod")]
    reauth_period: Duration,
    #[serde(default, alias = "persistCredentials")]
    persist_credentials: bool,
    #[serde(default = "default_true", alias = "encryptAtRest")]
    encrypt_at_rest: bool,
    #[serde(default = "default_cloud_timeout", with = "humantime_serde", alias = "cloudTimeout")]
    cloud_timeout: Duration,
    #[serde(default, alias = "serviceIdentity")]
    service_identity: Option<String>,
    #[serde(default, alias = "trustedCaThumbprints")]
    trusted_ca_thumbprints: Vec<String>,
}

fn default_scope_refresh_period() -> Duration {
    DEFAULT_SCOPE_REFRESH_PERIOD
}

fn default_reauth_period() -> Duration {
    DEFAULT_REAUTH_PERIOD
}

fn default_cloud_timeout() -> Duration {
    DEFAULT_CLOUD_TIMEOUT
}

fn default_true() -> bool {
    true
}

#[bon::bon]
impl AuthConfig {
    /// Creates a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any field fails validation.
    #[builder]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        #[builder(into)] hub_name: String,
        #[builder(default)] mode: AuthMode,
        #[builder(default = DEFAULT_SCOPE_REFRESH_PERIOD)] scope_refresh_period: Duration,
        #[builder(default = DEFAULT_REAUTH_PERIOD)] reauth_period: Duration,
        #[builder(default)] persist_credentials: bool,
        #[builder(default = true)] encrypt_at_rest: bool,
        #[builder(default = DEFAULT_CLOUD_TIMEOUT)] cloud_timeout: Duration,
        #[builder(into)] service_identity: Option<String>,
        #[builder(default)] trusted_ca_thumbprints: Vec<String>,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            hub_name,
            mode,
            scope_refresh_period,
            reauth_period,
            persist_credentials,
            encrypt_at_rest,
            cloud_timeout,
            service_identity,
            trusted_ca_thumbprints,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants the builder enforces.
    ///
    /// Deserialized configurations must be validated explicitly.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for the first field that fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hub_name.trim().is_empty() {
            return Err(ConfigError::Missing { field: "hub_name" });
        }
        check_period("scope_refresh_period", self.scope_refresh_period)?;
        check_period("reauth_period", self.reauth_period)?;
        if self.cloud_timeout.is_zero() {
            return Err(ConfigError::BelowMinimum {
                field: "cloud_timeout",
                value: "0s".into(),
                min: "1ns".into(),
            });
        }
        if self.service_identity.as_deref().is_some_and(str::is_empty) {
            return Err(ConfigError::Invalid {
                field: "service_identity",
                reason: "must not be empty when set".into(),
            });
        }
        Ok(())
    }

    /// Hub the gateway serves.
    #[must_use]
    pub fn hub_name(&self) -> &str {
        &self.hub_name
    }

    /// Authentication strategy.
    #[must_use]
    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    /// How often the scope cache refreshes.
    #[must_use]
    pub fn scope_refresh_period(&self) -> Duration {
        self.scope_refresh_period
    }

    /// How often open connections are revalidated.
    #[must_use]
    pub fn reauth_period(&self) -> Duration {
        self.reauth_period
    }

    /// Whether validated credentials survive a restart.
    #[must_use]
    pub fn persist_credentials(&self) -> bool {
        self.persist_credentials
    }

    /// Whether persisted credentials are encrypted.
    #[must_use]
    pub fn encrypt_at_rest(&self) -> bool {
        self.encrypt_at_rest
    }

    /// Upper bound on one cloud validation call.
    #[must_use]
    pub fn cloud_timeout(&self) -> Duration {
        self.cloud_timeout
    }

    /// Identity key excluded from reauthentication scans.
    #[must_use]
    pub fn service_identity(&self) -> Option<&str> {
        self.service_identity.as_deref()
    }

    /// Thumbprints of the certificate authorities trusted for CA-issued identities.
    #[must_use]
    pub fn trusted_ca_thumbprints(&self) -> &[String] {
        &self.trusted_ca_thumbprints
    }
}

fn check_period(field: &'static str, period: Duration) -> Result<(), ConfigError> {
    if period < MIN_PERIOD {
        return Err(ConfigError::BelowMinimum {
            field,
            value: format!("{period:?}"),
            min: format!("{MIN_PERIOD:?}"),
        });
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = AuthConfig::builder().hub_name("hub").build().expect("valid");
        assert_eq!(config.mode(), AuthMode::ScopeThenCloud);
        assert_eq!(config.scope_refresh_period(), DEFAULT_SCOPE_REFRESH_PERIOD);
        assert_eq!(config.reauth_period(), DEFAULT_REAUTH_PERIOD);
        assert_eq!(config.cloud_timeout(), DEFAULT_CLOUD_TIMEOUT);
        assert!(!config.persist_credentials());
        assert!(config.encrypt_at_rest());
        assert_eq!(config.service_identity(), None);
        assert!(config.trusted_ca_thumbprints().is_empty());
    }

    #[test]
    fn test_missing_hub_name() {
        let err = AuthConfig::builder().hub_name("  ").build().expect_err("invalid");
        assert!(matches!(err, ConfigError::Missing { field: "hub_name" }));
    }

    #[rstest]
    #[case::refresh(Duration::from_millis(500), DEFAULT_REAUTH_PERIOD, "scope_refresh_period")]
    #[case::reauth(DEFAULT_SCOPE_REFRESH_PERIOD, Duration::ZERO, "reauth_period")]
    fn test_period_minimum(
        #[case] refresh: Duration,
        #[case] reauth: Duration,
        #[case] expected: &str,
    ) {
        let err = AuthConfig::builder()
            .hub_name("hub")
            .scope_refresh_period(refresh)
            .reauth_period(reauth)
            .build()
            .expect_err("invalid");
        assert!(matches!(err, ConfigError::BelowMinimum { field, .. } if field == expected));
    }

    #[test]
    fn test_empty_service_identity() {
        let err =
            AuthConfig::builder().hub_name("hub").service_identity("").build().expect_err("invalid");
        assert!(matches!(err, ConfigError::Invalid { field: "service_identity", .. }));
    }

    #[test]
    fn test_mode_requirements() {
        assert!(AuthMode::CloudOnly.requires_cloud());
        assert!(!AuthMode::CloudOnly.requires_scope());
        assert!(AuthMode::ScopeOnly.requires_scope());
        assert!(!AuthMode::ScopeOnly.requires_cloud());
        assert!(AuthMode::ScopeThenCloud.requires_scope() && AuthMode::ScopeThenCloud.requires_cloud());
    }

    #[test]
    fn test_deserialize_with_humantime() {
        let config: AuthConfig = serde_json::from_str(
            r#"{"hub_name":"hub","mode":"scope_only","reauth_period":"2m","cloud_timeout":"5s",
                "service_identity":"edge-device/$edgeHub","trusted_ca_thumbprints":["AB"]}"#,
        )
        .expect("deserialize");
        assert_eq!(config.mode(), AuthMode::ScopeOnly);
        assert_eq!(config.reauth_period(), Duration::from_secs(120));
        assert_eq!(config.cloud_timeout(), Duration::from_secs(5));
        assert_eq!(config.scope_refresh_period(), DEFAULT_SCOPE_REFRESH_PERIOD);
        assert!(config.encrypt_at_rest());
        assert_eq!(config.service_identity(), Some("edge-device/$edgeHub"));
        config.validate().expect("valid");
    }

    #[test]
    fn test_deserialize_camel_case_option_names() {
        let config: AuthConfig = serde_json::from_str(
            r#"{"hubName":"hub","mode":"ScopeOnly","scopeRefreshPeriod":"10m",
                "reauthPeriod":"90s","persistCredentials":true,"encryptAtRest":false}"#,
        )
        .expect("deserialize");
        assert_eq!(config.hub_name(), "hub");
        assert_eq!(config.mode(), AuthMode::ScopeOnly);
        assert_eq!(config.scope_refresh_period(), Duration::from_secs(600));
        assert_eq!(config.reauth_period(), Duration::from_secs(90));
        assert!(config.persist_credentials());
        assert!(!config.encrypt_at_rest());
        config.validate().expect("valid");
    }

    #[rstest]
    #[case::cloud("CloudOnly", AuthMode::CloudOnly)]
    #[case::scope("ScopeOnly", AuthMode::ScopeOnly)]
    #[case::combined("ScopeThenCloud", AuthMode::ScopeThenCloud)]
    #[case::snake("scope_then_cloud", AuthMode::ScopeThenCloud)]
    fn test_mode_names(#[case] name: &str, #[case] expected: AuthMode) {
        let mode: AuthMode = serde_json::from_str(&format!("\"{name}\"")).expect("mode");
        assert_eq!(mode, expected);
    }

    #[test]
    fn test_deserialize_rejects_unknown_fields() {
        let result = serde_json::from_str::<AuthConfig>(r#"{"hub_name":"hub","refresh":"1h"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_deserialized_config_must_be_validated() {
        let config: AuthConfig =
            serde_json::from_str(r#"{"hub_name":"hub","reauth_period":"100ms"}"#).expect("parse");
        assert!(config.validate().is_err());
    }
}
