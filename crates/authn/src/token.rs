//! Shared access signature tokens.
//!
//! A token authorizes its holder for one resource until an expiry time:
//!
//! ```text
//! SharedAccessSignature sr=<resource>&sig=<signature>&se=<expiry>[&skn=<key name>]
//! ```
//!
//! - `sr` is `<hub>/devices/<device>` or `<hub>/devices/<device>/modules/<module>`
//! - `se` is the expiry as Unix seconds
//! - `sig` is `base64(HMAC-SHA256(key, "<url-encoded sr>\n<se>"))`
//!
//! All components are URL-encoded inside the token.

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use url::form_urlencoded;

use crate::{
    error::{AuthError, Result},
    identity::Identity,
};

/// Scheme prefix of every shared access signature token.
pub const SAS_SCHEME: &str = "SharedAccessSignature";

type HmacSha256 = Hmac<Sha256>;

/// A parsed shared access signature token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SasToken {
    resource: String,
    signature: Vec<u8>,
    expiry: i64,
    key_name: Option<String>,
}

impl SasToken {
    /// Parses a raw token string.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidProof`] if the scheme is wrong, a required
    /// field is missing or repeated, the expiry is not an integer, or the
    /// signature is not base64.
    pub fn parse(raw: &str) -> Result<Self> {
        let Some(fields) = raw.trim().strip_prefix(SAS_SCHEME) else {
            return Err(AuthError::invalid_proof("missing SharedAccessSignature scheme"));
        };
        let fields = fields.trim_start();
        if fields.is_empty() {
            return Err(AuthError::invalid_proof("token has no fields"));
        }

        let mut resource = None;
        let mut signature = None;
        let mut expiry = None;
        let mut key_name = None;

        for (name, value) in form_urlencoded::parse(fields.as_bytes()) {
            let slot = match &*name {
                "sr" => &mut resource,
                "sig" => &mut signature,
                "se" => &mut expiry,
                "skn" => &mut key_name,
                other => {
                    return Err(AuthError::invalid_proof(format!("unknown token field {other:?}")));
                },
            };
            if slot.replace(value.into_owned()).is_some() {
                return Err(AuthError::invalid_proof(format!("repeated token field {name:?}")));
            }
        }

        let resource = resource.ok_or_else(|| AuthError::invalid_proof("missing sr"))?;
        let signature = signature.ok_or_else(|| AuthError::invalid_proof("missing sig"))?;
        let expiry = expiry.ok_or_else(|| AuthError::invalid_proof("missing se"))?;

        let signature = STANDARD
            .decode(signature.as_bytes())
            .map_err(|e| AuthError::invalid_proof(format!("signature is not base64: {e}")))?;
        let expiry = expiry
            .parse::<i64>()
            .map_err(|e| AuthError::invalid_proof(format!("expiry is not an integer: {e}")))?;

        Ok(Self { resource, signature, expiry, key_name })
    }

    /// Signs a token for `resource` valid until `expires_at`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidProof`] if the key is rejected by HMAC.
    pub fn sign(resource: &str, key: &[u8], expires_at: DateTime<Utc>) -> Result<String> {
        let expiry = expires_at.timestamp();
        let signature = STANDARD.encode(compute_signature(resource, expiry, key)?);

        let fields: String = form_urlencoded::Serializer::new(String::new())
            .append_pair("sr", resource)
            .append_pair("sig", &signature)
            .append_pair("se", &expiry.to_string())
            .finish();
        Ok(format!("{SAS_SCHEME} {fields}"))
    }

    /// Decoded resource URI.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Expiry as Unix seconds.
    pub fn expiry(&self) -> i64 {
        self.expiry
    }

    /// Optional shared access policy name.
    pub fn key_name(&self) -> Option<&str> {
        self.key_name.as_deref()
    }

    /// Returns `true` if the token has expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.expiry
    }

    /// Returns `true` if the token's resource names `identity`.
    ///
    /// The hub name is compared case-insensitively; device and module ids exactly.
    pub fn is_for(&self, identity: &Identity) -> bool {
        let Some((hub, path)) = self.resource.split_once('/') else {
            return false;
        };
        hub.eq_ignore_ascii_case(identity.hub_name())
            && path.trim_end_matches('/') == resource_path(identity)
    }

    /// Verifies the signature against `key`, in constant time.
    pub fn verify(&self, key: &[u8]) -> bool {
        let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
            return false;
        };
        mac.update(string_to_sign(&self.resource, self.expiry).as_bytes());
        mac.verify_slice(&self.signature).is_ok()
    }
}

/// Builds the resource URI a token for `identity` must name.
pub fn resource_uri(identity: &Identity) -> String {
    format!("{}/{}", identity.hub_name(), resource_path(identity))
}

fn resource_path(identity: &Identity) -> String {
    match identity.module_id() {
        Some(module) => format!("devices/{}/modules/{module}", identity.device_id()),
        None => format!("devices/{}", identity.device_id()),
    }
}

fn string_to_sign(resource: &str, expiry: i64) -> String {
    let encoded: String = form_urlencoded::byte_serialize(resource.as_bytes()).collect();
    format!("{encoded}\n{expiry}")
}

fn compute_signature(resource: &str, expiry: i64, key: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| AuthError::invalid_proof(format!("hmac key: {e}")))?;
    mac.update(string_to_sign(resource, expiry).as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use chrono::Duration;
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;

    const HUB: &str = "hub.example.net";

    fn device() -> Identity {
        Identity::device(HUB, "device-1").expect("identity")
    }

    #[test]
    fn test_sign_then_parse_and_verify() {
        let identity = device();
        let key = b"0123456789abcdef0123456789abcdef";
        let raw = SasToken::sign(&resource_uri(&identity), key, Utc::now() + Duration::hours(1))
            .expect("sign");

        let token = SasToken::parse(&raw).expect("parse");
        assert_eq!(token.resource(), "hub.example.net/devices/device-1");
        assert!(token.is_for(&identity));
        assert!(token.verify(key));
        assert!(!token.verify(b"another key entirely"));
        assert!(!token.is_expired_at(Utc::now()));
    }

    #[test]
    fn test_module_resource() {
        let module = Identity::module(HUB, "device-1", "sensor").expect("identity");
        assert_eq!(resource_uri(&module), "hub.example.net/devices/device-1/modules/sensor");

        let raw = SasToken::sign(&resource_uri(&module), b"k", Utc::now() + Duration::hours(1))
            .expect("sign");
        let token = SasToken::parse(&raw).expect("parse");
        assert!(token.is_for(&module));
        assert!(!token.is_for(&device()), "module token must not authorize its device");
    }

    #[test]
    fn test_hub_comparison_is_case_insensitive() {
        let raw = SasToken::sign(
            "HUB.Example.NET/devices/device-1",
            b"k",
            Utc::now() + Duration::hours(1),
        )
        .expect("sign");
        assert!(SasToken::parse(&raw).expect("parse").is_for(&device()));
    }

    #[test]
    fn test_device_comparison_is_exact() {
        let raw =
            SasToken::sign("hub.example.net/devices/DEVICE-1", b"k", Utc::now() + Duration::hours(1))
                .expect("sign");
        assert!(!SasToken::parse(&raw).expect("parse").is_for(&device()));
    }

    #[test]
    fn test_expired_token() {
        let raw = SasToken::sign(&resource_uri(&device()), b"k", Utc::now() - Duration::seconds(5))
            .expect("sign");
        assert!(SasToken::parse(&raw).expect("parse").is_expired_at(Utc::now()));
    }

    #[test]
    fn test_optional_key_name() {
        let raw = "SharedAccessSignature sr=hub%2Fdevices%2Fd&sig=AAAA&se=10&skn=registryRead";
        let token = SasToken::parse(raw).expect("parse");
        assert_eq!(token.key_name(), Some("registryRead"));
        assert_eq!(token.resource(), "hub/devices/d");
        assert_eq!(token.expiry(), 10);
    }

    #[rstest]
    #[case::no_scheme("sr=a&sig=AAAA&se=1")]
    #[case::empty("SharedAccessSignature ")]
    #[case::missing_sig("SharedAccessSignature sr=a&se=1")]
    #[case::missing_se("SharedAccessSignature sr=a&sig=AAAA")]
    #[case::missing_sr("SharedAccessSignature sig=AAAA&se=1")]
    #[case::bad_expiry("SharedAccessSignature sr=a&sig=AAAA&se=soon")]
    #[case::bad_signature("SharedAccessSignature sr=a&sig=%%%%&se=1")]
    #[case::repeated("SharedAccessSignature sr=a&sr=b&sig=AAAA&se=1")]
    #[case::unknown_field("SharedAccessSignature sr=a&sig=AAAA&se=1&foo=bar")]
    fn test_malformed_tokens(#[case] raw: &str) {
        assert!(matches!(SasToken::parse(raw), Err(AuthError::InvalidProof(_))));
    }

    proptest! {
        #[test]
        fn parse_never_panics(raw in ".{0,256}") {
            let _ = SasToken::parse(&raw);
        }

        #[test]
        fn tampered_expiry_fails_verification(delta in 1i64..1_000_000) {
            let key = b"rotation-key";
            let raw = SasToken::sign("hub/devices/d", key, DateTime::from_timestamp(1_900_000_000, 0).expect("ts"))
                .expect("sign");
            let mut token = SasToken::parse(&raw).expect("parse");
            token.expiry += delta;
            prop_assert!(!token.verify(key));
        }
    }
}
