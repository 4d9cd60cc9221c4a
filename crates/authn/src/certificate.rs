//! Certificate thumbprints and trust-bundle matching.
//!
//! Chain signature validation happens in the transport's TLS handshake; this
//! module only pins what the handshake accepted to what the directory expects.

use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::identity::{CertificateProof, Identity};

/// Hex length of a SHA-1 thumbprint.
const SHA1_HEX_LEN: usize = 40;

/// Hex length of a SHA-256 thumbprint.
const SHA256_HEX_LEN: usize = 64;

/// Uppercase hex SHA-1 thumbprint of a DER certificate.
pub fn sha1_thumbprint(der: &[u8]) -> String {
    hex::encode_upper(Sha1::digest(der))
}

/// Uppercase hex SHA-256 thumbprint of a DER certificate.
pub fn sha256_thumbprint(der: &[u8]) -> String {
    hex::encode_upper(Sha256::digest(der))
}

/// Returns `true` if `der` hashes to `expected`.
///
/// The algorithm is picked from the thumbprint's length; colons and
/// whitespace are ignored and case does not matter.
pub fn matches_thumbprint(der: &[u8], expected: &str) -> bool {
    let normalized: String =
        expected.chars().filter(|c| !c.is_whitespace() && *c != ':').collect();
    let actual = match normalized.len() {
        SHA1_HEX_LEN => sha1_thumbprint(der),
        SHA256_HEX_LEN => sha256_thumbprint(der),
        _ => return false,
    };
    actual.eq_ignore_ascii_case(&normalized)
}

/// Returns `true` if the leaf matches the primary or secondary thumbprint.
pub fn matches_pinned(cert: &CertificateProof, primary: &str, secondary: Option<&str>) -> bool {
    matches_thumbprint(&cert.leaf, primary)
        || secondary.is_some_and(|thumbprint| matches_thumbprint(&cert.leaf, thumbprint))
}

/// Returns `true` if the certificate names `identity` and chains to one of
/// the `trusted` authority thumbprints.
///
/// The subject common name must equal the device id. Any certificate above
/// the leaf may be the trust anchor.
pub fn matches_authority(cert: &CertificateProof, identity: &Identity, trusted: &[String]) -> bool {
    if cert.common_name.as_deref() != Some(identity.device_id()) {
        return false;
    }
    cert.chain
        .iter()
        .any(|issuer| trusted.iter().any(|anchor| matches_thumbprint(issuer, anchor)))
}
