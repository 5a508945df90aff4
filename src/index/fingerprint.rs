//! Certificate fingerprints and pinning.
//!
//! A repository is identified by its signing certificate. The fingerprint is
//! the lowercase hex SHA-256 of the DER-encoded X.509 certificate.
//! [`check_fingerprint`] is the single place where a user-supplied fingerprint and the compiled-in
//! table of well-known repositories are enforced.

use sha2::{Digest, Sha256};

use super::error::IndexError;

/// Well-known repository addresses and their fingerprints.
pub const KNOWN_REPOSITORIES: &[(&str, &str)] = &[
    (
        "https://f-droid.org/repo",
        "43238d512c1e5eb2d6569f4a3afbf5523418b82e0a3ed1552770abb9a9c9ccab",
    ),
    (
        "https://f-droid.org/archive",
        "43238d512c1e5eb2d6569f4a3afbf5523418b82e0a3ed1552770abb9a9c9ccab",
    ),
    (
        "https://guardianproject.info/fdroid/repo",
        "b7c2eefd8dac7806af67dfcd92eb18126bc08312a7f2d6f3862e46013c7a6135",
    ),
    (
        "https://guardianproject.info/fdroid/archive",
        "b7c2eefd8dac7806af67dfcd92eb18126bc08312a7f2d6f3862e46013c7a6135",
    ),
    (
        "https://apt.izzysoft.de/fdroid/repo",
        "3bf0d6abfeae2f401707b6d966be743bf0eee49c2561b9ba39073711f628937a",
    ),
    (
        "https://apt.izzysoft.de/fdroid/archive",
        "3bf0d6abfeae2f401707b6d966be743bf0eee49c2561b9ba39073711f628937a",
    ),
];

/// Lowercase hex SHA-256 of a DER-encoded certificate.
#[must_use]
pub fn fingerprint_of(certificate: &[u8]) -> String {
    hex::encode(Sha256::digest(certificate))
}

/// Fingerprint of a hex-encoded certificate, `None` if it is not valid hex.
#[must_use]
pub fn fingerprint_of_hex(certificate_hex: &str) -> Option<String> {
    hex::decode(certificate_hex)
        .ok()
        .map(|bytes| fingerprint_of(&bytes))
}

/// Expected fingerprint for a well-known repository address.
#[must_use]
pub fn known_fingerprint(address: &str) -> Option<&'static str> {
    let address = address.trim().trim_end_matches('/');
    KNOWN_REPOSITORIES
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(address))
        .map(|(_, fingerprint)| *fingerprint)
}

/// Enforces certificate pinning.
///
/// `expected` is a fingerprint supplied by the user (for example from a
/// `?fingerprint=` query); when present it must match. Every address in
/// `addresses` that is a well-known repository must match its table entry,
/// whether or not the user supplied a fingerprint. Comparison ignores case.
///
/// # Errors
///
/// [`IndexError::FingerprintMismatch`] or [`IndexError::KnownRepositoryMismatch`].
pub fn check_fingerprint(
    expected: Option<&str>,
    addresses: &[&str],
    actual: &str,
) -> Result<(), IndexError> {
    if let Some(expected) = expected.map(str::trim).filter(|e| !e.is_empty())
        && !expected.eq_ignore_ascii_case(actual)
    {
        return Err(IndexError::FingerprintMismatch {
            expected: expected.to_ascii_lowercase(),
            actual: actual.to_ascii_lowercase(),
        });
    }
    for address in addresses {
        if let Some(known) = known_fingerprint(address)
            && !known.eq_ignore_ascii_case(actual)
        {
            return Err(IndexError::KnownRepositoryMismatch {
                address: (*address).to_string(),
                expected: known.to_string(),
                actual: actual.to_ascii_lowercase(),
            });
        }
    }
    Ok(())
}
