//! Error types for index verification and parsing.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while verifying a signed container or parsing an index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Reading or writing a local index file failed.
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Reading the index body from the network failed.
    #[error("error reading index stream: {0}")]
    Stream(#[source] std::io::Error),

    /// The signed container is not a readable archive.
    #[error("invalid signed container {path}: {source}")]
    Container {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    /// A required entry is missing from the signed container.
    #[error("{entry} missing from signed container {path}")]
    MissingEntry { path: PathBuf, entry: String },

    /// The embedded signature or certificate is invalid.
    #[error("signature verification failed: {reason}")]
    Signing { reason: String },

    /// Creating a signing key, certificate or signature failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    /// The signature is valid but the certificate is not the expected one.
    #[error("fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    /// A well-known repository was served with a different certificate.
    #[error("{address} is known to have fingerprint {expected}, got {actual}")]
    KnownRepositoryMismatch {
        address: String,
        expected: String,
        actual: String,
    },

    /// The payload is not a valid index document.
    #[error("malformed index: {0}")]
    Parse(#[from] serde_json::Error),

    /// The streamed index does not hash to the digest in the signed entry.
    #[error("index digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// The streamed index does not have the size in the signed entry.
    #[error("index size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// The document ended without a repository object.
    #[error("index contains no repository")]
    MissingRepository,

    /// The consumer of emitted records stopped listening.
    #[error("index consumer stopped receiving")]
    ReceiverClosed,

    /// The blocking parse task panicked or was cancelled.
    #[error("index processing task failed: {0}")]
    Task(String),
}

impl IndexError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn signing(reason: impl Into<String>) -> Self {
        Self::Signing {
            reason: reason.into(),
        }
    }

    /// Signature and certificate pinning failures.
    #[must_use]
    pub fn is_signing_failure(&self) -> bool {
        matches!(
            self,
            Self::Signing { .. }
                | Self::FingerprintMismatch { .. }
                | Self::KnownRepositoryMismatch { .. }
        )
    }

    /// Local or network I/O, as opposed to bad content.
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Stream(_) | Self::Task(_))
    }
}
