//! Error types for the download module.
//!
//! Structured errors for every mirror-level and local failure of a transfer.
//! The classification helpers at the bottom drive the mirror fallback policy.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while talking to mirrors or writing downloads.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The mirror answered with a redirect. Redirects are never followed.
    #[error("unexpected redirect (HTTP {status}) from {url} to {}", location.as_deref().unwrap_or("<none>"))]
    Redirect {
        /// The URL that redirected.
        url: String,
        /// The 3xx status code.
        status: u16,
        /// The Location header, if any.
        location: Option<String>,
    },

    /// A byte range was requested but the mirror sent the full content.
    #[error("mirror does not support resuming {url} (HTTP {status} instead of 206)")]
    NoResume {
        /// The URL requested with a Range header.
        url: String,
        /// The status the mirror answered with.
        status: u16,
    },

    /// File system error during download (create file, write, etc.)
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The SHA-256 of the downloaded file differs from the expected one.
    #[error("hash not matching for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        /// The downloaded file.
        path: PathBuf,
        /// Expected lowercase hex digest.
        expected: String,
        /// Computed lowercase hex digest.
        actual: String,
    },

    /// The download was cancelled through its cancel flag.
    #[error("download of {url} was cancelled")]
    Cancelled {
        /// The URL being downloaded.
        url: String,
    },

    /// The request carried no mirrors at all.
    #[error("no mirrors configured for {name}")]
    NoMirrors {
        /// Name of the requested file.
        name: String,
    },

    /// Only IPFS gateways were available and the file has no CID.
    #[error("Got IPFS gateway without CID for {name}")]
    IpfsGatewayWithoutCid {
        /// Name of the requested file.
        name: String,
    },

    /// The configured proxy cannot be used.
    #[error("invalid proxy {proxy}: {reason}")]
    InvalidProxy {
        /// The proxy as configured.
        proxy: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Building the underlying HTTP client failed.
    #[error("failed to build HTTP client: {source}")]
    ClientBuild {
        /// The underlying builder error.
        #[source]
        source: reqwest::Error,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error, promoting timeouts.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            return Self::timeout(url);
        }
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a redirect error.
    pub fn redirect(url: impl Into<String>, status: u16, location: Option<String>) -> Self {
        Self::Redirect {
            url: url.into(),
            status,
            location,
        }
    }

    /// Creates a resume-not-supported error.
    pub fn no_resume(url: impl Into<String>, status: u16) -> Self {
        Self::NoResume {
            url: url.into(),
            status,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a hash mismatch error.
    pub fn hash_mismatch(
        path: impl Into<PathBuf>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::HashMismatch {
            path: path.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Creates a cancellation error.
    pub fn cancelled(url: impl Into<String>) -> Self {
        Self::Cancelled { url: url.into() }
    }

    /// Returns the HTTP status if this error carries one.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. }
            | Self::Redirect { status, .. }
            | Self::NoResume { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The mirror answered 404.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::HttpStatus { status: 404, .. })
    }

    /// The mirror answered 403.
    #[must_use]
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::HttpStatus { status: 403, .. })
    }

    /// The mirror ignored a Range request.
    #[must_use]
    pub fn is_no_resume(&self) -> bool {
        matches!(self, Self::NoResume { .. })
    }

    /// Errors that another mirror cannot fix: local I/O, integrity, cancellation and
    /// configuration problems. The fallback loop stops on these immediately.
    #[must_use]
    pub fn is_mirror_independent(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::HashMismatch { .. }
                | Self::Cancelled { .. }
                | Self::NoMirrors { .. }
                | Self::IpfsGatewayWithoutCid { .. }
                | Self::InvalidProxy { .. }
                | Self::ClientBuild { .. }
        )
    }
}

// No From<reqwest::Error> / From<std::io::Error>: every variant needs the url or
// path for context, which the helper constructors take.
