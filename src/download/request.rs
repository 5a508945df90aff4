//! Download requests and proxy configuration.

use std::fmt;
use std::str::FromStr;

use url::Url;

use super::constants::{TOR_HTTP_PORT, TOR_SOCKS_PORT};
use super::error::DownloadError;
use super::mirror::Mirror;

/// A file inside a repository, optionally with its expected integrity data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexFile {
    /// Path relative to the repository base, e.g. `/index-v2.json`.
    pub name: String,
    /// Expected lowercase hex SHA-256.
    pub sha256: Option<String>,
    /// Expected size in bytes.
    pub size: Option<u64>,
    /// IPFS CIDv1, required for gateway mirrors.
    pub ipfs_cid_v1: Option<String>,
}

impl IndexFile {
    /// A file known only by name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sha256: None,
            size: None,
            ipfs_cid_v1: None,
        }
    }

    /// A file with expected digest and size.
    pub fn with_digest(name: impl Into<String>, sha256: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            sha256: Some(sha256.into()),
            size: Some(size),
            ipfs_cid_v1: None,
        }
    }
}

/// Kind of proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyKind {
    Http,
    Socks,
}

/// An HTTP or SOCKS proxy endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    /// Host name or IP literal, without IPv6 brackets.
    pub host: String,
    pub port: u16,
    /// Resolve host names on the SOCKS server (`socks5h`).
    pub remote_dns: bool,
}

impl ProxyConfig {
    pub fn socks(host: impl Into<String>, port: u16) -> Self {
        Self {
            kind: ProxyKind::Socks,
            host: host.into(),
            port,
            remote_dns: false,
        }
    }

    /// Lets the SOCKS server resolve host names.
    #[must_use]
    pub fn with_remote_dns(mut self) -> Self {
        self.remote_dns = true;
        self
    }

    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self {
            kind: ProxyKind::Http,
            host: host.into(),
            port,
            remote_dns: false,
        }
    }

    /// True for the default endpoints of a local Tor daemon.
    #[must_use]
    pub fn is_tor(&self) -> bool {
        let local = matches!(self.host.as_str(), "127.0.0.1" | "localhost" | "::1");
        local
            && match self.kind {
                ProxyKind::Socks => self.port == TOR_SOCKS_PORT,
                ProxyKind::Http => self.port == TOR_HTTP_PORT,
            }
    }

    /// Proxy URL for reqwest. Tor SOCKS endpoints and proxies parsed from
    /// `socks5h` use `socks5h` so that name resolution happens inside the
    /// tunnel.
    #[must_use]
    pub fn proxy_url(&self) -> String {
        let scheme = match self.kind {
            ProxyKind::Http => "http",
            ProxyKind::Socks if self.remote_dns || self.is_tor() => "socks5h",
            ProxyKind::Socks => "socks5",
        };
        if self.host.contains(':') {
            format!("{scheme}://[{}]:{}", self.host, self.port)
        } else {
            format!("{scheme}://{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.proxy_url())
    }
}

impl FromStr for ProxyConfig {
    type Err = DownloadError;

    /// Parses `http://host:port`, `socks5://host:port` or `socks5h://host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| DownloadError::InvalidProxy {
            proxy: s.to_string(),
            reason: reason.to_string(),
        };
        let url = Url::parse(s.trim()).map_err(|e| invalid(&e.to_string()))?;
        let kind = match url.scheme() {
            "http" => ProxyKind::Http,
            "socks" | "socks5" | "socks5h" => ProxyKind::Socks,
            other => return Err(invalid(&format!("unsupported scheme {other}"))),
        };
        let host = url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid("missing port"))?;
        Ok(Self {
            kind,
            host,
            port,
            remote_dns: url.scheme() == "socks5h",
        })
    }
}

/// Everything needed to fetch one repository file from a set of mirrors.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub index_file: IndexFile,
    pub mirrors: Vec<Mirror>,
    pub proxy: Option<ProxyConfig>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Mirror to attempt before all others, used for full repository downloads.
    pub try_first_mirror: Option<Mirror>,
}

impl DownloadRequest {
    pub fn new(index_file: IndexFile, mirrors: Vec<Mirror>) -> Self {
        Self {
            index_file,
            mirrors,
            proxy: None,
            username: None,
            password: None,
            try_first_mirror: None,
        }
    }

    #[must_use]
    pub fn with_proxy(mut self, proxy: Option<ProxyConfig>) -> Self {
        self.proxy = proxy;
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    #[must_use]
    pub fn with_try_first_mirror(mut self, mirror: Option<Mirror>) -> Self {
        self.try_first_mirror = mirror;
        self
    }

    /// True iff both username and password are present.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }
}
