//! Mirror value type.
//!
//! A [`Mirror`] is one candidate base URL for a repository, either official
//! (listed in the signed index) or added by the user. Resolving a mirror to a
//! [`Url`] never fails: a malformed base URL resolves to an unreachable
//! sentinel so a single bad mirror cannot abort mirror iteration.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::LazyLock;

use url::{Host, Url};

use super::constants::SENTINEL_MIRROR_URL;

#[allow(clippy::expect_used)]
static SENTINEL_URL: LazyLock<Url> = LazyLock::new(|| {
    Url::parse(SENTINEL_MIRROR_URL).expect("sentinel mirror URL is a static valid URL")
});

/// A candidate base URL for downloading repository files.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mirror {
    base_url: String,
    country_code: Option<String>,
    is_ipfs_gateway: bool,
}

impl Mirror {
    /// Creates a plain HTTP(S) mirror without location information.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            country_code: None,
            is_ipfs_gateway: false,
        }
    }

    /// Creates a mirror with an ISO 3166 country code.
    pub fn with_country(base_url: impl Into<String>, country_code: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            country_code: country_code.map(|c| c.to_ascii_uppercase()),
            is_ipfs_gateway: false,
        }
    }

    /// Creates an IPFS gateway mirror. Gateways serve files by CID, not by name.
    pub fn ipfs_gateway(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            country_code: None,
            is_ipfs_gateway: true,
        }
    }

    /// The base URL exactly as given.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Upper-case ISO country code, if known.
    #[must_use]
    pub fn country_code(&self) -> Option<&str> {
        self.country_code.as_deref()
    }

    #[must_use]
    pub fn is_ipfs_gateway(&self) -> bool {
        self.is_ipfs_gateway
    }

    /// Resolved base URL, or the sentinel if the base URL does not parse.
    #[must_use]
    pub fn url(&self) -> Url {
        Url::parse(&self.base_url).unwrap_or_else(|_| SENTINEL_URL.clone())
    }

    /// Joins `path` onto the base URL with exactly one `/` between them.
    #[must_use]
    pub fn get_url(&self, path: &str) -> Url {
        let joined = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&joined).unwrap_or_else(|_| SENTINEL_URL.clone())
    }

    /// True for `.onion` hosts, which are only reachable through Tor.
    #[must_use]
    pub fn is_onion(&self) -> bool {
        self.url()
            .host_str()
            .is_some_and(|host| host.to_ascii_lowercase().ends_with(".onion"))
    }

    /// True for loopback, private and link-local hosts. Requests to these bypass proxies.
    #[must_use]
    pub fn is_local(&self) -> bool {
        match self.url().host() {
            Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
            Some(Host::Ipv4(ip)) => is_local_ip(IpAddr::V4(ip)),
            Some(Host::Ipv6(ip)) => is_local_ip(IpAddr::V6(ip)),
            None => false,
        }
    }
}

impl fmt::Display for Mirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base_url)
    }
}

fn is_local_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || is_unique_local(v6) || is_unicast_link_local(v6),
    }
}

fn is_unique_local(ip: Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xfe00) == 0xfc00
}

fn is_unicast_link_local(ip: Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}
