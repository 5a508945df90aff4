//! Constants for the download module (timeouts, progress throttling).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large index files).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Connect timeout when the resolved mirror is an onion service (slow circuits).
pub const ONION_CONNECT_TIMEOUT_SECS: u64 = 60;

/// Connect and read timeout when routing through Tor or when high timeouts are configured.
pub const HIGH_TIMEOUT_SECS: u64 = 300;

/// Minimum wall-clock interval between two progress callbacks during a transfer.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Base URL a malformed mirror resolves to. Nothing listens on this port.
pub const SENTINEL_MIRROR_URL: &str = "http://127.0.0.1:64335";

/// Default SOCKS port of a local Tor daemon.
pub const TOR_SOCKS_PORT: u16 = 9050;

/// Default HTTP port of a local Tor (Privoxy style) proxy.
pub const TOR_HTTP_PORT: u16 = 8118;
