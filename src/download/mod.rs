//! Mirror-aware download layer.
//!
//! This module fetches repository files from a set of mirrors with fallback,
//! resumable partial downloads and hash verification.
//!
//! # Features
//!
//! - Mirror ordering strategies with try-first, onion and IPFS gateway rules
//! - HEAD and streaming GET with range resume and redirects disabled
//! - Proxy support (HTTP, SOCKS, Tor) with local-network bypass
//! - Running SHA-256 over resumed downloads, throttled progress, cancellation
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fdroid_repo::download::{DownloadRequest, Downloader, HttpManager, IndexFile, Mirror};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let http = Arc::new(HttpManager::with_defaults()?);
//! let request = DownloadRequest::new(
//!     IndexFile::named("entry.jar"),
//!     vec![Mirror::new("https://f-droid.org/repo")],
//! );
//! let outcome = Downloader::new(http, request, "/tmp/entry.jar").download().await?;
//! println!("downloaded {} bytes", outcome.bytes());
//! # Ok(())
//! # }
//! ```

mod chooser;
mod client;
pub mod constants;
mod downloader;
mod error;
mod mirror;
mod request;

pub use chooser::{
    InMemoryMirrorParameters, MirrorAttempt, MirrorAttempts, MirrorChooser,
    MirrorChooserRandom, MirrorChooserWithParameters, MirrorParameterManager, plan_attempts,
};
pub use client::{BytesReceiver, HeadInfo, HttpManager, HttpSettings, IndexStream};
pub use downloader::{DownloadOutcome, Downloader, ProgressListener};
pub use error::DownloadError;
pub use mirror::Mirror;
pub use request::{DownloadRequest, IndexFile, ProxyConfig, ProxyKind};

// Note: we do NOT define module-local Result aliases.
// Use `Result<T, DownloadError>` explicitly in function signatures.
