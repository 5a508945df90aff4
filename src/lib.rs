//! F-Droid repository acquisition.
//!
//! This library fetches, verifies and stores F-Droid style package
//! repositories: it normalizes shared repository addresses, downloads signed
//! indexes from a set of mirrors with fallback and resume, verifies them
//! against the repository certificate, streams their records into a live
//! preview and commits them transactionally.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`download`] - Mirror ordering, HTTP client and resumable downloader
//! - [`index`] - Signed containers, fingerprints and streaming index parsers
//! - [`repo`] - Address normalization, fetchers, the add flow and persistence
//! - [`db`] - Database connection and schema management

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod db;
pub mod download;
pub mod index;
pub mod repo;
mod user_agent;

// Re-export commonly used types
pub use db::{Database, DbError};
pub use download::{DownloadError, DownloadRequest, Downloader, HttpManager, IndexFile, Mirror};
pub use index::IndexError;
pub use repo::{
    AddRepoErrorKind, AddRepoState, FetchError, FetchResult, RepoAdder, RepoStore, Repository,
    get_uri,
};
