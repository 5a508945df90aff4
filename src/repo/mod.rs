//! Repository acquisition and persistence.
//!
//! This module turns a typed repository address into a stored, verified
//! repository:
//!
//! - [`uri`] normalizes the many forms a repository address is shared in
//! - [`fetcher`] downloads and verifies a V2 or V1 index for preview
//! - [`adder`] runs the observable add flow on top of the fetchers
//! - [`store`] and [`updater`] persist repositories and their indexes

pub mod adder;
mod error;
pub mod fetcher;
mod model;
mod state;
mod store;
mod updater;
pub mod uri;

pub use adder::{RepoAdder, StaticUnknownSourcesPolicy, UnknownSourcesPolicy};
pub use error::{StoreDbErrorKind, StoreError};
pub use fetcher::{
    FetchError, FetchOutcome, FetchTarget, FetchedIndex, RepoFetcher, RepoPreviewReceiver,
    RepoV1Fetcher, RepoV2Fetcher,
};
pub use model::{
    IndexFormatVersion, IndexUpdateResult, MinimalApp, NewRepository, Repository,
    RepositoryPreferences,
};
pub use state::{AddRepoErrorKind, AddRepoState, FetchResult, FetchingState};
pub use store::{RepoStore, RowCounts, StoreTransaction};
pub use updater::RepoUpdater;
pub use uri::{NormalizedUri, get_uri, is_invalid_http_url};
