//! Observable state of the add-repository flow.

use std::fmt;
use std::sync::Arc;

use super::fetcher::{FetchError, FetchedIndex};
use super::model::{IndexUpdateResult, MinimalApp, Repository};

/// What adding the fetched repository would do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult {
    /// No repository with this certificate exists yet.
    IsNewRepository { add_url: String },
    /// A repository with this certificate exists; the fetched URL becomes a
    /// user mirror of it.
    IsNewMirror {
        existing_repo_id: i64,
        new_mirror_url: String,
    },
    /// A repository with this certificate already knows the fetched URL.
    IsExistingRepository { existing_repo_id: i64 },
}

/// Why a fetch or add failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddRepoErrorKind {
    UnknownSourcesDisallowed,
    InvalidFingerprint,
    IsArchiveRepo,
    InvalidIndex,
    IoError,
}

impl AddRepoErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownSourcesDisallowed => "unknown_sources_disallowed",
            Self::InvalidFingerprint => "invalid_fingerprint",
            Self::IsArchiveRepo => "is_archive_repo",
            Self::InvalidIndex => "invalid_index",
            Self::IoError => "io_error",
        }
    }
}

impl fmt::Display for AddRepoErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of a fetch, republished as records arrive.
#[derive(Debug, Clone, Default)]
pub struct FetchingState {
    /// The normalized address being fetched.
    pub fetch_url: String,
    pub repo: Option<Arc<Repository>>,
    /// Apps in index order.
    pub apps: Vec<Arc<MinimalApp>>,
    pub fetch_result: Option<FetchResult>,
    /// Set once the whole index was received and verified.
    pub done: bool,
    pub(crate) index: Option<Arc<FetchedIndex>>,
    pub(crate) credentials: Credentials,
}

impl FetchingState {
    pub(crate) fn new(fetch_url: String, credentials: Credentials) -> Self {
        Self {
            fetch_url,
            credentials,
            ..Self::default()
        }
    }

    /// Whether the fetched repository can be added now.
    ///
    /// Adding does not wait for the app list: the repository, its certificate
    /// and the duplicate check are known as soon as the repo record arrived.
    #[must_use]
    pub fn can_add(&self) -> bool {
        self.repo.is_some()
            && self
                .fetch_result
                .as_ref()
                .is_some_and(|r| !matches!(r, FetchResult::IsExistingRepository { .. }))
    }
}

/// Basic-auth credentials taken from the typed address.
#[derive(Clone, Default, PartialEq, Eq)]
pub(crate) struct Credentials {
    pub(crate) username: Option<String>,
    pub(crate) password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// State of the add-repository flow.
#[derive(Debug, Clone, Default)]
pub enum AddRepoState {
    #[default]
    None,
    Fetching(FetchingState),
    Adding,
    Added {
        repo: Arc<Repository>,
        /// Outcome of applying the fetched index; `None` for a new mirror.
        update_result: Option<IndexUpdateResult>,
    },
    Error {
        kind: AddRepoErrorKind,
        cause: Option<Arc<FetchError>>,
    },
}

impl AddRepoState {
    #[must_use]
    pub fn is_fetching(&self) -> bool {
        matches!(self, Self::Fetching(_))
    }

    /// The fetching state, if any.
    #[must_use]
    pub fn fetching(&self) -> Option<&FetchingState> {
        match self {
            Self::Fetching(state) => Some(state),
            _ => None,
        }
    }

    pub(crate) fn error(error: FetchError) -> Self {
        Self::Error {
            kind: error.kind(),
            cause: Some(Arc::new(error)),
        }
    }
}
