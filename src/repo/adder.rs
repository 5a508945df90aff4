//! The add-repository flow.
//!
//! # Overview
//!
//! [`RepoAdder`] drives `None → Fetching → Adding → Added`, or ends in
//! `Error`, and publishes every step on a [`watch`] channel:
//!
//! 1. [`RepoAdder::fetch_repository`] normalizes the typed address, applies
//!    the unknown-sources and archive gates, and starts a background fetch.
//!    The V2 format is tried first; only a missing V2 entry falls back to V1.
//!    The preview is republished as the repository record and each app arrive.
//! 2. [`RepoAdder::add_fetched_repository`] commits the preview as a new
//!    repository or as a new mirror of a stored one, then applies the fetched
//!    index without downloading it again.
//! 3. [`RepoAdder::abort_adding_repo`] returns to `None` from any state.
//!
//! Starting a fetch, committing and aborting each begin a new generation.
//! A job only publishes while its generation is current, and the generation
//! check runs under the channel's lock, so a cancelled job can never publish
//! after a newer step began.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fdroid_repo::download::HttpManager;
//! use fdroid_repo::repo::{RepoAdder, RepoStore, StaticUnknownSourcesPolicy};
//! use fdroid_repo::Database;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RepoStore::new(Database::new_in_memory().await?);
//! let http = Arc::new(HttpManager::with_defaults()?);
//! let adder = RepoAdder::with_http(
//!     store,
//!     http,
//!     std::env::temp_dir(),
//!     "en-US",
//!     Arc::new(StaticUnknownSourcesPolicy::allowed()),
//! );
//! adder.fetch_repository("https://f-droid.org/repo", None);
//! let state = adder.wait_for_fetch().await;
//! if state.fetching().is_some_and(|s| s.can_add()) {
//!     adder.add_fetched_repository().await;
//! }
//! # Ok(())
//! # }
//! ```

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::error::StoreError;
use super::fetcher::{
    FetchError, FetchOutcome, FetchTarget, RepoFetcher, RepoPreviewReceiver, RepoV1Fetcher,
    RepoV2Fetcher,
};
use super::model::{IndexUpdateResult, MinimalApp, NewRepository, Repository};
use super::state::{AddRepoState, Credentials, FetchResult, FetchingState};
use super::store::RepoStore;
use super::updater::RepoUpdater;
use super::uri::{get_uri, is_invalid_http_url};
use crate::download::{HttpManager, ProxyConfig};
use crate::index::{IndexError, check_fingerprint};

/// Decides whether adding repositories is allowed at all.
pub trait UnknownSourcesPolicy: Send + Sync {
    fn is_disallowed(&self) -> bool;
}

/// A policy fixed at construction, typically from configuration.
#[derive(Debug, Clone, Copy)]
pub struct StaticUnknownSourcesPolicy {
    disallowed: bool,
}

impl StaticUnknownSourcesPolicy {
    #[must_use]
    pub fn allowed() -> Self {
        Self { disallowed: false }
    }

    #[must_use]
    pub fn disallowed() -> Self {
        Self { disallowed: true }
    }
}

impl UnknownSourcesPolicy for StaticUnknownSourcesPolicy {
    fn is_disallowed(&self) -> bool {
        self.disallowed
    }
}

struct Job {
    handle: JoinHandle<()>,
    cancelled: Arc<AtomicBool>,
}

struct Inner {
    store: RepoStore,
    v2: Arc<dyn RepoFetcher>,
    v1: Arc<dyn RepoFetcher>,
    policy: Arc<dyn UnknownSourcesPolicy>,
    state: watch::Sender<AddRepoState>,
    generation: AtomicU64,
    job: Mutex<Option<Job>>,
}

/// Fetches, previews and adds repositories. Cheap to clone; clones share
/// state.
#[derive(Clone)]
pub struct RepoAdder {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RepoAdder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoAdder")
            .field("state", &*self.inner.state.borrow())
            .field("generation", &self.inner.generation.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl RepoAdder {
    #[must_use]
    pub fn new(
        store: RepoStore,
        v2: Arc<dyn RepoFetcher>,
        v1: Arc<dyn RepoFetcher>,
        policy: Arc<dyn UnknownSourcesPolicy>,
    ) -> Self {
        let (state, _) = watch::channel(AddRepoState::None);
        Self {
            inner: Arc::new(Inner {
                store,
                v2,
                v1,
                policy,
                state,
                generation: AtomicU64::new(0),
                job: Mutex::new(None),
            }),
        }
    }

    /// Builds the V2 and V1 fetchers on a shared HTTP manager.
    #[must_use]
    pub fn with_http(
        store: RepoStore,
        http: Arc<HttpManager>,
        temp_dir: impl Into<PathBuf>,
        locale: &str,
        policy: Arc<dyn UnknownSourcesPolicy>,
    ) -> Self {
        let temp_dir = temp_dir.into();
        let v2 = RepoV2Fetcher::new(Arc::clone(&http), temp_dir.clone(), locale);
        let v1 = RepoV1Fetcher::new(http, temp_dir, locale);
        Self::new(store, Arc::new(v2), Arc::new(v1), policy)
    }

    /// Observes the flow. The receiver sees the latest state immediately.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AddRepoState> {
        self.inner.state.subscribe()
    }

    /// A snapshot of the current state.
    #[must_use]
    pub fn state(&self) -> AddRepoState {
        self.inner.state.borrow().clone()
    }

    /// Waits until the current fetch is done, failed or aborted.
    pub async fn wait_for_fetch(&self) -> AddRepoState {
        let mut receiver = self.subscribe();
        let finished = receiver
            .wait_for(|state| match state {
                AddRepoState::Fetching(fetching) => fetching.done,
                _ => true,
            })
            .await
            .map(|state| state.clone());
        // The sender lives in `self`, so the channel cannot close here.
        finished.unwrap_or_else(|_| self.state())
    }

    /// Starts fetching the repository at `url`, cancelling any previous
    /// fetch. Progress and errors are published, never returned.
    ///
    /// Must be called within a Tokio runtime.
    #[instrument(skip(self, proxy))]
    pub fn fetch_repository(&self, url: &str, proxy: Option<ProxyConfig>) {
        self.cancel_job();

        if self.inner.policy.is_disallowed() {
            self.fail_new_generation(FetchError::UnknownSourcesDisallowed);
            return;
        }
        let normalized = get_uri(url);
        if normalized.last_path_segment() == Some("archive") {
            self.fail_new_generation(FetchError::ArchiveRepo(normalized.uri));
            return;
        }
        if !normalized.is_local_source() && is_invalid_http_url(&normalized.uri) {
            self.fail_new_generation(FetchError::InvalidUri(normalized.uri));
            return;
        }

        let credentials = Credentials {
            username: normalized.username.clone(),
            password: normalized.password.clone(),
        };
        let generation = self.begin_generation(AddRepoState::Fetching(FetchingState::new(
            normalized.uri.clone(),
            credentials,
        )));
        let cancelled = Arc::new(AtomicBool::new(false));
        let target = FetchTarget {
            address: normalized.uri,
            fingerprint: normalized.fingerprint,
            username: normalized.username,
            password: normalized.password,
            proxy,
            cancelled: Arc::clone(&cancelled),
        };
        info!(address = %target.address, generation, "fetching repository");

        let adder = self.clone();
        let handle = tokio::spawn(async move { adder.run_fetch(generation, target).await });
        *self.lock_job() = Some(Job { handle, cancelled });
    }

    /// Commits the fetched repository and returns the resulting state.
    ///
    /// Does nothing and returns the current state unless a fetch has produced
    /// something addable; in particular a second call while the first is
    /// committing is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if the fetched repository already exists. Such a preview can
    /// never be added and callers must not offer it.
    pub async fn add_fetched_repository(&self) -> AddRepoState {
        let mut existing = false;
        let mut claimed: Option<(u64, FetchingState)> = None;
        self.inner.state.send_if_modified(|current| {
            let AddRepoState::Fetching(fetching) = current else {
                return false;
            };
            if matches!(
                fetching.fetch_result,
                Some(FetchResult::IsExistingRepository { .. })
            ) {
                existing = true;
                return false;
            }
            if !fetching.can_add() {
                return false;
            }
            let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            claimed = Some((generation, std::mem::take(fetching)));
            *current = AddRepoState::Adding;
            true
        });
        assert!(!existing, "cannot add a repository that already exists");
        let Some((generation, fetching)) = claimed else {
            debug!("nothing to add");
            return self.state();
        };
        self.cancel_job();

        let result = match fetching.fetch_result.clone() {
            Some(FetchResult::IsNewRepository { add_url }) => {
                self.commit_new_repository(&fetching, &add_url).await
            }
            Some(FetchResult::IsNewMirror {
                existing_repo_id,
                new_mirror_url,
            }) => self.commit_new_mirror(existing_repo_id, &new_mirror_url).await,
            Some(FetchResult::IsExistingRepository { .. }) | None => {
                unreachable!("claimed fetch state is always addable")
            }
        };
        let state = match result {
            Ok(state) => state,
            Err(error) => {
                warn!(error = %error, kind = %error.kind(), "adding repository failed");
                AddRepoState::error(error)
            }
        };
        self.publish_if_current(generation, state.clone());
        state
    }

    /// Returns to `None`, cancelling any fetch in progress.
    pub fn abort_adding_repo(&self) {
        self.begin_generation(AddRepoState::None);
        self.cancel_job();
    }

    /// Adds the archive companion of a stored repository, verified with the
    /// repository's own certificate, with a weight just below it.
    ///
    /// Returns the new repository id, or `None` if the archive index ended
    /// without a repository record. Does not touch the published state.
    ///
    /// # Errors
    ///
    /// [`FetchError::ArchiveRepo`] when `repo` is itself an archive, or any
    /// fetch or database error.
    #[instrument(skip(self, repo, proxy), fields(repo_id = repo.repo_id, address = %repo.address))]
    pub async fn add_archive_repo(
        &self,
        repo: &Repository,
        proxy: Option<ProxyConfig>,
    ) -> Result<Option<i64>, FetchError> {
        if repo.is_archive_repo() {
            return Err(FetchError::ArchiveRepo(repo.address.clone()));
        }
        let target = FetchTarget {
            address: repo.archive_address(),
            fingerprint: repo.fingerprint(),
            username: repo.preferences.username.clone(),
            password: repo.preferences.password.clone(),
            proxy,
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        let mut receiver = ArchiveReceiver {
            store: self.inner.store.clone(),
            weight: repo.preferences.weight - 1,
            credentials: Credentials {
                username: target.username.clone(),
                password: target.password.clone(),
            },
            repo_id: None,
        };
        self.fetch_with_fallback(&target, &mut receiver).await?;
        if let Some(repo_id) = receiver.repo_id {
            info!(archive_repo_id = repo_id, "archive repository added");
        }
        Ok(receiver.repo_id)
    }

    async fn fetch_with_fallback(
        &self,
        target: &FetchTarget,
        receiver: &mut dyn RepoPreviewReceiver,
    ) -> Result<FetchOutcome, FetchError> {
        match self.inner.v2.fetch(target, receiver).await {
            Err(FetchError::EntryNotFound { url, file }) => {
                info!(url = %url, file, "no V2 index, trying V1");
                self.inner.v1.fetch(target, receiver).await
            }
            other => other,
        }
    }

    async fn run_fetch(self, generation: u64, target: FetchTarget) {
        let mut receiver = PreviewReceiver {
            adder: self.clone(),
            generation,
            fetch_url: target.address.clone(),
            fingerprint: target.fingerprint.clone(),
        };
        match self.fetch_with_fallback(&target, &mut receiver).await {
            Ok(FetchOutcome::Complete(index)) => {
                let index = Arc::new(index);
                let published = self.update_fetching(generation, |state| {
                    state.done = true;
                    state.index = Some(index);
                });
                debug!(generation, published, "fetch complete");
            }
            Ok(FetchOutcome::Stopped) => debug!(generation, "fetch superseded"),
            Err(error) => {
                warn!(
                    address = %target.address,
                    error = %error,
                    kind = %error.kind(),
                    "fetching repository failed"
                );
                self.publish_if_current(generation, AddRepoState::error(error));
            }
        }
    }

    /// Determines what adding `repo`, fetched from `fetch_url`, would do.
    async fn fetch_result(
        &self,
        repo: &Repository,
        fetch_url: &str,
    ) -> Result<FetchResult, FetchError> {
        let certificate = repo.certificate.as_deref().unwrap_or_default();
        let url = fetch_url.trim_end_matches('/').to_string();
        let result = match self
            .inner
            .store
            .get_repository_by_certificate(certificate)
            .await?
        {
            None => FetchResult::IsNewRepository { add_url: url },
            Some(existing) if existing.knows_url(&url) => FetchResult::IsExistingRepository {
                existing_repo_id: existing.repo_id,
            },
            Some(existing) => FetchResult::IsNewMirror {
                existing_repo_id: existing.repo_id,
                new_mirror_url: url,
            },
        };
        Ok(result)
    }

    async fn commit_new_repository(
        &self,
        fetching: &FetchingState,
        add_url: &str,
    ) -> Result<AddRepoState, FetchError> {
        let repo = fetching
            .repo
            .as_deref()
            .ok_or(IndexError::MissingRepository)?;
        let new_repo = NewRepository::from_preview(
            repo,
            fetching.credentials.username.clone(),
            fetching.credentials.password.clone(),
        )
        .ok_or_else(|| IndexError::signing("repository has no certificate"))?;

        let store = &self.inner.store;
        let mut tx = store.begin().await?;
        let repo_id = tx.insert_repository(&new_repo).await?;
        let add_url = add_url.trim_end_matches('/');
        let known = repo
            .official_mirror_urls()
            .iter()
            .any(|url| url.trim_end_matches('/') == add_url);
        if !known {
            tx.update_user_mirrors(repo_id, &[add_url.to_string()])
                .await?;
        }
        tx.commit().await?;
        info!(repo_id, address = %new_repo.address, "repository added");

        let update_result = match &fetching.index {
            Some(index) => Some(
                match RepoUpdater::new(store.clone()).apply(repo_id, index).await {
                    Ok(result) => result,
                    Err(error) => {
                        warn!(repo_id, error = %error, "applying fetched index failed");
                        IndexUpdateResult::Failed {
                            reason: error.to_string(),
                        }
                    }
                },
            ),
            None => None,
        };
        let stored = store
            .get_repository(repo_id)
            .await?
            .ok_or(StoreError::RepositoryNotFound(repo_id))?;
        Ok(AddRepoState::Added {
            repo: Arc::new(stored),
            update_result,
        })
    }

    async fn commit_new_mirror(
        &self,
        repo_id: i64,
        mirror_url: &str,
    ) -> Result<AddRepoState, FetchError> {
        let mut tx = self.inner.store.begin().await?;
        let existing = tx
            .get_repository(repo_id)
            .await?
            .ok_or(StoreError::RepositoryNotFound(repo_id))?;
        let mut mirrors = existing.preferences.user_mirrors;
        if !mirrors.iter().any(|url| url == mirror_url) {
            mirrors.push(mirror_url.to_string());
        }
        tx.update_user_mirrors(repo_id, &mirrors).await?;
        let repo = tx
            .get_repository(repo_id)
            .await?
            .ok_or(StoreError::RepositoryNotFound(repo_id))?;
        tx.commit().await?;
        info!(repo_id, mirror = %mirror_url, "user mirror added");
        Ok(AddRepoState::Added {
            repo: Arc::new(repo),
            update_result: None,
        })
    }

    /// Publishes `state` as the start of a new generation.
    fn begin_generation(&self, state: AddRepoState) -> u64 {
        let mut generation = 0;
        self.inner.state.send_modify(|current| {
            generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *current = state;
        });
        generation
    }

    fn fail_new_generation(&self, error: FetchError) {
        warn!(error = %error, kind = %error.kind(), "repository rejected");
        self.begin_generation(AddRepoState::error(error));
    }

    fn publish_if_current(&self, generation: u64, state: AddRepoState) -> bool {
        self.inner.state.send_if_modified(|current| {
            if self.inner.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            *current = state;
            true
        })
    }

    fn update_fetching(&self, generation: u64, update: impl FnOnce(&mut FetchingState)) -> bool {
        self.inner.state.send_if_modified(|current| {
            if self.inner.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            match current {
                AddRepoState::Fetching(fetching) => {
                    update(fetching);
                    true
                }
                _ => false,
            }
        })
    }

    fn lock_job(&self) -> std::sync::MutexGuard<'_, Option<Job>> {
        self.inner.job.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_job(&self) {
        if let Some(job) = self.lock_job().take() {
            job.cancelled.store(true, Ordering::SeqCst);
            job.handle.abort();
        }
    }
}

/// Publishes the preview of a fetch while its generation is current.
struct PreviewReceiver {
    adder: RepoAdder,
    generation: u64,
    fetch_url: String,
    fingerprint: Option<String>,
}

#[async_trait]
impl RepoPreviewReceiver for PreviewReceiver {
    async fn on_repo_received(&mut self, repo: Repository) -> Result<ControlFlow<()>, FetchError> {
        let actual = repo
            .fingerprint()
            .ok_or_else(|| IndexError::signing("repository has no certificate"))?;
        check_fingerprint(
            self.fingerprint.as_deref(),
            &[self.fetch_url.as_str(), repo.address.as_str()],
            &actual,
        )?;
        let fetch_result = self.adder.fetch_result(&repo, &self.fetch_url).await?;
        debug!(fetch_result = ?fetch_result, "repository received");

        let repo = Arc::new(repo);
        let published = self.adder.update_fetching(self.generation, |state| {
            state.repo = Some(repo);
            state.fetch_result = Some(fetch_result);
        });
        Ok(if published {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(())
        })
    }

    async fn on_app_received(&mut self, app: MinimalApp) -> Result<ControlFlow<()>, FetchError> {
        let app = Arc::new(app);
        let published = self
            .adder
            .update_fetching(self.generation, |state| state.apps.push(app));
        Ok(if published {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(())
        })
    }
}

/// Stores the archive repository as soon as its record arrives.
struct ArchiveReceiver {
    store: RepoStore,
    weight: i64,
    credentials: Credentials,
    repo_id: Option<i64>,
}

#[async_trait]
impl RepoPreviewReceiver for ArchiveReceiver {
    async fn on_repo_received(&mut self, repo: Repository) -> Result<ControlFlow<()>, FetchError> {
        let new_repo = NewRepository::from_preview(
            &repo,
            self.credentials.username.clone(),
            self.credentials.password.clone(),
        )
        .ok_or_else(|| IndexError::signing("repository has no certificate"))?;
        let mut tx = self.store.begin().await?;
        let repo_id = tx.insert_repository(&new_repo).await?;
        tx.set_weight(repo_id, self.weight).await?;
        tx.commit().await?;
        self.repo_id = Some(repo_id);
        Ok(ControlFlow::Break(()))
    }

    async fn on_app_received(&mut self, _app: MinimalApp) -> Result<ControlFlow<()>, FetchError> {
        Ok(ControlFlow::Break(()))
    }
}
