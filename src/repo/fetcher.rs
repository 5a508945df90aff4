//! Fetching and verifying a repository for preview.
//!
//! # Overview
//!
//! A fetch runs `downloading-entry → verifying → streaming-index` for one
//! index format:
//!
//! - [`RepoV2Fetcher`] downloads the small signed `entry.jar`, verifies it,
//!   then streams the index it names while hashing it, and finally compares
//!   the digest and size announced by the entry.
//! - [`RepoV1Fetcher`] downloads the signed `index-v1.jar`, verifies it, then
//!   streams the payload.
//!
//! Parsed records are pushed into a [`RepoPreviewReceiver`] as they arrive.
//! Only a missing V2 entry yields [`FetchError::EntryNotFound`]; callers use
//! it, and nothing else, to fall back to V1.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use tempfile::TempPath;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::error::StoreError;
use super::model::{IndexFormatVersion, MinimalApp, Repository};
use super::state::AddRepoErrorKind;
use crate::download::{
    DownloadError, DownloadRequest, Downloader, HttpManager, IndexFile, Mirror, ProgressListener,
    ProxyConfig,
};
use crate::index::jar::{read_entry, verify_jar, with_entry};
use crate::index::{
    ENTRY_JAR, ENTRY_JSON, Entry, HashingReader, INDEX_V1_JAR, INDEX_V1_JSON, IndexError,
    IndexEvent, IndexV1StreamProcessor, IndexV2StreamProcessor, join_index_processor,
    spawn_index_processor,
};

/// Errors of the fetch and add pipeline.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The signed entry point of the format does not exist at the address.
    #[error("no {file} at {url}")]
    EntryNotFound { url: String, file: &'static str },

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid repository address: {0}")]
    InvalidUri(String),

    #[error("{0} is an archive repository")]
    ArchiveRepo(String),

    #[error("installing apps from unknown sources is disallowed")]
    UnknownSourcesDisallowed,

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// The add-flow error category this error is reported as.
    #[must_use]
    pub fn kind(&self) -> AddRepoErrorKind {
        match self {
            Self::UnknownSourcesDisallowed => AddRepoErrorKind::UnknownSourcesDisallowed,
            Self::ArchiveRepo(_) => AddRepoErrorKind::IsArchiveRepo,
            Self::Index(error) if error.is_signing_failure() => AddRepoErrorKind::InvalidFingerprint,
            Self::Index(error) if error.is_io() || matches!(error, IndexError::ReceiverClosed) => {
                AddRepoErrorKind::IoError
            }
            Self::EntryNotFound { .. } | Self::InvalidUri(_) | Self::Index(_) => {
                AddRepoErrorKind::InvalidIndex
            }
            Self::Download(error)
                if error.is_not_found() || matches!(error, DownloadError::HashMismatch { .. }) =>
            {
                AddRepoErrorKind::InvalidIndex
            }
            Self::Download(_) | Self::Store(_) | Self::Io { .. } => AddRepoErrorKind::IoError,
        }
    }
}

/// Receives a repository preview while it is being fetched.
#[async_trait]
pub trait RepoPreviewReceiver: Send {
    /// The verified repository, before any app.
    ///
    /// # Errors
    ///
    /// An error aborts the fetch and is returned from it unchanged.
    async fn on_repo_received(&mut self, repo: Repository) -> Result<ControlFlow<()>, FetchError>;

    /// One app of the repository.
    ///
    /// # Errors
    ///
    /// An error aborts the fetch and is returned from it unchanged.
    async fn on_app_received(&mut self, app: MinimalApp) -> Result<ControlFlow<()>, FetchError>;
}

/// Where and how to fetch a repository.
#[derive(Debug, Clone, Default)]
pub struct FetchTarget {
    /// Normalized repository address.
    pub address: String,
    /// Expected certificate fingerprint; without one the certificate is
    /// trusted on first use.
    pub fingerprint: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub proxy: Option<ProxyConfig>,
    /// Cooperative cancel flag shared with the downloads of this fetch.
    pub cancelled: Arc<AtomicBool>,
}

impl FetchTarget {
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    fn request(&self, index_file: IndexFile) -> DownloadRequest {
        let mirror = Mirror::new(&self.address);
        DownloadRequest::new(index_file, vec![mirror.clone()])
            .with_proxy(self.proxy.clone())
            .with_credentials(self.username.clone(), self.password.clone())
            .with_try_first_mirror(Some(mirror))
    }

    /// File system directory for `file://` repositories.
    fn local_dir(&self) -> Option<PathBuf> {
        Url::parse(&self.address)
            .ok()
            .filter(|url| url.scheme() == "file")
            .and_then(|url| url.to_file_path().ok())
    }
}

/// A fully verified index kept on disk until it is applied or discarded.
/// The file is deleted when this value is dropped.
#[derive(Debug)]
pub struct FetchedIndex {
    pub format: IndexFormatVersion,
    /// V2: the index document. V1: the signed container.
    pub path: TempPath,
    /// Expected SHA-256 of the file at `path`, for formats that carry one.
    pub sha256: Option<String>,
    pub certificate: String,
    pub version: i64,
}

/// How a fetch ended.
#[derive(Debug)]
pub enum FetchOutcome {
    Complete(FetchedIndex),
    /// The receiver asked to stop; the transfer was abandoned.
    Stopped,
}

/// Fetches one index format.
#[async_trait]
pub trait RepoFetcher: Send + Sync {
    fn format(&self) -> IndexFormatVersion;

    /// Fetches, verifies and streams the repository at `target`.
    ///
    /// # Errors
    ///
    /// [`FetchError::EntryNotFound`] when the signed entry point does not
    /// exist; any download, verification, parse or receiver error otherwise.
    async fn fetch(
        &self,
        target: &FetchTarget,
        receiver: &mut dyn RepoPreviewReceiver,
    ) -> Result<FetchOutcome, FetchError>;
}

/// Shared plumbing of both fetchers.
#[derive(Clone)]
struct FetchContext {
    http: Arc<HttpManager>,
    temp_dir: PathBuf,
    locale: String,
    progress: Option<ProgressListener>,
}

impl std::fmt::Debug for FetchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchContext")
            .field("temp_dir", &self.temp_dir)
            .field("locale", &self.locale)
            .finish_non_exhaustive()
    }
}

impl FetchContext {
    fn temp_path(&self, prefix: &str, suffix: &str) -> Result<TempPath, FetchError> {
        tempfile::Builder::new()
            .prefix(prefix)
            .suffix(suffix)
            .tempfile_in(&self.temp_dir)
            .map(tempfile::NamedTempFile::into_temp_path)
            .map_err(|e| FetchError::io(&self.temp_dir, e))
    }

    /// Downloads a signed entry point into a temp file. A 404 becomes
    /// [`FetchError::EntryNotFound`].
    async fn download_entry(
        &self,
        target: &FetchTarget,
        file: &'static str,
        prefix: &str,
    ) -> Result<TempPath, FetchError> {
        let path = self.temp_path(prefix, ".jar")?;
        let not_found = || FetchError::EntryNotFound {
            url: target.address.clone(),
            file,
        };

        if let Some(dir) = target.local_dir() {
            return match tokio::fs::copy(dir.join(file), &path).await {
                Ok(_) => Ok(path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found()),
                Err(e) => Err(FetchError::io(dir.join(file), e)),
            };
        }

        let downloader = Downloader::new(
            Arc::clone(&self.http),
            target.request(IndexFile::named(file)),
            path.to_path_buf(),
        )
        .with_cancel_flag(Arc::clone(&target.cancelled))
        .with_progress(self.progress.clone());
        match downloader.download().await {
            Ok(outcome) => {
                debug!(file, bytes = outcome.bytes(), "downloaded signed entry");
                Ok(path)
            }
            Err(error) if error.is_not_found() => Err(not_found()),
            Err(error) => Err(error.into()),
        }
    }

    /// Forwards parsed records to the preview receiver until the stream ends
    /// or the receiver breaks. A finished stream yields the repository
    /// version it announced.
    async fn forward_events(
        &self,
        events: &mut mpsc::Receiver<IndexEvent>,
        format: IndexFormatVersion,
        certificate: &str,
        receiver: &mut dyn RepoPreviewReceiver,
    ) -> Result<ControlFlow<(), Option<i64>>, FetchError> {
        let mut repo_version = None;
        while let Some(event) = events.recv().await {
            let flow = match event {
                IndexEvent::Repo { repo, version } => {
                    repo_version = Some(version);
                    let repo = Repository::from_index(repo, version, format, certificate);
                    receiver.on_repo_received(repo).await?
                }
                IndexEvent::Package {
                    package_name,
                    package,
                } => {
                    let app =
                        MinimalApp::from_metadata(0, package_name, &package.metadata, &self.locale);
                    receiver.on_app_received(app).await?
                }
                IndexEvent::End => ControlFlow::Continue(()),
            };
            if flow.is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(repo_version))
    }
}

async fn verify_blocking(
    path: PathBuf,
    payload_entry: &'static str,
    fingerprint: Option<String>,
) -> Result<crate::index::VerifiedJar, IndexError> {
    tokio::task::spawn_blocking(move || verify_jar(&path, payload_entry, fingerprint.as_deref()))
        .await
        .map_err(|e| IndexError::Task(e.to_string()))?
}

/// Fetches repositories in the V2 format.
#[derive(Debug, Clone)]
pub struct RepoV2Fetcher {
    context: FetchContext,
}

impl RepoV2Fetcher {
    #[must_use]
    pub fn new(http: Arc<HttpManager>, temp_dir: impl Into<PathBuf>, locale: impl Into<String>) -> Self {
        Self {
            context: FetchContext {
                http,
                temp_dir: temp_dir.into(),
                locale: locale.into(),
                progress: None,
            },
        }
    }

    /// Reports progress of the entry download.
    #[must_use]
    pub fn with_progress(mut self, listener: Option<ProgressListener>) -> Self {
        self.context.progress = listener;
        self
    }

    async fn open_index(
        &self,
        target: &FetchTarget,
        entry: &Entry,
    ) -> Result<Box<dyn Read + Send>, FetchError> {
        let name = entry.index.name.trim_start_matches('/');
        if let Some(dir) = target.local_dir() {
            let path = dir.join(name);
            let file = File::open(&path).map_err(|e| FetchError::io(&path, e))?;
            return Ok(Box::new(file));
        }

        let index_file = IndexFile {
            name: entry.index.name.clone(),
            sha256: Some(entry.index.sha256.clone()),
            size: Some(entry.index.size),
            ipfs_cid_v1: entry.index.ipfs_cid_v1.clone(),
        };
        let stream = self.context.http.get_stream(&target.request(index_file)).await?;
        debug!(url = %stream.url, length = ?stream.content_length, "streaming index");
        // Created here, inside the runtime, so the bridge can block on it later.
        Ok(Box::new(SyncIoBridge::new(StreamReader::new(stream.body))))
    }
}

#[async_trait]
impl RepoFetcher for RepoV2Fetcher {
    fn format(&self) -> IndexFormatVersion {
        IndexFormatVersion::Two
    }

    #[instrument(skip(self, target, receiver), fields(address = %target.address))]
    async fn fetch(
        &self,
        target: &FetchTarget,
        receiver: &mut dyn RepoPreviewReceiver,
    ) -> Result<FetchOutcome, FetchError> {
        let entry_jar = self.context.download_entry(target, ENTRY_JAR, "entry-").await?;
        let verified =
            verify_blocking(entry_jar.to_path_buf(), ENTRY_JSON, target.fingerprint.clone()).await?;
        let entry: Entry = serde_json::from_slice(&read_entry(&entry_jar, ENTRY_JSON)?)
            .map_err(IndexError::from)?;
        drop(entry_jar);
        info!(
            version = entry.version,
            index = %entry.index.name,
            size = entry.index.size,
            "verified entry"
        );

        let source = self.open_index(target, &entry).await?;
        let tee_file = tempfile::Builder::new()
            .prefix("index-v2-")
            .suffix(".json")
            .tempfile_in(&self.context.temp_dir)
            .map_err(|e| FetchError::io(&self.context.temp_dir, e))?;
        let (tee, index_path) = tee_file.into_parts();

        let version = entry.version;
        let (mut events, handle) = spawn_index_processor(move |channel| {
            let mut hashing = HashingReader::new(source, BufWriter::new(tee));
            IndexV2StreamProcessor::new(version).process(BufReader::new(&mut hashing), channel)?;
            hashing.drain().map_err(IndexError::Stream)?;
            hashing.finish().map_err(IndexError::Stream)
        });

        let flow = self
            .context
            .forward_events(&mut events, IndexFormatVersion::Two, &verified.certificate, receiver)
            .await;
        drop(events);
        match flow {
            Ok(ControlFlow::Break(())) => {
                debug!("receiver stopped the index transfer");
                return Ok(FetchOutcome::Stopped);
            }
            Ok(ControlFlow::Continue(_)) => {}
            Err(error) => return Err(error),
        }

        let (digest, size) = join_index_processor(handle).await?;
        if !digest.eq_ignore_ascii_case(&entry.index.sha256) {
            warn!(expected = %entry.index.sha256, actual = %digest, "index digest mismatch");
            return Err(IndexError::DigestMismatch {
                expected: entry.index.sha256,
                actual: digest,
            }
            .into());
        }
        if size != entry.index.size {
            return Err(IndexError::SizeMismatch {
                expected: entry.index.size,
                actual: size,
            }
            .into());
        }

        Ok(FetchOutcome::Complete(FetchedIndex {
            format: IndexFormatVersion::Two,
            path: index_path,
            sha256: Some(digest),
            certificate: verified.certificate,
            version,
        }))
    }
}

/// Fetches repositories in the legacy V1 format.
#[derive(Debug, Clone)]
pub struct RepoV1Fetcher {
    context: FetchContext,
}

impl RepoV1Fetcher {
    #[must_use]
    pub fn new(http: Arc<HttpManager>, temp_dir: impl Into<PathBuf>, locale: impl Into<String>) -> Self {
        Self {
            context: FetchContext {
                http,
                temp_dir: temp_dir.into(),
                locale: locale.into(),
                progress: None,
            },
        }
    }

    /// Reports progress of the container download.
    #[must_use]
    pub fn with_progress(mut self, listener: Option<ProgressListener>) -> Self {
        self.context.progress = listener;
        self
    }
}

/// Streams the payload of a verified V1 container into an index channel.
pub(crate) fn process_v1_jar(
    path: &Path,
    channel: &mut dyn crate::index::IndexStreamReceiver,
) -> Result<(), IndexError> {
    with_entry(path, INDEX_V1_JSON, |reader| {
        IndexV1StreamProcessor.process(BufReader::new(reader), channel)
    })
}

#[async_trait]
impl RepoFetcher for RepoV1Fetcher {
    fn format(&self) -> IndexFormatVersion {
        IndexFormatVersion::One
    }

    #[instrument(skip(self, target, receiver), fields(address = %target.address))]
    async fn fetch(
        &self,
        target: &FetchTarget,
        receiver: &mut dyn RepoPreviewReceiver,
    ) -> Result<FetchOutcome, FetchError> {
        let jar = self
            .context
            .download_entry(target, INDEX_V1_JAR, "index-v1-")
            .await?;
        let verified =
            verify_blocking(jar.to_path_buf(), INDEX_V1_JSON, target.fingerprint.clone()).await?;
        info!(fingerprint = %verified.fingerprint, "verified index-v1");

        let jar_path = jar.to_path_buf();
        let (mut events, handle) =
            spawn_index_processor(move |channel| process_v1_jar(&jar_path, channel));
        let flow = self
            .context
            .forward_events(&mut events, IndexFormatVersion::One, &verified.certificate, receiver)
            .await;
        drop(events);
        let repo_version = match flow {
            Ok(ControlFlow::Break(())) => return Ok(FetchOutcome::Stopped),
            Ok(ControlFlow::Continue(repo_version)) => repo_version,
            Err(error) => return Err(error),
        };
        join_index_processor(handle).await?;

        let version = repo_version.ok_or(IndexError::MissingRepository)?;
        Ok(FetchOutcome::Complete(FetchedIndex {
            format: IndexFormatVersion::One,
            path: jar,
            sha256: None,
            certificate: verified.certificate,
            version,
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::download::{HttpSettings, MirrorChooserRandom};
    use crate::index::{JarSigner, write_signed_jar};

    #[derive(Default)]
    struct Collect {
        repos: Vec<Repository>,
        apps: Vec<String>,
    }

    #[async_trait]
    impl RepoPreviewReceiver for Collect {
        async fn on_repo_received(&mut self, repo: Repository) -> Result<ControlFlow<()>, FetchError> {
            self.repos.push(repo);
            Ok(ControlFlow::Continue(()))
        }

        async fn on_app_received(&mut self, app: MinimalApp) -> Result<ControlFlow<()>, FetchError> {
            self.apps.push(app.package_name);
            Ok(ControlFlow::Continue(()))
        }
    }

    #[tokio::test]
    async fn test_v1_fetch_takes_version_from_streamed_repo() {
        let repo_dir = tempfile::tempdir().unwrap();
        let work_dir = tempfile::tempdir().unwrap();
        let index = serde_json::json!({
            "repo": {
                "timestamp": 1_700_000_000_000_i64,
                "version": 21,
                "name": "Legacy Repo",
                "address": "https://example.org/fdroid/repo",
                "description": "A V1 repository",
            },
            "requests": {"install": [], "uninstall": []},
            "apps": [{"packageName": "org.example.one", "name": "One", "added": 1, "lastUpdated": 2}],
            "packages": {},
        })
        .to_string();
        let signer = JarSigner::generate("legacy").unwrap();
        write_signed_jar(
            &repo_dir.path().join(INDEX_V1_JAR),
            INDEX_V1_JSON,
            index.as_bytes(),
            &signer,
        )
        .unwrap();

        let http = HttpManager::new(
            HttpSettings::default(),
            Arc::new(MirrorChooserRandom::with_seed(1)),
        )
        .unwrap();
        let fetcher = RepoV1Fetcher::new(Arc::new(http), work_dir.path(), "en-US");
        let target = FetchTarget::new(Url::from_directory_path(repo_dir.path()).unwrap().to_string());
        let mut receiver = Collect::default();

        let FetchOutcome::Complete(fetched) = fetcher.fetch(&target, &mut receiver).await.unwrap()
        else {
            panic!("expected a complete fetch");
        };
        assert_eq!(fetched.version, 21);
        assert_eq!(fetched.format, IndexFormatVersion::One);
        assert_eq!(receiver.repos.len(), 1);
        assert_eq!(receiver.repos[0].version, 21);
        assert_eq!(receiver.apps, ["org.example.one"]);
    }

    #[test]
    fn test_entry_not_found_is_invalid_index() {
        let error = FetchError::EntryNotFound {
            url: "https://example.org/fdroid/repo".to_string(),
            file: ENTRY_JAR,
        };
        assert_eq!(error.kind(), AddRepoErrorKind::InvalidIndex);
    }

    #[test]
    fn test_signing_failure_is_invalid_fingerprint() {
        let error = FetchError::from(IndexError::FingerprintMismatch {
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        });
        assert_eq!(error.kind(), AddRepoErrorKind::InvalidFingerprint);
        let error = FetchError::from(IndexError::signing("bad signature"));
        assert_eq!(error.kind(), AddRepoErrorKind::InvalidFingerprint);
    }

    #[test]
    fn test_content_errors_are_invalid_index() {
        let error = FetchError::from(IndexError::MissingRepository);
        assert_eq!(error.kind(), AddRepoErrorKind::InvalidIndex);
        let error = FetchError::from(IndexError::DigestMismatch {
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        });
        assert_eq!(error.kind(), AddRepoErrorKind::InvalidIndex);
        let error = FetchError::from(DownloadError::http_status("https://example.org/index-v2.json", 404));
        assert_eq!(error.kind(), AddRepoErrorKind::InvalidIndex);
    }

    #[test]
    fn test_transport_errors_are_io() {
        let error = FetchError::from(DownloadError::http_status("https://example.org/entry.jar", 500));
        assert_eq!(error.kind(), AddRepoErrorKind::IoError);
        let error = FetchError::from(DownloadError::timeout("https://example.org/entry.jar"));
        assert_eq!(error.kind(), AddRepoErrorKind::IoError);
        let error = FetchError::from(StoreError::RepositoryNotFound(1));
        assert_eq!(error.kind(), AddRepoErrorKind::IoError);
    }

    #[test]
    fn test_policy_errors() {
        assert_eq!(
            FetchError::UnknownSourcesDisallowed.kind(),
            AddRepoErrorKind::UnknownSourcesDisallowed
        );
        assert_eq!(
            FetchError::ArchiveRepo("https://example.org/archive".to_string()).kind(),
            AddRepoErrorKind::IsArchiveRepo
        );
        assert_eq!(
            FetchError::InvalidUri("mailto:x".to_string()).kind(),
            AddRepoErrorKind::InvalidIndex
        );
    }

    #[test]
    fn test_local_dir_only_for_file_scheme() {
        assert!(FetchTarget::new("https://example.org/fdroid/repo").local_dir().is_none());
        assert_eq!(
            FetchTarget::new("file:///srv/fdroid/repo").local_dir(),
            Some(PathBuf::from("/srv/fdroid/repo"))
        );
    }
}
