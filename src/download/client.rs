//! Byte-level HTTP client for repository mirrors.
//!
//! This module provides [`HttpManager`], which performs HEAD and streaming GET
//! requests against the mirrors of a [`DownloadRequest`], walking them in the
//! order chosen by a [`MirrorChooser`]. Redirects are never followed: a 3xx
//! answer surfaces as [`DownloadError::Redirect`].
//!
//! The underlying reqwest clients are rebuilt only when the effective proxy
//! changes. Requests to local-network mirrors always go out without a proxy.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_LENGTH, ETAG, LAST_MODIFIED, LOCATION, RANGE};
use reqwest::redirect::Policy;
use reqwest::{Client, Method, Proxy, Response, StatusCode};
use tracing::{debug, info, instrument};
use url::Url;

use super::chooser::{
    MirrorAttempt, MirrorAttempts, MirrorChooser, MirrorChooserRandom, plan_attempts,
};
use super::constants::{
    CONNECT_TIMEOUT_SECS, HIGH_TIMEOUT_SECS, ONION_CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS,
};
use super::error::DownloadError;
use super::mirror::Mirror;
use super::request::{DownloadRequest, ProxyConfig};
use crate::user_agent;

/// Timeouts and identification shared by all clients of an [`HttpManager`].
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub onion_connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Use [`HIGH_TIMEOUT_SECS`] for everything, as for Tor.
    pub high_timeouts: bool,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            user_agent: user_agent::default_repo_user_agent(),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            onion_connect_timeout: Duration::from_secs(ONION_CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            high_timeouts: false,
        }
    }
}

/// Result of a HEAD request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadInfo {
    /// False only when a previous ETag was supplied and the server still reports it.
    /// Advisory: mirrors disagree on ETag semantics.
    pub etag_changed: bool,
    pub etag: Option<String>,
    pub content_length: Option<u64>,
    pub last_modified: Option<SystemTime>,
}

/// Sink for the body chunks of a GET.
#[async_trait]
pub trait BytesReceiver: Send {
    /// Receives the next chunk. `total_bytes` is the full file size when the
    /// server announced it, including any skipped prefix.
    async fn receive(&mut self, chunk: &[u8], total_bytes: Option<u64>)
    -> Result<(), DownloadError>;
}

/// A response body handed out as a stream once a mirror answered successfully.
pub struct IndexStream {
    pub url: Url,
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, std::io::Result<Bytes>>,
}

impl std::fmt::Debug for IndexStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexStream")
            .field("url", &self.url.as_str())
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct ClientState {
    proxy: Option<ProxyConfig>,
    client: Client,
    onion_client: Client,
    rebuilds: u64,
}

/// Proxy-aware HTTP client that walks mirrors with fallback.
#[derive(Debug)]
pub struct HttpManager {
    settings: HttpSettings,
    chooser: Arc<dyn MirrorChooser>,
    state: Mutex<ClientState>,
}

impl HttpManager {
    /// Creates a manager with the given settings and mirror ordering strategy.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::ClientBuild`] if the TLS backend cannot be initialized.
    pub fn new(
        settings: HttpSettings,
        chooser: Arc<dyn MirrorChooser>,
    ) -> Result<Self, DownloadError> {
        let client = build_client(&settings, None, false)?;
        let onion_client = build_client(&settings, None, true)?;
        Ok(Self {
            settings,
            chooser,
            state: Mutex::new(ClientState {
                proxy: None,
                client,
                onion_client,
                rebuilds: 0,
            }),
        })
    }

    /// Default settings with random mirror ordering.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::ClientBuild`] if the TLS backend cannot be initialized.
    pub fn with_defaults() -> Result<Self, DownloadError> {
        Self::new(HttpSettings::default(), Arc::new(MirrorChooserRandom::new()))
    }

    #[must_use]
    pub fn settings(&self) -> &HttpSettings {
        &self.settings
    }

    /// The proxy the current clients were built with.
    #[must_use]
    pub fn current_proxy(&self) -> Option<ProxyConfig> {
        self.lock_state().proxy.clone()
    }

    /// How often the clients were rebuilt because the effective proxy changed.
    #[must_use]
    pub fn client_rebuilds(&self) -> u64 {
        self.lock_state().rebuilds
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the client for `mirror`, rebuilding when the effective proxy differs.
    fn client_for(
        &self,
        proxy: Option<&ProxyConfig>,
        mirror: &Mirror,
    ) -> Result<Client, DownloadError> {
        let effective = if mirror.is_local() { None } else { proxy.cloned() };
        let mut state = self.lock_state();
        if state.proxy != effective {
            debug!(
                from = ?state.proxy.as_ref().map(ProxyConfig::proxy_url),
                to = ?effective.as_ref().map(ProxyConfig::proxy_url),
                "proxy changed, rebuilding HTTP clients"
            );
            state.client = build_client(&self.settings, effective.as_ref(), false)?;
            state.onion_client = build_client(&self.settings, effective.as_ref(), true)?;
            state.proxy = effective;
            state.rebuilds += 1;
        }
        Ok(if mirror.is_onion() {
            state.onion_client.clone()
        } else {
            state.client.clone()
        })
    }

    /// Checks a file on the first mirror that answers.
    ///
    /// # Errors
    ///
    /// Returns the last mirror's error when every mirror failed, or the first
    /// error the fallback policy refuses to recover from.
    #[instrument(skip(self, request), fields(file = %request.index_file.name))]
    pub async fn head(
        &self,
        request: &DownloadRequest,
        previous_etag: Option<&str>,
    ) -> Result<HeadInfo, DownloadError> {
        let attempts = plan_attempts(self.chooser.as_ref(), request)?;
        for (index, attempt) in attempts.attempts().iter().enumerate() {
            match self.send(Method::HEAD, attempt, request, 0).await {
                Ok(response) => return Ok(head_info(&response, previous_etag)),
                Err(error) => self.fail_attempt(&attempts, index, attempt, error)?,
            }
        }
        Err(DownloadError::NoMirrors {
            name: request.index_file.name.clone(),
        })
    }

    /// Streams a file into `receiver`, skipping the first `skip_first_bytes`.
    ///
    /// When a transfer breaks off mid-body, the next mirror is asked only for
    /// the remaining range.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::NoResume`] when a range was requested and the
    /// last mirror tried answered with the full content.
    #[instrument(skip(self, request, receiver), fields(file = %request.index_file.name))]
    pub async fn get(
        &self,
        request: &DownloadRequest,
        skip_first_bytes: Option<u64>,
        receiver: &mut dyn BytesReceiver,
    ) -> Result<(), DownloadError> {
        let attempts = plan_attempts(self.chooser.as_ref(), request)?;
        let mut offset = skip_first_bytes.unwrap_or(0);
        for (index, attempt) in attempts.attempts().iter().enumerate() {
            match self.get_once(attempt, request, &mut offset, receiver).await {
                Ok(()) => {
                    info!(url = %attempt.url, bytes = offset, "download complete");
                    return Ok(());
                }
                Err(error) => self.fail_attempt(&attempts, index, attempt, error)?,
            }
        }
        Err(DownloadError::NoMirrors {
            name: request.index_file.name.clone(),
        })
    }

    /// Opens a file on the first mirror that answers and returns its body as a stream.
    ///
    /// Mirror fallback covers establishing the response only; errors while
    /// reading the body surface as I/O errors on the stream.
    ///
    /// # Errors
    ///
    /// Same as [`head`](Self::head).
    #[instrument(skip(self, request), fields(file = %request.index_file.name))]
    pub async fn get_stream(&self, request: &DownloadRequest) -> Result<IndexStream, DownloadError> {
        let attempts = plan_attempts(self.chooser.as_ref(), request)?;
        for (index, attempt) in attempts.attempts().iter().enumerate() {
            match self.send(Method::GET, attempt, request, 0).await {
                Ok(response) => {
                    debug!(url = %attempt.url, "streaming response body");
                    return Ok(IndexStream {
                        url: attempt.url.clone(),
                        content_length: header_content_length(&response),
                        body: response.bytes_stream().map_err(std::io::Error::other).boxed(),
                    });
                }
                Err(error) => self.fail_attempt(&attempts, index, attempt, error)?,
            }
        }
        Err(DownloadError::NoMirrors {
            name: request.index_file.name.clone(),
        })
    }

    /// Counts a failure against the mirror unless the error would have hit
    /// any mirror, then applies the fallback policy.
    fn fail_attempt(
        &self,
        attempts: &MirrorAttempts,
        index: usize,
        attempt: &MirrorAttempt,
        error: DownloadError,
    ) -> Result<(), DownloadError> {
        if !error.is_mirror_independent() {
            self.chooser.report_failure(&attempt.mirror);
        }
        attempts.on_error(index, attempt, error)
    }

    async fn get_once(
        &self,
        attempt: &MirrorAttempt,
        request: &DownloadRequest,
        offset: &mut u64,
        receiver: &mut dyn BytesReceiver,
    ) -> Result<(), DownloadError> {
        let response = self.send(Method::GET, attempt, request, *offset).await?;
        let status = response.status();
        if *offset > 0 && status != StatusCode::PARTIAL_CONTENT {
            return Err(DownloadError::no_resume(attempt.url.as_str(), status.as_u16()));
        }
        let total = header_content_length(&response).map(|len| len + *offset);
        debug!(url = %attempt.url, offset = *offset, total = ?total, "receiving body");

        let mut stream = response.bytes_stream();
        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|e| DownloadError::network(attempt.url.as_str(), e))?;
            receiver.receive(&chunk, total).await?;
            *offset += chunk.len() as u64;
        }
        Ok(())
    }

    async fn send(
        &self,
        method: Method,
        attempt: &MirrorAttempt,
        request: &DownloadRequest,
        range_start: u64,
    ) -> Result<Response, DownloadError> {
        let client = self.client_for(request.proxy.as_ref(), &attempt.mirror)?;
        let url = attempt.url.as_str();
        let mut builder = client.request(method, attempt.url.clone());
        if let (Some(username), Some(password)) = (&request.username, &request.password) {
            builder = builder.basic_auth(username, Some(password));
        }
        if range_start > 0 {
            builder = builder.header(RANGE, format!("bytes={range_start}-"));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| DownloadError::network(url, e))?;

        let status = response.status();
        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string);
            return Err(DownloadError::redirect(url, status.as_u16(), location));
        }
        if !status.is_success() {
            return Err(DownloadError::http_status(url, status.as_u16()));
        }
        Ok(response)
    }
}

fn head_info(response: &Response, previous_etag: Option<&str>) -> HeadInfo {
    let headers = response.headers();
    let etag = headers
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);
    let etag_changed = match (previous_etag, etag.as_deref()) {
        (Some(previous), Some(current)) => previous != current,
        _ => true,
    };
    let last_modified = headers
        .get(LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok());
    HeadInfo {
        etag_changed,
        etag,
        content_length: header_content_length(response),
        last_modified,
    }
}

fn header_content_length(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn build_client(
    settings: &HttpSettings,
    proxy: Option<&ProxyConfig>,
    onion: bool,
) -> Result<Client, DownloadError> {
    let high = settings.high_timeouts || proxy.is_some_and(ProxyConfig::is_tor);
    let (connect_timeout, read_timeout) = if high {
        let high = Duration::from_secs(HIGH_TIMEOUT_SECS);
        (high, high)
    } else if onion {
        (settings.onion_connect_timeout, settings.read_timeout)
    } else {
        (settings.connect_timeout, settings.read_timeout)
    };

    let mut builder = Client::builder()
        .redirect(Policy::none())
        .connect_timeout(connect_timeout)
        .read_timeout(read_timeout)
        .user_agent(&settings.user_agent);

    builder = match proxy {
        Some(proxy) => {
            let proxy_url = proxy.proxy_url();
            let reqwest_proxy = Proxy::all(&proxy_url).map_err(|e| DownloadError::InvalidProxy {
                proxy: proxy_url.clone(),
                reason: e.to_string(),
            })?;
            builder.proxy(reqwest_proxy)
        }
        None => builder.no_proxy(),
    };

    builder
        .build()
        .map_err(|source| DownloadError::ClientBuild { source })
}
