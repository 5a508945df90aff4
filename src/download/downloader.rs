//! Resumable, hash-verifying file downloads.
//!
//! A [`Downloader`] drives one [`DownloadRequest`] to completion against a
//! destination file:
//!
//! - A partial file smaller than the expected size is resumed with a range
//!   request; the running SHA-256 is seeded with the bytes already on disk.
//! - A file that already has the expected size is hashed; when it matches
//!   the network is skipped entirely, otherwise it is discarded.
//! - When a mirror refuses the range request the download restarts from zero.
//! - Progress is reported at most once per [`PROGRESS_INTERVAL`] and once at the end.
//! - Cancellation is cooperative, checked around every chunk write.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument};

use super::client::{BytesReceiver, HttpManager};
use super::constants::PROGRESS_INTERVAL;
use super::error::DownloadError;
use super::request::DownloadRequest;

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Progress callback: `(bytes_so_far, total_bytes)`.
pub type ProgressListener = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// How a download finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Bytes were transferred; `resumed_from` is the offset the transfer started at.
    Downloaded { bytes: u64, resumed_from: u64 },
    /// The file was already complete and matched the expected hash.
    AlreadyComplete { bytes: u64 },
}

impl DownloadOutcome {
    #[must_use]
    pub fn bytes(&self) -> u64 {
        match self {
            Self::Downloaded { bytes, .. } | Self::AlreadyComplete { bytes } => *bytes,
        }
    }
}

/// Downloads one request into one destination file.
pub struct Downloader {
    http: Arc<HttpManager>,
    request: DownloadRequest,
    destination: PathBuf,
    cancelled: Arc<AtomicBool>,
    progress: Option<ProgressListener>,
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("file", &self.request.index_file.name)
            .field("destination", &self.destination)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Downloader {
    pub fn new(
        http: Arc<HttpManager>,
        request: DownloadRequest,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            http,
            request,
            destination: destination.into(),
            cancelled: Arc::new(AtomicBool::new(false)),
            progress: None,
        }
    }

    #[must_use]
    pub fn with_progress(mut self, listener: Option<ProgressListener>) -> Self {
        self.progress = listener;
        self
    }

    /// Shares an externally owned cancel flag.
    #[must_use]
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancelled = flag;
        self
    }

    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    fn check_cancelled(&self) -> Result<(), DownloadError> {
        if self.is_cancelled() {
            return Err(DownloadError::cancelled(&self.request.index_file.name));
        }
        Ok(())
    }

    /// Runs the download.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::HashMismatch`] when the finished file does not
    /// match the expected SHA-256; the file must then be treated as untrusted.
    /// Returns [`DownloadError::Cancelled`] when the cancel flag was set.
    #[instrument(skip(self), fields(file = %self.request.index_file.name, dest = %self.destination.display()))]
    pub async fn download(&self) -> Result<DownloadOutcome, DownloadError> {
        self.check_cancelled()?;
        let existing = file_len(&self.destination).await;

        let mut total = self.request.index_file.size;
        if total.is_none() && existing > 0 {
            match self.http.head(&self.request, None).await {
                Ok(info) => total = info.content_length,
                Err(error) if error.is_not_found() => return Err(error),
                Err(error) => debug!(error = %error, "HEAD failed, downloading from scratch"),
            }
        }

        let mut skip = 0;
        match total {
            Some(total) if existing > total => {
                debug!(existing, total, "existing file larger than expected, discarding");
                self.remove_destination().await?;
            }
            Some(total) if existing == total && existing > 0 => {
                if self.existing_file_matches().await? {
                    info!(bytes = existing, "file already complete");
                    self.notify(existing, Some(existing));
                    return Ok(DownloadOutcome::AlreadyComplete { bytes: existing });
                }
                debug!("complete-sized file does not verify, discarding");
                self.remove_destination().await?;
            }
            Some(_) if existing > 0 => skip = existing,
            _ => {}
        }

        match self.transfer(skip).await {
            Err(error) if error.is_no_resume() => {
                debug!(error = %error, "resume not supported, restarting from zero");
                self.transfer(0).await
            }
            other => other,
        }
    }

    async fn transfer(&self, skip: u64) -> Result<DownloadOutcome, DownloadError> {
        let path = &self.destination;
        let file = if skip > 0 {
            OpenOptions::new()
                .append(true)
                .open(path)
                .await
                .map_err(|e| DownloadError::io(path, e))?
        } else {
            File::create(path)
                .await
                .map_err(|e| DownloadError::io(path, e))?
        };

        let mut hasher = self.request.index_file.sha256.as_ref().map(|_| Sha256::new());
        if skip > 0
            && let Some(hasher) = hasher.as_mut()
        {
            hash_file_into(path, hasher).await?;
        }

        let mut sink = FileSink {
            writer: BufWriter::new(file),
            path,
            url: &self.request.index_file.name,
            hasher,
            bytes: skip,
            cancelled: &self.cancelled,
            progress: self.progress.as_ref(),
            total: self.request.index_file.size,
            last_report: None,
        };

        let result = self.http.get(&self.request, Some(skip), &mut sink).await;
        let flushed = sink.writer.flush().await.map_err(|e| DownloadError::io(path, e));
        result?;
        flushed?;
        self.check_cancelled()?;

        let bytes = sink.bytes;
        sink.report(true);
        if let (Some(expected), Some(hasher)) =
            (self.request.index_file.sha256.as_deref(), sink.hasher.take())
        {
            let actual = hex::encode(hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(DownloadError::hash_mismatch(path, expected, actual));
            }
        }
        Ok(DownloadOutcome::Downloaded {
            bytes,
            resumed_from: skip,
        })
    }

    async fn existing_file_matches(&self) -> Result<bool, DownloadError> {
        let Some(expected) = self.request.index_file.sha256.as_deref() else {
            return Ok(false);
        };
        let mut hasher = Sha256::new();
        hash_file_into(&self.destination, &mut hasher).await?;
        Ok(hex::encode(hasher.finalize()).eq_ignore_ascii_case(expected))
    }

    async fn remove_destination(&self) -> Result<(), DownloadError> {
        match tokio::fs::remove_file(&self.destination).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DownloadError::io(&self.destination, e)),
        }
    }

    fn notify(&self, bytes: u64, total: Option<u64>) {
        if let Some(listener) = &self.progress {
            listener(bytes, total);
        }
    }
}

struct FileSink<'a> {
    writer: BufWriter<File>,
    path: &'a Path,
    url: &'a str,
    hasher: Option<Sha256>,
    bytes: u64,
    cancelled: &'a AtomicBool,
    progress: Option<&'a ProgressListener>,
    total: Option<u64>,
    last_report: Option<Instant>,
}

impl FileSink<'_> {
    fn check_cancelled(&self) -> Result<(), DownloadError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(DownloadError::cancelled(self.url));
        }
        Ok(())
    }

    fn report(&mut self, force: bool) {
        let Some(listener) = self.progress else {
            return;
        };
        let due = self
            .last_report
            .is_none_or(|at| at.elapsed() >= PROGRESS_INTERVAL);
        if force || due {
            listener(self.bytes, self.total);
            self.last_report = Some(Instant::now());
        }
    }
}

#[async_trait]
impl BytesReceiver for FileSink<'_> {
    async fn receive(
        &mut self,
        chunk: &[u8],
        total_bytes: Option<u64>,
    ) -> Result<(), DownloadError> {
        self.check_cancelled()?;
        self.writer
            .write_all(chunk)
            .await
            .map_err(|e| DownloadError::io(self.path, e))?;
        self.check_cancelled()?;

        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(chunk);
        }
        self.bytes += chunk.len() as u64;
        self.total = total_bytes.or(self.total);
        self.report(false);
        Ok(())
    }
}

async fn file_len(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.len())
        .unwrap_or(0)
}

async fn hash_file_into(path: &Path, hasher: &mut Sha256) -> Result<(), DownloadError> {
    let mut file = File::open(path)
        .await
        .map_err(|e| DownloadError::io(path, e))?;
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let read = file
            .read(&mut buffer)
            .await
            .map_err(|e| DownloadError::io(path, e))?;
        if read == 0 {
            return Ok(());
        }
        hasher.update(&buffer[..read]);
    }
}
