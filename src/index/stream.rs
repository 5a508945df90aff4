//! Streaming emission contract for index processors.
//!
//! Processors parse synchronously from a [`Read`] and push records into an
//! [`IndexStreamReceiver`]: the repository exactly once, then each package as
//! soon as it is parsed, then an end-of-stream signal. Async consumers run the
//! processor on the blocking pool via [`spawn_index_processor`] and receive the
//! records as [`IndexEvent`]s over a bounded channel.

use std::io::{self, Read, Write};

use serde::de;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::error::IndexError;
use super::model::{PackageV2, RepoV2};

/// Records buffered between the parser and its async consumer.
const EVENT_BUFFER: usize = 64;

/// Receives the records of an index in document order.
pub trait IndexStreamReceiver {
    /// The repository object. Called exactly once, before any package.
    ///
    /// # Errors
    ///
    /// An error aborts parsing and is returned from the processor unchanged.
    fn receive_repo(&mut self, repo: RepoV2, version: i64) -> Result<(), IndexError>;

    /// One package, in document order.
    ///
    /// # Errors
    ///
    /// An error aborts parsing and is returned from the processor unchanged.
    fn receive_package(&mut self, package_name: String, package: PackageV2)
    -> Result<(), IndexError>;

    /// The document was parsed completely.
    ///
    /// # Errors
    ///
    /// An error is returned from the processor unchanged.
    fn on_stream_ended(&mut self) -> Result<(), IndexError> {
        Ok(())
    }
}

/// A record forwarded from a blocking processor to an async consumer.
#[derive(Debug, Clone)]
pub enum IndexEvent {
    Repo { repo: RepoV2, version: i64 },
    Package { package_name: String, package: PackageV2 },
    End,
}

/// Forwards records into a channel. Must run outside the async runtime.
#[derive(Debug)]
pub struct ChannelIndexReceiver {
    tx: mpsc::Sender<IndexEvent>,
}

impl ChannelIndexReceiver {
    fn send(&self, event: IndexEvent) -> Result<(), IndexError> {
        self.tx
            .blocking_send(event)
            .map_err(|_| IndexError::ReceiverClosed)
    }
}

impl IndexStreamReceiver for ChannelIndexReceiver {
    fn receive_repo(&mut self, repo: RepoV2, version: i64) -> Result<(), IndexError> {
        self.send(IndexEvent::Repo { repo, version })
    }

    fn receive_package(
        &mut self,
        package_name: String,
        package: PackageV2,
    ) -> Result<(), IndexError> {
        self.send(IndexEvent::Package {
            package_name,
            package,
        })
    }

    fn on_stream_ended(&mut self) -> Result<(), IndexError> {
        self.send(IndexEvent::End)
    }
}

/// Runs `process` on the blocking pool, returning the event stream and the
/// task's result. Dropping the receiver makes the processor fail with
/// [`IndexError::ReceiverClosed`] at its next record.
pub fn spawn_index_processor<T, F>(
    process: F,
) -> (mpsc::Receiver<IndexEvent>, JoinHandle<Result<T, IndexError>>)
where
    T: Send + 'static,
    F: FnOnce(&mut ChannelIndexReceiver) -> Result<T, IndexError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let handle = tokio::task::spawn_blocking(move || {
        let mut receiver = ChannelIndexReceiver { tx };
        process(&mut receiver)
    });
    (rx, handle)
}

/// Waits for a processor task, flattening join failures into [`IndexError::Task`].
///
/// # Errors
///
/// The processor's own error, or [`IndexError::Task`] if it panicked.
pub async fn join_index_processor<T>(
    handle: JoinHandle<Result<T, IndexError>>,
) -> Result<T, IndexError> {
    handle
        .await
        .map_err(|e| IndexError::Task(e.to_string()))?
}

/// Wraps a receiver for use inside serde visitors, stashing receiver errors
/// so they can be returned instead of the generic serde error they cause.
pub(crate) struct Emitter<'r> {
    receiver: &'r mut dyn IndexStreamReceiver,
    failure: Option<IndexError>,
    repo_seen: bool,
}

impl<'r> Emitter<'r> {
    pub(crate) fn new(receiver: &'r mut dyn IndexStreamReceiver) -> Self {
        Self {
            receiver,
            failure: None,
            repo_seen: false,
        }
    }

    pub(crate) fn repo_seen(&self) -> bool {
        self.repo_seen
    }

    pub(crate) fn repo<E: de::Error>(&mut self, repo: RepoV2, version: i64) -> Result<(), E> {
        if self.repo_seen {
            return Err(E::custom("duplicate repo object"));
        }
        match self.receiver.receive_repo(repo, version) {
            Ok(()) => {
                self.repo_seen = true;
                Ok(())
            }
            Err(error) => Err(self.stash(error)),
        }
    }

    pub(crate) fn package<E: de::Error>(
        &mut self,
        package_name: String,
        package: PackageV2,
    ) -> Result<(), E> {
        if !self.repo_seen {
            return Err(E::custom("package before repo object"));
        }
        match self.receiver.receive_package(package_name, package) {
            Ok(()) => Ok(()),
            Err(error) => Err(self.stash(error)),
        }
    }

    fn stash<E: de::Error>(&mut self, error: IndexError) -> E {
        let message = error.to_string();
        self.failure = Some(error);
        E::custom(message)
    }

    /// Maps the outcome of a parse back to the receiver's error if it caused the failure.
    pub(crate) fn finish(mut self, result: Result<(), serde_json::Error>) -> Result<(), IndexError> {
        if let Err(error) = result {
            return Err(self.failure.take().unwrap_or(IndexError::Parse(error)));
        }
        if !self.repo_seen {
            return Err(IndexError::MissingRepository);
        }
        self.receiver.on_stream_ended()
    }
}

/// A reader that hashes and counts everything read through it and copies it
/// into a tee writer.
pub struct HashingReader<R, W> {
    inner: R,
    tee: W,
    hasher: Sha256,
    bytes: u64,
}

impl<R: Read, W: Write> HashingReader<R, W> {
    pub fn new(inner: R, tee: W) -> Self {
        Self {
            inner,
            tee,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    /// Reads the rest of the input so the digest covers the whole stream.
    ///
    /// # Errors
    ///
    /// Returns any read or tee write error.
    pub fn drain(&mut self) -> io::Result<u64> {
        io::copy(self, &mut io::sink())
    }

    /// Flushes the tee and returns `(lowercase hex sha256, bytes read)`.
    ///
    /// # Errors
    ///
    /// Returns the tee's flush error.
    pub fn finish(mut self) -> io::Result<(String, u64)> {
        self.tee.flush()?;
        Ok((hex::encode(self.hasher.finalize()), self.bytes))
    }
}

impl<R: Read, W: Write> Read for HashingReader<R, W> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        if read > 0 {
            self.hasher.update(&buf[..read]);
            self.tee.write_all(&buf[..read])?;
            self.bytes += read as u64;
        }
        Ok(read)
    }
}
