//! Applying a fetched index to a stored repository.
//!
//! The whole index is written in one transaction: either every record of the
//! stream is stored, or none is. The file handed to the updater was verified
//! when it was fetched; it is checked again before anything is committed.

use std::fs::File;
use std::io::{BufReader, sink};
use std::path::Path;

use tracing::{debug, info, instrument};

use super::fetcher::{FetchError, FetchedIndex, process_v1_jar};
use super::model::{IndexFormatVersion, IndexUpdateResult};
use super::store::RepoStore;
use crate::index::fingerprint::fingerprint_of_hex;
use crate::index::{
    HashingReader, INDEX_V1_JSON, IndexError, IndexEvent, IndexV2StreamProcessor,
    join_index_processor, spawn_index_processor, verify_jar,
};

/// Writes fetched indexes into the store.
#[derive(Debug, Clone)]
pub struct RepoUpdater {
    store: RepoStore,
}

impl RepoUpdater {
    #[must_use]
    pub fn new(store: RepoStore) -> Self {
        Self { store }
    }

    /// Replaces the repository fields and the apps of `repo_id` with the
    /// contents of `index`.
    ///
    /// Returns [`IndexUpdateResult::Unchanged`] without writing when the
    /// stored repository is already at the index's timestamp.
    ///
    /// # Errors
    ///
    /// Any read, verification, parse or database error. Nothing is written
    /// in that case.
    #[instrument(skip(self, index), fields(format = %index.format, path = %index.path.display()))]
    pub async fn apply(
        &self,
        repo_id: i64,
        index: &FetchedIndex,
    ) -> Result<IndexUpdateResult, FetchError> {
        let mut tx = self.store.begin().await?;
        let stored_timestamp = tx
            .get_repository(repo_id)
            .await?
            .map(|repo| repo.timestamp)
            .ok_or(super::error::StoreError::RepositoryNotFound(repo_id))?;

        let path = index.path.to_path_buf();
        let (mut events, handle) = match index.format {
            IndexFormatVersion::Two => {
                let version = index.version;
                spawn_index_processor(move |channel| {
                    let file = File::open(&path).map_err(|e| IndexError::io(&path, e))?;
                    let mut hashing = HashingReader::new(file, sink());
                    IndexV2StreamProcessor::new(version)
                        .process(BufReader::new(&mut hashing), channel)?;
                    hashing.drain().map_err(|e| IndexError::io(&path, e))?;
                    let (digest, _) = hashing.finish().map_err(|e| IndexError::io(&path, e))?;
                    Ok(Some(digest))
                })
            }
            IndexFormatVersion::One => {
                let fingerprint = fingerprint_of_hex(&index.certificate);
                spawn_index_processor(move |channel| {
                    verify_v1(&path, fingerprint.as_deref())?;
                    process_v1_jar(&path, channel)?;
                    Ok(None)
                })
            }
        };

        let mut app_count = 0_u64;
        while let Some(event) = events.recv().await {
            match event {
                IndexEvent::Repo { repo, version } => {
                    if stored_timestamp >= repo.timestamp {
                        debug!(stored_timestamp, timestamp = repo.timestamp, "index not newer");
                        return Ok(IndexUpdateResult::Unchanged);
                    }
                    tx.update_repository_index(
                        repo_id,
                        &repo,
                        version,
                        index.format,
                        &index.certificate,
                    )
                    .await?;
                    tx.clear_apps(repo_id).await?;
                }
                IndexEvent::Package {
                    package_name,
                    package,
                } => {
                    tx.insert_app(repo_id, &package_name, &package.metadata)
                        .await?;
                    app_count += 1;
                }
                IndexEvent::End => {}
            }
        }

        let digest = join_index_processor(handle).await?;
        if let (Some(actual), Some(expected)) = (digest, index.sha256.as_deref())
            && !actual.eq_ignore_ascii_case(expected)
        {
            return Err(IndexError::DigestMismatch {
                expected: expected.to_string(),
                actual,
            }
            .into());
        }

        tx.commit().await?;
        info!(repo_id, app_count, "index applied");
        Ok(IndexUpdateResult::Processed { app_count })
    }
}

fn verify_v1(path: &Path, fingerprint: Option<&str>) -> Result<(), IndexError> {
    verify_jar(path, INDEX_V1_JSON, fingerprint).map(|_| ())
}
