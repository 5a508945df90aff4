//! Integration tests for the download module.
//!
//! These tests verify mirror fallback, resume and hashing against mock HTTP servers.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fdroid_repo::download::{
    BytesReceiver, DownloadError, DownloadOutcome, DownloadRequest, Downloader, HttpManager,
    HttpSettings, IndexFile, Mirror, MirrorChooser, MirrorChooserRandom,
};
use futures_util::TryStreamExt;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod support;
use support::{sha256_hex, start_mock_server_or_skip};

const CONTENT: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn manager() -> Arc<HttpManager> {
    Arc::new(
        HttpManager::new(
            HttpSettings::default(),
            Arc::new(MirrorChooserRandom::with_seed(7)),
        )
        .unwrap(),
    )
}

fn mirror(server: &MockServer) -> Mirror {
    Mirror::new(format!("{}/repo", server.uri()))
}

fn digest_file() -> IndexFile {
    IndexFile::with_digest("/index-v2.json", sha256_hex(CONTENT), CONTENT.len() as u64)
}

#[tokio::test]
async fn test_download_full_flow_verifies_hash() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/repo/index-v2.json"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(CONTENT))
        .expect(1)
        .mount(&server)
        .await;
    let temp_dir = TempDir::new().unwrap();
    let dest = temp_dir.path().join("index-v2.json");

    let request = DownloadRequest::new(digest_file(), vec![mirror(&server)]);
    let outcome = Downloader::new(manager(), request, &dest)
        .download()
        .await
        .unwrap();

    assert_eq!(
        outcome,
        DownloadOutcome::Downloaded {
            bytes: CONTENT.len() as u64,
            resumed_from: 0
        }
    );
    assert_eq!(std::fs::read(&dest).unwrap(), CONTENT);
}

#[tokio::test]
async fn test_download_resumes_partial_file_with_range() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/repo/index-v2.json"))
        .and(header("range", "bytes=10-"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(&CONTENT[10..]))
        .expect(1)
        .mount(&server)
        .await;
    let temp_dir = TempDir::new().unwrap();
    let dest = temp_dir.path().join("index-v2.json");
    std::fs::write(&dest, &CONTENT[..10]).unwrap();

    let request = DownloadRequest::new(digest_file(), vec![mirror(&server)]);
    let outcome = Downloader::new(manager(), request, &dest)
        .download()
        .await
        .unwrap();

    assert_eq!(
        outcome,
        DownloadOutcome::Downloaded {
            bytes: CONTENT.len() as u64,
            resumed_from: 10
        }
    );
    assert_eq!(std::fs::read(&dest).unwrap(), CONTENT);
}

#[tokio::test]
async fn test_download_restarts_when_range_ignored() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/repo/index-v2.json"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(CONTENT))
        .mount(&server)
        .await;
    let temp_dir = TempDir::new().unwrap();
    let dest = temp_dir.path().join("index-v2.json");
    std::fs::write(&dest, &CONTENT[..10]).unwrap();

    let request = DownloadRequest::new(digest_file(), vec![mirror(&server)]);
    let outcome = Downloader::new(manager(), request, &dest)
        .download()
        .await
        .unwrap();

    assert_eq!(
        outcome,
        DownloadOutcome::Downloaded {
            bytes: CONTENT.len() as u64,
            resumed_from: 0
        }
    );
    assert_eq!(std::fs::read(&dest).unwrap(), CONTENT);
}

#[tokio::test]
async fn test_download_hash_mismatch_is_error() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/repo/index-v2.json"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tampered".to_vec()))
        .mount(&server)
        .await;
    let temp_dir = TempDir::new().unwrap();
    let dest = temp_dir.path().join("index-v2.json");

    let request = DownloadRequest::new(digest_file(), vec![mirror(&server)]);
    let error = Downloader::new(manager(), request, &dest)
        .download()
        .await
        .unwrap_err();

    assert!(matches!(error, DownloadError::HashMismatch { .. }), "{error:?}");
    assert!(error.is_mirror_independent());
}

#[tokio::test]
async fn test_download_falls_back_to_next_mirror() {
    let Some(broken) = start_mock_server_or_skip().await else {
        return;
    };
    let Some(healthy) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/repo/entry.jar"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&broken)
        .await;
    Mock::given(method("GET"))
        .and(path("/repo/entry.jar"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(CONTENT))
        .expect(1)
        .mount(&healthy)
        .await;
    let temp_dir = TempDir::new().unwrap();
    let dest = temp_dir.path().join("entry.jar");

    let request = DownloadRequest::new(
        IndexFile::named("entry.jar"),
        vec![mirror(&broken), mirror(&healthy)],
    )
    .with_try_first_mirror(Some(mirror(&broken)));
    Downloader::new(manager(), request, &dest)
        .download()
        .await
        .unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), CONTENT);
}

#[tokio::test]
async fn test_not_found_on_try_first_mirror_stops() {
    let Some(first) = start_mock_server_or_skip().await else {
        return;
    };
    let Some(other) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/repo/entry.jar"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&first)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(CONTENT))
        .expect(0)
        .mount(&other)
        .await;
    let temp_dir = TempDir::new().unwrap();

    let request = DownloadRequest::new(
        IndexFile::named("entry.jar"),
        vec![mirror(&first), mirror(&other)],
    )
    .with_try_first_mirror(Some(mirror(&first)));
    let error = Downloader::new(manager(), request, temp_dir.path().join("entry.jar"))
        .download()
        .await
        .unwrap_err();

    assert!(error.is_not_found(), "{error:?}");
}

#[tokio::test]
async fn test_forbidden_with_credentials_stops() {
    let Some(first) = start_mock_server_or_skip().await else {
        return;
    };
    let Some(other) = start_mock_server_or_skip().await else {
        return;
    };
    // "user:secret"
    Mock::given(method("GET"))
        .and(path("/repo/entry.jar"))
        .and(header("authorization", "Basic dXNlcjpzZWNyZXQ="))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&first)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(CONTENT))
        .expect(0)
        .mount(&other)
        .await;
    let temp_dir = TempDir::new().unwrap();

    let request = DownloadRequest::new(
        IndexFile::named("entry.jar"),
        vec![mirror(&first), mirror(&other)],
    )
    .with_credentials(Some("user".into()), Some("secret".into()))
    .with_try_first_mirror(Some(mirror(&first)));
    let error = Downloader::new(manager(), request, temp_dir.path().join("entry.jar"))
        .download()
        .await
        .unwrap_err();

    assert!(error.is_forbidden(), "{error:?}");
}

#[tokio::test]
async fn test_cancelled_download_does_not_request() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(CONTENT))
        .expect(0)
        .mount(&server)
        .await;
    let temp_dir = TempDir::new().unwrap();

    let request = DownloadRequest::new(IndexFile::named("entry.jar"), vec![mirror(&server)]);
    let error = Downloader::new(manager(), request, temp_dir.path().join("entry.jar"))
        .with_cancel_flag(Arc::new(AtomicBool::new(true)))
        .download()
        .await
        .unwrap_err();

    assert!(matches!(error, DownloadError::Cancelled { .. }), "{error:?}");
}

#[tokio::test]
async fn test_head_reports_unchanged_etag_and_last_modified() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("HEAD"))
        .and(path("/repo/entry.jar"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "\"abc\"")
                .insert_header("last-modified", "Wed, 21 Oct 2015 07:28:00 GMT"),
        )
        .mount(&server)
        .await;
    let http = manager();
    let request = DownloadRequest::new(IndexFile::named("entry.jar"), vec![mirror(&server)]);

    let same = http.head(&request, Some("\"abc\"")).await.unwrap();
    assert!(!same.etag_changed);
    assert_eq!(same.etag.as_deref(), Some("\"abc\""));
    assert!(same.last_modified.is_some());

    let changed = http.head(&request, Some("\"old\"")).await.unwrap();
    assert!(changed.etag_changed);
}

#[tokio::test]
async fn test_get_stream_yields_body() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/repo/index-v2.json"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(CONTENT))
        .mount(&server)
        .await;

    let request = DownloadRequest::new(digest_file(), vec![mirror(&server)]);
    let stream = manager().get_stream(&request).await.unwrap();
    assert_eq!(stream.content_length, Some(CONTENT.len() as u64));
    let chunks: Vec<bytes::Bytes> = stream.body.try_collect().await.unwrap();
    assert_eq!(chunks.concat(), CONTENT);
}

/// Keeps the request's mirror order and records every reported failure.
#[derive(Debug, Default)]
struct RecordingChooser {
    failures: Mutex<Vec<String>>,
}

impl MirrorChooser for RecordingChooser {
    fn order_mirrors(&self, request: &DownloadRequest) -> Vec<Mirror> {
        request.mirrors.clone()
    }

    fn report_failure(&self, mirror: &Mirror) {
        self.failures.lock().unwrap().push(mirror.base_url().to_string());
    }
}

struct FailingReceiver;

#[async_trait]
impl BytesReceiver for FailingReceiver {
    async fn receive(&mut self, _chunk: &[u8], _total: Option<u64>) -> Result<(), DownloadError> {
        Err(DownloadError::io(
            "/tmp/entry.jar",
            std::io::Error::other("disk full"),
        ))
    }
}

fn recording_manager(chooser: &Arc<RecordingChooser>) -> HttpManager {
    HttpManager::new(HttpSettings::default(), chooser.clone()).unwrap()
}

#[tokio::test]
async fn test_only_mirror_failures_are_reported_to_chooser() {
    let Some(broken) = start_mock_server_or_skip().await else {
        return;
    };
    let Some(healthy) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/repo/entry.jar"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&broken)
        .await;
    Mock::given(method("GET"))
        .and(path("/repo/entry.jar"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(CONTENT))
        .mount(&healthy)
        .await;

    let chooser = Arc::new(RecordingChooser::default());
    let http = recording_manager(&chooser);
    let request = DownloadRequest::new(
        IndexFile::named("entry.jar"),
        vec![mirror(&broken), mirror(&healthy)],
    );
    let stream = http.get_stream(&request).await.unwrap();
    assert!(stream.url.as_str().starts_with(&healthy.uri()));
    assert_eq!(
        *chooser.failures.lock().unwrap(),
        vec![mirror(&broken).base_url().to_string()]
    );
}

#[tokio::test]
async fn test_local_write_failure_is_not_blamed_on_mirror() {
    let Some(first) = start_mock_server_or_skip().await else {
        return;
    };
    let Some(second) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/repo/entry.jar"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(CONTENT))
        .expect(1)
        .mount(&first)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(CONTENT))
        .expect(0)
        .mount(&second)
        .await;

    let chooser = Arc::new(RecordingChooser::default());
    let http = recording_manager(&chooser);
    let request = DownloadRequest::new(
        IndexFile::named("entry.jar"),
        vec![mirror(&first), mirror(&second)],
    );
    let error = http
        .get(&request, None, &mut FailingReceiver)
        .await
        .unwrap_err();

    assert!(matches!(error, DownloadError::Io { .. }), "{error:?}");
    assert!(chooser.failures.lock().unwrap().is_empty());
}
