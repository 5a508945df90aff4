//! Shared helpers: signed test repositories served from a wiremock server.

#![allow(dead_code)]

use std::net::TcpListener;
use std::sync::LazyLock;

use fdroid_repo::index::{INDEX_V1_JSON, JarSigner, fingerprint_of, write_signed_jar};
use sha2::{Digest, Sha256};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const REPO_PATH: &str = "/fdroid/repo";
pub const ENTRY_JSON: &str = "entry.json";
pub const TIMESTAMP: i64 = 1_700_000_000_000;
pub const VERSION: i64 = 20_002;

static SIGNER: LazyLock<JarSigner> = LazyLock::new(|| JarSigner::generate("test repo").unwrap());
static OTHER_SIGNER: LazyLock<JarSigner> =
    LazyLock::new(|| JarSigner::generate("other repo").unwrap());

/// The key every test repository is signed with.
pub fn signing_key() -> &'static JarSigner {
    &SIGNER
}

/// A different key, for fingerprint mismatch tests.
pub fn other_signing_key() -> &'static JarSigner {
    &OTHER_SIGNER
}

pub fn certificate_hex(key: &JarSigner) -> String {
    hex::encode(key.certificate_der().unwrap())
}

pub fn fingerprint(key: &JarSigner) -> String {
    fingerprint_of(&key.certificate_der().unwrap())
}

/// Starts a mock server, or returns `None` where sockets cannot be bound.
pub async fn start_mock_server_or_skip() -> Option<MockServer> {
    if TcpListener::bind("127.0.0.1:0").is_err() {
        eprintln!("[socket-bound-test] cannot bind localhost socket; skipping");
        return None;
    }
    Some(MockServer::start().await)
}

/// Address of the test repository on `server`.
pub fn repo_address(server: &MockServer) -> String {
    format!("{}{REPO_PATH}", server.uri())
}

/// An `index-v2.json` document with one app per `(package, name)` pair.
pub fn index_v2_json(address: &str, apps: &[(&str, &str)]) -> Vec<u8> {
    let packages: serde_json::Map<String, serde_json::Value> = apps
        .iter()
        .map(|(package, name)| {
            (
                (*package).to_string(),
                serde_json::json!({
                    "metadata": {
                        "name": {"en-US": name},
                        "summary": {"en-US": format!("{name} summary")},
                        "added": 1,
                        "lastUpdated": 2,
                    },
                    "versions": {}
                }),
            )
        })
        .collect();
    serde_json::json!({
        "repo": {
            "name": {"en-US": "Test Repo"},
            "description": {"en-US": "A repository for tests"},
            "address": address,
            "timestamp": TIMESTAMP,
            "mirrors": [{"url": "https://mirror.example.net/fdroid/repo", "countryCode": "DE"}],
            "antiFeatures": {"Ads": {"name": {"en-US": "Advertising"}}},
        },
        "packages": packages,
    })
    .to_string()
    .into_bytes()
}

/// A signed `entry.jar` pointing at `/index-v2.json` with the given digest and size.
pub fn entry_jar(key: &JarSigner, sha256: &str, size: u64) -> Vec<u8> {
    let entry = serde_json::json!({
        "timestamp": TIMESTAMP,
        "version": VERSION,
        "index": {
            "name": "/index-v2.json",
            "sha256": sha256,
            "size": size,
            "numPackages": 2,
        },
        "diffs": {},
    })
    .to_string();
    signed_jar(ENTRY_JSON, entry.as_bytes(), key)
}

/// A signed `index-v1.jar` with one app per `(package, name)` pair.
pub fn index_v1_jar(key: &JarSigner, address: &str, apps: &[(&str, &str)]) -> Vec<u8> {
    let apps: Vec<serde_json::Value> = apps
        .iter()
        .map(|(package, name)| {
            serde_json::json!({
                "packageName": package,
                "name": name,
                "summary": format!("{name} summary"),
                "added": 1,
                "lastUpdated": 2,
            })
        })
        .collect();
    let index = serde_json::json!({
        "repo": {
            "timestamp": TIMESTAMP,
            "version": 21,
            "name": "Legacy Repo",
            "address": address,
            "description": "A V1 repository",
            "mirrors": [],
        },
        "requests": {"install": [], "uninstall": []},
        "apps": apps,
        "packages": {},
    })
    .to_string();
    signed_jar(INDEX_V1_JSON, index.as_bytes(), key)
}

fn signed_jar(entry: &str, payload: &[u8], key: &JarSigner) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("signed.jar");
    write_signed_jar(&path, entry, payload, key).unwrap();
    std::fs::read(&path).unwrap()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Serves a complete V2 repository under `base_path` on `server`.
pub async fn mount_v2_repo(
    server: &MockServer,
    base_path: &str,
    key: &JarSigner,
    address: &str,
    apps: &[(&str, &str)],
) -> Vec<u8> {
    let index = index_v2_json(address, apps);
    let entry = entry_jar(key, &sha256_hex(&index), index.len() as u64);
    mount_file(server, &format!("{base_path}/entry.jar"), entry).await;
    mount_file(server, &format!("{base_path}/index-v2.json"), index.clone()).await;
    index
}

pub async fn mount_file(server: &MockServer, file_path: &str, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(file_path))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(server)
        .await;
}

pub async fn mount_status(server: &MockServer, file_path: &str, status: u16) {
    Mock::given(method("GET"))
        .and(path(file_path))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}
